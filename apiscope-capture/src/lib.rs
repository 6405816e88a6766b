//! Capture pipeline: interception gating, redaction, normalization,
//! feature extraction, content-addressed body storage, and the append-only
//! journal for a single run.
//!
//! The orchestrator (in `apiscope-run`) owns lifecycle and timing; this
//! crate owns everything that happens to one response between the engine
//! event and the journal line.

pub mod classify;
pub mod features;
pub mod journal;
pub mod limiter;
pub mod normalize;
pub mod process;
pub mod record;
pub mod redact;
pub mod store;

pub use classify::ResponseClassifier;
pub use features::{FeatureBounds, FeatureExtractor};
pub use journal::{new_run_id, CaptureLog, JournalReader};
pub use limiter::ConcurrencyLimiter;
pub use process::{CapturePipeline, TaskOutcome};
pub use record::{CaptureRecord, Features, OmittedReason, RunMetadata};
pub use store::{BodyStore, StoredBody};
