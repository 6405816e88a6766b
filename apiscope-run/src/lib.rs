//! Run orchestration: lifecycle state machine, per-endpoint aggregation,
//! scoring, and the summary artifacts.

pub mod aggregate;
pub mod orchestrator;
pub mod score;
pub mod summary;

use std::sync::Arc;

use apiscope_common::Result;
use apiscope_config::RunOptions;
use apiscope_session::SessionLauncher;

pub use aggregate::{aggregate_run, Aggregator, EndpointAggregate};
pub use orchestrator::{RunOrchestrator, RunReport};
pub use score::{score_endpoints, BodyEvidenceSpec, ScoredEndpoint, ScoringWeights};
pub use summary::{RunSummary, ENDPOINTS_FILE, SUMMARY_FILE};

/// Convenience wrapper: one run with no interstitial handlers and no flow.
pub async fn run_capture(
    opts: RunOptions,
    launcher: Arc<dyn SessionLauncher>,
) -> Result<RunReport> {
    RunOrchestrator::new(opts, launcher).run().await
}
