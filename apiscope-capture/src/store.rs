//! Content-addressed hybrid body storage.
//!
//! Small bodies are inlined into the journal line; larger ones land in
//! `bodies/<sha256>.json`, pretty-printed, written at most once per hash.
//! Two workers racing on the same hash both succeed: `create_new` lets
//! exactly one write land and the loser observes the existing file.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::record::OmittedReason;
use crate::redact::redact_json;

pub const BODIES_DIR: &str = "bodies";

/// Where a persisted body ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredBody {
    /// Parsed and redacted, small enough to live on the journal line.
    Inline(Value),
    /// Relative path (`bodies/<hash>.json`) inside the run directory.
    External(String),
    /// Not persisted after all.
    Omitted(OmittedReason),
}

pub struct BodyStore {
    bodies_dir: PathBuf,
    inline_body_bytes: u64,
    max_body_bytes: u64,
}

impl BodyStore {
    /// Create the store and its `bodies/` directory inside the run dir.
    pub async fn create(
        run_dir: &Path,
        inline_body_bytes: u64,
        max_body_bytes: u64,
    ) -> anyhow::Result<Self> {
        let bodies_dir = run_dir.join(BODIES_DIR);
        tokio::fs::create_dir_all(&bodies_dir).await?;
        Ok(Self {
            bodies_dir,
            inline_body_bytes,
            max_body_bytes,
        })
    }

    /// Place one parsed body. `raw_len` is the size of the raw bytes the
    /// parse came from; `body_hash` their hex SHA-256.
    pub async fn place(&self, raw_len: u64, body_hash: &str, parsed: &Value) -> StoredBody {
        if raw_len <= self.inline_body_bytes {
            return StoredBody::Inline(redact_json(parsed));
        }
        if raw_len > self.max_body_bytes {
            return StoredBody::Omitted(OmittedReason::MaxBodyBytes);
        }

        let relative = format!("{BODIES_DIR}/{body_hash}.json");
        let full = self.bodies_dir.join(format!("{body_hash}.json"));

        let open = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .await;
        match open {
            Ok(mut file) => {
                let redacted = redact_json(parsed);
                let bytes = match serde_json::to_vec_pretty(&redacted) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, hash = body_hash, "store.body.encode_failed");
                        return StoredBody::Omitted(OmittedReason::Unavailable);
                    }
                };
                if let Err(e) = write_all_and_flush(&mut file, &bytes).await {
                    warn!(error = %e, hash = body_hash, "store.body.write_failed");
                    let _ = tokio::fs::remove_file(&full).await;
                    return StoredBody::Omitted(OmittedReason::Unavailable);
                }
                StoredBody::External(relative)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(hash = body_hash, "store.body.exists");
                StoredBody::External(relative)
            }
            Err(e) => {
                warn!(error = %e, hash = body_hash, "store.body.open_failed");
                StoredBody::Omitted(OmittedReason::Unavailable)
            }
        }
    }
}

async fn write_all_and_flush(file: &mut tokio::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}
