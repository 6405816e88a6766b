//! Append-only capture journal and run metadata.
//!
//! Layout inside `<outDir>/<runId>/`:
//! - `run.json` — metadata, written once at start
//! - `index.jsonl` — one record per line, appended as workers finish
//! - `bodies/` — managed by the body store
//!
//! Each journal line is a complete JSON object written in a single call, so
//! losing or corrupting one line never takes down its neighbours. Readers
//! skip lines that fail to parse (including a partial trailing line).

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::record::{CaptureRecord, RunMetadata};

pub const RUN_FILE: &str = "run.json";
pub const INDEX_FILE: &str = "index.jsonl";

/// `<ISO timestamp, colons replaced by dashes>-<8 hex chars>`.
pub fn new_run_id(started_at: DateTime<Utc>) -> String {
    let stamp = started_at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', "-");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{stamp}-{}", &suffix[..8])
}

/// Single-writer journal for one run.
pub struct CaptureLog {
    run_dir: PathBuf,
    index: Mutex<File>,
}

impl CaptureLog {
    /// Create `<outDir>/<runId>/`, write `run.json`, and open an empty
    /// `index.jsonl` so downstream aggregation is safe even for empty runs.
    pub async fn create(out_dir: &Path, metadata: &RunMetadata) -> anyhow::Result<Self> {
        let run_dir = out_dir.join(&metadata.run_id);
        tokio::fs::create_dir_all(&run_dir).await?;

        let run_json = serde_json::to_vec_pretty(metadata)?;
        tokio::fs::write(run_dir.join(RUN_FILE), run_json).await?;

        let index = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join(INDEX_FILE))
            .await?;

        Ok(Self {
            run_dir,
            index: Mutex::new(index),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append one frozen record: the full line goes out in one write.
    pub async fn append(&self, record: &CaptureRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.index.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Streaming journal reader that tolerates damaged lines.
pub struct JournalReader {
    lines: Lines<BufReader<File>>,
    skipped: u64,
}

impl JournalReader {
    pub async fn open(run_dir: &Path) -> anyhow::Result<Self> {
        let file = File::open(run_dir.join(INDEX_FILE)).await?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            skipped: 0,
        })
    }

    /// Next parseable record, or `None` at end of journal.
    pub async fn next_record(&mut self) -> Option<CaptureRecord> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<CaptureRecord>(&line) {
                        Ok(record) => return Some(record),
                        Err(e) => {
                            self.skipped += 1;
                            warn!(error = %e, "journal.line_skipped");
                        }
                    }
                }
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "journal.read_failed");
                    return None;
                }
            }
        }
    }

    /// How many lines failed to parse so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Features;
    use apiscope_config::RunOptions;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn metadata() -> RunMetadata {
        let started_at = Utc::now();
        RunMetadata {
            run_id: new_run_id(started_at),
            started_at,
            url: "https://example.com".into(),
            options: RunOptions::for_url("https://example.com"),
        }
    }

    fn record(key: &str) -> CaptureRecord {
        CaptureRecord {
            timestamp: Utc::now(),
            method: "GET".into(),
            url: format!("https://example.com{key}"),
            status: 200,
            content_type: Some("application/json".into()),
            request_headers: BTreeMap::new(),
            response_headers: BTreeMap::new(),
            payload_size: 2,
            body_available: true,
            truncated: false,
            omitted_reason: None,
            json_parse_success: true,
            parse_error: None,
            body_hash: "00".repeat(32),
            body_path: None,
            inline_body: Some(serde_json::json!({})),
            normalized_url: format!("https://example.com{key}"),
            normalized_path: key.into(),
            endpoint_key: format!("GET {key}"),
            features: Some(Features::default()),
        }
    }

    #[test]
    fn run_ids_have_no_colons_and_are_unique() {
        let now = Utc::now();
        let a = new_run_id(now);
        let b = new_run_id(now);
        assert!(!a.contains(':'));
        assert_ne!(a, b);
        assert_eq!(a.rsplit('-').next().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn create_writes_metadata_and_empty_index() {
        let tmp = TempDir::new().unwrap();
        let meta = metadata();
        let log = CaptureLog::create(tmp.path(), &meta).await.unwrap();

        let run_json = tokio::fs::read_to_string(log.run_dir().join(RUN_FILE))
            .await
            .unwrap();
        let parsed: RunMetadata = serde_json::from_str(&run_json).unwrap();
        assert_eq!(parsed.run_id, meta.run_id);

        let index = tokio::fs::read_to_string(log.run_dir().join(INDEX_FILE))
            .await
            .unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn appended_lines_are_independently_parseable() {
        let tmp = TempDir::new().unwrap();
        let log = CaptureLog::create(tmp.path(), &metadata()).await.unwrap();
        log.append(&record("/a")).await.unwrap();
        log.append(&record("/b")).await.unwrap();

        let mut reader = JournalReader::open(log.run_dir()).await.unwrap();
        let first = reader.next_record().await.unwrap();
        let second = reader.next_record().await.unwrap();
        assert!(reader.next_record().await.is_none());
        assert_eq!(first.endpoint_key, "GET /a");
        assert_eq!(second.endpoint_key, "GET /b");
        assert_eq!(reader.skipped(), 0);
    }

    #[tokio::test]
    async fn reader_skips_damaged_and_partial_lines() {
        let tmp = TempDir::new().unwrap();
        let log = CaptureLog::create(tmp.path(), &metadata()).await.unwrap();
        log.append(&record("/ok")).await.unwrap();

        // Corrupt line plus a partial trailing line with no newline.
        let index_path = log.run_dir().join(INDEX_FILE);
        let mut content = tokio::fs::read_to_string(&index_path).await.unwrap();
        content.push_str("{\"broken\": tru\n");
        content.push_str("{\"timestamp\": \"2026-0");
        tokio::fs::write(&index_path, content).await.unwrap();

        let mut reader = JournalReader::open(log.run_dir()).await.unwrap();
        let first = reader.next_record().await.unwrap();
        assert_eq!(first.endpoint_key, "GET /ok");
        assert!(reader.next_record().await.is_none());
        assert_eq!(reader.skipped(), 2);
    }
}
