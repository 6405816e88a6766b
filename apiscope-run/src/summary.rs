//! Run summary artifacts: `summary.json` and `endpoints.jsonl`.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::score::{BodyEvidenceSpec, ScoredEndpoint, ScoringWeights};

pub const SUMMARY_FILE: &str = "summary.json";
pub const ENDPOINTS_FILE: &str = "endpoints.jsonl";

/// How many top endpoints are embedded in `summary.json`.
pub const SUMMARY_TOP_ENDPOINTS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub url: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub capture_dir: String,
    pub total_responses: u64,
    pub json_captures: u64,
    pub duplicates_skipped: u64,
    pub total_endpoints: u64,
    pub scoring_weights: ScoringWeights,
    pub body_evidence: BodyEvidenceSpec,
    /// Top endpoints by score, at most [`SUMMARY_TOP_ENDPOINTS`].
    pub endpoints: Vec<ScoredEndpoint>,
}

/// Write `summary.json` (pretty) and `endpoints.jsonl` (one endpoint per
/// line, score order) into the run directory.
pub async fn write_summary(
    run_dir: &Path,
    summary: &RunSummary,
    all_endpoints: &[ScoredEndpoint],
) -> anyhow::Result<()> {
    let summary_bytes = serde_json::to_vec_pretty(summary)?;
    tokio::fs::write(run_dir.join(SUMMARY_FILE), summary_bytes).await?;

    let mut file = tokio::fs::File::create(run_dir.join(ENDPOINTS_FILE)).await?;
    for endpoint in all_endpoints {
        let mut line = serde_json::to_string(endpoint)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
    }
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn summary_and_endpoints_land_on_disk() {
        let tmp = TempDir::new().unwrap();
        let summary = RunSummary {
            run_id: "run-1".into(),
            url: "https://example.com".into(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            capture_dir: tmp.path().display().to_string(),
            total_responses: 0,
            json_captures: 0,
            duplicates_skipped: 0,
            total_endpoints: 0,
            scoring_weights: ScoringWeights::default(),
            body_evidence: BodyEvidenceSpec::default(),
            endpoints: Vec::new(),
        };
        write_summary(tmp.path(), &summary, &[]).await.unwrap();

        let text = tokio::fs::read_to_string(tmp.path().join(SUMMARY_FILE))
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["runId"], "run-1");
        let w = &parsed["scoringWeights"];
        let sum = w["frequency"].as_f64().unwrap()
            + w["payloadSize"].as_f64().unwrap()
            + w["structure"].as_f64().unwrap()
            + w["stability"].as_f64().unwrap();
        assert!((sum - 1.0).abs() < 1e-12);
        assert_eq!(parsed["bodyEvidence"]["scale"], 1.5);
        assert_eq!(parsed["bodyEvidence"]["minFactor"], 0.05);

        let endpoints = tokio::fs::read_to_string(tmp.path().join(ENDPOINTS_FILE))
            .await
            .unwrap();
        assert!(endpoints.is_empty());
    }
}
