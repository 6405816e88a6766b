//! Per-endpoint rollup from the journal.
//!
//! A single streaming pass folds each record into its aggregate; list-valued
//! fields deduplicate on insert so the pass stays one record deep.

use std::collections::BTreeMap;
use std::path::Path;

use apiscope_capture::{CaptureRecord, JournalReader};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Rollup of every persisted record sharing one endpoint key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAggregate {
    pub endpoint_key: String,
    pub count: u64,
    /// Status code (as string, for JSON object keys) to occurrence count.
    pub status_counts: BTreeMap<String, u64>,
    pub hosts: Vec<String>,
    /// Sizes of every persisted body, in record order.
    pub payload_sizes: Vec<u64>,
    /// Distinct schema fingerprints observed.
    pub schema_hashes: Vec<String>,
    /// Merged, deduplicated sample paths.
    pub sample_paths: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub body_available_count: u64,
    pub json_parse_success_count: u64,
    pub no_body_count: u64,
    pub has_array_structure: bool,
    pub has_data_flags: bool,
    /// Running mean over records with a positive depth estimate.
    pub avg_depth: f64,
    #[serde(skip)]
    depth_samples: u64,
}

impl EndpointAggregate {
    fn new(endpoint_key: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            endpoint_key,
            count: 0,
            status_counts: BTreeMap::new(),
            hosts: Vec::new(),
            payload_sizes: Vec::new(),
            schema_hashes: Vec::new(),
            sample_paths: Vec::new(),
            first_seen: timestamp,
            last_seen: timestamp,
            body_available_count: 0,
            json_parse_success_count: 0,
            no_body_count: 0,
            has_array_structure: false,
            has_data_flags: false,
            avg_depth: 0.0,
            depth_samples: 0,
        }
    }

    fn add(&mut self, record: &CaptureRecord) {
        self.count += 1;
        *self
            .status_counts
            .entry(record.status.to_string())
            .or_insert(0) += 1;

        if let Ok(parsed) = url::Url::parse(&record.url) {
            if let Some(host) = parsed.host_str() {
                push_unique(&mut self.hosts, host.to_string());
            }
        }

        if record.inline_body.is_some() || record.body_path.is_some() {
            self.payload_sizes.push(record.payload_size);
        }

        if record.timestamp < self.first_seen {
            self.first_seen = record.timestamp;
        }
        if record.timestamp > self.last_seen {
            self.last_seen = record.timestamp;
        }

        if record.body_available {
            self.body_available_count += 1;
        } else {
            self.no_body_count += 1;
        }
        if record.json_parse_success {
            self.json_parse_success_count += 1;
        }

        if let Some(features) = &record.features {
            if !features.schema_hash.is_empty() {
                push_unique(&mut self.schema_hashes, features.schema_hash.clone());
            }
            for path in &features.sample_paths {
                push_unique(&mut self.sample_paths, path.clone());
            }
            self.has_array_structure |= features.is_array;
            self.has_data_flags |= features.has_id
                || features.has_items
                || features.has_results
                || features.has_data;
            if features.depth_estimate > 0 {
                self.depth_samples += 1;
                let depth = features.depth_estimate as f64;
                self.avg_depth += (depth - self.avg_depth) / self.depth_samples as f64;
            }
        }
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.iter().any(|v| v == &value) {
        list.push(value);
    }
}

/// Streaming aggregation state for one run.
#[derive(Default)]
pub struct Aggregator {
    endpoints: BTreeMap<String, EndpointAggregate>,
    records: u64,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record(&mut self, record: &CaptureRecord) {
        let key = if record.endpoint_key.is_empty() {
            record.url.clone()
        } else {
            record.endpoint_key.clone()
        };
        self.records += 1;
        self.endpoints
            .entry(key.clone())
            .or_insert_with(|| EndpointAggregate::new(key, record.timestamp))
            .add(record);
    }

    /// Records folded so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn into_aggregates(self) -> Vec<EndpointAggregate> {
        self.endpoints.into_values().collect()
    }
}

/// Stream `index.jsonl` into aggregates. Damaged lines are skipped by the
/// reader; an empty journal yields an empty vector.
pub async fn aggregate_run(run_dir: &Path) -> anyhow::Result<(Vec<EndpointAggregate>, u64)> {
    let mut reader = JournalReader::open(run_dir).await?;
    let mut aggregator = Aggregator::new();
    while let Some(record) = reader.next_record().await {
        aggregator.add_record(&record);
    }
    if reader.skipped() > 0 {
        debug!(skipped = reader.skipped(), "aggregate.lines_skipped");
    }
    let records = aggregator.records();
    Ok((aggregator.into_aggregates(), records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiscope_capture::OmittedReason;
    use serde_json::json;

    fn record(endpoint: &str, status: u16, body: Option<serde_json::Value>) -> CaptureRecord {
        let features = body.as_ref().map(|b| {
            apiscope_capture::FeatureExtractor::default().extract(b)
        });
        CaptureRecord {
            timestamp: Utc::now(),
            method: "GET".into(),
            url: format!("https://api.example.com{}", endpoint.trim_start_matches("GET ")),
            status,
            content_type: Some("application/json".into()),
            request_headers: BTreeMap::new(),
            response_headers: BTreeMap::new(),
            payload_size: body.as_ref().map(|b| b.to_string().len() as u64).unwrap_or(0),
            body_available: body.is_some(),
            truncated: body.is_none(),
            omitted_reason: body.is_none().then_some(OmittedReason::EmptyBody),
            json_parse_success: body.is_some(),
            parse_error: None,
            body_hash: body
                .as_ref()
                .map(|b| format!("{:064x}", b.to_string().len()))
                .unwrap_or_default(),
            body_path: None,
            inline_body: body,
            normalized_url: String::new(),
            normalized_path: endpoint.trim_start_matches("GET ").to_string(),
            endpoint_key: endpoint.to_string(),
            features,
        }
    }

    #[test]
    fn counts_and_dedup_on_insert() {
        let mut agg = Aggregator::new();
        agg.add_record(&record("GET /a", 200, Some(json!({"id": 1}))));
        agg.add_record(&record("GET /a", 200, Some(json!({"id": 2}))));
        agg.add_record(&record("GET /a", 304, None));
        agg.add_record(&record("GET /b", 200, Some(json!([1, 2]))));

        let aggregates = agg.into_aggregates();
        assert_eq!(aggregates.len(), 2);

        let a = aggregates.iter().find(|e| e.endpoint_key == "GET /a").unwrap();
        assert_eq!(a.count, 3);
        assert_eq!(a.status_counts["200"], 2);
        assert_eq!(a.status_counts["304"], 1);
        assert_eq!(a.count, a.status_counts.values().sum::<u64>());
        assert_eq!(a.hosts, vec!["api.example.com"]);
        // Same schema twice, deduplicated.
        assert_eq!(a.schema_hashes.len(), 1);
        assert_eq!(a.sample_paths, vec!["id"]);
        assert_eq!(a.body_available_count, 2);
        assert_eq!(a.json_parse_success_count, 2);
        assert_eq!(a.no_body_count, 1);
        assert!(a.has_data_flags);
        assert!(!a.has_array_structure);
        assert!((a.avg_depth - 1.0).abs() < f64::EPSILON);

        let b = aggregates.iter().find(|e| e.endpoint_key == "GET /b").unwrap();
        assert!(b.has_array_structure);
        assert!(!b.has_data_flags);
    }

    #[test]
    fn payload_sizes_only_for_persisted_bodies() {
        let mut agg = Aggregator::new();
        agg.add_record(&record("GET /x", 200, Some(json!({"k": "v"}))));
        agg.add_record(&record("GET /x", 204, None));
        let aggregates = agg.into_aggregates();
        assert_eq!(aggregates[0].payload_sizes.len(), 1);
    }

    #[test]
    fn empty_endpoint_key_falls_back_to_url() {
        let mut agg = Aggregator::new();
        let mut r = record("GET /y", 200, Some(json!({})));
        r.endpoint_key = String::new();
        agg.add_record(&r);
        let aggregates = agg.into_aggregates();
        assert_eq!(aggregates[0].endpoint_key, r.url);
    }

    #[test]
    fn running_depth_mean() {
        let mut agg = Aggregator::new();
        agg.add_record(&record("GET /d", 200, Some(json!({"a": {"b": 1}}))));
        agg.add_record(&record("GET /d", 200, Some(json!({"c": 2}))));
        let aggregates = agg.into_aggregates();
        // depths 2 and 1
        assert!((aggregates[0].avg_depth - 1.5).abs() < 1e-9);
    }
}
