//! Persisted data model: capture records, feature fingerprints, run metadata.
//!
//! Records are frozen on append and never mutated. Field names serialize in
//! camelCase because the capture directory is consumed by non-Rust tooling.

use std::collections::BTreeMap;

use apiscope_config::RunOptions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a record carries no persisted body. Set iff the body is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OmittedReason {
    /// Declared or actual size exceeded the body cap.
    MaxBodyBytes,
    /// The engine could not hand over the bytes (opaque, evicted, closed).
    Unavailable,
    /// Parse failed and the response never claimed to be JSON.
    NonJson,
    /// Parse failed on a response that claimed to be JSON.
    ParseError,
    /// Screened out by a gate; no record is persisted for this reason.
    Filtered,
    /// Status 204/304: no body by definition.
    EmptyBody,
}

/// Shallow structural fingerprint of one parsed JSON body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    pub is_array: bool,
    pub is_object: bool,
    pub is_primitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_keys: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub top_level_keys: Vec<String>,
    pub depth_estimate: usize,
    pub has_id: bool,
    pub has_items: bool,
    pub has_results: bool,
    pub has_data: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_paths: Vec<String>,
    /// SHA-256 of the sorted top-level key set; empty unless `is_object`.
    pub schema_hash: String,
}

/// One observation of one response, as appended to `index.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    /// Redacted request URL.
    pub url: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    /// Bytes of body persisted with this record; 0 when none was.
    pub payload_size: u64,
    /// Whether any body bytes were obtained from the engine.
    pub body_available: bool,
    /// Whether the body was dropped as oversized or empty-by-status.
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub omitted_reason: Option<OmittedReason>,
    pub json_parse_success: bool,
    /// Redacted parse/read error, at most 200 characters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    /// Hex SHA-256 of the raw bytes; empty when no bytes were read.
    pub body_hash: String,
    /// Relative path of the externalized body, exclusive with `inline_body`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_path: Option<String>,
    /// Parsed and redacted body, exclusive with `body_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_body: Option<serde_json::Value>,
    pub normalized_url: String,
    pub normalized_path: String,
    /// `"METHOD normalizedPath"`, or the redacted URL when normalization failed.
    pub endpoint_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
}

/// Frozen description of a run, written once to `run.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub url: String,
    pub options: RunOptions,
}
