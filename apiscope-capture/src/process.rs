//! Per-response worker pipeline.
//!
//! One call to [`CapturePipeline::process`] is the unit of work the limiter
//! schedules: screen the response, read and hash the body, redact, normalize,
//! fingerprint, deduplicate, place the body, append the journal line. All
//! failures are contained here; a worker never takes the run down.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use apiscope_common::ScopeError;
use apiscope_config::RunOptions;
use apiscope_session::BrowserResponse;
use chrono::Utc;
use dashmap::DashSet;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::classify::{ResponseClassifier, Screen};
use crate::features::FeatureExtractor;
use crate::journal::CaptureLog;
use crate::normalize::{endpoint_key, normalize_url};
use crate::record::{CaptureRecord, Features, OmittedReason};
use crate::redact::{redact_error, redact_headers, redact_url};
use crate::store::{BodyStore, StoredBody};

/// How one response task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Persisted,
    Duplicate,
    Dropped(&'static str),
    /// The window closed or the session went away under us.
    Skipped,
}

/// Shared state of the capture window; one instance per run.
pub struct CapturePipeline {
    classifier: ResponseClassifier,
    extractor: FeatureExtractor,
    store: BodyStore,
    journal: Arc<CaptureLog>,
    dedup: DashSet<(String, u16, String)>,
    persisted: AtomicU64,
    duplicates: AtomicU64,
    total_responses: AtomicU64,
    max_captures: u64,
    max_body_bytes: u64,
    closing: AtomicBool,
}

impl CapturePipeline {
    pub async fn create(opts: &RunOptions, journal: Arc<CaptureLog>) -> Result<Self, ScopeError> {
        let classifier = ResponseClassifier::from_options(opts)?;
        let store = BodyStore::create(
            journal.run_dir(),
            opts.inline_body_bytes,
            opts.max_body_bytes,
        )
        .await
        .map_err(|e| ScopeError::Storage(e.to_string()))?;
        Ok(Self {
            classifier,
            extractor: FeatureExtractor::default(),
            store,
            journal,
            dedup: DashSet::new(),
            persisted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            total_responses: AtomicU64::new(0),
            max_captures: opts.max_captures,
            max_body_bytes: opts.max_body_bytes,
            closing: AtomicBool::new(false),
        })
    }

    /// Stop accepting responses; later arrivals are dropped silently.
    pub fn close_window(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Whether the window has closed. Lets the enqueue side stop submitting
    /// before drain starts.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Acquire)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Acquire)
    }

    pub fn total_responses(&self) -> u64 {
        self.total_responses.load(Ordering::Acquire)
    }

    /// Process one response event end to end.
    pub async fn process(&self, response: Arc<dyn BrowserResponse>) -> TaskOutcome {
        if self.closing.load(Ordering::Acquire) {
            return TaskOutcome::Skipped;
        }
        self.total_responses.fetch_add(1, Ordering::AcqRel);

        let raw_url = response.url().to_string();
        let method = response.method().to_string();
        let status = response.status();

        if self.classifier.at_capacity(self.persisted()) {
            debug!(url = %raw_url, "capture.response.dropped_capacity");
            return TaskOutcome::Dropped("capacity");
        }
        if let Some(cause) = self.classifier.url_gate(&raw_url) {
            debug!(url = %raw_url, cause = cause.as_str(), "capture.response.filtered");
            return TaskOutcome::Dropped(cause.as_str());
        }

        // Header fetches fail once the context is gone; treat that as skipped.
        let request_headers = match response.request_headers().await {
            Ok(h) => redact_headers(&h.into_iter().collect::<BTreeMap<_, _>>()),
            Err(e) => {
                debug!(url = %raw_url, error = %e, "capture.response.headers_unavailable");
                return TaskOutcome::Skipped;
            }
        };
        let response_headers = match response.response_headers().await {
            Ok(h) => redact_headers(&h.into_iter().collect::<BTreeMap<_, _>>()),
            Err(e) => {
                debug!(url = %raw_url, error = %e, "capture.response.headers_unavailable");
                return TaskOutcome::Skipped;
            }
        };

        let content_type = header_value(&response_headers, "content-type");
        let declared_length =
            header_value(&response_headers, "content-length").and_then(|v| v.parse::<u64>().ok());

        let resource_type = response.resource_type();
        let screen = self.classifier.screen(
            &resource_type,
            content_type.as_deref(),
            status,
            declared_length,
        );

        let mut draft = Draft::new(
            method,
            &raw_url,
            status,
            content_type,
            request_headers,
            response_headers,
        );

        match screen {
            Screen::Drop(cause) => {
                debug!(url = %raw_url, cause = cause.as_str(), "capture.response.dropped");
                TaskOutcome::Dropped(cause.as_str())
            }
            Screen::MetadataOnly(reason) => {
                draft.truncated = true;
                self.finish_metadata(draft, reason, None).await
            }
            Screen::ReadBody => self.read_and_persist(draft, response.as_ref()).await,
        }
    }

    async fn read_and_persist(
        &self,
        mut draft: Draft,
        response: &dyn BrowserResponse,
    ) -> TaskOutcome {
        let bytes = match response.body().await {
            Ok(bytes) => bytes,
            Err(e) => {
                let redacted = redact_error(&e.to_string());
                return self
                    .finish_metadata(draft, OmittedReason::Unavailable, Some(redacted))
                    .await;
            }
        };

        draft.body_available = true;
        draft.body_hash = hex::encode(Sha256::digest(&bytes));

        if bytes.len() as u64 > self.max_body_bytes {
            draft.truncated = true;
            return self
                .finish_metadata(draft, OmittedReason::MaxBodyBytes, None)
                .await;
        }

        let parsed: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(e) => {
                let reason = if self.classifier.expects_json(draft.content_type.as_deref()) {
                    OmittedReason::ParseError
                } else {
                    OmittedReason::NonJson
                };
                let redacted = redact_error(&e.to_string());
                return self.finish_metadata(draft, reason, Some(redacted)).await;
            }
        };

        draft.json_parse_success = true;
        draft.features = Some(self.extractor.extract(&parsed));

        match self
            .store
            .place(bytes.len() as u64, &draft.body_hash, &parsed)
            .await
        {
            StoredBody::Inline(redacted) => {
                draft.inline_body = Some(redacted);
                draft.payload_size = bytes.len() as u64;
            }
            StoredBody::External(path) => {
                draft.body_path = Some(path);
                draft.payload_size = bytes.len() as u64;
            }
            StoredBody::Omitted(reason) => {
                draft.truncated = reason == OmittedReason::MaxBodyBytes;
                draft.omitted_reason = Some(reason);
            }
        }

        self.append(draft.into_record()).await
    }

    async fn finish_metadata(
        &self,
        mut draft: Draft,
        reason: OmittedReason,
        parse_error: Option<String>,
    ) -> TaskOutcome {
        draft.omitted_reason = Some(reason);
        draft.parse_error = parse_error;
        self.append(draft.into_record()).await
    }

    /// Deduplicate, reserve a capacity slot, and append. The dedup insert is
    /// the atomic check: the second task with the same key sees the first.
    async fn append(&self, record: CaptureRecord) -> TaskOutcome {
        let key = (
            record.endpoint_key.clone(),
            record.status,
            record.body_hash.clone(),
        );
        if !self.dedup.insert(key.clone()) {
            self.duplicates.fetch_add(1, Ordering::AcqRel);
            debug!(endpoint = %record.endpoint_key, "capture.response.duplicate");
            return TaskOutcome::Duplicate;
        }

        if !self.try_reserve_slot() {
            self.dedup.remove(&key);
            debug!(endpoint = %record.endpoint_key, "capture.response.dropped_capacity");
            return TaskOutcome::Dropped("capacity");
        }

        if let Err(e) = self.journal.append(&record).await {
            // Give the slot and the dedup entry back; the record never landed.
            self.persisted.fetch_sub(1, Ordering::AcqRel);
            self.dedup.remove(&key);
            warn!(endpoint = %record.endpoint_key, error = %e, "capture.journal.append_failed");
            return TaskOutcome::Dropped("journal_append");
        }

        debug!(
            endpoint = %record.endpoint_key,
            status = record.status,
            size = record.payload_size,
            "capture.response.persisted"
        );
        TaskOutcome::Persisted
    }

    fn try_reserve_slot(&self) -> bool {
        if self.max_captures == 0 {
            self.persisted.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        self.persisted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_captures).then_some(current + 1)
            })
            .is_ok()
    }
}

/// Case-insensitive single-header lookup.
fn header_value(headers: &BTreeMap<String, String>, name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.clone())
}

/// Accumulates record fields along the pipeline.
struct Draft {
    method: String,
    url: String,
    status: u16,
    content_type: Option<String>,
    request_headers: BTreeMap<String, String>,
    response_headers: BTreeMap<String, String>,
    payload_size: u64,
    body_available: bool,
    truncated: bool,
    omitted_reason: Option<OmittedReason>,
    json_parse_success: bool,
    parse_error: Option<String>,
    body_hash: String,
    body_path: Option<String>,
    inline_body: Option<serde_json::Value>,
    normalized_url: String,
    normalized_path: String,
    endpoint_key: String,
    features: Option<Features>,
}

impl Draft {
    fn new(
        method: String,
        raw_url: &str,
        status: u16,
        content_type: Option<String>,
        request_headers: BTreeMap<String, String>,
        response_headers: BTreeMap<String, String>,
    ) -> Self {
        let redacted_url = redact_url(raw_url);
        let normalized = normalize_url(&redacted_url);
        // Normalization failure leaves the raw string in both fields; key on
        // the redacted URL then so the record still lands somewhere stable.
        let key = if url::Url::parse(&redacted_url).is_ok() {
            endpoint_key(&method, &normalized.normalized_path)
        } else {
            endpoint_key(&method, &redacted_url)
        };
        Self {
            method,
            url: redacted_url,
            status,
            content_type,
            request_headers,
            response_headers,
            payload_size: 0,
            body_available: false,
            truncated: false,
            omitted_reason: None,
            json_parse_success: false,
            parse_error: None,
            body_hash: String::new(),
            body_path: None,
            inline_body: None,
            normalized_url: normalized.normalized_url,
            normalized_path: normalized.normalized_path,
            endpoint_key: key,
            features: None,
        }
    }

    fn into_record(self) -> CaptureRecord {
        CaptureRecord {
            timestamp: Utc::now(),
            method: self.method,
            url: self.url,
            status: self.status,
            content_type: self.content_type,
            request_headers: self.request_headers,
            response_headers: self.response_headers,
            payload_size: self.payload_size,
            body_available: self.body_available,
            truncated: self.truncated,
            omitted_reason: self.omitted_reason,
            json_parse_success: self.json_parse_success,
            parse_error: self.parse_error,
            body_hash: self.body_hash,
            body_path: self.body_path,
            inline_body: self.inline_body,
            normalized_url: self.normalized_url,
            normalized_path: self.normalized_path,
            endpoint_key: self.endpoint_key,
            features: self.features,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{new_run_id, JournalReader};
    use crate::record::RunMetadata;
    use apiscope_session::testing::ScriptedResponse;
    use apiscope_session::ResourceType;
    use serde_json::json;
    use tempfile::TempDir;

    async fn pipeline(tmp: &TempDir, mutate: impl FnOnce(&mut RunOptions)) -> CapturePipeline {
        let mut opts = RunOptions::for_url("https://site.example");
        mutate(&mut opts);
        let started_at = Utc::now();
        let metadata = RunMetadata {
            run_id: new_run_id(started_at),
            started_at,
            url: opts.url.clone(),
            options: opts.clone(),
        };
        let journal = Arc::new(CaptureLog::create(tmp.path(), &metadata).await.unwrap());
        CapturePipeline::create(&opts, journal).await.unwrap()
    }

    async fn records(p: &CapturePipeline) -> Vec<CaptureRecord> {
        let mut reader = JournalReader::open(p.journal.run_dir()).await.unwrap();
        let mut out = Vec::new();
        while let Some(r) = reader.next_record().await {
            out.push(r);
        }
        out
    }

    fn arc(r: ScriptedResponse) -> Arc<dyn BrowserResponse> {
        Arc::new(r)
    }

    #[tokio::test]
    async fn inline_persistence_end_to_end() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp, |_| {}).await;

        let outcome = p
            .process(arc(ScriptedResponse::json(
                "https://site.example/data",
                json!({"id": 123, "name": "test"}),
            )))
            .await;
        assert_eq!(outcome, TaskOutcome::Persisted);

        let rows = records(&p).await;
        assert_eq!(rows.len(), 1);
        let r = &rows[0];
        assert_eq!(r.endpoint_key, "GET /data");
        assert_eq!(r.inline_body, Some(json!({"id": 123, "name": "test"})));
        assert!(r.body_path.is_none());
        assert!(r.json_parse_success);
        assert!(r.features.as_ref().unwrap().has_id);
        assert_eq!(r.body_hash.len(), 64);
        assert!(r.omitted_reason.is_none());
    }

    #[tokio::test]
    async fn large_bodies_are_externalized() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp, |o| o.inline_body_bytes = 16 * 1024).await;

        let items: Vec<_> = (0..1000).map(|_| json!({"id": 1, "value": "test"})).collect();
        let outcome = p
            .process(arc(ScriptedResponse::json(
                "https://site.example/big",
                json!({"items": items}),
            )))
            .await;
        assert_eq!(outcome, TaskOutcome::Persisted);

        let rows = records(&p).await;
        let r = &rows[0];
        let path = r.body_path.as_ref().expect("externalized");
        assert!(path.starts_with("bodies/") && path.ends_with(".json"));
        assert_eq!(path.len(), "bodies/.json".len() + 64);
        assert!(r.inline_body.is_none());
        assert!(p.journal.run_dir().join(path).exists());
    }

    #[tokio::test]
    async fn empty_body_status_is_metadata_only() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp, |_| {}).await;

        let outcome = p
            .process(arc(
                ScriptedResponse::json("https://site.example/touch", json!({}))
                    .with_status(204)
                    .with_failing_body(),
            ))
            .await;
        assert_eq!(outcome, TaskOutcome::Persisted);

        let rows = records(&p).await;
        let r = &rows[0];
        assert!(!r.body_available);
        assert!(r.truncated);
        assert_eq!(r.omitted_reason, Some(OmittedReason::EmptyBody));
        assert!(!r.json_parse_success);
        assert!(r.parse_error.is_none());
        assert_eq!(r.body_hash, "");
    }

    #[tokio::test]
    async fn body_read_failure_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp, |_| {}).await;

        let outcome = p
            .process(arc(
                ScriptedResponse::json("https://site.example/opaque", json!({}))
                    .with_failing_body(),
            ))
            .await;
        assert_eq!(outcome, TaskOutcome::Persisted);

        let rows = records(&p).await;
        let r = &rows[0];
        assert_eq!(r.omitted_reason, Some(OmittedReason::Unavailable));
        assert!(!r.body_available);
        assert!(!r.truncated);
        assert!(r.parse_error.is_some());
    }

    #[tokio::test]
    async fn parse_failure_reason_depends_on_content_type() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp, |_| {}).await;

        p.process(arc(ScriptedResponse::raw(
            "https://site.example/claims-json",
            "application/json",
            b"not json at all".to_vec(),
        )))
        .await;
        p.process(arc(ScriptedResponse::raw(
            "https://site.example/plain",
            "text/plain",
            b"hello".to_vec(),
        )))
        .await;

        let rows = records(&p).await;
        let by_url = |needle: &str| {
            rows.iter()
                .find(|r| r.url.contains(needle))
                .unwrap_or_else(|| panic!("record for {needle}"))
        };
        assert_eq!(
            by_url("claims-json").omitted_reason,
            Some(OmittedReason::ParseError)
        );
        assert_eq!(by_url("plain").omitted_reason, Some(OmittedReason::NonJson));
        for r in &rows {
            assert!(r.body_available);
            assert!(r.inline_body.is_none() && r.body_path.is_none());
            assert!(!r.body_hash.is_empty());
        }
    }

    #[tokio::test]
    async fn duplicates_are_suppressed() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp, |_| {}).await;

        for _ in 0..3 {
            p.process(arc(ScriptedResponse::json(
                "https://site.example/api/list",
                json!({"items": [1, 2]}),
            )))
            .await;
        }

        assert_eq!(records(&p).await.len(), 1);
        assert_eq!(p.duplicates(), 2);
        assert_eq!(p.persisted(), 1);
        assert_eq!(p.total_responses(), 3);
    }

    #[tokio::test]
    async fn capture_cap_is_hard() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp, |o| o.max_captures = 2).await;

        for i in 0..5 {
            p.process(arc(ScriptedResponse::json(
                format!("https://site.example/distinct/{i}"),
                json!({"n": i}),
            )))
            .await;
        }

        assert_eq!(records(&p).await.len(), 2);
        assert_eq!(p.persisted(), 2);
    }

    #[tokio::test]
    async fn non_programmatic_non_json_is_dropped() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp, |_| {}).await;

        let outcome = p
            .process(arc(
                ScriptedResponse::raw("https://site.example/logo.png", "image/png", vec![1, 2, 3])
                    .with_resource_type(ResourceType::Image),
            ))
            .await;
        assert_eq!(outcome, TaskOutcome::Dropped("resource_type"));
        assert!(records(&p).await.is_empty());
    }

    #[tokio::test]
    async fn closing_window_drops_silently() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp, |_| {}).await;
        p.close_window();

        let outcome = p
            .process(arc(ScriptedResponse::json(
                "https://site.example/late",
                json!({}),
            )))
            .await;
        assert_eq!(outcome, TaskOutcome::Skipped);
        assert_eq!(p.total_responses(), 0);
        assert!(records(&p).await.is_empty());
    }

    #[tokio::test]
    async fn credentials_never_reach_the_journal() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(&tmp, |_| {}).await;

        p.process(arc(
            ScriptedResponse::json(
                "https://site.example/profile?token=tok-secret&page=1",
                json!({"email": "ada@example.com", "name": "Ada"}),
            )
            .with_request_header("Authorization", "Bearer bearer-secret"),
        ))
        .await;

        let raw = tokio::fs::read_to_string(p.journal.run_dir().join("index.jsonl"))
            .await
            .unwrap();
        assert!(!raw.contains("tok-secret"));
        assert!(!raw.contains("bearer-secret"));
        assert!(!raw.contains("ada@example.com"));
        assert!(raw.contains("page=1"));
    }
}
