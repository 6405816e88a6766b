//! JSON-gating: decides which responses are worth a body read at all.
//!
//! Gates run in a fixed order: capture capacity, include/exclude URL
//! filters, the resource-type/content-type gate, the status gate, then the
//! empty-body and declared-size shortcuts. Everything after that is the
//! worker's body-read path.

use apiscope_config::RunOptions;
use apiscope_common::ScopeError;
use apiscope_session::ResourceType;
use regex::Regex;

use crate::record::OmittedReason;

/// Content types treated as JSON (substring match, case-insensitive).
pub const JSON_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/ld+json",
    "application/hal+json",
    "application/vnd.api+json",
];

pub fn is_json_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = content_type else { return false };
    let lower = ct.to_ascii_lowercase();
    JSON_CONTENT_TYPES.iter().any(|t| lower.contains(t))
}

/// Outcome of screening one response before its body is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    /// Not interesting; no record, no side effect.
    Drop(DropCause),
    /// Persist a metadata-only record; do not attempt a body read.
    MetadataOnly(OmittedReason),
    /// Proceed to the body read.
    ReadBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    Capacity,
    IncludeMiss,
    ExcludeHit,
    ResourceType,
    Status,
}

impl DropCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capacity => "capacity",
            Self::IncludeMiss => "include_miss",
            Self::ExcludeHit => "exclude_hit",
            Self::ResourceType => "resource_type",
            Self::Status => "status",
        }
    }
}

pub struct ResponseClassifier {
    include: Option<Regex>,
    exclude: Option<Regex>,
    capture_all_json: bool,
    max_captures: u64,
    max_body_bytes: u64,
}

impl ResponseClassifier {
    pub fn from_options(opts: &RunOptions) -> Result<Self, ScopeError> {
        let compile = |name: &str, pattern: &Option<String>| -> Result<Option<Regex>, ScopeError> {
            pattern
                .as_deref()
                .map(|p| {
                    Regex::new(p)
                        .map_err(|e| ScopeError::Config(format!("{name} does not compile: {e}")))
                })
                .transpose()
        };
        Ok(Self {
            include: compile("includeRegex", &opts.include_regex)?,
            exclude: compile("excludeRegex", &opts.exclude_regex)?,
            capture_all_json: opts.capture_all_json,
            max_captures: opts.max_captures,
            max_body_bytes: opts.max_body_bytes,
        })
    }

    /// Gate 1: cheap capacity pre-check against the persisted-record count.
    /// The authoritative reservation happens at append time.
    pub fn at_capacity(&self, persisted: u64) -> bool {
        self.max_captures > 0 && persisted >= self.max_captures
    }

    /// Gates 2–3: URL include/exclude filters on the raw URL.
    pub fn url_gate(&self, url: &str) -> Option<DropCause> {
        if let Some(include) = &self.include {
            if !include.is_match(url) {
                return Some(DropCause::IncludeMiss);
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(url) {
                return Some(DropCause::ExcludeHit);
            }
        }
        None
    }

    /// Gates 4–7, run once headers are available.
    pub fn screen(
        &self,
        resource_type: &ResourceType,
        content_type: Option<&str>,
        status: u16,
        declared_length: Option<u64>,
    ) -> Screen {
        // Gate 4: in default mode only programmatic requests or JSON-typed
        // responses pass; captureAllJson removes the resource-type gate and
        // lets the parse attempt decide.
        let json_typed = is_json_content_type(content_type);
        if !self.capture_all_json && !resource_type.is_xhr_or_fetch() && !json_typed {
            return Screen::Drop(DropCause::ResourceType);
        }

        // Gate 5: success statuses only.
        if !(200..400).contains(&status) {
            return Screen::Drop(DropCause::Status);
        }

        // Gate 6: statuses that carry no body by definition.
        if status == 204 || status == 304 {
            return Screen::MetadataOnly(OmittedReason::EmptyBody);
        }

        // Gate 7: declared size over the cap; skip the read entirely.
        if let Some(len) = declared_length {
            if len > self.max_body_bytes {
                return Screen::MetadataOnly(OmittedReason::MaxBodyBytes);
            }
        }

        Screen::ReadBody
    }

    /// Whether a failed parse should be reported as `parseError` (we promised
    /// to try) rather than `nonJson`.
    pub fn expects_json(&self, content_type: Option<&str>) -> bool {
        self.capture_all_json || is_json_content_type(content_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(mutate: impl FnOnce(&mut RunOptions)) -> ResponseClassifier {
        let mut opts = RunOptions::for_url("https://example.com");
        mutate(&mut opts);
        ResponseClassifier::from_options(&opts).unwrap()
    }

    #[test]
    fn default_mode_keeps_xhr_and_json_typed() {
        let c = classifier(|_| {});
        assert_eq!(
            c.screen(&ResourceType::Xhr, Some("text/plain"), 200, None),
            Screen::ReadBody
        );
        assert_eq!(
            c.screen(&ResourceType::Script, Some("application/json"), 200, None),
            Screen::ReadBody
        );
        assert_eq!(
            c.screen(&ResourceType::Image, Some("image/png"), 200, None),
            Screen::Drop(DropCause::ResourceType)
        );
    }

    #[test]
    fn capture_all_json_drops_the_resource_gate() {
        let c = classifier(|o| o.capture_all_json = true);
        assert_eq!(
            c.screen(&ResourceType::Image, Some("image/png"), 200, None),
            Screen::ReadBody
        );
    }

    #[test]
    fn content_type_match_is_case_insensitive_substring() {
        assert!(is_json_content_type(Some("Application/JSON; charset=utf-8")));
        assert!(is_json_content_type(Some("application/vnd.api+json")));
        assert!(!is_json_content_type(Some("text/html")));
        assert!(!is_json_content_type(None));
    }

    #[test]
    fn non_success_statuses_drop() {
        let c = classifier(|_| {});
        for status in [199, 400, 404, 500] {
            assert_eq!(
                c.screen(&ResourceType::Fetch, None, status, None),
                Screen::Drop(DropCause::Status),
                "status {status}"
            );
        }
        assert_eq!(c.screen(&ResourceType::Fetch, None, 302, None), Screen::ReadBody);
    }

    #[test]
    fn empty_body_statuses_skip_the_read() {
        let c = classifier(|_| {});
        for status in [204, 304] {
            assert_eq!(
                c.screen(&ResourceType::Fetch, None, status, None),
                Screen::MetadataOnly(OmittedReason::EmptyBody)
            );
        }
    }

    #[test]
    fn declared_oversize_skips_the_read() {
        let c = classifier(|o| o.max_body_bytes = 1000);
        assert_eq!(
            c.screen(&ResourceType::Fetch, None, 200, Some(1001)),
            Screen::MetadataOnly(OmittedReason::MaxBodyBytes)
        );
        assert_eq!(
            c.screen(&ResourceType::Fetch, None, 200, Some(1000)),
            Screen::ReadBody
        );
    }

    #[test]
    fn url_gates_apply_in_order() {
        let c = classifier(|o| {
            o.include_regex = Some("api\\.".into());
            o.exclude_regex = Some("analytics".into());
        });
        assert_eq!(c.url_gate("https://cdn.example.com/app.js"), Some(DropCause::IncludeMiss));
        assert_eq!(
            c.url_gate("https://api.example.com/analytics/ping"),
            Some(DropCause::ExcludeHit)
        );
        assert_eq!(c.url_gate("https://api.example.com/v1/items"), None);
    }

    #[test]
    fn capacity_precheck() {
        let c = classifier(|o| o.max_captures = 2);
        assert!(!c.at_capacity(1));
        assert!(c.at_capacity(2));
        let unlimited = classifier(|_| {});
        assert!(!unlimited.at_capacity(u64::MAX));
    }
}
