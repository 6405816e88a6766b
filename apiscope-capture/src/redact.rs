//! Strips credentials and personal data before anything is persisted.
//!
//! Every function here is total: on any internal failure the input is
//! returned unchanged. The sensitive key sets are fixed contract constants;
//! widening them requires a configuration surface, not an edit here.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-auth-token",
    "api-key",
];

const SENSITIVE_QUERY_PARAMS: &[&str] = &[
    "token",
    "key",
    "auth",
    "session",
    "sig",
    "signature",
    "apikey",
    "api_key",
];

// Exact, case-sensitive: JSON keys are producer-controlled identifiers.
const SENSITIVE_JSON_KEYS: &[&str] = &[
    "password",
    "token",
    "secret",
    "email",
    "apiKey",
    "api_key",
    "accessToken",
    "access_token",
    "refreshToken",
    "refresh_token",
];

const MAX_REDACT_DEPTH: usize = 64;
const MAX_ERROR_CHARS: usize = 200;

/// Replace values of credential-bearing headers, preserving key case.
pub fn redact_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.to_ascii_lowercase();
            if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                (name.clone(), REDACTED.to_string())
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

/// Replace values of credential-bearing query parameters, leaving the rest
/// of the URL intact. Unparseable input is returned unchanged.
pub fn redact_url(raw: &str) -> String {
    let Ok(mut url) = url::Url::parse(raw) else {
        return raw.to_string();
    };
    if url.query().is_none() {
        return raw.to_string();
    }

    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let lower = k.to_ascii_lowercase();
            if SENSITIVE_QUERY_PARAMS.contains(&lower.as_str()) {
                (k.into_owned(), REDACTED.to_string())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();

    url.query_pairs_mut().clear().extend_pairs(pairs);
    url.to_string()
}

/// Recursively blank values under sensitive keys. Terminates on arbitrarily
/// deep input via a hard depth cap.
pub fn redact_json(value: &Value) -> Value {
    redact_json_bounded(value, 0)
}

fn redact_json_bounded(value: &Value, depth: usize) -> Value {
    if depth >= MAX_REDACT_DEPTH {
        return value.clone();
    }
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, val) in map {
                if SENSITIVE_JSON_KEYS.contains(&key.as_str()) {
                    out.insert(key.clone(), Value::String(REDACTED.to_string()));
                } else {
                    out.insert(key.clone(), redact_json_bounded(val, depth + 1));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| redact_json_bounded(v, depth + 1))
                .collect(),
        ),
        primitive => primitive.clone(),
    }
}

fn path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Windows drive paths, or POSIX home-rooted paths, up to whitespace.
        Regex::new(r"(?:[A-Za-z]:\\\S+|/(?:home|Users)/\S*)").expect("path pattern compiles")
    })
}

/// Truncate an error message and blank any absolute filesystem path in it.
pub fn redact_error(message: &str) -> String {
    let truncated: String = message.chars().take(MAX_ERROR_CHARS).collect();
    path_pattern().replace_all(&truncated, "[PATH]").into_owned()
}
