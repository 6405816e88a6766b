//! URL canonicalization and endpoint-key derivation.
//!
//! Two URLs that differ only in fragment, query order, or embedded IDs must
//! collapse onto the same endpoint key; that is what makes per-endpoint
//! aggregation possible.

use std::sync::OnceLock;

use regex::Regex;

/// Canonical form of one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub normalized_url: String,
    pub normalized_path: String,
}

/// Path words that look like IDs but are API vocabulary; never replaced.
const PRESERVED_SEGMENTS: &[&str] = &[
    "api", "v1", "v2", "v3", "v4", "search", "query", "list", "create", "update", "delete",
    "users", "posts", "items", "products", "orders", "comments", "auth", "login", "logout",
    "register", "admin", "public", "private",
];

const ID_TOKEN: &str = ":id";

fn uuid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$",
        )
        .expect("uuid pattern compiles")
    })
}

fn is_preserved(segment: &str) -> bool {
    let lower = segment.to_ascii_lowercase();
    PRESERVED_SEGMENTS.contains(&lower.as_str())
}

/// A segment is ID-like when it is pure digits, a canonical UUID, a long
/// lowercase hex run, or a long opaque slug.
fn is_id_segment(segment: &str) -> bool {
    if segment.is_empty() || is_preserved(segment) {
        return false;
    }
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    if uuid_pattern().is_match(segment) {
        return true;
    }
    if segment.len() >= 32
        && segment
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return true;
    }
    segment.len() >= 20
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Canonicalize a URL: drop the fragment, sort the query, blank ID segments.
///
/// Unparseable (or path-less) input is returned unchanged in both fields, so
/// downstream keying can fall back to the raw string.
pub fn normalize_url(raw: &str) -> Normalized {
    let parsed = url::Url::parse(raw);
    let Ok(mut url) = parsed else {
        return Normalized {
            normalized_url: raw.to_string(),
            normalized_path: raw.to_string(),
        };
    };
    if url.cannot_be_a_base() {
        return Normalized {
            normalized_url: raw.to_string(),
            normalized_path: raw.to_string(),
        };
    }

    url.set_fragment(None);

    let normalized_path: String = url
        .path()
        .split('/')
        .map(|segment| {
            if is_id_segment(segment) {
                ID_TOKEN
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/");
    url.set_path(&normalized_path);

    if url.query().is_some() {
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
    }

    Normalized {
        normalized_url: url.to_string(),
        normalized_path,
    }
}

/// Stable endpoint identity: `"METHOD normalizedPath"`.
pub fn endpoint_key(method: &str, normalized_path: &str) -> String {
    format!("{} {}", method.to_ascii_uppercase(), normalized_path)
}
