//! Bounded shallow feature extraction over parsed JSON bodies.
//!
//! The extractor never looks deeper than a few levels: the point is a cheap
//! structural fingerprint (schema hash, data-likeness flags, sample paths),
//! not a full schema. Every bound is a hard cap so a pathological payload
//! cannot stall a capture worker; a soft wall-clock budget backstops the
//! caps and returns whatever was computed so far.

use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::record::Features;

const ID_KEYS: &[&str] = &["id", "_id", "uuid"];
const ITEMS_KEYS: &[&str] = &["items", "results", "data", "list"];

/// Traversal caps. Defaults match the published capture contract.
#[derive(Debug, Clone)]
pub struct FeatureBounds {
    pub max_depth: usize,
    pub max_keys_per_object: usize,
    pub max_sample_paths: usize,
    pub max_top_level_keys: usize,
    pub time_budget: Duration,
}

impl Default for FeatureBounds {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_keys_per_object: 50,
            max_sample_paths: 100,
            max_top_level_keys: 20,
            time_budget: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor {
    bounds: FeatureBounds,
}

impl FeatureExtractor {
    pub fn new(bounds: FeatureBounds) -> Self {
        Self { bounds }
    }

    /// Fingerprint one parsed body. Deterministic for bounded inputs.
    pub fn extract(&self, value: &Value) -> Features {
        let deadline = Instant::now() + self.bounds.time_budget;
        let mut features = Features {
            is_array: value.is_array(),
            is_object: value.is_object(),
            is_primitive: !value.is_array() && !value.is_object(),
            ..Features::default()
        };

        match value {
            Value::Object(map) => {
                features.num_keys = Some(map.len());
                let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
                keys.sort_unstable();
                features.schema_hash = schema_hash(&keys);
                features.top_level_keys = keys
                    .iter()
                    .take(self.bounds.max_top_level_keys)
                    .map(|k| k.to_string())
                    .collect();

                for key in map.keys() {
                    let lower = key.to_ascii_lowercase();
                    if ID_KEYS.contains(&lower.as_str()) {
                        features.has_id = true;
                    }
                    if ITEMS_KEYS.contains(&lower.as_str()) {
                        features.has_items = true;
                    }
                    if lower == "results" {
                        features.has_results = true;
                    }
                    if lower == "data" {
                        features.has_data = true;
                    }
                }
            }
            Value::Array(items) => {
                features.array_length = Some(items.len());
            }
            _ => {}
        }

        features.depth_estimate = self
            .depth_of(value, self.bounds.max_depth, deadline)
            .min(self.bounds.max_depth);

        let mut paths = Vec::new();
        self.walk_paths(value, String::new(), 0, deadline, &mut paths);
        features.sample_paths = paths;

        features
    }

    /// Subtree depth: primitives are 0, containers are 1 + deepest child.
    /// `remaining` bounds how far we descend; exhausted levels count as 1.
    fn depth_of(&self, value: &Value, remaining: usize, deadline: Instant) -> usize {
        match value {
            Value::Object(map) if !map.is_empty() => {
                if remaining == 0 || Instant::now() > deadline {
                    return 1;
                }
                1 + map
                    .values()
                    .take(self.bounds.max_keys_per_object)
                    .map(|v| self.depth_of(v, remaining - 1, deadline))
                    .max()
                    .unwrap_or(0)
            }
            Value::Array(items) if !items.is_empty() => {
                if remaining == 0 || Instant::now() > deadline {
                    return 1;
                }
                // Depth is estimated from the first element only.
                1 + self.depth_of(&items[0], remaining - 1, deadline)
            }
            Value::Object(_) | Value::Array(_) => 1,
            _ => 0,
        }
    }

    fn walk_paths(
        &self,
        value: &Value,
        prefix: String,
        depth: usize,
        deadline: Instant,
        out: &mut Vec<String>,
    ) {
        if out.len() >= self.bounds.max_sample_paths || Instant::now() > deadline {
            return;
        }
        match value {
            Value::Object(map) if !map.is_empty() && depth < self.bounds.max_depth => {
                for (key, child) in map.iter().take(self.bounds.max_keys_per_object) {
                    let child_prefix = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    self.walk_paths(child, child_prefix, depth + 1, deadline, out);
                    if out.len() >= self.bounds.max_sample_paths {
                        return;
                    }
                }
            }
            Value::Array(items) if !items.is_empty() && depth < self.bounds.max_depth => {
                // Only the first element is descended into.
                self.walk_paths(&items[0], format!("{prefix}[0]"), depth + 1, deadline, out);
            }
            _ => {
                if !prefix.is_empty() {
                    out.push(prefix);
                }
            }
        }
    }
}

/// Digest of the sorted top-level key set, joined by `|`.
fn schema_hash(sorted_keys: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sorted_keys.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn extract(value: &Value) -> Features {
        FeatureExtractor::default().extract(value)
    }

    #[test]
    fn object_fingerprint() {
        let f = extract(&json!({"id": 123, "name": "test"}));
        assert!(f.is_object && !f.is_array && !f.is_primitive);
        assert_eq!(f.num_keys, Some(2));
        assert_eq!(f.top_level_keys, vec!["id", "name"]);
        assert!(f.has_id);
        assert!(!f.has_items);
        assert_eq!(f.schema_hash.len(), 64);
        assert_eq!(f.depth_estimate, 1);
        assert_eq!(f.sample_paths, vec!["id", "name"]);
    }

    #[test]
    fn array_of_objects_fingerprint() {
        let f = extract(&json!([{"id": 1, "value": "x"}, {"id": 2, "value": "y"}]));
        assert!(f.is_array);
        assert_eq!(f.array_length, Some(2));
        assert_eq!(f.schema_hash, "");
        assert_eq!(f.depth_estimate, 2);
        assert_eq!(f.sample_paths, vec!["[0].id", "[0].value"]);
    }

    #[test]
    fn primitives_and_null_are_primitive() {
        for v in [json!(null), json!(42), json!("s"), json!(true)] {
            let f = extract(&v);
            assert!(f.is_primitive);
            assert_eq!(f.schema_hash, "");
            assert_eq!(f.depth_estimate, 0);
            assert!(f.sample_paths.is_empty());
        }
    }

    #[test]
    fn data_likeness_flags_are_case_insensitive_and_disjunctive() {
        let f = extract(&json!({"Results": [], "DATA": {}, "list": []}));
        assert!(f.has_items);
        assert!(f.has_results);
        assert!(f.has_data);
        assert!(!f.has_id);
    }

    #[test]
    fn depth_is_capped() {
        let v = json!({"a": {"b": {"c": {"d": {"e": 1}}}}});
        let f = extract(&v);
        assert_eq!(f.depth_estimate, 3);
    }

    #[test]
    fn sample_paths_are_capped() {
        let mut obj = serde_json::Map::new();
        for i in 0..60 {
            let mut inner = serde_json::Map::new();
            for j in 0..10 {
                inner.insert(format!("f{j:02}"), json!(j));
            }
            obj.insert(format!("k{i:03}"), Value::Object(inner));
        }
        let f = extract(&Value::Object(obj));
        assert_eq!(f.sample_paths.len(), 100);
        assert_eq!(f.top_level_keys.len(), 20);
        assert_eq!(f.num_keys, Some(60));
    }

    #[test]
    fn extraction_is_deterministic() {
        let v = json!({"items": [{"id": 1, "tags": ["a", "b"]}], "total": 1});
        let a = extract(&v);
        let b = extract(&v);
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }
}
