//! Loader and validation for run options, with file + environment overlays.
//!
//! A [`RunOptions`] value is the frozen input of a single capture run. It can
//! be built programmatically, or loaded from a YAML/TOML/JSON file merged
//! with `APISCOPE_`-prefixed environment variables via [`RunOptionsLoader`].
//! `${VAR}` placeholders inside string values are expanded before the typed
//! struct is materialised.
use apiscope_common::{ConsentAction, ConsentMode, ScopeError};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

const DEFAULT_MAX_BODY_BYTES: u64 = 1024 * 1024;
const DEFAULT_INLINE_BODY_BYTES: u64 = 16 * 1024;

/// Effective options of one capture run.
///
/// The struct is serialised verbatim into `run.json` so that a capture
/// directory records exactly the knobs it was produced with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Target page URL.
    pub url: String,
    /// Capture-window duration after the page settles, in milliseconds.
    ///
    /// The snake_case aliases keep config files and `APISCOPE_` environment
    /// overrides working: the `config` crate lowercases keys, so camelCase
    /// only appears in persisted artifacts.
    #[serde(default = "default_monitor_ms", alias = "monitor_ms")]
    pub monitor_ms: u64,
    /// Global hard deadline and per-stage ceiling, in milliseconds.
    #[serde(default = "default_timeout_ms", alias = "timeout_ms")]
    pub timeout_ms: u64,
    /// Root directory for run directories.
    #[serde(default = "default_out_dir", alias = "out_dir")]
    pub out_dir: PathBuf,
    /// Only responses whose URL matches are considered.
    #[serde(default, alias = "include_regex", skip_serializing_if = "Option::is_none")]
    pub include_regex: Option<String>,
    /// Responses whose URL matches are dropped.
    #[serde(default, alias = "exclude_regex", skip_serializing_if = "Option::is_none")]
    pub exclude_regex: Option<String>,
    /// Absolute body cap in bytes; larger bodies are never persisted.
    #[serde(default = "default_max_body_bytes", alias = "max_body_bytes")]
    pub max_body_bytes: u64,
    /// Bodies at or below this size are inlined into the journal line.
    #[serde(default = "default_inline_body_bytes", alias = "inline_body_bytes")]
    pub inline_body_bytes: u64,
    /// Hard cap on persisted records; 0 means unlimited.
    #[serde(default, alias = "max_captures")]
    pub max_captures: u64,
    /// Concurrency limit for response processing.
    #[serde(
        default = "default_max_concurrent_captures",
        alias = "max_concurrent_captures"
    )]
    pub max_concurrent_captures: usize,
    /// Keep any JSON response regardless of its resource type.
    #[serde(default, alias = "capture_all_json")]
    pub capture_all_json: bool,
    /// Path/reference of a user flow script, resolved by the host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    /// Ask the session to record a HAR archive into the run directory.
    #[serde(default, alias = "save_har")]
    pub save_har: bool,
    /// Ask the session to record an engine trace into the run directory.
    #[serde(default)]
    pub trace: bool,
    /// User agent forwarded to the browser context.
    #[serde(default, alias = "user_agent", skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Interstitial handler selection.
    #[serde(default, alias = "consent_mode")]
    pub consent_mode: ConsentMode,
    /// Which consent button family to press.
    #[serde(default, alias = "consent_action")]
    pub consent_action: ConsentAction,
    /// Explicit handler names, used when `consent_mode` is `auto`.
    #[serde(default, alias = "consent_handlers", skip_serializing_if = "Vec::is_empty")]
    pub consent_handlers: Vec<String>,
    /// Seed cookies/local storage from this opaque blob.
    #[serde(default, alias = "storage_state", skip_serializing_if = "Option::is_none")]
    pub storage_state: Option<PathBuf>,
    /// Persist cookies/local storage here at CLOSE.
    #[serde(
        default,
        alias = "save_storage_state",
        skip_serializing_if = "Option::is_none"
    )]
    pub save_storage_state: Option<PathBuf>,
    /// Alias used by session tooling for the storage-state write path.
    #[serde(default, alias = "save_session", skip_serializing_if = "Option::is_none")]
    pub save_session: Option<PathBuf>,
    /// Skip the AGGREGATE stage entirely.
    #[serde(default, alias = "disable_summary")]
    pub disable_summary: bool,
    /// Watch mode: capture until interrupted; the hard deadline is not armed.
    #[serde(default)]
    pub watch: bool,
}

fn default_monitor_ms() -> u64 {
    10_000
}
fn default_timeout_ms() -> u64 {
    60_000
}
fn default_out_dir() -> PathBuf {
    PathBuf::from("captures")
}
fn default_max_body_bytes() -> u64 {
    DEFAULT_MAX_BODY_BYTES
}
fn default_inline_body_bytes() -> u64 {
    DEFAULT_INLINE_BODY_BYTES
}
fn default_max_concurrent_captures() -> usize {
    6
}

impl RunOptions {
    /// Minimal options for a target URL; everything else at defaults.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            monitor_ms: default_monitor_ms(),
            timeout_ms: default_timeout_ms(),
            out_dir: default_out_dir(),
            include_regex: None,
            exclude_regex: None,
            max_body_bytes: default_max_body_bytes(),
            inline_body_bytes: default_inline_body_bytes(),
            max_captures: 0,
            max_concurrent_captures: default_max_concurrent_captures(),
            capture_all_json: false,
            flow: None,
            save_har: false,
            trace: false,
            user_agent: None,
            consent_mode: ConsentMode::default(),
            consent_action: ConsentAction::default(),
            consent_handlers: Vec::new(),
            storage_state: None,
            save_storage_state: None,
            save_session: None,
            disable_summary: false,
            watch: false,
        }
    }

    /// Reject invalid combinations before any run directory exists.
    ///
    /// ```
    /// use apiscope_config::RunOptions;
    ///
    /// let mut opts = RunOptions::for_url("https://example.com");
    /// assert!(opts.validate().is_ok());
    ///
    /// opts.max_concurrent_captures = 0;
    /// assert!(opts.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), ScopeError> {
        if url::Url::parse(&self.url).is_err() {
            return Err(ScopeError::Config(format!(
                "target url does not parse: {}",
                self.url
            )));
        }
        if !self.watch && self.monitor_ms >= self.timeout_ms {
            return Err(ScopeError::Config(format!(
                "monitorMs ({}) must be below timeoutMs ({})",
                self.monitor_ms, self.timeout_ms
            )));
        }
        if self.inline_body_bytes > self.max_body_bytes {
            return Err(ScopeError::Config(format!(
                "inlineBodyBytes ({}) must not exceed maxBodyBytes ({})",
                self.inline_body_bytes, self.max_body_bytes
            )));
        }
        if self.max_concurrent_captures < 1 {
            return Err(ScopeError::Config(
                "maxConcurrentCaptures must be at least 1".into(),
            ));
        }
        for (name, pattern) in [
            ("includeRegex", &self.include_regex),
            ("excludeRegex", &self.exclude_regex),
        ] {
            if let Some(p) = pattern {
                regex::Regex::new(p)
                    .map_err(|e| ScopeError::Config(format!("{name} does not compile: {e}")))?;
            }
        }
        Ok(())
    }
}

/// Passes over one string before giving up on `${VAR}` chains; keeps
/// self-referential variables from looping forever.
const ENV_EXPANSION_PASSES: usize = 8;

// FIXME(config): support `${VAR:-default}` fallback syntax once shellexpand
// exposes it without pulling in a full shell parser.
fn expand_placeholders(tree: Value) -> Value {
    match tree {
        Value::String(s) => Value::String(expand_string(s)),
        Value::Array(items) => Value::Array(items.into_iter().map(expand_placeholders).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, expand_placeholders(value)))
                .collect(),
        ),
        scalar => scalar,
    }
}

/// Expand env placeholders in one string until it stops changing. Unknown
/// variables leave the placeholder in place so the error is visible where
/// the value is consumed.
fn expand_string(mut value: String) -> String {
    if !value.contains('$') {
        return value;
    }
    for _ in 0..ENV_EXPANSION_PASSES {
        let expanded = match shellexpand::env(&value) {
            Ok(cow) => cow.into_owned(),
            Err(_) => break,
        };
        if expanded == value {
            break;
        }
        value = expanded;
    }
    value
}

/// Builder that hides the `config` crate wiring (file + env overrides).
pub struct RunOptionsLoader {
    builder: config::ConfigBuilder<config::builder::DefaultState>,
}

impl Default for RunOptionsLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl RunOptionsLoader {
    /// Start with sensible defaults: `APISCOPE_` env overrides are always on.
    ///
    /// ```
    /// use apiscope_config::RunOptionsLoader;
    ///
    /// let opts = RunOptionsLoader::new()
    ///     .with_yaml_str("url: https://example.com")
    ///     .load()
    ///     .expect("valid options");
    ///
    /// assert_eq!(opts.url, "https://example.com");
    /// assert_eq!(opts.max_concurrent_captures, 6);
    /// ```
    pub fn new() -> Self {
        let builder =
            Config::builder().add_source(Environment::with_prefix("APISCOPE").separator("__"));
        Self { builder }
    }

    /// Attach an options file; the `config` crate infers format by suffix.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.builder = self.builder.add_source(File::from(path.as_ref()));
        self
    }

    /// Allow tests and embedders to merge inline YAML snippets.
    pub fn with_yaml_str(mut self, yaml: &str) -> Self {
        self.builder = self
            .builder
            .add_source(File::from_str(yaml, config::FileFormat::Yaml));
        self
    }

    /// Consume the builder and deserialize the merged sources.
    ///
    /// The merged tree is expanded for `${VAR}` placeholders first, then
    /// deserialised and validated; an invalid combination surfaces here, not
    /// at LAUNCH.
    pub fn load(self) -> Result<RunOptions, ScopeError> {
        let cfg = self
            .builder
            .build()
            .map_err(|e| ScopeError::Config(e.to_string()))?;

        let merged: Value = cfg
            .try_deserialize()
            .map_err(|e| ScopeError::Config(e.to_string()))?;
        let expanded = expand_placeholders(merged);

        let typed: RunOptions =
            serde_json::from_value(expanded).map_err(|e| ScopeError::Config(e.to_string()))?;
        typed.validate()?;
        Ok(typed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expands_simple_string() {
        temp_env::with_var("SCOPE_FOO", Some("bar"), || {
            let v = expand_placeholders(json!("prefix-${SCOPE_FOO}-suffix"));
            assert_eq!(v, json!("prefix-bar-suffix"));
        });
    }

    #[test]
    fn expands_in_array_and_object() {
        temp_env::with_vars(
            [("SCOPE_HOST", Some("api.example.com")), ("SCOPE_VER", Some("v2"))],
            || {
                let v = expand_placeholders(json!([
                    "https://$SCOPE_HOST",
                    { "path": "${SCOPE_VER}/items" },
                    42,
                    true,
                    null
                ]));
                assert_eq!(
                    v,
                    json!(["https://api.example.com", { "path": "v2/items" }, 42, true, null])
                );
            },
        );
    }

    #[test]
    fn chained_variables_expand_to_a_fixed_point() {
        temp_env::with_vars(
            [
                ("SCOPE_INNER", Some("deep")),
                ("SCOPE_OUTER", Some("wrap-${SCOPE_INNER}")),
            ],
            || {
                let v = expand_placeholders(json!("${SCOPE_OUTER}-end"));
                assert_eq!(v, json!("wrap-deep-end"));
            },
        );
    }

    #[test]
    fn stops_on_cycles_and_leaves_value_reasonable() {
        temp_env::with_vars(
            [("SCOPE_A", Some("${SCOPE_B}")), ("SCOPE_B", Some("${SCOPE_A}"))],
            || {
                let v = expand_placeholders(json!("x=${SCOPE_A}-y"));
                let s = v.as_str().unwrap();
                assert!(s.starts_with("x=") && s.ends_with("-y"));
                assert!(s.contains("${"));
            },
        );
    }

    #[test]
    fn unknown_vars_are_left_as_is() {
        let v = expand_placeholders(json!("hi-${SCOPE_DOES_NOT_EXIST}"));
        assert_eq!(v, json!("hi-${SCOPE_DOES_NOT_EXIST}"));
    }

    #[test]
    fn validate_rejects_monitor_at_or_above_timeout() {
        let mut opts = RunOptions::for_url("https://example.com");
        opts.monitor_ms = opts.timeout_ms;
        assert!(opts.validate().is_err());

        // Watch mode ignores the deadline relationship.
        opts.watch = true;
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inline_above_max() {
        let mut opts = RunOptions::for_url("https://example.com");
        opts.inline_body_bytes = opts.max_body_bytes + 1;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_regex() {
        let mut opts = RunOptions::for_url("https://example.com");
        opts.include_regex = Some("([".into());
        assert!(opts.validate().is_err());
    }
}
