use apiscope_config::RunOptionsLoader;
use std::{fs, path::PathBuf};
use tempfile::TempDir;

/// Helper to write a YAML file in a temp dir and return its path.
fn write_yaml(tmp: &TempDir, name: &str, yaml: &str) -> PathBuf {
    let p = tmp.path().join(name);
    fs::write(&p, yaml).expect("write yaml");
    p
}

#[test]
fn loads_full_options_file() {
    let tmp = TempDir::new().unwrap();

    let file_yaml = r#"
url: "https://shop.example.com"
monitor_ms: 8000
timeout_ms: 45000
out_dir: "./runs"
include_regex: "api\\."
max_body_bytes: 524288
inline_body_bytes: 8192
max_captures: 200
max_concurrent_captures: 4
capture_all_json: true
consent_mode: generic
consent_action: accept
"#;
    let p = write_yaml(&tmp, "apiscope.yaml", file_yaml);

    let opts = RunOptionsLoader::new()
        .with_file(p)
        .load()
        .expect("load run options");

    assert_eq!(opts.url, "https://shop.example.com");
    assert_eq!(opts.monitor_ms, 8000);
    assert_eq!(opts.out_dir, PathBuf::from("./runs"));
    assert_eq!(opts.include_regex.as_deref(), Some("api\\."));
    assert_eq!(opts.max_body_bytes, 524288);
    assert_eq!(opts.inline_body_bytes, 8192);
    assert_eq!(opts.max_captures, 200);
    assert_eq!(opts.max_concurrent_captures, 4);
    assert!(opts.capture_all_json);
    assert!(!opts.disable_summary);
}

#[test]
fn invalid_combination_fails_at_load() {
    let tmp = TempDir::new().unwrap();

    // monitor window exceeds the hard deadline
    let p = write_yaml(
        &tmp,
        "bad.yaml",
        r#"
url: "https://example.com"
monitor_ms: 90000
timeout_ms: 60000
"#,
    );

    let err = RunOptionsLoader::new().with_file(p).load().unwrap_err();
    assert!(err.to_string().contains("monitorMs"));
}

#[test]
fn env_placeholder_expands_into_options() {
    let tmp = TempDir::new().unwrap();
    let p = write_yaml(
        &tmp,
        "env.yaml",
        r#"
url: "https://${APISCOPE_TEST_HOST}/app"
"#,
    );

    temp_env::with_var("APISCOPE_TEST_HOST", Some("dash.example.com"), || {
        let opts = RunOptionsLoader::new().with_file(&p).load().expect("load");
        assert_eq!(opts.url, "https://dash.example.com/app");
    });
}
