use dfe_config::{load_layered_yaml_from_strings, report_unused_keys, UnusedKeyPolicy};

/// Validates:
/// 1) Unused keys are detected in WARN mode but do not error.
/// 2) Unused keys cause failure in FAIL mode.
/// 3) Keys under consumed prefixes are not flagged.

const YAML: &str = r#"
environment: production
sync:
  quota_limit: 20
legacy:
  poll_minutes: 60
  output_dir: "/tmp/xml"
"#;

#[test]
fn warn_mode_reports_unused_keys_without_error() {
    let loaded = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let report = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)
        .expect("warn mode must not error");

    assert!(!report.is_clean());
    assert_eq!(
        report.unused_leaf_pointers,
        vec!["/legacy/output_dir".to_string(), "/legacy/poll_minutes".to_string()],
        "unused pointers are sorted and limited to unconsumed leaves"
    );
}

#[test]
fn fail_mode_errors_on_unused_keys() {
    let loaded = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let err = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Fail).unwrap_err();
    assert!(err.to_string().contains("CONFIG_UNUSED_KEYS"));
}

#[test]
fn consumed_sections_are_clean() {
    let yaml = r#"
environment: production
sync:
  quota_limit: 20
endpoints:
  events:
    "35": "https://example.invalid/evento"
tls:
  ca_bundle_path: "/etc/dfe/icp-brasil.pem"
"#;
    let loaded = load_layered_yaml_from_strings(&[yaml]).unwrap();
    let report = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Fail).unwrap();
    assert!(report.is_clean());
}
