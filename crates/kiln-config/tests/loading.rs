use std::io::Write;

use kiln_config::{load_settings, ConfigError};

#[test]
fn defaults_without_a_file() {
    let settings = load_settings(None).expect("defaults should validate");
    assert_eq!(settings.loop_interval_sec, 5);
    assert_eq!(settings.global_max_vms, 100);
    assert_eq!(settings.label_burst, 3);
    assert!(!settings.allow_unknown_host_registration);
}

#[test]
fn partial_file_fills_in_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "ci_url: http://ci.internal:8080").unwrap();
    writeln!(file, "label_burst: 7").unwrap();
    writeln!(file, "agent_auth_token: sekrit").unwrap();

    let settings = load_settings(Some(file.path())).unwrap();
    assert_eq!(settings.ci_url, "http://ci.internal:8080");
    assert_eq!(settings.label_burst, 7);
    assert_eq!(settings.agent_auth_token.as_deref(), Some("sekrit"));
    // untouched keys keep their defaults
    assert_eq!(settings.vm_ttl_sec, 7200);
}

#[test]
fn out_of_range_value_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "loop_interval_sec: 0").unwrap();

    let err = load_settings(Some(file.path())).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { key: "loop_interval_sec", .. }));
}

#[test]
fn unknown_key_is_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "loop_interval: 5").unwrap();

    assert!(matches!(
        load_settings(Some(file.path())),
        Err(ConfigError::YamlParse { .. })
    ));
}

#[test]
fn missing_file_returns_io_error() {
    let err = load_settings(Some(std::path::Path::new("/nonexistent/kiln.yml"))).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}
