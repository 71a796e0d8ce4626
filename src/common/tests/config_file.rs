use std::io::Write;

use common::config::Configuration;

#[test]
fn test_load_from_explicit_path() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    writeln!(
        file,
        r#"
[engine]
allow_dots = true
max_series = 250

[logging]
level = "querier=debug,warn"
"#
    )
    .unwrap();

    let config = Configuration::load_from_path(file.path()).unwrap();

    assert!(config.engine.allow_dots);
    assert_eq!(config.engine.max_series, 250);
    assert_eq!(config.logging.level, "querier=debug,warn");
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Configuration::load_from_path(dir.path().join("absent.toml")).unwrap();

    assert_eq!(config, Configuration::default());
}

#[test]
fn test_malformed_file_is_rejected() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    writeln!(file, "[engine]\nallow_dots = \"maybe\"").unwrap();

    assert!(Configuration::load_from_path(file.path()).is_err());
}
