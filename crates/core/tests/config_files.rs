use switchboard_core::config::{CfiConfig, ConfigError, ResidualMode};

#[test]
fn yaml_overrides_keep_remaining_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("cfi.yaml");
    std::fs::write(
        &path,
        "min_id: 16\ndispatcher_limit: 3\nresidual_check: error\nruntime:\n  sled_capacity: 64\n",
    )
    .expect("write");

    let config = CfiConfig::load(&path).expect("load");
    assert_eq!(config.min_id, 16);
    assert_eq!(config.dispatcher_limit, 3);
    assert_eq!(config.residual_check, ResidualMode::Error);
    assert_eq!(config.runtime.sled_capacity, 64);
    assert_eq!(config.runtime.secondary_capacity, 1023);
    assert_eq!(config.id_bitwidth, 31);
    assert!(config.is_carve_out("libc_start_init"));
}

#[test]
fn json_is_accepted_too() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("cfi.json");
    std::fs::write(&path, r#"{"debug": true, "output_name": "libx.so"}"#).expect("write");
    let config = CfiConfig::load(&path).expect("load");
    assert!(config.debug);
    assert_eq!(config.output_name, "libx.so");
}

#[test]
fn invalid_values_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("bad.yaml");
    std::fs::write(&path, "id_bitwidth: 4\nmin_id: 100\n").expect("write");
    assert!(matches!(CfiConfig::load(&path), Err(ConfigError::Invalid(_))));

    std::fs::write(&path, "min_id: [oops\n").expect("write");
    assert!(matches!(CfiConfig::load(&path), Err(ConfigError::Document(_))));
}

#[test]
fn fingerprint_tracks_content() {
    let a = CfiConfig::default();
    let b = CfiConfig { debug: true, ..CfiConfig::default() };
    assert_eq!(a.fingerprint(), CfiConfig::default().fingerprint());
    assert_ne!(a.fingerprint(), b.fingerprint());
}
