use imac_dimmer::config::{
    DEVICE_CONFIG_FILE, DIMMER_CONFIG_FILE, DeviceAddress, DeviceConfig, DimmerConfig, JsonStore,
};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn dimmer_config_round_trips_through_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(DIMMER_CONFIG_FILE);
    let cfg = DimmerConfig {
        idle_minutes: 5.0,
        dim_level: 10,
        check_interval: 15,
        last_updated: None,
    };
    JsonStore::new(&path).pretty().save(&cfg).unwrap();

    let loaded = JsonStore::<DimmerConfig>::new(&path).load();
    assert_eq!(loaded, cfg);
    assert_eq!(loaded.idle_threshold(), Duration::from_secs(300));
    assert_eq!(loaded.poll_interval(), Duration::from_secs(15));
}

#[test]
fn dimmer_config_is_pretty_printed_with_legacy_keys() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(DIMMER_CONFIG_FILE);
    JsonStore::new(&path)
        .pretty()
        .save(&DimmerConfig::default())
        .unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains('\n'));
    let raw: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(raw["idle_minutes"], 10.0);
    assert_eq!(raw["dim_level"], 0);
    assert_eq!(raw["check_interval"], 30);
}

#[test]
fn partial_dimmer_config_fills_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(DIMMER_CONFIG_FILE);
    fs::write(&path, r#"{"dim_level": 20}"#).unwrap();

    let cfg = JsonStore::<DimmerConfig>::new(&path).load();
    assert_eq!(cfg.dim_level, 20);
    assert_eq!(cfg.idle_minutes, 10.0);
    assert_eq!(cfg.check_interval, 30);
}

#[test]
fn device_config_keeps_both_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::<DeviceConfig>::new(dir.path().join(DEVICE_CONFIG_FILE));

    let mut cfg = store.load();
    cfg.remember(&DeviceAddress::HttpEndpoint("10.0.1.27".into()));
    cfg.remember(&DeviceAddress::SerialPath("/dev/ttyACM0".into()));
    cfg.last_brightness = 33;
    store.save(&cfg).unwrap();

    let loaded = store.load();
    assert_eq!(loaded.host.as_deref(), Some("10.0.1.27"));
    assert_eq!(loaded.port, Some(PathBuf::from("/dev/ttyACM0")));
    assert_eq!(loaded.last_brightness, 33);
}

#[test]
fn unreadable_device_config_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(DEVICE_CONFIG_FILE);
    fs::write(&path, "esp32_ip=10.0.1.27").unwrap();

    let cfg = JsonStore::<DeviceConfig>::new(&path).load();
    assert_eq!(cfg, DeviceConfig::default());
    assert_eq!(cfg.last_brightness, 70);
}

#[test]
fn oversized_idle_minutes_load_without_panicking() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(DIMMER_CONFIG_FILE);
    fs::write(&path, r#"{"idle_minutes": 1e300, "dim_level": 5}"#).unwrap();

    let mut cfg = JsonStore::<DimmerConfig>::new(&path).load();
    assert_eq!(cfg.idle_threshold(), Duration::MAX);

    cfg.normalize();
    assert_eq!(cfg.idle_minutes, 10.0);
    assert_eq!(cfg.dim_level, 5);
    assert_eq!(cfg.idle_threshold(), Duration::from_secs(600));
}
