use cncstream_communication::Firmware;
use cncstream_settings::{load_or_default, Config, SettingsError};
use tempfile::TempDir;

fn sample() -> Config {
    let mut config = Config::new();
    config.connection.firmware = Firmware::Smoothie;
    config.connection.port = Some("/dev/ttyACM0".to_string());
    config.connection.baud_rate = 250000;
    config.streaming.buffer_size = Some(64);
    config.streaming.status_poll_rate_ms = 500;
    config.watchdog.enabled = false;
    config
}

#[test]
fn test_toml_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    sample().save_to_file(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("[connection]"));
    assert_eq!(Config::load_from_file(&path).unwrap(), sample());
}

#[test]
fn test_json_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");

    sample().save_to_file(&path).unwrap();
    assert_eq!(Config::load_from_file(&path).unwrap(), sample());
}

#[test]
fn test_invalid_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[connection]\nbaud_rate = 0\n").unwrap();

    let err = Config::load_from_file(&path).unwrap_err();
    assert!(matches!(err, SettingsError::InvalidSetting { .. }));
}

#[test]
fn test_invalid_config_is_not_saved() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    let mut config = Config::new();
    config.watchdog.check_interval_ms = 0;

    assert!(config.save_to_file(&path).is_err());
    assert!(!path.exists());
}

#[test]
fn test_malformed_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(
        Config::load_from_file(&path),
        Err(SettingsError::JsonError(_))
    ));
}

#[test]
fn test_load_or_default_requires_named_file() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.toml");
    let err = load_or_default(Some(&missing)).unwrap_err();
    assert!(err.to_string().contains("missing.toml"));

    let path = dir.path().join("config.toml");
    sample().save_to_file(&path).unwrap();
    assert_eq!(load_or_default(Some(&path)).unwrap(), sample());
}
