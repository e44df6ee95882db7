// Integration tests for configuration loading and validation

mod common;

use common::{create_temp_state_path, create_test_config};
use conservative_grid_bot::{BotConfig, ConfigError, StoreBackend};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_config_creation() {
    let (_temp_dir, path) = create_temp_state_path();
    let config = create_test_config(path.clone());

    assert_eq!(config.grid.pair, "BTC/USDT");
    assert_eq!(config.grid.level_count, 5);
    assert!(config.grid.capital > 0.0);
    assert_eq!(config.persistence.path, path);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_serialization_deserialization() {
    let (_temp_dir, path) = create_temp_state_path();
    let config = create_test_config(path);

    let toml_string = toml::to_string(&config).expect("Failed to serialize config");
    assert!(toml_string.contains("lower_bound"));
    assert!(toml_string.contains("BTC/USDT"));

    let deserialized = BotConfig::from_toml_str(&toml_string).expect("Failed to deserialize config");
    assert_eq!(deserialized.grid.pair, config.grid.pair);
    assert_eq!(deserialized.grid.level_count, config.grid.level_count);
    assert_eq!(deserialized.execution.retry_base_delay_ms, 1);
}

#[test]
fn test_config_file_loading() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("grid.toml");

    fs::write(
        &config_path,
        r#"
        [grid]
        pair = "SOL/USDC"
        lower_bound = 120.0
        upper_bound = 180.0
        level_count = 13
        spacing_mode = "geometric"
        capital = 2500.0
        min_order_size = 0.01

        [persistence]
        backend = "sqlite"
        path = "data/sol.db"

        [logging]
        level = "debug"
        json = true
        "#,
    )
    .expect("Failed to write config file");

    let loaded = BotConfig::from_file(&config_path).expect("Failed to load config");
    assert_eq!(loaded.grid.pair, "SOL/USDC");
    assert_eq!(loaded.grid.level_count, 13);
    assert_eq!(loaded.persistence.backend, StoreBackend::Sqlite);
    assert!(loaded.logging.json);
}

#[test]
fn test_load_or_create_writes_default() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = temp_dir.path().join("nested").join("config.toml");

    let created = BotConfig::load_or_create(&config_path).expect("Failed to create config");
    assert!(config_path.exists());

    let reloaded = BotConfig::load_or_create(&config_path).expect("Failed to reload config");
    assert_eq!(reloaded.grid.pair, created.grid.pair);
    assert_eq!(reloaded.grid.upper_bound, created.grid.upper_bound);
}

#[test]
fn test_bad_files_are_reported() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let missing = BotConfig::from_file(temp_dir.path().join("absent.toml"));
    assert!(matches!(missing, Err(ConfigError::FileRead(_))));

    let garbled = temp_dir.path().join("garbled.toml");
    fs::write(&garbled, "[grid\npair = ").unwrap();
    assert!(matches!(BotConfig::from_file(&garbled), Err(ConfigError::Parse(_))));

    let invalid = temp_dir.path().join("invalid.toml");
    fs::write(
        &invalid,
        "[grid]\npair = \"BTC/USDT\"\nlower_bound = 90.0\nupper_bound = 110.0\ncapital = 500.0\nleverage = 0.2\n",
    )
    .unwrap();
    assert!(matches!(BotConfig::from_file(&invalid), Err(ConfigError::Validation(_))));
}
