use super::*;
use std::sync::Mutex;
use tempfile::TempDir;

/// Serialize tests that touch KAMAL_NAPPER_* variables.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for (key, _) in std::env::vars() {
        if key.starts_with(ENV_PREFIX) {
            // SAFETY: caller holds ENV_LOCK
            unsafe { std::env::remove_var(&key) };
        }
    }
}

fn write_config(dir: &TempDir, yaml: &str) -> PathBuf {
    let path = dir.path().join("config.yml");
    std::fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn test_defaults() {
    let config = NapperConfig::default();
    assert_eq!(config.idle_timeout, 900);
    assert_eq!(config.poll_interval, 10);
    assert_eq!(config.startup_timeout, 60);
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.health_check_port, 80);
    assert_eq!(config.health_check_path, "/health");
    assert_eq!(config.health_check_timeout, 10);
    assert!(config.own_hostname.is_none());
    assert_eq!(config.proxy_container, "kamal-proxy");
    config.validate().unwrap();
}

#[test]
fn test_load_overlays_partial_yaml_on_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        "idle_timeout: 120\nown_hostname: panel.example.com\nstate_dir: /tmp/napper-test\n",
    );

    let config = NapperConfig::load(&path).unwrap();
    assert_eq!(config.idle_timeout, 120);
    assert_eq!(config.own_hostname.as_deref(), Some("panel.example.com"));
    assert_eq!(config.state_dir, PathBuf::from("/tmp/napper-test"));
    // Untouched fields keep their defaults
    assert_eq!(config.poll_interval, 10);
}

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    let err = NapperConfig::load(&dir.path().join("nope.yml")).unwrap_err();
    assert!(matches!(err, NapperError::ConfigNotFound(_)));
}

#[test]
fn test_load_rejects_unknown_field_with_path() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, "idle_timeouts: 120\n");

    let err = NapperConfig::load(&path).unwrap_err();
    assert!(matches!(err, NapperError::ConfigParse { .. }));
    assert!(err.to_string().contains("idle_timeouts"));
}

#[test]
fn test_env_overrides_coerce_by_type() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    // SAFETY: holding ENV_LOCK
    unsafe {
        std::env::set_var("KAMAL_NAPPER_IDLE_TIMEOUT", "45");
        std::env::set_var("KAMAL_NAPPER_MAX_RETRIES", "0");
        std::env::set_var("KAMAL_NAPPER_HEALTH_CHECK_PORT", "3000");
        std::env::set_var("KAMAL_NAPPER_HEALTH_CHECK_PATH", "/up");
        std::env::set_var("KAMAL_NAPPER_OWN_HOSTNAME", "self.example.com");
    }

    let mut config = NapperConfig::default();
    config.apply_env_overrides().unwrap();
    clear_env();

    assert_eq!(config.idle_timeout, 45);
    assert_eq!(config.max_retries, 0);
    assert_eq!(config.health_check_port, 3000);
    assert_eq!(config.health_check_path, "/up");
    assert_eq!(config.own_hostname.as_deref(), Some("self.example.com"));
}

#[test]
fn test_env_override_rejects_non_numeric() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    // SAFETY: holding ENV_LOCK
    unsafe { std::env::set_var("KAMAL_NAPPER_POLL_INTERVAL", "soon") };

    let mut config = NapperConfig::default();
    let err = config.apply_env_overrides().unwrap_err();
    clear_env();

    assert!(matches!(err, NapperError::Config(_)));
    assert!(err.to_string().contains("KAMAL_NAPPER_POLL_INTERVAL"));
}

#[test]
fn test_validate_rejects_zero_numerics() {
    let mut config = NapperConfig::default();
    config.idle_timeout = 0;
    config.health_check_timeout = 0;

    let err = config.validate().unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("idle_timeout"));
    assert!(msg.contains("health_check_timeout"));
}

#[test]
fn test_validate_rejects_bad_path_and_addr() {
    let mut config = NapperConfig::default();
    config.health_check_path = "health".to_string();
    config.bind_addr = "not-an-addr".to_string();

    let err = config.validate().unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("health_check_path"));
    assert!(msg.contains("bind_addr"));
}

#[test]
fn test_max_retries_zero_is_valid() {
    let mut config = NapperConfig::default();
    config.max_retries = 0;
    config.validate().unwrap();
}
