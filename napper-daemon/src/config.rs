use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::errors::{NapperError, Result};

/// Prefix for per-key environment overrides, e.g. `KAMAL_NAPPER_IDLE_TIMEOUT`.
pub const ENV_PREFIX: &str = "KAMAL_NAPPER_";

/// Daemon configuration.
///
/// Loaded from YAML, overlaid on defaults, then overridden per key from the
/// environment. Read-only after load; the supervisor holds it behind an Arc.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct NapperConfig {
    /// Seconds without user traffic before an Idle app is stopped
    pub idle_timeout: u64,
    /// Seconds between control-loop ticks
    pub poll_interval: u64,
    /// Seconds a Starting app may take before it is forced back to Stopped
    pub startup_timeout: u64,
    /// Extra attempts for external commands beyond the first
    pub max_retries: u32,
    pub health_check_port: u16,
    pub health_check_path: String,
    /// Seconds covering connect + read of one health probe
    pub health_check_timeout: u64,
    /// Directory holding the persisted state snapshot
    pub state_dir: PathBuf,
    /// Hostname of the daemon itself, never managed
    pub own_hostname: Option<String>,
    pub log_level: String,
    /// Name of the reverse-proxy container whose logs carry request records
    pub proxy_container: String,
    /// Directory of plain-text access logs, used when the proxy log is unavailable
    pub access_log_dir: Option<PathBuf>,
    /// Directory for out-of-band per-host request-timestamp files
    pub stamp_dir: PathBuf,
    /// Listen address for the control API
    pub bind_addr: String,
}

impl Default for NapperConfig {
    fn default() -> Self {
        Self {
            idle_timeout: 900,
            poll_interval: 10,
            startup_timeout: 60,
            max_retries: 3,
            health_check_port: 80,
            health_check_path: "/health".to_string(),
            health_check_timeout: 10,
            state_dir: PathBuf::from("/var/lib/kamal-napper"),
            own_hostname: None,
            log_level: "info".to_string(),
            proxy_container: "kamal-proxy".to_string(),
            access_log_dir: None,
            stamp_dir: std::env::temp_dir().join("kamal-napper"),
            bind_addr: "127.0.0.1:4077".to_string(),
        }
    }
}

impl NapperConfig {
    /// Load configuration from a YAML file, apply environment overrides,
    /// and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NapperError::ConfigNotFound(path.to_path_buf())
            } else {
                NapperError::Io(e)
            }
        })?;

        let deserializer = serde_yaml::Deserializer::from_str(&contents);
        let mut config: NapperConfig =
            serde_path_to_error::deserialize(deserializer).map_err(|e| {
                NapperError::ConfigParse {
                    path: path.to_path_buf(),
                    source: e,
                }
            })?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a config file.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override each field whose `KAMAL_NAPPER_<UPPER_KEY>` variable is set,
    /// coercing to the field's type.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        override_u64(&mut self.idle_timeout, "IDLE_TIMEOUT")?;
        override_u64(&mut self.poll_interval, "POLL_INTERVAL")?;
        override_u64(&mut self.startup_timeout, "STARTUP_TIMEOUT")?;
        override_u32(&mut self.max_retries, "MAX_RETRIES")?;
        override_u16(&mut self.health_check_port, "HEALTH_CHECK_PORT")?;
        override_string(&mut self.health_check_path, "HEALTH_CHECK_PATH");
        override_u64(&mut self.health_check_timeout, "HEALTH_CHECK_TIMEOUT")?;
        override_path(&mut self.state_dir, "STATE_DIR");
        override_opt_string(&mut self.own_hostname, "OWN_HOSTNAME");
        override_string(&mut self.log_level, "LOG_LEVEL");
        override_string(&mut self.proxy_container, "PROXY_CONTAINER");
        override_opt_path(&mut self.access_log_dir, "ACCESS_LOG_DIR");
        override_path(&mut self.stamp_dir, "STAMP_DIR");
        override_string(&mut self.bind_addr, "BIND_ADDR");
        Ok(())
    }

    /// Reject configurations the supervisor cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("idle_timeout", self.idle_timeout),
            ("poll_interval", self.poll_interval),
            ("startup_timeout", self.startup_timeout),
            ("health_check_timeout", self.health_check_timeout),
        ] {
            if value == 0 {
                errors.push(format!("'{}' must be greater than zero", name));
            }
        }

        if self.health_check_port == 0 {
            errors.push("'health_check_port' must be greater than zero".to_string());
        }
        if !self.health_check_path.starts_with('/') {
            errors.push(format!(
                "'health_check_path' must begin with '/', got '{}'",
                self.health_check_path
            ));
        }
        if self.state_dir.as_os_str().is_empty() {
            errors.push("'state_dir' must not be empty".to_string());
        }
        if self.log_level.is_empty() {
            errors.push("'log_level' must not be empty".to_string());
        }
        if self.bind_addr.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "'bind_addr' must be a socket address, got '{}'",
                self.bind_addr
            ));
        }

        if !errors.is_empty() {
            return Err(NapperError::Config(format!(
                "Configuration errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        // validate() has already checked this parses
        self.bind_addr
            .parse()
            .expect("bind_addr validated at load time")
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key)).ok()
}

fn override_u64(field: &mut u64, key: &str) -> Result<()> {
    if let Some(raw) = env_var(key) {
        *field = parse_env(&raw, key)?;
    }
    Ok(())
}

fn override_u32(field: &mut u32, key: &str) -> Result<()> {
    if let Some(raw) = env_var(key) {
        *field = parse_env(&raw, key)?;
    }
    Ok(())
}

fn override_u16(field: &mut u16, key: &str) -> Result<()> {
    if let Some(raw) = env_var(key) {
        *field = parse_env(&raw, key)?;
    }
    Ok(())
}

fn override_string(field: &mut String, key: &str) {
    if let Some(raw) = env_var(key) {
        *field = raw;
    }
}

fn override_opt_string(field: &mut Option<String>, key: &str) {
    if let Some(raw) = env_var(key) {
        *field = if raw.is_empty() { None } else { Some(raw) };
    }
}

fn override_path(field: &mut PathBuf, key: &str) {
    if let Some(raw) = env_var(key) {
        *field = PathBuf::from(raw);
    }
}

fn override_opt_path(field: &mut Option<PathBuf>, key: &str) {
    if let Some(raw) = env_var(key) {
        *field = if raw.is_empty() {
            None
        } else {
            Some(PathBuf::from(raw))
        };
    }
}

fn parse_env<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        NapperError::Config(format!(
            "{}{} must be a number, got '{}'",
            ENV_PREFIX, key, raw
        ))
    })
}

#[cfg(test)]
mod tests;
