//! Configuration loading for the daemon
//!
//! Wraps `DaemonConfig` from `uecups-common` with file loading and
//! validation.

use std::path::Path;

use thiserror::Error;

use uecups_common::DaemonConfig;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// YAML parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Configuration validation error
    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ConfigValidationError),
}

/// Errors that can occur during configuration validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// Control channel port is zero
    #[error("Invalid CUPS port: 0")]
    InvalidCupsPort,

    /// TUN MTU below the IPv4 minimum
    #[error("Invalid TUN MTU: {0} (minimum 68)")]
    InvalidTunMtu(u16),
}

/// Loads the daemon configuration from a YAML file.
pub fn load_daemon_config<P: AsRef<Path>>(path: P) -> Result<DaemonConfig, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    load_daemon_config_from_str(&contents)
}

/// Loads the daemon configuration from a YAML string.
pub fn load_daemon_config_from_str(yaml: &str) -> Result<DaemonConfig, ConfigError> {
    let config: DaemonConfig =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    Ok(config)
}

/// Validates a daemon configuration.
pub fn validate_daemon_config(config: &DaemonConfig) -> Result<(), ConfigValidationError> {
    if config.cups_listen_port == 0 {
        return Err(ConfigValidationError::InvalidCupsPort);
    }
    if config.tun_mtu < 68 {
        return Err(ConfigValidationError::InvalidTunMtu(config.tun_mtu));
    }
    Ok(())
}

/// Loads and validates the daemon configuration in one step.
pub fn load_and_validate_daemon_config<P: AsRef<Path>>(
    path: P,
) -> Result<DaemonConfig, ConfigError> {
    let config = load_daemon_config(path)?;
    validate_daemon_config(&config)?;
    Ok(config)
}
