//! Daemon settings, read from `VMPILOT_*` environment variables
//!
//! A `.env` file in the working directory is loaded first when present.
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::{
    builder::{provisioner::DEFAULT_BASE_PATH, tools::DEFAULT_CONNECT_URI},
    command::DEFAULT_COMMAND_TIMEOUT,
    vm::DEFAULT_BRIDGE,
};

pub const BASE_PATH: &str = "VMPILOT_BASE_PATH";
pub const BASE_IMAGE: &str = "VMPILOT_BASE_IMAGE";
pub const BRIDGE: &str = "VMPILOT_BRIDGE";
pub const CONNECT_URI: &str = "VMPILOT_CONNECT_URI";
pub const LISTEN: &str = "VMPILOT_LISTEN";
pub const COMMAND_TIMEOUT_SECS: &str = "VMPILOT_COMMAND_TIMEOUT_SECS";
pub const KEEP_FAILED_ARTIFACTS: &str = "VMPILOT_KEEP_FAILED_ARTIFACTS";

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid value {1:?} for {0}: {2}")]
    Invalid(&'static str, String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory holding one sub-directory per VM
    pub base_path: PathBuf,
    /// Image every boot disk is derived from
    pub base_image: PathBuf,
    pub bridge: String,
    pub connect_uri: String,
    pub listen: SocketAddr,
    /// Deadline of every `qemu-img` and `virsh` call
    pub command_timeout: Duration,
    pub keep_failed_artifacts: bool,
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid(
            key,
            value.to_string(),
            "expected a boolean".to_string(),
        )),
    }
}

impl Settings {
    /// Load `.env` if present, then read the process environment
    pub fn from_env() -> Result<Settings, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the settings from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Settings, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let base_image = lookup(BASE_IMAGE)
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing(BASE_IMAGE))?;

        let listen_value = or_default(LISTEN, DEFAULT_LISTEN);
        let listen = listen_value
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(LISTEN, listen_value.clone(), e.to_string()))?;

        let command_timeout = match lookup(COMMAND_TIMEOUT_SECS) {
            Some(value) => {
                let secs = value.trim().parse::<u64>().map_err(|e| {
                    ConfigError::Invalid(COMMAND_TIMEOUT_SECS, value.clone(), e.to_string())
                })?;
                if secs == 0 {
                    return Err(ConfigError::Invalid(
                        COMMAND_TIMEOUT_SECS,
                        value,
                        "must be greater than zero".to_string(),
                    ));
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_COMMAND_TIMEOUT,
        };

        let keep_failed_artifacts = match lookup(KEEP_FAILED_ARTIFACTS) {
            Some(value) => parse_bool(KEEP_FAILED_ARTIFACTS, &value)?,
            None => false,
        };

        Ok(Settings {
            base_path: PathBuf::from(or_default(BASE_PATH, DEFAULT_BASE_PATH)),
            base_image: PathBuf::from(base_image),
            bridge: or_default(BRIDGE, DEFAULT_BRIDGE),
            connect_uri: or_default(CONNECT_URI, DEFAULT_CONNECT_URI),
            listen,
            command_timeout,
            keep_failed_artifacts,
        })
    }
}
