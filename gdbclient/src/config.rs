/// Session configuration
///
/// Every field has a default, so a config file only needs to name what it
/// changes.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commands::MachineKind;
use crate::communication::TransportOptions;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub machine: MachineKind,
    /// Used until the stub reports its own `PacketSize`
    pub packet_size: usize,
    pub resume_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub max_retransmits: u32,
    pub negotiate_features: bool,
    /// Upper bound on pages walked while looking for the kernel image
    pub kernel_scan_pages: u64,
    pub log_level: String,
    /// Root of a JSON symbol store, see [`crate::symbols::JsonSymbolStore`]
    pub symbol_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8864,
            machine: MachineKind::Vmware,
            packet_size: 400,
            resume_timeout_ms: 3000,
            command_timeout_ms: 10_000,
            max_retransmits: 3,
            negotiate_features: true,
            kernel_scan_pages: 0x4000,
            log_level: "info".to_string(),
            symbol_path: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&text)?;
        log::debug!("Loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            resume_timeout: Duration::from_millis(self.resume_timeout_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            max_retransmits: self.max_retransmits,
        }
    }

    /// `log_level` as a filter, falling back to `Info` on unknown names
    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}
