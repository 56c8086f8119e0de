//! Runtime configuration
//!
//! Loaded from a JSON file, every field optional:
//!
//! ```json
//! {
//!   "settle_delay_ms": 1000,
//!   "ambiguity": "require-unique",
//!   "controller_drivers": ["xhci_hcd", "ehci-pci"]
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const SYSTEM_CONFIG_PATH: &str = "/etc/usb-resetter/config.json";

const MAX_SETTLE_DELAY_MS: u64 = 10_000;

/// What to do when a vendor:product target matches more than one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmbiguityPolicy {
    /// Act on every match
    #[default]
    All,
    /// Refuse unless a bus/address qualifier narrows it to one device
    RequireUnique,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sys_root: PathBuf,
    pub dev_root: PathBuf,
    pub settle_delay_ms: u64,
    pub controller_drivers: Vec<String>,
    pub ambiguity: AmbiguityPolicy,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
            dev_root: PathBuf::from("/dev/bus/usb"),
            settle_delay_ms: 500,
            controller_drivers: [
                "uhci_hcd", "ohci_hcd", "ehci_hcd", "xhci_hcd", "ehci-pci", "ohci-pci", "xhci-pci",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            ambiguity: AmbiguityPolicy::All,
            log_level: "warn".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the system location when
    /// `path` is `None` and that file exists, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let system = PathBuf::from(SYSTEM_CONFIG_PATH);
                if !system.exists() {
                    log::debug!("No configuration file at {}, using defaults", system.display());
                    return Ok(Self::default());
                }
                system
            }
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        log::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["off", "trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.controller_drivers.is_empty() {
            return Err(anyhow!("controller_drivers must name at least one driver"));
        }

        if self.settle_delay_ms > MAX_SETTLE_DELAY_MS {
            return Err(anyhow!(
                "settle_delay_ms {} exceeds the maximum of {} ms",
                self.settle_delay_ms,
                MAX_SETTLE_DELAY_MS
            ));
        }

        Ok(())
    }
}
