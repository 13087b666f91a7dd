//! Configuration management for the blueprobe CLI

use anyhow::{Context, Result};
use blueprobe::{ChannelConfig, FirmwareMap};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CHIP: &str = "bcm4339";
pub const DEFAULT_VIEWER: &str = "wireshark -k -i -";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// host:port of the controller's H4 byte stream
    pub endpoint: Option<String>,
    pub chip: String,
    pub firmware_map: Option<PathBuf>,
    pub viewer: String,
    pub assembler: Option<String>,
    pub disassembler: Option<String>,
    pub timeout_ms: u64,
    pub retries: u32,
    pub template_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let channel = ChannelConfig::default();
        Config {
            endpoint: None,
            chip: DEFAULT_CHIP.to_string(),
            firmware_map: None,
            viewer: DEFAULT_VIEWER.to_string(),
            assembler: None,
            disassembler: None,
            timeout_ms: channel.timeout.as_millis() as u64,
            retries: channel.retries,
            template_dir: None,
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("blueprobe");

        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from file, or the defaults if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory at {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        Ok(())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            retries: self.retries,
        }
    }

    /// Where ROM templates live; the user cache directory unless configured.
    pub fn template_dir(&self) -> Option<PathBuf> {
        self.template_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|dir| dir.join("blueprobe")))
    }

    /// Resolve the firmware map: an explicit TOML file wins over a preset.
    pub fn firmware_map(&self, chip: Option<&str>, map_file: Option<&Path>) -> Result<FirmwareMap> {
        if let Some(path) = map_file.or(self.firmware_map.as_deref()) {
            return load_firmware_map(path);
        }

        let chip = chip.unwrap_or(&self.chip);
        FirmwareMap::preset(chip).with_context(|| format!("Unknown chip preset '{}'", chip))
    }
}

/// Load a firmware map file. `.json` files go through the library's own
/// parser, anything else is read as TOML.
pub fn load_firmware_map(path: &Path) -> Result<FirmwareMap> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read firmware map {}", path.display()))?;

    if path.extension().is_some_and(|ext| ext == "json") {
        return FirmwareMap::from_json(&contents)
            .with_context(|| format!("Invalid firmware map {}", path.display()));
    }

    let map: FirmwareMap = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse firmware map {}", path.display()))?;
    map.validate()
        .with_context(|| format!("Invalid firmware map {}", path.display()))?;
    Ok(map)
}
