// Handles host configuration loading, saving, and defaults.
//
// The config file carries what the host supplies to the engine: device-level
// default scripts/timings shared by alarms that opt in, plus daemon
// settings. Per-alarm configuration lives in the store, not here.
use crate::context::AppContext;
use anyhow::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::model::{DeviceDefaults, GlobalSettings};

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Device-level fallback scripts and timings.
    #[serde(default)]
    pub defaults: DeviceDefaults,

    /// Initial engine settings; the persisted store takes over after the
    /// first run.
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            defaults: DeviceDefaults::default(),
            settings: GlobalSettings::default(),
        }
    }
}

impl Config {
    pub fn load(ctx: &dyn AppContext) -> Result<Self> {
        let path = ctx.get_config_file_path()?;
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found"));
        }

        let contents = fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;

        let config: Config = toml::from_str(&contents).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
        })?;

        Ok(config)
    }

    pub fn is_missing_config_error(err: &Error) -> bool {
        if err.to_string().contains("Config file not found") {
            return true;
        }
        for cause in err.chain() {
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>()
                && io_err.kind() == std::io::ErrorKind::NotFound
            {
                return true;
            }
        }
        false
    }

    pub fn save(&self, ctx: &dyn AppContext) -> Result<()> {
        let path = ctx.get_config_file_path()?;
        let toml_str = toml::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, toml_str)?;
        fs::rename(tmp, &path)?;
        Ok(())
    }
}
