use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::sync::DEFAULT_MAX_RECENT;

const APP_DIR: &str = "mailmirror";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Active account address.
    pub email: Option<String>,
    pub refresh_interval_secs: u64,
    pub max_messages_cached: usize,
    pub database_path: Option<PathBuf>,
    pub client_secrets_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            email: None,
            refresh_interval_secs: 300,
            max_messages_cached: DEFAULT_MAX_RECENT,
            database_path: None,
            client_secrets_path: None,
        }
    }
}

pub fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow!("no config dir available"))?
        .join(APP_DIR))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn token_store_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("tokens.json"))
}

impl Settings {
    /// Reads the settings file, writing one with defaults first if missing.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let settings = Self::default();
            settings.save(path)?;
            info!("wrote default settings to {}", path.display());
            return Ok(settings);
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("read settings from {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse settings in {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("serialize settings")?;
        fs::write(path, raw).with_context(|| format!("write settings to {}", path.display()))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => crate::db::Database::default_db_path().map_err(Into::into),
        }
    }

    pub fn resolve_client_secrets_path(&self) -> Result<PathBuf> {
        match &self.client_secrets_path {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join("credentials.json")),
        }
    }
}
