use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestration::{BusConfig, ManagerConfig};
use crate::{clog_debug, Error, Result};

const DEFAULT_MAX_CONCURRENT: usize = 3;
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_RETENTION_SECS: u64 = 60;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 30;
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_concurrent: usize,
    pub agent_timeout_secs: u64,
    pub handle_retention_secs: u64,
    pub cleanup_interval_secs: u64,
    pub receive_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub state_path: Option<String>,
    /// Shell command per step kind, keyed by the kind's snake_case name.
    pub agents: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            agent_timeout_secs: DEFAULT_AGENT_TIMEOUT_SECS,
            handle_retention_secs: DEFAULT_RETENTION_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            state_path: None,
            agents: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    /// Where the JSON execution store lives.
    pub fn effective_state_path(&self) -> Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::conductor_dir()?.join("state.json")),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_concurrent: self.max_concurrent,
            agent_timeout: Duration::from_secs(self.agent_timeout_secs),
            handle_retention: Duration::from_secs(self.handle_retention_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            ..ManagerConfig::default()
        }
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            default_receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            default_request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..BusConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Validation(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.agent_timeout_secs == 0 {
            return Err(Error::Validation(
                "agent_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: max_concurrent={}, agent_timeout_secs={}, agents={:?}",
            config.max_concurrent,
            config.agent_timeout_secs,
            config.agents.keys().collect::<Vec<_>>()
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        Self::ensure_dirs()?;
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs() -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            clog_debug!("Creating conductor directory: {}", dir.display());
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
