use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::Role;
use crate::backup::DEFAULT_RETENTION;
use crate::error::{KeeperError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "keeper.json";

// -----------------------------------------------------------------------------
// KeeperConfig (root)
// -----------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KeeperConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Backups kept per file after every new backup.
    #[serde(default = "default_retention")]
    pub retention: usize,

    #[serde(default)]
    pub restart: RestartConfig,

    /// Operator name to role.
    #[serde(default)]
    pub operators: BTreeMap<String, Role>,

    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            retention: default_retention(),
            restart: RestartConfig::default(),
            operators: BTreeMap::new(),
            log_file: default_log_file(),
        }
    }
}

impl KeeperConfig {
    /// Missing file means defaults; anything else unreadable is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let txt = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(KeeperError::Config(format!("{}: {e}", path.display()))),
        };
        let config: Self = serde_json::from_str(&txt)
            .map_err(|e| KeeperError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| KeeperError::Config(e.to_string()))?;
        fs::write(path, json).map_err(|e| KeeperError::write(path, e))
    }

    fn validate(&self) -> Result<()> {
        if self.retention == 0 {
            return Err(KeeperError::Config("retention must be at least 1".into()));
        }
        if self.restart.command.is_empty()
            || self.restart.primary.is_empty()
            || self.restart.legacy.is_empty()
        {
            return Err(KeeperError::Config(
                "restart command lists must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./docker-compose-list")
}

fn default_retention() -> usize {
    DEFAULT_RETENTION
}

fn default_log_file() -> PathBuf {
    PathBuf::from("keeper.log")
}

// -----------------------------------------------------------------------------
// RestartConfig
// -----------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandStrategy {
    /// Always run `command`.
    Fixed,
    /// Try `primary`, then `legacy`, once at startup.
    Probe,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RestartConfig {
    #[serde(default = "default_strategy")]
    pub strategy: CommandStrategy,
    #[serde(default = "default_fixed_command")]
    pub command: Vec<String>,
    #[serde(default = "default_primary_command")]
    pub primary: Vec<String>,
    #[serde(default = "default_legacy_command")]
    pub legacy: Vec<String>,
    #[serde(default = "default_quiescence")]
    pub quiescence_secs: u64,
    /// Upper bound for each phase.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            command: default_fixed_command(),
            primary: default_primary_command(),
            legacy: default_legacy_command(),
            quiescence_secs: default_quiescence(),
            timeout_secs: default_timeout(),
        }
    }
}

impl RestartConfig {
    pub fn quiescence(&self) -> Duration {
        Duration::from_secs(self.quiescence_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

fn default_strategy() -> CommandStrategy {
    CommandStrategy::Probe
}

fn default_fixed_command() -> Vec<String> {
    vec!["docker-compose".into()]
}

fn default_primary_command() -> Vec<String> {
    vec!["docker".into(), "compose".into()]
}

fn default_legacy_command() -> Vec<String> {
    vec!["docker-compose".into()]
}

fn default_quiescence() -> u64 {
    2
}

fn default_timeout() -> u64 {
    300
}
