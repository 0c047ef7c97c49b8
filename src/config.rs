//! Configuration for AutoStash, stored as TOML.
//!
//! Loaded from `<config dir>/autostash/config.toml` unless a path is given;
//! a default file is written on first load.

use crate::crypto::{CipherBackend, KeyRef};
use crate::manifest::BackupOptions;
use crate::pipeline::remote::{BackoffStrategy, RemoteSettings};
use crate::scanner::ScanOptions;
use crate::scheduler::Frequency;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where manifests, push queues and schedule state live
    pub state_dir: PathBuf,
    pub logging: LoggingConfig,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

/// One set of watched directories backed up into one repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub watched_paths: Vec<PathBuf>,
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub encryption: bool,
    #[serde(default = "default_true")]
    pub incremental: bool,
    #[serde(default)]
    pub include_system_paths: bool,
    /// Key file path (builtin cipher) or recipient (gpg)
    #[serde(default)]
    pub key_ref: Option<String>,
    #[serde(default)]
    pub cipher: CipherBackend,
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RepositoryConfig {
    Git {
        path: PathBuf,
        #[serde(default)]
        remote: Option<String>,
        #[serde(default = "default_branch")]
        branch: String,
    },
    Directory {
        path: PathBuf,
        #[serde(default)]
        mirror: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// `daily`, `weekly`, `monthly` or `every@<n>[s|m|h|d]`
    pub frequency: String,
    pub hour: u32,
    pub minute: u32,
}

/// Timeouts (seconds) and push retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub commit_timeout_secs: u64,
    pub push_timeout_secs: u64,
    pub pull_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub max_push_attempts: u32,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_excludes() -> Vec<String> {
    ScanOptions::default().exclude_patterns
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("/tmp"));

        Self {
            state_dir: data_dir.join("autostash"),
            logging: LoggingConfig::default(),
            targets: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            frequency: "daily".to_string(),
            hour: 2,
            minute: 0,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        let settings = RemoteSettings::default();
        let (initial, max) = match settings.backoff {
            BackoffStrategy::Exponential { initial, max } => (initial, max),
            BackoffStrategy::Fixed(delay) => (delay, delay),
        };
        Self {
            commit_timeout_secs: settings.commit_timeout.as_secs(),
            push_timeout_secs: settings.push_timeout.as_secs(),
            pull_timeout_secs: settings.pull_timeout.as_secs(),
            fetch_timeout_secs: settings.fetch_timeout.as_secs(),
            max_push_attempts: settings.max_push_attempts,
            backoff_initial_secs: initial.as_secs(),
            backoff_max_secs: max.as_secs(),
        }
    }
}

impl RemoteConfig {
    pub fn settings(&self) -> RemoteSettings {
        RemoteSettings {
            commit_timeout: Duration::from_secs(self.commit_timeout_secs),
            push_timeout: Duration::from_secs(self.push_timeout_secs),
            pull_timeout: Duration::from_secs(self.pull_timeout_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_push_attempts: self.max_push_attempts,
            backoff: BackoffStrategy::Exponential {
                initial: Duration::from_secs(self.backoff_initial_secs),
                max: Duration::from_secs(self.backoff_max_secs),
            },
        }
    }
}

impl TargetConfig {
    /// A target with default flags storing into a plain directory
    pub fn new(name: impl Into<String>, watched_paths: Vec<PathBuf>, repository: RepositoryConfig) -> Self {
        Self {
            name: name.into(),
            watched_paths,
            repository,
            compression: false,
            encryption: false,
            incremental: true,
            include_system_paths: false,
            key_ref: None,
            cipher: CipherBackend::default(),
            exclude: default_excludes(),
            schedule: None,
            remote: RemoteConfig::default(),
        }
    }

    pub fn backup_options(&self) -> BackupOptions {
        BackupOptions {
            compression: self.compression,
            encryption: self.encryption,
            incremental: self.incremental,
            include_system_paths: self.include_system_paths,
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            exclude_patterns: self.exclude.clone(),
            ..ScanOptions::default()
        }
    }

    pub fn key(&self) -> Option<KeyRef> {
        self.key_ref.as_deref().map(KeyRef::new)
    }

    /// Parsed schedule frequency, if the target is scheduled
    pub fn frequency(&self) -> Result<Option<Frequency>> {
        self.schedule
            .as_ref()
            .map(|s| Frequency::parse(&s.frequency))
            .transpose()
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::Configuration {
            reason: format!("target '{}': {}", self.name, reason),
        };

        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("name must be non-empty and use [A-Za-z0-9_-]".to_string()));
        }
        if self.watched_paths.is_empty() && !self.include_system_paths {
            return Err(invalid("no watched paths".to_string()));
        }
        if self.encryption && self.key_ref.is_none() {
            return Err(invalid("encryption is enabled but key_ref is not set".to_string()));
        }
        if let Some(schedule) = &self.schedule {
            if schedule.hour > 23 || schedule.minute > 59 {
                return Err(invalid(format!(
                    "invalid schedule time {:02}:{:02}",
                    schedule.hour, schedule.minute
                )));
            }
        }
        self.frequency()?;
        if self.remote.max_push_attempts == 0 {
            return Err(invalid("max_push_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Config {
    /// Load from the default location, writing defaults when absent
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path()?)
    }

    /// Load from `path`, writing defaults when absent
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            info!("Writing default configuration to {}", path.display());
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Self::default_path()?)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| Error::Configuration {
            reason: "Could not determine config directory".to_string(),
        })?;

        Ok(config_dir.join("autostash").join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for target in &self.targets {
            target.validate()?;
            if !names.insert(target.name.as_str()) {
                return Err(Error::Configuration {
                    reason: format!("duplicate target name '{}'", target.name),
                });
            }
        }
        Ok(())
    }

    pub fn target(&self, name: &str) -> Result<&TargetConfig> {
        self.targets
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::UnknownTarget {
                name: name.to_string(),
            })
    }

    /// State directory of one target
    pub fn target_state_dir(&self, name: &str) -> PathBuf {
        self.state_dir.join("targets").join(name)
    }
}
