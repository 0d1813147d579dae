use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::channel::{BackoffConfig, DEFAULT_CHANNEL_CAPACITY};

pub const CONFIG_DIRECTORY_NAME: &str = "parley";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const ENV_PREFIX: &str = "PARLEY_";
pub const DEFAULT_DATABASE_FILE: &str = "parley.sqlite3";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub database_path: String,
    pub channel_capacity: usize,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub log_filter: String,
    pub notifications_enabled: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            database_path: ConfigStore::default_config_dir()
                .join(DEFAULT_DATABASE_FILE)
                .to_string_lossy()
                .into_owned(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            reconnect_initial_ms: 250,
            reconnect_max_ms: 10_000,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            notifications_enabled: true,
        }
    }
}

impl ChatConfig {
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.database_path.trim().is_empty() {
            self.database_path = defaults.database_path;
        }
        if self.log_filter.trim().is_empty() {
            self.log_filter = defaults.log_filter;
        }
        self.channel_capacity = self.channel_capacity.max(1);
        self.reconnect_initial_ms = self.reconnect_initial_ms.max(1);
        self.reconnect_max_ms = self.reconnect_max_ms.max(self.reconnect_initial_ms);
        self
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(self.reconnect_initial_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
        }
    }
}

pub struct ConfigStore {
    config: Arc<ArcSwap<ChatConfig>>,
    config_path: PathBuf,
}

impl ConfigStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let config = Self::load_from_disk(&config_path);
        Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config(&self) -> Arc<ChatConfig> {
        self.config.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, config: ChatConfig) -> Result<(), ConfigError> {
        let normalized = config.normalized();
        self.persist(&normalized)?;
        self.config.store(Arc::new(normalized));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> ChatConfig {
        let mut figment = Figment::from(Serialized::defaults(ChatConfig::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("config file not found at {:?}, using defaults", path);
        }
        let figment = figment.merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ChatConfig>() {
            Ok(config) => config.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse config from {:?}: {}. using defaults",
                    path,
                    error
                );
                ChatConfig::default()
            }
        }
    }

    fn persist(&self, config: &ChatConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-config-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(config).context(SerializeConfigSnafu {
            stage: "serialize-config-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-config-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-config-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved config to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to create config directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize config on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write config file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace config file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
