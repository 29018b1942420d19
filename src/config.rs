use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::clicktime::DEFAULT_BASE_URL;
use crate::index::{IndexAuth, DEFAULT_ALIAS};
use crate::logging::parse_flag;

pub const CONFIG_PATH_ENV: &str = "CLICKTIME_SYNC_CONFIG";

/// Upper bound for `lookback_days` and `history_days`.
pub const MAX_WINDOW_DAYS: i64 = 36_500;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub clicktime: ClickTimeConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ClickTimeConfig {
    #[serde(default = "default_clicktime_base_url")]
    pub base_url: String,
    pub api_token: String,
    /// Job numbers synced when no project is given on the command line.
    pub projects: Vec<u64>,
}

#[derive(Debug, Deserialize)]
pub struct IndexConfig {
    pub base_url: String,
    #[serde(default = "default_alias")]
    pub alias: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl IndexConfig {
    pub fn auth(&self) -> IndexAuth {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return IndexAuth::ApiKey(key.clone());
        }
        match self.username.as_ref().filter(|u| !u.trim().is_empty()) {
            Some(username) => IndexAuth::Basic {
                username: username.clone(),
                password: self.password.clone(),
            },
            None => IndexAuth::None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    /// Days subtracted from the newest indexed timestamp to form the cutoff.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    /// Cutoff distance from now when nothing has been indexed for a job.
    #[serde(default = "default_history_days")]
    pub history_days: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            lookback_days: default_lookback_days(),
            history_days: default_history_days(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Default)]
pub struct AppConfigOverrides {
    pub clicktime_base_url: Option<String>,
    pub clicktime_api_token: Option<String>,
    pub index_base_url: Option<String>,
    pub index_username: Option<String>,
    pub index_password: Option<String>,
    pub index_api_key: Option<String>,
    pub logging_debug: Option<bool>,
}

impl AppConfigOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            clicktime_base_url: non_empty("CLICKTIME_BASE_URL"),
            clicktime_api_token: non_empty("CLICKTIME_API_TOKEN"),
            index_base_url: non_empty("INDEX_BASE_URL"),
            index_username: non_empty("INDEX_USERNAME"),
            index_password: non_empty("INDEX_PASSWORD"),
            index_api_key: non_empty("INDEX_API_KEY"),
            logging_debug: non_empty("CLICKTIME_SYNC_DEBUG").map(|v| parse_flag(&v)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found at {path}. expected at $CLICKTIME_SYNC_CONFIG, $XDG_CONFIG_HOME/clicktime-sync/config.toml or ~/.config/clicktime-sync/config.toml")]
    MissingConfigFile { path: PathBuf },
    #[error("failed to resolve config path: HOME is not set and XDG_CONFIG_HOME is unset")]
    MissingHomeDirectory,
    #[error("failed to read config file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse TOML config at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

pub fn load() -> Result<AppConfig, ConfigError> {
    let path = resolve_config_path()?;
    load_from(&path)
}

pub fn load_from(path: &Path) -> Result<AppConfig, ConfigError> {
    let path = path.to_path_buf();
    let raw = std::fs::read_to_string(&path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigError::MissingConfigFile { path: path.clone() }
        } else {
            ConfigError::ReadFailed {
                path: path.clone(),
                source,
            }
        }
    })?;

    let cfg = toml::from_str::<AppConfig>(&raw).map_err(|source| ConfigError::ParseFailed {
        path: path.clone(),
        source,
    })?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn resolve_config_path() -> Result<PathBuf, ConfigError> {
    resolve_config_path_from_env(
        std::env::var_os(CONFIG_PATH_ENV),
        std::env::var_os("XDG_CONFIG_HOME"),
        std::env::var_os("HOME"),
    )
}

fn resolve_config_path_from_env(
    explicit: Option<OsString>,
    xdg_config_home: Option<OsString>,
    home: Option<OsString>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit.filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(path));
    }

    if let Some(dir) = xdg_config_home.filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(dir).join("clicktime-sync").join("config.toml"));
    }

    let home = home
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::MissingHomeDirectory)?;
    Ok(PathBuf::from(home)
        .join(".config")
        .join("clicktime-sync")
        .join("config.toml"))
}

impl AppConfig {
    pub fn apply_overrides(&mut self, overrides: &AppConfigOverrides) -> Result<(), ConfigError> {
        if let Some(value) = &overrides.clicktime_base_url {
            self.clicktime.base_url = value.clone();
        }
        if let Some(value) = &overrides.clicktime_api_token {
            self.clicktime.api_token = value.clone();
        }
        if let Some(value) = &overrides.index_base_url {
            self.index.base_url = value.clone();
        }
        if let Some(value) = &overrides.index_username {
            self.index.username = Some(value.clone());
        }
        if let Some(value) = &overrides.index_password {
            self.index.password = Some(value.clone());
        }
        if let Some(value) = &overrides.index_api_key {
            self.index.api_key = Some(value.clone());
        }
        if let Some(value) = overrides.logging_debug {
            self.logging.debug = value;
        }

        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.clicktime.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "clicktime.base_url must not be empty".into(),
            ));
        }
        if self.clicktime.api_token.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "clicktime.api_token must not be empty".into(),
            ));
        }
        if self.clicktime.projects.is_empty() {
            return Err(ConfigError::Invalid(
                "clicktime.projects must contain at least one job number".into(),
            ));
        }
        if self.index.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "index.base_url must not be empty".into(),
            ));
        }
        if self.index.alias.trim().is_empty() {
            return Err(ConfigError::Invalid("index.alias must not be empty".into()));
        }
        if self.sync.page_size == 0 {
            return Err(ConfigError::Invalid("sync.page_size must be > 0".into()));
        }
        if !(0..=MAX_WINDOW_DAYS).contains(&self.sync.lookback_days) {
            return Err(ConfigError::Invalid(format!(
                "sync.lookback_days must be between 0 and {MAX_WINDOW_DAYS}"
            )));
        }
        if !(1..=MAX_WINDOW_DAYS).contains(&self.sync.history_days) {
            return Err(ConfigError::Invalid(format!(
                "sync.history_days must be between 1 and {MAX_WINDOW_DAYS}"
            )));
        }

        Ok(())
    }
}

fn default_clicktime_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_alias() -> String {
    DEFAULT_ALIAS.to_string()
}

const fn default_page_size() -> u64 {
    500
}

const fn default_lookback_days() -> i64 {
    1
}

const fn default_history_days() -> i64 {
    2000
}
