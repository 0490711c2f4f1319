//! Application-level configuration loading.
//!
//! The JSON file is optional; every field has a default. Environment variables
//! are applied on top of the file and the result is validated once.

use std::{
    env, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use serde_with::{DurationSeconds, serde_as};
use thiserror::Error;
use tracing::info;
use validator::{Validate, ValidationErrors};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "LOBBY_PULSE_CONFIG_PATH";

/// Fatal configuration problems detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config `{path}`")]
    Read {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid JSON for [`AppConfig`].
    #[error("failed to parse config `{path}`")]
    Parse {
        /// Path of the rejected file.
        path: PathBuf,
        /// Deserializer error with line and column.
        #[source]
        source: serde_json::Error,
    },
    /// An environment override could not be parsed.
    #[error("environment variable `{var}` has invalid value `{value}`")]
    InvalidEnv {
        /// Name of the variable.
        var: &'static str,
        /// Raw value found in the environment.
        value: String,
    },
    /// A field is out of range or malformed.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationErrors),
    /// PostgreSQL was selected without a connection string.
    #[error("storage backend `postgres` requires `storage.database_url` or DATABASE_URL")]
    MissingDatabaseUrl,
    /// Push delivery was enabled without a signing key.
    #[error("push delivery is enabled but `push.key_path` is not set")]
    MissingPushKey,
    /// A period or timeout that drives a loop or a deadline is zero.
    #[error("`{field}` must be greater than zero")]
    ZeroDuration {
        /// Dotted path of the offending field.
        field: &'static str,
    },
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// HTTP listener.
    #[validate(nested)]
    pub listen: ListenConfig,
    /// Storage backend selection and connection settings.
    #[validate(nested)]
    pub storage: StorageConfig,
    /// Game engine endpoints.
    #[validate(nested)]
    pub engine: EngineConfig,
    /// APNs delivery.
    #[validate(nested)]
    pub push: PushConfig,
    /// Activity scanner and dispatcher pool.
    #[validate(nested)]
    pub notifications: NotificationConfig,
    /// Rating updater.
    pub rating: RatingConfig,
    /// Finished-match collector.
    pub games: GamesConfig,
    /// Turn-state watcher timeouts.
    pub watcher: WatcherConfig,
}

/// Address the HTTP server binds to.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ListenConfig {
    /// Interface to bind, `0.0.0.0` by default.
    pub host: String,
    /// TCP port.
    #[validate(range(min = 1))]
    pub port: u16,
}

/// Which [`crate::dao::lobby_store::LobbyStore`] implementation to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// PostgreSQL through sqlx.
    #[default]
    Postgres,
    /// Process-local maps, for development and tests.
    Memory,
}

/// Storage backend settings.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend to run.
    pub backend: StorageBackend,
    /// Connection string, required for PostgreSQL.
    pub database_url: Option<String>,
    /// Upper bound of the connection pool.
    #[validate(range(min = 1))]
    pub max_connections: u32,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
/// Game engine endpoints.
pub struct EngineConfig {
    /// Internal address of the engine API.
    #[validate(url)]
    pub base_url: String,
    /// Address players open in their browser.
    #[validate(url)]
    pub public_base_url: String,
    /// Per-request timeout of the engine client and the passthrough.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
/// APNs credentials and endpoints.
pub struct PushConfig {
    /// When false, notifications are logged instead of delivered.
    pub enabled: bool,
    /// Bundle id sent as `apns-topic`.
    pub topic: String,
    /// Apple developer team id, the token issuer.
    pub team_id: String,
    /// Id of the signing key.
    pub key_id: String,
    /// PEM file holding the ES256 signing key.
    pub key_path: Option<PathBuf>,
    /// Age after which the provider token is re-signed.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_token_age: Duration,
    /// Sandbox gateway.
    #[validate(url)]
    pub sandbox_url: String,
    /// Production gateway.
    #[validate(url)]
    pub production_url: String,
    /// Per-request timeout.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
/// Activity scanner and dispatcher settings.
pub struct NotificationConfig {
    /// Number of dispatcher workers.
    #[validate(range(min = 1))]
    pub workers: usize,
    /// Capacity of the notification queue.
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
    /// Period of the activity scan.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub scan_interval: Duration,
    /// How long a finished match keeps its players active.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub activity_window: Duration,
    /// Title of alert notifications.
    pub alert_title: String,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Rating updater settings.
pub struct RatingConfig {
    /// Period between two rating attempts.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub scan_interval: Duration,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Finished-match collector settings.
pub struct GamesConfig {
    /// Period of the collector.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub scan_interval: Duration,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Turn-state watcher budgets.
pub struct WatcherConfig {
    /// Budget for the awaiting-input lookup made before forwarding a move.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub lookup_timeout: Duration,
    /// Budget for the detached lookup and enqueue made after the response.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub follow_up_timeout: Duration,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Postgres,
            database_url: None,
            max_connections: 10,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".into(),
            public_base_url: "http://localhost:8080".into(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topic: String::new(),
            team_id: String::new(),
            key_id: String::new(),
            key_path: None,
            max_token_age: Duration::from_secs(30 * 60),
            sandbox_url: "https://api.sandbox.push.apple.com".into(),
            production_url: "https://api.push.apple.com".into(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
            scan_interval: Duration::from_secs(60),
            activity_window: Duration::from_secs(24 * 60 * 60),
            alert_title: "Your move!".into(),
        }
    }
}

impl Default for RatingConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
        }
    }
}

impl Default for GamesConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: Duration::from_secs(5),
            follow_up_timeout: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    /// Load the configuration file, apply environment overrides and validate the result.
    pub fn load() -> Result<Self, ConfigError> {
        let path = resolve_config_path();
        let mut config = Self::from_file(&path)?;
        config.apply_env(|var| env::var(var).ok())?;
        config.check()?;
        Ok(config)
    }

    /// Read `path`, falling back to defaults when it does not exist.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = serde_json::from_str::<Self>(&contents).map_err(|source| {
                    ConfigError::Parse {
                        path: path.to_owned(),
                        source,
                    }
                })?;
                info!(path = %path.display(), "loaded configuration file");
                Ok(config)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_owned(),
                source,
            }),
        }
    }

    /// Override file values with the process environment, read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |var: &str| lookup(var).filter(|value| !value.is_empty());

        if let Some(url) = set("DATABASE_URL") {
            self.storage.database_url = Some(url);
        }
        for var in ["PORT", "SERVER_PORT"] {
            if let Some(value) = set(var) {
                self.listen.port = value
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnv { var, value })?;
            }
        }
        if let Some(url) = set("ENGINE_BASE_URL") {
            self.engine.base_url = url;
        }
        if let Some(path) = set("APNS_KEY_PATH") {
            self.push.key_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Validate field ranges and cross-section requirements.
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.storage.backend == StorageBackend::Postgres && self.storage.database_url.is_none()
        {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        if self.push.enabled && self.push.key_path.is_none() {
            return Err(ConfigError::MissingPushKey);
        }
        let durations = [
            ("notifications.scan_interval", self.notifications.scan_interval),
            ("rating.scan_interval", self.rating.scan_interval),
            ("games.scan_interval", self.games.scan_interval),
            ("watcher.lookup_timeout", self.watcher.lookup_timeout),
            ("watcher.follow_up_timeout", self.watcher.follow_up_timeout),
            ("engine.request_timeout", self.engine.request_timeout),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        Ok(())
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
