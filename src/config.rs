//! Configuration types for url-fetcher
//!
//! Stored as YAML (JSON is accepted too, picked by file extension). Every
//! field has a default, so a partial file is valid. Durations are written as
//! integer milliseconds.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Config file used when neither `--config` nor `CONFIG_PATH` is given
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// Environment variable overriding `logger.level`
pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// Environment variable overriding `app.workers`
pub const WORKERS_ENV: &str = "WORKERS";

/// Prefix of per-field environment overrides
pub const ENV_PREFIX: &str = "URL_FETCHER";

const ENV_PREFIX_SEPARATOR: &str = "_";

const ENV_SEPARATOR: &str = "__";

/// Main configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Pipeline settings
    #[serde(default)]
    pub app: AppConfig,

    /// Logging settings
    #[serde(default)]
    pub logger: LogConfig,

    /// Retry, backoff and shutdown settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Shared HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,
}

/// Pipeline settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Number of fetch workers (default: available parallelism)
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Logging settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Level filter, e.g. "debug" or "url_fetcher=trace" (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file, appended to; empty means stderr
    #[serde(default)]
    pub path: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            path: String::new(),
        }
    }
}

/// Retry, backoff and shutdown settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Attempt budget given to every new task (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Lower backoff bound (default: 50ms)
    #[serde(default = "default_retry_wait_min", with = "duration_ms")]
    pub retry_wait_min: Duration,

    /// Upper backoff bound (default: 5s)
    #[serde(default = "default_retry_wait_max", with = "duration_ms")]
    pub retry_wait_max: Duration,

    /// Randomise backoff waits (default: false)
    #[serde(default)]
    pub jitter: bool,

    /// Budget of a forced stage shutdown (default: 5s)
    #[serde(default = "default_shutdown_timeout", with = "duration_ms")]
    pub shutdown_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_wait_min: default_retry_wait_min(),
            retry_wait_max: default_retry_wait_max(),
            jitter: false,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Shared HTTP client settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Idle connections kept per host (default: 3)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// How long an idle connection is kept (default: 30s)
    #[serde(default = "default_pool_idle_timeout", with = "duration_ms")]
    pub pool_idle_timeout: Duration,

    /// Timeout of a single attempt, including the body (default: 30s)
    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,

    /// Connect timeout (default: 10s)
    #[serde(default = "default_connect_timeout", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// User-Agent header
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout: default_pool_idle_timeout(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl Config {
    /// Read a YAML or JSON config file and layer the process environment on top
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_env(path, std::env::vars().collect())
    }

    /// Read a config file (format chosen by extension), then apply `env`
    ///
    /// `LOG_LEVEL` and `WORKERS` override `logger.level` and `app.workers`.
    /// Any other field can be set as `URL_FETCHER_<SECTION>__<FIELD>`, e.g.
    /// `URL_FETCHER_FETCH__MAX_ATTEMPTS=5`. Empty values are ignored.
    pub fn load_with_env(path: impl AsRef<Path>, env: HashMap<String, String>) -> Result<Self> {
        let level = non_empty(&env, LOG_LEVEL_ENV);
        let workers = non_empty(&env, WORKERS_ENV);

        let environment = ::config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_PREFIX_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .ignore_empty(true)
            .source(Some(env));

        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()))
            .add_source(environment)
            .set_override_option("logger.level", level)?
            .set_override_option("app.workers", workers)?
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Pick the config file: explicit flag, then `CONFIG_PATH`, then the default
    pub fn resolve_path(
        flag: Option<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> PathBuf {
        flag.or_else(|| lookup(CONFIG_PATH_ENV).filter(|p| !p.is_empty()).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Check invariants the pipeline relies on
    pub fn validate(&self) -> Result<()> {
        if self.app.workers == 0 {
            return Err(Error::config("must be greater than zero", "app.workers"));
        }
        if self.fetch.max_attempts == 0 {
            return Err(Error::config("must be greater than zero", "fetch.max_attempts"));
        }
        if self.fetch.retry_wait_min > self.fetch.retry_wait_max {
            return Err(Error::config(
                "retry_wait_min must not exceed retry_wait_max",
                "fetch.retry_wait_min",
            ));
        }
        Ok(())
    }

    /// Configuration written by `--prepare`
    pub fn prepared() -> Self {
        Self {
            app: AppConfig::default(),
            logger: LogConfig {
                level: "debug".to_string(),
                path: "log.log".to_string(),
            },
            fetch: FetchConfig::default(),
            http: HttpConfig::default(),
        }
    }

    /// Write [`Config::prepared`] to `path`, refusing to overwrite
    pub fn prepare(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config = Self::prepared();

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::ConfigExists(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let yaml = serde_yaml::to_string(&config)?;
        file.write_all(yaml.as_bytes())?;

        tracing::info!(path = %path.display(), "wrote default configuration");
        Ok(config)
    }
}

fn non_empty(env: &HashMap<String, String>, key: &str) -> Option<String> {
    env.get(key).filter(|v| !v.trim().is_empty()).cloned()
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_wait_min() -> Duration {
    Duration::from_millis(50)
}

fn default_retry_wait_max() -> Duration {
    Duration::from_secs(5)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_pool_max_idle_per_host() -> usize {
    3
}

fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_user_agent() -> String {
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string()
}

// Duration as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
