//! Process-level configuration loaded from environment variables.
//!
//! `.env` files are honoured through `dotenvy` before the variables are read.
//! Every section has a sensible default so the service starts with an empty
//! environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::api::server::ApiServerConfig;
use crate::{Error, Result};

/// Core stream lifecycle settings.
#[derive(Debug, Clone)]
pub struct CasterConfig {
    /// Maximum number of streams in a non-terminal state.
    pub max_streams: usize,
    /// Directory for acquired source files. Only files below it are ever deleted.
    pub temp_dir: PathBuf,
    /// Transmission binary (ffmpeg compatible).
    pub ffmpeg_path: String,
    /// Relay binary used for both legs of a redundant branch.
    pub relay_path: String,
    /// Grace period between terminate and kill.
    pub terminate_grace: Duration,
    /// How long terminal status records are kept. `None` keeps them forever.
    pub status_retention: Option<Duration>,
}

impl Default for CasterConfig {
    fn default() -> Self {
        Self {
            max_streams: 10,
            temp_dir: PathBuf::from("./temp"),
            ffmpeg_path: "ffmpeg".to_string(),
            relay_path: "srt-live-transmit".to_string(),
            terminate_grace: Duration::from_secs(5),
            status_retention: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

/// Storage collaborator settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory of the local object store.
    pub media_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            media_dir: PathBuf::from("./media"),
        }
    }
}

/// Login and API key settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Username to password map accepted by `/login`.
    pub users: HashMap<String, String>,
    /// Lifetime of an issued API key.
    pub api_key_ttl: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            users: HashMap::from([("Admin".to_string(), "1234".to_string())]),
            api_key_ttl: Duration::from_secs(60 * 60),
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Default)]
pub struct LoggingSettings {
    /// Directory for daily rolling log files. Console only when unset.
    pub log_dir: Option<PathBuf>,
}

/// Complete application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub caster: CasterConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub api: ApiServerConfig,
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let caster = CasterConfig {
            max_streams: parse_or(&lookup, "MAX_STREAMS", defaults.caster.max_streams)?,
            temp_dir: path_or(&lookup, "TEMP_DIR", defaults.caster.temp_dir),
            ffmpeg_path: lookup("FFMPEG_PATH").unwrap_or(defaults.caster.ffmpeg_path),
            relay_path: lookup("RELAY_PATH").unwrap_or(defaults.caster.relay_path),
            terminate_grace: Duration::from_secs(parse_or(
                &lookup,
                "TERMINATE_GRACE_SECS",
                defaults.caster.terminate_grace.as_secs(),
            )?),
            status_retention: match lookup("STATUS_RETENTION_SECS") {
                Some(raw) => {
                    let secs: u64 = parse_value("STATUS_RETENTION_SECS", &raw)?;
                    (secs > 0).then(|| Duration::from_secs(secs))
                }
                None => defaults.caster.status_retention,
            },
        };

        if caster.max_streams == 0 {
            return Err(Error::config("MAX_STREAMS must be at least 1"));
        }

        let storage = StorageConfig {
            media_dir: path_or(&lookup, "MEDIA_DIR", defaults.storage.media_dir),
        };

        let auth = AuthConfig {
            users: match lookup("USERS") {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| Error::config(format!("USERS is not a JSON object: {e}")))?,
                None => defaults.auth.users,
            },
            api_key_ttl: Duration::from_secs(
                60 * parse_or(
                    &lookup,
                    "API_KEY_TTL_MINUTES",
                    defaults.auth.api_key_ttl.as_secs() / 60,
                )?,
            ),
        };

        let mut api = defaults.api;
        if let Some(bind_address) = lookup("API_BIND_ADDRESS")
            && !bind_address.trim().is_empty()
        {
            api.bind_address = bind_address;
        }
        api.port = parse_or(&lookup, "API_PORT", api.port)?;
        if let Some(raw) = lookup("ALLOWED_ORIGINS") {
            api.allowed_origins = serde_json::from_str(&raw)
                .map_err(|e| Error::config(format!("ALLOWED_ORIGINS is not a JSON list: {e}")))?;
        }

        let logging = LoggingSettings {
            log_dir: lookup("LOG_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
        };

        Ok(Self {
            caster,
            storage,
            auth,
            api,
            logging,
        })
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::config(format!("{key}={raw:?} is invalid: {e}")))
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn path_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: PathBuf) -> PathBuf {
    lookup(key).map(PathBuf::from).unwrap_or(default)
}
