use crate::ws::{bridge::BridgeConfig, provider::deepgram::DEFAULT_AGENT_URL};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Where menu and order records live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Postgres => "postgres",
            StoreKind::Memory => "memory",
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub deepgram_api_key: String,
    pub agent_url: String,
    pub agent_settings_path: PathBuf,
    pub validate_agent_key: bool,
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub menu_seed_path: Option<PathBuf>,
    pub control_timeout: Duration,
    pub audio_read_timeout: Duration,
    pub max_audio_skips: u32,
    pub shutdown_grace: Duration,
    pub agent_keepalive: Option<Duration>,
    pub audio_chunk_bytes: usize,
    pub caller_vad_threshold: u16,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var("BIND_ADDRESS", "0.0.0.0:5000")?;

        let deepgram_api_key = std::env::var("DEEPGRAM_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("DEEPGRAM_API_KEY".to_string()))?;

        let agent_url =
            std::env::var("AGENT_URL").unwrap_or_else(|_| DEFAULT_AGENT_URL.to_string());
        let agent_settings_path = std::env::var("AGENT_SETTINGS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./agent_settings.json"));
        let validate_agent_key = parse_var("VALIDATE_AGENT_KEY", "true")?;

        let store_str = std::env::var("MENU_STORE").unwrap_or_else(|_| "postgres".to_string());
        let store = match store_str.to_lowercase().as_str() {
            "postgres" => StoreKind::Postgres,
            "memory" => StoreKind::Memory,
            other => {
                return Err(ConfigError::InvalidValue(
                    "MENU_STORE".to_string(),
                    format!("'{}' is not one of 'postgres' or 'memory'", other),
                ));
            }
        };
        let database_url = std::env::var("DATABASE_URL").ok();
        if store == StoreKind::Postgres && database_url.is_none() {
            return Err(ConfigError::MissingVar(
                "DATABASE_URL must be set for the 'postgres' menu store".to_string(),
            ));
        }
        let menu_seed_path = std::env::var("MENU_SEED_PATH").ok().map(PathBuf::from);

        let control_timeout = Duration::from_secs(parse_var("CONTROL_TIMEOUT_SECS", "120")?);
        let audio_read_timeout = Duration::from_millis(parse_var("AUDIO_READ_TIMEOUT_MS", "2000")?);
        let max_audio_skips = parse_var("MAX_AUDIO_SKIPS", "5")?;
        let shutdown_grace = Duration::from_millis(parse_var("SHUTDOWN_GRACE_MS", "2000")?);
        let keepalive_secs: u64 = parse_var("AGENT_KEEPALIVE_SECS", "8")?;
        let agent_keepalive = (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs));
        let audio_chunk_bytes: usize = parse_var("AUDIO_CHUNK_BYTES", "3200")?;
        if audio_chunk_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "AUDIO_CHUNK_BYTES".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        let caller_vad_threshold = parse_var("CALLER_VAD_THRESHOLD", "900")?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            deepgram_api_key,
            agent_url,
            agent_settings_path,
            validate_agent_key,
            store,
            database_url,
            menu_seed_path,
            control_timeout,
            audio_read_timeout,
            max_audio_skips,
            shutdown_grace,
            agent_keepalive,
            audio_chunk_bytes,
            caller_vad_threshold,
            log_level,
        })
    }

    /// The per-call settings handed to every session bridge.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            control_timeout: self.control_timeout,
            audio_read_timeout: self.audio_read_timeout,
            max_audio_skips: self.max_audio_skips,
            shutdown_grace: self.shutdown_grace,
            keepalive_interval: self.agent_keepalive,
            ..BridgeConfig::default()
        }
    }
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}
