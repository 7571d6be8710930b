// Configuration loading and parsing (turnpick.toml, credentials.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use turnpick_core::channel::Credential;
use turnpick_core::league::parse_start_time;
use turnpick_core::protocol::{Participant, SessionId};
use turnpick_core::session::{ReconnectPolicy, SessionContext};

/// Overrides the base directory that holds `config/`.
pub const CONFIG_DIR_ENV: &str = "TURNPICK_CONFIG_DIR";

/// Upper bound for `reconnect.max_delay_ms` (10 minutes).
pub const MAX_RECONNECT_DELAY_MS: u64 = 10 * 60 * 1000;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub reconnect: ReconnectConfig,
    pub logging: LoggingConfig,
    pub schedule: Option<ScheduleConfig>,
    pub credentials: CredentialsConfig,
}

impl Config {
    /// The explicit context threaded into the realtime channel and REST calls.
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            session_id: SessionId(self.session.session_id),
            local: Participant::new(self.credentials.participant_id, &self.credentials.username),
            credential: Credential::new(&self.credentials.token),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial: Duration::from_millis(self.reconnect.initial_delay_ms),
            max: Duration::from_millis(self.reconnect.max_delay_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// turnpick.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire turnpick.toml file.
#[derive(Debug, Clone, Deserialize)]
struct TurnpickFile {
    server: ServerConfig,
    session: SessionConfig,
    #[serde(default)]
    reconnect: ReconnectConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    schedule: Option<ScheduleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// REST base, e.g. `http://localhost:8080/api`.
    pub api_base_url: String,
    /// STOMP websocket endpoint, e.g. `ws://localhost:8080/ws`.
    pub ws_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub session_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        ReconnectConfig {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub directory: String,
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            directory: "logs".into(),
            filter: "turnpick=info,warn".into(),
        }
    }
}

/// Scheduling parameters the league admin submits for an unscheduled draft.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    pub start_time: String,
    pub turn_duration_secs: u32,
}

impl ScheduleConfig {
    pub fn start(&self) -> Option<DateTime<Utc>> {
        parse_start_time(self.start_time.trim())
    }
}

// ---------------------------------------------------------------------------
// credentials.toml
// ---------------------------------------------------------------------------

/// Output of the identity provider.
#[derive(Clone, Deserialize)]
pub struct CredentialsConfig {
    pub token: String,
    pub participant_id: u64,
    pub username: String,
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("token", &"<redacted>")
            .field("participant_id", &self.participant_id)
            .field("username", &self.username)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/turnpick.toml` and
/// `config/credentials.toml`, relative to the given `base_dir`.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- turnpick.toml (required) ---
    let main_path = config_dir.join("turnpick.toml");
    let main_text = read_file(&main_path)?;
    let file: TurnpickFile = toml::from_str(&main_text).map_err(|e| ConfigError::ParseError {
        path: main_path.clone(),
        source: e,
    })?;

    // --- credentials.toml (required) ---
    let credentials_path = config_dir.join("credentials.toml");
    let cred_text = read_file(&credentials_path)?;
    let credentials: CredentialsConfig =
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?;

    let config = Config {
        server: file.server,
        session: file.session,
        reconnect: file.reconnect,
        logging: file.logging,
        schedule: file.schedule,
        credentials,
    };

    validate(&config)?;

    Ok(config)
}

/// Base directory resolution: `TURNPICK_CONFIG_DIR`, then the current
/// directory when it has a `config/` folder, then the platform config dir.
pub fn resolve_base_dir() -> Result<PathBuf, ConfigError> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    if cwd.join("config").is_dir() {
        return Ok(cwd);
    }
    match ProjectDirs::from("", "", "turnpick") {
        Some(dirs) => Ok(dirs.config_dir().to_path_buf()),
        None => Ok(cwd),
    }
}

/// Convenience wrapper: resolve the base directory and load from it.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&resolve_base_dir()?)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.into(),
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let api = config.server.api_base_url.trim();
    if !(api.starts_with("http://") || api.starts_with("https://")) {
        return Err(invalid("server.api_base_url", format!("must be an http(s) URL, got `{api}`")));
    }

    let ws = config.server.ws_url.trim();
    if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
        return Err(invalid("server.ws_url", format!("must be a ws(s) URL, got `{ws}`")));
    }

    if config.session.session_id == 0 {
        return Err(invalid("session.session_id", "must be greater than 0"));
    }

    let r = &config.reconnect;
    if r.initial_delay_ms == 0 {
        return Err(invalid("reconnect.initial_delay_ms", "must be greater than 0"));
    }
    if r.max_delay_ms < r.initial_delay_ms {
        return Err(invalid(
            "reconnect.max_delay_ms",
            format!("must be >= initial_delay_ms ({})", r.initial_delay_ms),
        ));
    }
    if r.max_delay_ms > MAX_RECONNECT_DELAY_MS {
        return Err(invalid(
            "reconnect.max_delay_ms",
            format!("must be at most {MAX_RECONNECT_DELAY_MS}"),
        ));
    }

    if config.logging.directory.trim().is_empty() {
        return Err(invalid("logging.directory", "must not be empty"));
    }

    if let Some(schedule) = &config.schedule {
        if schedule.start().is_none() {
            return Err(invalid(
                "schedule.start_time",
                format!("not an ISO-8601 timestamp: `{}`", schedule.start_time),
            ));
        }
        if schedule.turn_duration_secs == 0 {
            return Err(invalid("schedule.turn_duration_secs", "must be greater than 0"));
        }
    }

    let c = &config.credentials;
    if c.token.trim().is_empty() {
        return Err(invalid("credentials.token", "must not be empty"));
    }
    if c.participant_id == 0 {
        return Err(invalid("credentials.participant_id", "must be greater than 0"));
    }
    if c.username.trim().is_empty() {
        return Err(invalid("credentials.username", "must not be empty"));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
