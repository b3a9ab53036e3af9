use serde::Deserialize;
use std::path::PathBuf;

use crate::model::Identity;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub identity: IdentityConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub hydration: HydrationConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// The identity this session runs under. An empty display name falls
    /// back to the user id.
    pub fn identity(&self) -> Identity {
        let display_name = if self.identity.display_name.is_empty() {
            self.identity.user_id.clone()
        } else {
            self.identity.display_name.clone()
        };

        Identity {
            user_id: self.identity.user_id.clone(),
            company_id: self.identity.company_id.clone(),
            display_name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub user_id: String,
    pub company_id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_url: default_api_url(),
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_connect_timeout")]
    pub timeout_seconds: u64,
    /// 0 means retry forever.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_reconnect_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HydrationConfig {
    #[serde(default = "default_hydration_timeout")]
    pub timeout_seconds: u64,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    user_id: Option<String>,
    company_id: Option<String>,
    ws_url: Option<String>,
    api_url: Option<String>,
    auth_token: Option<String>,
    log_level: Option<String>,
}

fn default_ws_url() -> String {
    "wss://chat.example.com/ws".to_string()
}

fn default_api_url() -> String {
    "https://chat.example.com/api".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_hydration_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[identity]
user_id = ""
company_id = ""
# display_name = "Jane Seller"

[server]
ws_url = "wss://chat.example.com/ws"
api_url = "https://chat.example.com/api"
# auth_token = ""

[connection]
timeout_seconds = 30
max_reconnect_attempts = 0

[hydration]
timeout_seconds = 10

[event_bus]
channel_capacity = 1024

[logging]
level = "info"
"#;

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "natter", "natter") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides. Returns a validated Config or a descriptive error.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. Used by `load_config()` and tests.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly (for testing).
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: PathBuf,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(&path)?;
            return Err(ConfigError::MissingRequiredFields {
                fields: vec![
                    "identity.user_id".to_string(),
                    "identity.company_id".to_string(),
                ],
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        user_id: std::env::var("NATTER_USER_ID").ok(),
        company_id: std::env::var("NATTER_COMPANY_ID").ok(),
        ws_url: std::env::var("NATTER_WS_URL").ok(),
        api_url: std::env::var("NATTER_API_URL").ok(),
        auth_token: std::env::var("NATTER_AUTH_TOKEN").ok(),
        log_level: std::env::var("NATTER_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(user_id) = overrides.user_id {
        config.identity.user_id = user_id;
    }
    if let Some(company_id) = overrides.company_id {
        config.identity.company_id = company_id;
    }
    if let Some(ws_url) = overrides.ws_url {
        config.server.ws_url = ws_url;
    }
    if let Some(api_url) = overrides.api_url {
        config.server.api_url = api_url;
    }
    if let Some(auth_token) = overrides.auth_token {
        config.server.auth_token = Some(auth_token);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut missing = Vec::new();

    if config.identity.user_id.is_empty() {
        missing.push("identity.user_id".to_string());
    }
    if config.identity.company_id.is_empty() {
        missing.push("identity.company_id".to_string());
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    if config.server.ws_url.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "server.ws_url".to_string(),
            message: "must not be empty".to_string(),
        });
    }
    if config.server.api_url.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "server.api_url".to_string(),
            message: "must not be empty".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    Ok(())
}

fn create_default_config(path: &PathBuf) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
