use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::BackoffPolicy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub chat: ChatConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
    pub operation_timeout_secs: u64,
    pub connect_max_attempts: u32,
    pub connect_initial_delay_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub server_url: String,
    pub bot_token: SecretString,
    pub reconnect_attempts: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub chat_server_url: Option<String>,
    pub chat_bot_token: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://pollbot.db?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 15,
                operation_timeout_secs: 10,
                connect_max_attempts: 7,
                connect_initial_delay_ms: 1_000,
            },
            chat: ChatConfig {
                server_url: String::new(),
                bot_token: String::new().into(),
                reconnect_attempts: 1,
            },
            server: ServerConfig { bind_address: "127.0.0.1".to_string(), health_check_port: 8080 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl DatabaseConfig {
    pub fn connect_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: self.connect_max_attempts,
            initial_delay: Duration::from_millis(self.connect_initial_delay_ms),
            ..BackoffPolicy::store_connect()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl ChatConfig {
    pub fn reconnect_policy(&self) -> BackoffPolicy {
        BackoffPolicy::immediate(self.reconnect_attempts)
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("pollbot.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
            if let Some(operation_timeout_secs) = database.operation_timeout_secs {
                self.database.operation_timeout_secs = operation_timeout_secs;
            }
            if let Some(connect_max_attempts) = database.connect_max_attempts {
                self.database.connect_max_attempts = connect_max_attempts;
            }
            if let Some(connect_initial_delay_ms) = database.connect_initial_delay_ms {
                self.database.connect_initial_delay_ms = connect_initial_delay_ms;
            }
        }

        if let Some(chat) = patch.chat {
            if let Some(server_url) = chat.server_url {
                self.chat.server_url = server_url;
            }
            if let Some(bot_token) = chat.bot_token {
                self.chat.bot_token = secret_value(bot_token);
            }
            if let Some(reconnect_attempts) = chat.reconnect_attempts {
                self.chat.reconnect_attempts = reconnect_attempts;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("POLLBOT_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("POLLBOT_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("POLLBOT_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("POLLBOT_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("POLLBOT_DATABASE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("POLLBOT_DATABASE_OPERATION_TIMEOUT_SECS") {
            self.database.operation_timeout_secs =
                parse_u64("POLLBOT_DATABASE_OPERATION_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("POLLBOT_DATABASE_CONNECT_MAX_ATTEMPTS") {
            self.database.connect_max_attempts =
                parse_u32("POLLBOT_DATABASE_CONNECT_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("POLLBOT_DATABASE_CONNECT_INITIAL_DELAY_MS") {
            self.database.connect_initial_delay_ms =
                parse_u64("POLLBOT_DATABASE_CONNECT_INITIAL_DELAY_MS", &value)?;
        }

        let server_url =
            read_env("POLLBOT_CHAT_SERVER_URL").or_else(|| read_env("MATTERMOST_URL"));
        if let Some(value) = server_url {
            self.chat.server_url = value;
        }
        let bot_token = read_env("POLLBOT_CHAT_BOT_TOKEN").or_else(|| read_env("MATTERMOST_TOKEN"));
        if let Some(value) = bot_token {
            self.chat.bot_token = secret_value(value);
        }
        if let Some(value) = read_env("POLLBOT_CHAT_RECONNECT_ATTEMPTS") {
            self.chat.reconnect_attempts = parse_u32("POLLBOT_CHAT_RECONNECT_ATTEMPTS", &value)?;
        }

        if let Some(value) = read_env("POLLBOT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("POLLBOT_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("POLLBOT_SERVER_HEALTH_CHECK_PORT", &value)?;
        }

        let log_level = read_env("POLLBOT_LOGGING_LEVEL").or_else(|| read_env("POLLBOT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("POLLBOT_LOGGING_FORMAT").or_else(|| read_env("POLLBOT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(chat_server_url) = overrides.chat_server_url {
            self.chat.server_url = chat_server_url;
        }
        if let Some(chat_bot_token) = overrides.chat_bot_token {
            self.chat.bot_token = secret_value(chat_bot_token);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_chat(&self.chat)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("pollbot.toml"), PathBuf::from("config/pollbot.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if database.operation_timeout_secs == 0 || database.operation_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.operation_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if database.connect_max_attempts == 0 || database.connect_max_attempts > 16 {
        return Err(ConfigError::Validation(
            "database.connect_max_attempts must be in range 1..=16".to_string(),
        ));
    }

    Ok(())
}

fn validate_chat(chat: &ChatConfig) -> Result<(), ConfigError> {
    let server_url = chat.server_url.trim();
    if server_url.is_empty() {
        return Err(ConfigError::Validation(
            "chat.server_url is required (set POLLBOT_CHAT_SERVER_URL or MATTERMOST_URL)"
                .to_string(),
        ));
    }
    if !server_url.starts_with("http://") && !server_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "chat.server_url must start with http:// or https://".to_string(),
        ));
    }

    if chat.bot_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "chat.bot_token is required (set POLLBOT_CHAT_BOT_TOKEN or MATTERMOST_TOKEN)"
                .to_string(),
        ));
    }

    if chat.reconnect_attempts == 0 {
        return Err(ConfigError::Validation(
            "chat.reconnect_attempts must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    chat: Option<ChatPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
    operation_timeout_secs: Option<u64>,
    connect_max_attempts: Option<u32>,
    connect_initial_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatPatch {
    server_url: Option<String>,
    bot_token: Option<String>,
    reconnect_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
