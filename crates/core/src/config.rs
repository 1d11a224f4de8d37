use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ranking::{RankingPolicy, OPTION_EMOJI};
use crate::render::RenderLimits;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub discord: DiscordConfig,
    pub polls: PollsConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct DiscordConfig {
    pub bot_token: SecretString,
    pub api_base_url: String,
    pub guild_id: Option<String>,
    pub timeout_secs: u64,
    /// Enables the HTTP interactions endpoint together with `public_key`.
    pub application_id: Option<String>,
    /// Hex-encoded ed25519 key used to verify interaction signatures.
    pub public_key: Option<String>,
}

impl DiscordConfig {
    /// Both halves needed to accept slash commands over HTTP.
    pub fn interactions(&self) -> Option<(&str, &str)> {
        match (&self.application_id, &self.public_key) {
            (Some(application_id), Some(public_key)) => {
                Some((application_id.as_str(), public_key.as_str()))
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollsConfig {
    pub tick_interval_secs: u64,
    pub duration_hours: u64,
    pub reconcile_timeout_secs: u64,
    pub message_char_limit: usize,
    pub label_char_budget: usize,
    pub label_word_budget: usize,
    pub default_option_count: usize,
    pub max_option_count: usize,
    pub source_window_days: u64,
    pub source_fetch_limit: usize,
    pub history_limit: usize,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
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
    pub store_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub discord_bot_token: Option<String>,
    pub discord_api_base_url: Option<String>,
    pub tick_interval_secs: Option<u64>,
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

impl Default for PollsConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            duration_hours: 24,
            reconcile_timeout_secs: 15,
            message_char_limit: 2_000,
            label_char_budget: 80,
            label_word_budget: 50,
            default_option_count: 5,
            max_option_count: 10,
            source_window_days: 7,
            source_fetch_limit: 100,
            history_limit: 288,
        }
    }
}

impl PollsConfig {
    pub fn tick_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.tick_interval_secs)
    }

    pub fn reconcile_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn poll_duration(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::try_from(self.duration_hours).unwrap_or(i64::MAX / 3_600_000))
    }

    pub fn render_limits(&self) -> RenderLimits {
        RenderLimits {
            message_char_limit: self.message_char_limit,
            label_char_budget: self.label_char_budget,
        }
    }

    /// Ranking policy with `requested` clamped into `1..=max_option_count`.
    pub fn ranking_policy(&self, requested: Option<usize>) -> RankingPolicy {
        let top_k = requested.unwrap_or(self.default_option_count).clamp(1, self.max_option_count);
        RankingPolicy {
            window: chrono::Duration::days(
                i64::try_from(self.source_window_days).unwrap_or(i64::MAX / 86_400_000),
            ),
            top_k,
            ..RankingPolicy::default()
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig { path: PathBuf::from("polls.json") },
            discord: DiscordConfig {
                bot_token: String::new().into(),
                api_base_url: "https://discord.com/api/v10".to_string(),
                guild_id: None,
                timeout_secs: 15,
                application_id: None,
                public_key: None,
            },
            polls: PollsConfig::default(),
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tallybot.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(store) = patch.store {
            if let Some(path) = store.path {
                self.store.path = path;
            }
        }

        if let Some(discord) = patch.discord {
            if let Some(bot_token_value) = discord.bot_token {
                self.discord.bot_token = secret_value(bot_token_value);
            }
            if let Some(api_base_url) = discord.api_base_url {
                self.discord.api_base_url = api_base_url;
            }
            if let Some(guild_id) = discord.guild_id {
                self.discord.guild_id = Some(guild_id);
            }
            if let Some(timeout_secs) = discord.timeout_secs {
                self.discord.timeout_secs = timeout_secs;
            }
            if let Some(application_id) = discord.application_id {
                self.discord.application_id = Some(application_id);
            }
            if let Some(public_key) = discord.public_key {
                self.discord.public_key = Some(public_key);
            }
        }

        if let Some(polls) = patch.polls {
            let target = &mut self.polls;
            if let Some(value) = polls.tick_interval_secs {
                target.tick_interval_secs = value;
            }
            if let Some(value) = polls.duration_hours {
                target.duration_hours = value;
            }
            if let Some(value) = polls.reconcile_timeout_secs {
                target.reconcile_timeout_secs = value;
            }
            if let Some(value) = polls.message_char_limit {
                target.message_char_limit = value;
            }
            if let Some(value) = polls.label_char_budget {
                target.label_char_budget = value;
            }
            if let Some(value) = polls.label_word_budget {
                target.label_word_budget = value;
            }
            if let Some(value) = polls.default_option_count {
                target.default_option_count = value;
            }
            if let Some(value) = polls.max_option_count {
                target.max_option_count = value;
            }
            if let Some(value) = polls.source_window_days {
                target.source_window_days = value;
            }
            if let Some(value) = polls.source_fetch_limit {
                target.source_fetch_limit = value;
            }
            if let Some(value) = polls.history_limit {
                target.history_limit = value;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
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
        if let Some(value) = read_env("TALLYBOT_STORE_PATH") {
            self.store.path = PathBuf::from(value);
        }

        if let Some(value) = read_env("TALLYBOT_DISCORD_BOT_TOKEN") {
            self.discord.bot_token = secret_value(value);
        }
        if let Some(value) = read_env("TALLYBOT_DISCORD_API_BASE_URL") {
            self.discord.api_base_url = value;
        }
        if let Some(value) = read_env("TALLYBOT_DISCORD_GUILD_ID") {
            self.discord.guild_id = Some(value);
        }
        if let Some(value) = read_env("TALLYBOT_DISCORD_TIMEOUT_SECS") {
            self.discord.timeout_secs = parse_u64("TALLYBOT_DISCORD_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TALLYBOT_DISCORD_APPLICATION_ID") {
            self.discord.application_id = Some(value);
        }
        if let Some(value) = read_env("TALLYBOT_DISCORD_PUBLIC_KEY") {
            self.discord.public_key = Some(value);
        }

        if let Some(value) = read_env("TALLYBOT_POLLS_TICK_INTERVAL_SECS") {
            self.polls.tick_interval_secs =
                parse_u64("TALLYBOT_POLLS_TICK_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("TALLYBOT_POLLS_DURATION_HOURS") {
            self.polls.duration_hours = parse_u64("TALLYBOT_POLLS_DURATION_HOURS", &value)?;
        }
        if let Some(value) = read_env("TALLYBOT_POLLS_RECONCILE_TIMEOUT_SECS") {
            self.polls.reconcile_timeout_secs =
                parse_u64("TALLYBOT_POLLS_RECONCILE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TALLYBOT_POLLS_MESSAGE_CHAR_LIMIT") {
            self.polls.message_char_limit =
                parse_usize("TALLYBOT_POLLS_MESSAGE_CHAR_LIMIT", &value)?;
        }
        if let Some(value) = read_env("TALLYBOT_POLLS_DEFAULT_OPTION_COUNT") {
            self.polls.default_option_count =
                parse_usize("TALLYBOT_POLLS_DEFAULT_OPTION_COUNT", &value)?;
        }
        if let Some(value) = read_env("TALLYBOT_POLLS_MAX_OPTION_COUNT") {
            self.polls.max_option_count = parse_usize("TALLYBOT_POLLS_MAX_OPTION_COUNT", &value)?;
        }
        if let Some(value) = read_env("TALLYBOT_POLLS_SOURCE_WINDOW_DAYS") {
            self.polls.source_window_days =
                parse_u64("TALLYBOT_POLLS_SOURCE_WINDOW_DAYS", &value)?;
        }
        if let Some(value) = read_env("TALLYBOT_POLLS_HISTORY_LIMIT") {
            self.polls.history_limit = parse_usize("TALLYBOT_POLLS_HISTORY_LIMIT", &value)?;
        }

        if let Some(value) = read_env("TALLYBOT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("TALLYBOT_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("TALLYBOT_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("TALLYBOT_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("TALLYBOT_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("TALLYBOT_LOGGING_LEVEL").or_else(|| read_env("TALLYBOT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TALLYBOT_LOGGING_FORMAT").or_else(|| read_env("TALLYBOT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(store_path) = overrides.store_path {
            self.store.path = store_path;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(bot_token) = overrides.discord_bot_token {
            self.discord.bot_token = secret_value(bot_token);
        }
        if let Some(api_base_url) = overrides.discord_api_base_url {
            self.discord.api_base_url = api_base_url;
        }
        if let Some(tick_interval_secs) = overrides.tick_interval_secs {
            self.polls.tick_interval_secs = tick_interval_secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_store(&self.store)?;
        validate_discord(&self.discord)?;
        validate_polls(&self.polls)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tallybot.toml"), PathBuf::from("config/tallybot.toml")]
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

fn validate_store(store: &StoreConfig) -> Result<(), ConfigError> {
    if store.path.as_os_str().is_empty() {
        return Err(ConfigError::Validation("store.path must not be empty".to_string()));
    }
    if store.path.is_dir() {
        return Err(ConfigError::Validation(format!(
            "store.path `{}` points at a directory; expected a file such as `polls.json`",
            store.path.display()
        )));
    }
    Ok(())
}

fn validate_discord(discord: &DiscordConfig) -> Result<(), ConfigError> {
    let bot_token = discord.bot_token.expose_secret();
    if bot_token.trim().is_empty() {
        return Err(ConfigError::Validation(
            "discord.bot_token is required. Get it from https://discord.com/developers/applications > Your App > Bot > Reset Token".to_string(),
        ));
    }
    if bot_token.starts_with("Bot ") {
        return Err(ConfigError::Validation(
            "discord.bot_token must be the raw token (hint: drop the `Bot ` prefix, it is added automatically)"
                .to_string(),
        ));
    }
    if bot_token.chars().any(char::is_whitespace) {
        return Err(ConfigError::Validation(
            "discord.bot_token must not contain whitespace".to_string(),
        ));
    }

    let base_url = discord.api_base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "discord.api_base_url must start with http:// or https://".to_string(),
        ));
    }

    if let Some(guild_id) = &discord.guild_id {
        if guild_id.is_empty() || !guild_id.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(ConfigError::Validation(
                "discord.guild_id must be a numeric snowflake id".to_string(),
            ));
        }
    }

    if let Some(application_id) = &discord.application_id {
        if application_id.is_empty() || !application_id.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(ConfigError::Validation(
                "discord.application_id must be a numeric snowflake id".to_string(),
            ));
        }
    }
    if let Some(public_key) = &discord.public_key {
        if public_key.len() != 64 || !public_key.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return Err(ConfigError::Validation(
                "discord.public_key must be the 64 character hex key from the developer portal (General Information > Public Key)".to_string(),
            ));
        }
    }
    if discord.application_id.is_some() != discord.public_key.is_some() {
        return Err(ConfigError::Validation(
            "discord.application_id and discord.public_key must be set together".to_string(),
        ));
    }

    if discord.timeout_secs == 0 || discord.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "discord.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_polls(polls: &PollsConfig) -> Result<(), ConfigError> {
    if polls.tick_interval_secs == 0 || polls.tick_interval_secs > 3_600 {
        return Err(ConfigError::Validation(
            "polls.tick_interval_secs must be in range 1..=3600".to_string(),
        ));
    }
    if polls.duration_hours == 0 || polls.duration_hours > 24 * 30 {
        return Err(ConfigError::Validation(
            "polls.duration_hours must be in range 1..=720".to_string(),
        ));
    }
    if polls.reconcile_timeout_secs == 0 || polls.reconcile_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "polls.reconcile_timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if polls.message_char_limit < 100 {
        return Err(ConfigError::Validation(
            "polls.message_char_limit must be at least 100".to_string(),
        ));
    }
    if polls.label_char_budget == 0 || polls.label_word_budget == 0 {
        return Err(ConfigError::Validation(
            "polls.label_char_budget and polls.label_word_budget must be greater than zero"
                .to_string(),
        ));
    }
    if polls.max_option_count == 0 || polls.max_option_count > OPTION_EMOJI.len() {
        return Err(ConfigError::Validation(format!(
            "polls.max_option_count must be in range 1..={}",
            OPTION_EMOJI.len()
        )));
    }
    if polls.default_option_count == 0 || polls.default_option_count > polls.max_option_count {
        return Err(ConfigError::Validation(
            "polls.default_option_count must be in range 1..=polls.max_option_count".to_string(),
        ));
    }
    if polls.source_window_days == 0 {
        return Err(ConfigError::Validation(
            "polls.source_window_days must be greater than zero".to_string(),
        ));
    }
    if polls.source_fetch_limit == 0 || polls.source_fetch_limit > 100 {
        return Err(ConfigError::Validation(
            "polls.source_fetch_limit must be in range 1..=100".to_string(),
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

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
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

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    store: Option<StorePatch>,
    discord: Option<DiscordPatch>,
    polls: Option<PollsPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct StorePatch {
    path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct DiscordPatch {
    bot_token: Option<String>,
    api_base_url: Option<String>,
    guild_id: Option<String>,
    timeout_secs: Option<u64>,
    application_id: Option<String>,
    public_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PollsPatch {
    tick_interval_secs: Option<u64>,
    duration_hours: Option<u64>,
    reconcile_timeout_secs: Option<u64>,
    message_char_limit: Option<usize>,
    label_char_budget: Option<usize>,
    label_word_budget: Option<usize>,
    default_option_count: Option<usize>,
    max_option_count: Option<usize>,
    source_window_days: Option<u64>,
    source_fetch_limit: Option<usize>,
    history_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
