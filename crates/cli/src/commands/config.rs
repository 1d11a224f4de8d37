use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use tallybot_core::config::{AppConfig, LoadOptions};
use toml::Value;

struct Field {
    key: &'static str,
    env_key: &'static str,
    value: String,
}

fn field(key: &'static str, env_key: &'static str, value: impl Into<String>) -> Field {
    Field { key, env_key, value: value.into() }
}

fn unset_or(value: Option<&str>) -> String {
    value.unwrap_or("<unset>").to_string()
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for entry in fields(&config) {
        let source = field_source(
            entry.key,
            entry.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(entry.key, &entry.value, source));
    }

    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let discord = &config.discord;
    let polls = &config.polls;
    vec![
        field("store.path", "TALLYBOT_STORE_PATH", config.store.path.display().to_string()),
        field(
            "discord.bot_token",
            "TALLYBOT_DISCORD_BOT_TOKEN",
            redact_token(discord.bot_token.expose_secret()),
        ),
        field("discord.api_base_url", "TALLYBOT_DISCORD_API_BASE_URL", &discord.api_base_url),
        field("discord.guild_id", "TALLYBOT_DISCORD_GUILD_ID", unset_or(discord.guild_id.as_deref())),
        field(
            "discord.timeout_secs",
            "TALLYBOT_DISCORD_TIMEOUT_SECS",
            discord.timeout_secs.to_string(),
        ),
        field(
            "discord.application_id",
            "TALLYBOT_DISCORD_APPLICATION_ID",
            unset_or(discord.application_id.as_deref()),
        ),
        field(
            "discord.public_key",
            "TALLYBOT_DISCORD_PUBLIC_KEY",
            unset_or(discord.public_key.as_deref()),
        ),
        field(
            "polls.tick_interval_secs",
            "TALLYBOT_POLLS_TICK_INTERVAL_SECS",
            polls.tick_interval_secs.to_string(),
        ),
        field("polls.duration_hours", "TALLYBOT_POLLS_DURATION_HOURS", polls.duration_hours.to_string()),
        field(
            "polls.reconcile_timeout_secs",
            "TALLYBOT_POLLS_RECONCILE_TIMEOUT_SECS",
            polls.reconcile_timeout_secs.to_string(),
        ),
        field(
            "polls.message_char_limit",
            "TALLYBOT_POLLS_MESSAGE_CHAR_LIMIT",
            polls.message_char_limit.to_string(),
        ),
        field(
            "polls.default_option_count",
            "TALLYBOT_POLLS_DEFAULT_OPTION_COUNT",
            polls.default_option_count.to_string(),
        ),
        field(
            "polls.max_option_count",
            "TALLYBOT_POLLS_MAX_OPTION_COUNT",
            polls.max_option_count.to_string(),
        ),
        field(
            "polls.source_window_days",
            "TALLYBOT_POLLS_SOURCE_WINDOW_DAYS",
            polls.source_window_days.to_string(),
        ),
        field("polls.history_limit", "TALLYBOT_POLLS_HISTORY_LIMIT", polls.history_limit.to_string()),
        field("server.bind_address", "TALLYBOT_SERVER_BIND_ADDRESS", &config.server.bind_address),
        field(
            "server.health_check_port",
            "TALLYBOT_SERVER_HEALTH_CHECK_PORT",
            config.server.health_check_port.to_string(),
        ),
        field("logging.level", "TALLYBOT_LOGGING_LEVEL", &config.logging.level),
        field("logging.format", "TALLYBOT_LOGGING_FORMAT", format!("{:?}", config.logging.format)),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["tallybot.toml", "config/tallybot.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Discord bot tokens are three dot-separated segments; the first encodes
/// the bot user id and is safe to show.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    match trimmed.split_once('.') {
        Some((prefix, _)) if !prefix.is_empty() => format!("{prefix}.***"),
        _ => "<redacted>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{contains_path, redact_token};

    #[test]
    fn bot_tokens_keep_only_their_first_segment() {
        assert_eq!(redact_token("MTIz.abc.def"), "MTIz.***");
        assert_eq!(redact_token("opaque"), "<redacted>");
        assert_eq!(redact_token("   "), "<empty>");
    }

    #[test]
    fn nested_keys_are_found_in_the_file_document() {
        let doc: toml::Value = "[polls]\ntick_interval_secs = 5\n".parse().expect("toml");
        assert!(contains_path(&doc, "polls.tick_interval_secs"));
        assert!(!contains_path(&doc, "polls.duration_hours"));
    }
}
