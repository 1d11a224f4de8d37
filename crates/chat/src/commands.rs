use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use tallybot_core::domain::poll::ChannelId;

pub const CREATE_FROM_LIKES: &str = "/poll-from-likes";
pub const RESULTS: &str = "/poll-results";
pub const HELP: &str = "/poll-help";

const OPTION_COUNT: &str = "count";
const OPTION_CHANNEL: &str = "channel";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlashCommandPayload {
    pub command: String,
    /// Named options as sent by the client. Positional text is accepted under
    /// the empty key and split on whitespace.
    pub options: BTreeMap<String, String>,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub user_id: String,
    pub request_id: String,
}

/// Where a command was invoked and by whom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandContext {
    pub channel_id: ChannelId,
    pub guild_id: Option<String>,
    pub user_id: String,
    pub request_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollCommand {
    CreateFromLikes { count: Option<usize>, source_channel: Option<ChannelId> },
    Results,
    Help,
    Unknown { command: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandReply {
    pub content: String,
    /// Visible only to the invoking user.
    pub ephemeral: bool,
}

impl CommandReply {
    pub fn public(content: impl Into<String>) -> Self {
        Self { content: content.into(), ephemeral: false }
    }

    pub fn ephemeral(content: impl Into<String>) -> Self {
        Self { content: content.into(), ephemeral: true }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("option `{name}` has invalid value `{value}`")]
    InvalidOption { name: String, value: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandRouteError {
    #[error("command service failed: {0}")]
    Service(String),
}

pub fn parse_poll_command(payload: &SlashCommandPayload) -> Result<PollCommand, CommandParseError> {
    let command = payload.command.trim().to_ascii_lowercase();
    match command.as_str() {
        CREATE_FROM_LIKES => {
            let options = collect_options(&payload.options);
            let count = options.get(OPTION_COUNT).map(|raw| parse_count(raw)).transpose()?;
            let source_channel =
                options.get(OPTION_CHANNEL).map(|raw| parse_channel_ref(raw)).transpose()?;
            Ok(PollCommand::CreateFromLikes { count, source_channel })
        }
        RESULTS => Ok(PollCommand::Results),
        HELP | "/poll" => Ok(PollCommand::Help),
        _ => Ok(PollCommand::Unknown { command: payload.command.clone() }),
    }
}

/// Merges named options with positional ones. Positional order is
/// `count` then `channel`; a `<#id>` token is always taken as the channel.
fn collect_options(raw: &BTreeMap<String, String>) -> BTreeMap<&'static str, String> {
    let mut options = BTreeMap::new();
    if let Some(positional) = raw.get("") {
        for token in positional.split_whitespace() {
            if token.starts_with("<#") || options.contains_key(OPTION_COUNT) {
                options.entry(OPTION_CHANNEL).or_insert_with(|| token.to_owned());
            } else {
                options.insert(OPTION_COUNT, token.to_owned());
            }
        }
    }
    for (name, value) in raw {
        match name.as_str() {
            OPTION_COUNT => {
                options.insert(OPTION_COUNT, value.trim().to_owned());
            }
            OPTION_CHANNEL => {
                options.insert(OPTION_CHANNEL, value.trim().to_owned());
            }
            _ => {}
        }
    }
    options
}

fn parse_count(raw: &str) -> Result<usize, CommandParseError> {
    raw.trim().parse::<usize>().ok().filter(|count| *count > 0).ok_or_else(|| {
        CommandParseError::InvalidOption { name: OPTION_COUNT.to_owned(), value: raw.to_owned() }
    })
}

/// Accepts a raw snowflake or a `<#snowflake>` channel mention.
pub fn parse_channel_ref(raw: &str) -> Result<ChannelId, CommandParseError> {
    let trimmed = raw.trim();
    let id = trimmed
        .strip_prefix("<#")
        .and_then(|rest| rest.strip_suffix('>'))
        .unwrap_or(trimmed);
    if id.is_empty() || !id.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(CommandParseError::InvalidOption {
            name: OPTION_CHANNEL.to_owned(),
            value: raw.to_owned(),
        });
    }
    Ok(ChannelId(id.to_owned()))
}

pub fn help_reply() -> CommandReply {
    CommandReply::ephemeral(
        "**Poll commands**\n\
         `/poll-from-likes [count] [channel]` - start a 24 hour poll from the most liked recent messages\n\
         `/poll-results` - show the current standings of the latest poll in this channel\n\
         `/poll-help` - show this message",
    )
}

pub struct CommandRouter<S> {
    service: S,
}

impl<S> CommandRouter<S>
where
    S: PollCommandService,
{
    pub fn new(service: S) -> Self {
        Self { service }
    }

    pub async fn route(
        &self,
        payload: &SlashCommandPayload,
    ) -> Result<CommandReply, CommandRouteError> {
        let context = CommandContext {
            channel_id: ChannelId(payload.channel_id.clone()),
            guild_id: payload.guild_id.clone(),
            user_id: payload.user_id.clone(),
            request_id: payload.request_id.clone(),
        };

        let command = match parse_poll_command(payload) {
            Ok(command) => command,
            Err(error) => {
                return Ok(CommandReply::ephemeral(format!(
                    "{error}. Try `{HELP}`. (ref: {})",
                    context.request_id
                )))
            }
        };

        match command {
            PollCommand::CreateFromLikes { count, source_channel } => {
                let source_channel = source_channel.unwrap_or_else(|| context.channel_id.clone());
                self.service.create_from_likes(count, source_channel, &context).await
            }
            PollCommand::Results => self.service.poll_results(&context).await,
            PollCommand::Help => Ok(help_reply()),
            PollCommand::Unknown { command } => Ok(CommandReply::ephemeral(format!(
                "Unsupported command `{command}`. Try `{HELP}`."
            ))),
        }
    }
}

#[async_trait]
pub trait PollCommandService: Send + Sync {
    async fn create_from_likes(
        &self,
        count: Option<usize>,
        source_channel: ChannelId,
        context: &CommandContext,
    ) -> Result<CommandReply, CommandRouteError>;

    async fn poll_results(&self, context: &CommandContext)
        -> Result<CommandReply, CommandRouteError>;
}

#[derive(Default)]
pub struct NoopPollCommandService;

#[async_trait]
impl PollCommandService for NoopPollCommandService {
    async fn create_from_likes(
        &self,
        count: Option<usize>,
        source_channel: ChannelId,
        _context: &CommandContext,
    ) -> Result<CommandReply, CommandRouteError> {
        Ok(CommandReply::ephemeral(format!(
            "Poll creation is unavailable (requested {} options from <#{source_channel}>).",
            count.map_or_else(|| "default".to_owned(), |count| count.to_string())
        )))
    }

    async fn poll_results(
        &self,
        _context: &CommandContext,
    ) -> Result<CommandReply, CommandRouteError> {
        Ok(CommandReply::ephemeral("Poll results are unavailable."))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use tallybot_core::domain::poll::ChannelId;

    use super::{
        parse_channel_ref, parse_poll_command, CommandContext, CommandParseError, CommandReply,
        CommandRouteError, CommandRouter, PollCommand, PollCommandService, SlashCommandPayload,
    };

    fn payload(command: &str, options: &[(&str, &str)]) -> SlashCommandPayload {
        SlashCommandPayload {
            command: command.to_owned(),
            options: options
                .iter()
                .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
                .collect::<BTreeMap<_, _>>(),
            channel_id: "100".to_owned(),
            guild_id: Some("1".to_owned()),
            user_id: "U1".to_owned(),
            request_id: "req-1".to_owned(),
        }
    }

    #[test]
    fn parses_named_options() {
        let command =
            parse_poll_command(&payload("/poll-from-likes", &[("count", "3"), ("channel", "<#200>")]))
                .expect("parse");

        assert_eq!(
            command,
            PollCommand::CreateFromLikes {
                count: Some(3),
                source_channel: Some(ChannelId("200".to_owned())),
            }
        );
    }

    #[test]
    fn parses_positional_text() {
        let command = parse_poll_command(&payload("/poll-from-likes", &[("", "7 <#300>")]))
            .expect("parse");
        assert_eq!(
            command,
            PollCommand::CreateFromLikes {
                count: Some(7),
                source_channel: Some(ChannelId("300".to_owned())),
            }
        );

        let channel_only =
            parse_poll_command(&payload("/poll-from-likes", &[("", "<#300>")])).expect("parse");
        assert_eq!(
            channel_only,
            PollCommand::CreateFromLikes {
                count: None,
                source_channel: Some(ChannelId("300".to_owned())),
            }
        );
    }

    #[test]
    fn rejects_non_numeric_or_zero_count() {
        for raw in ["abc", "0", "-2"] {
            let error = parse_poll_command(&payload("/poll-from-likes", &[("count", raw)]))
                .expect_err("invalid count");
            assert!(matches!(error, CommandParseError::InvalidOption { ref name, .. } if name == "count"));
        }
    }

    #[test]
    fn channel_refs_accept_raw_ids_and_mentions() {
        assert_eq!(parse_channel_ref("123").expect("raw"), ChannelId("123".to_owned()));
        assert_eq!(parse_channel_ref(" <#456> ").expect("mention"), ChannelId("456".to_owned()));
        assert!(parse_channel_ref("#general").is_err());
        assert!(parse_channel_ref("<#>").is_err());
    }

    #[test]
    fn classifies_results_help_and_unknown() {
        assert_eq!(parse_poll_command(&payload("/poll-results", &[])), Ok(PollCommand::Results));
        assert_eq!(parse_poll_command(&payload("/poll-help", &[])), Ok(PollCommand::Help));
        assert!(matches!(
            parse_poll_command(&payload("/quote", &[])),
            Ok(PollCommand::Unknown { .. })
        ));
    }

    #[derive(Default)]
    struct RecordingService {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl PollCommandService for RecordingService {
        async fn create_from_likes(
            &self,
            count: Option<usize>,
            source_channel: ChannelId,
            _context: &CommandContext,
        ) -> Result<CommandReply, CommandRouteError> {
            self.calls.lock().expect("lock").push(format!("create:{count:?}:{source_channel}"));
            Ok(CommandReply::public("created"))
        }

        async fn poll_results(
            &self,
            context: &CommandContext,
        ) -> Result<CommandReply, CommandRouteError> {
            self.calls.lock().expect("lock").push(format!("results:{}", context.channel_id));
            Ok(CommandReply::public("results"))
        }
    }

    #[tokio::test]
    async fn router_defaults_source_channel_to_invoking_channel() {
        let router = CommandRouter::new(RecordingService::default());

        router.route(&payload("/poll-from-likes", &[])).await.expect("create");
        router.route(&payload("/poll-results", &[])).await.expect("results");

        let calls = router.service.calls.lock().expect("lock");
        assert_eq!(&*calls, &["create:None:100", "results:100"]);
    }

    #[tokio::test]
    async fn router_answers_parse_errors_without_calling_service() {
        let router = CommandRouter::new(RecordingService::default());

        let reply =
            router.route(&payload("/poll-from-likes", &[("count", "lots")])).await.expect("reply");

        assert!(reply.ephemeral);
        assert!(reply.content.contains("count"));
        assert!(reply.content.contains("req-1"));
        assert!(router.service.calls.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn help_and_unknown_commands_reply_ephemerally() {
        let router = CommandRouter::new(RecordingService::default());

        let help = router.route(&payload("/poll-help", &[])).await.expect("help");
        assert!(help.ephemeral);
        assert!(help.content.contains("/poll-from-likes"));

        let unknown = router.route(&payload("/poll-nope", &[])).await.expect("unknown");
        assert!(unknown.content.contains("Unsupported command `/poll-nope`"));
    }
}
