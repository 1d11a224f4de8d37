//! Discord REST v10 implementation of [`ChatPlatform`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use tallybot_core::domain::poll::{ChannelId, MessageId};

use crate::platform::{
    ChatError, ChatMessage, ChatPlatform, ChatUser, ReactionSummary, DEFAULT_MESSAGE_CHAR_LIMIT,
};

const USER_AGENT: &str =
    concat!("DiscordBot (https://github.com/tallybot, ", env!("CARGO_PKG_VERSION"), ")");
const REACTION_PAGE_SIZE: usize = 100;
const MESSAGE_PAGE_MAX: usize = 100;

// Longer limits are left to the caller; the next poll tick retries anyway.
const RATE_LIMIT_RETRIES: u32 = 2;
const RATE_LIMIT_MAX_WAIT: Duration = Duration::from_secs(5);
const DEFAULT_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

// JSON error codes returned alongside 4xx statuses.
const UNKNOWN_CHANNEL: u64 = 10_003;
const UNKNOWN_MESSAGE: u64 = 10_008;
const MISSING_ACCESS: u64 = 50_001;

/// Message flag that limits visibility to the invoking user.
pub const EPHEMERAL_FLAG: u64 = 1 << 6;

pub struct DiscordRestClient {
    http: Client,
    base_url: Url,
    token: SecretString,
}

impl DiscordRestClient {
    pub fn new(base_url: &str, token: SecretString, timeout: Duration) -> Result<Self, ChatError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|error| ChatError::Request(format!("invalid api base url: {error}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::Request(format!("api base url `{base_url}` cannot be a base")));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| ChatError::Request(error.to_string()))?;

        Ok(Self { http, base_url, token })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ChatError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|()| {
                ChatError::Request(format!("api base url `{}` cannot be a base", self.base_url))
            })?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bot {}", self.token.expose_secret()))
    }

    /// Sends a request, waiting out short rate limits. A limit that outlasts
    /// the retry budget surfaces as [`ChatError::RateLimited`].
    async fn execute(
        &self,
        request: RequestBuilder,
        target: &Target<'_>,
    ) -> Result<reqwest::Response, ChatError> {
        let mut request = request;
        let mut retries_left = RATE_LIMIT_RETRIES;
        loop {
            let retry = request.try_clone();
            let response =
                request.send().await.map_err(|error| ChatError::Request(error.to_string()))?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let header_wait = retry_after_header(&response);
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = rate_limit_wait(header_wait, &body);
                match retry {
                    Some(next) if retries_left > 0 && retry_after <= RATE_LIMIT_MAX_WAIT => {
                        debug!(
                            event_name = "chat.discord.rate_limited",
                            channel_id = %target.channel_id,
                            retry_after_ms = retry_after.as_millis() as u64,
                            retries_left,
                            "waiting out discord rate limit"
                        );
                        tokio::time::sleep(retry_after).await;
                        retries_left -= 1;
                        request = next;
                        continue;
                    }
                    _ => {
                        warn!(
                            event_name = "chat.discord.rate_limited",
                            channel_id = %target.channel_id,
                            retry_after_ms = retry_after.as_millis() as u64,
                            "discord rate limit outlasted the retry budget"
                        );
                        return Err(ChatError::RateLimited { retry_after });
                    }
                }
            }

            let code = serde_json::from_str::<ApiErrorBody>(&body).ok().and_then(|body| body.code);
            debug!(
                event_name = "chat.discord.request_rejected",
                status = status.as_u16(),
                code = code.unwrap_or_default(),
                channel_id = %target.channel_id,
                "discord api rejected request"
            );
            return Err(classify_failure(status, code, &body, target));
        }
    }

    async fn execute_json<T>(
        &self,
        request: RequestBuilder,
        target: &Target<'_>,
    ) -> Result<T, ChatError>
    where
        T: DeserializeOwned,
    {
        let response = self.execute(request, target).await?;
        response.json::<T>().await.map_err(|error| ChatError::Decode(error.to_string()))
    }
}

// Interaction webhooks are authorized by their token, not the bot token.
impl DiscordRestClient {
    /// Replaces the deferred response of an interaction.
    pub async fn edit_original_response(
        &self,
        application_id: &str,
        interaction_token: &str,
        content: &str,
    ) -> Result<(), ChatError> {
        let url = self.endpoint(&[
            "webhooks",
            application_id,
            interaction_token,
            "messages",
            "@original",
        ])?;
        self.execute_webhook(self.http.patch(url).json(&json!({ "content": content }))).await
    }

    pub async fn delete_original_response(
        &self,
        application_id: &str,
        interaction_token: &str,
    ) -> Result<(), ChatError> {
        let url = self.endpoint(&[
            "webhooks",
            application_id,
            interaction_token,
            "messages",
            "@original",
        ])?;
        self.execute_webhook(self.http.delete(url)).await
    }

    pub async fn create_followup(
        &self,
        application_id: &str,
        interaction_token: &str,
        content: &str,
        ephemeral: bool,
    ) -> Result<(), ChatError> {
        let url = self.endpoint(&["webhooks", application_id, interaction_token])?;
        let flags = if ephemeral { EPHEMERAL_FLAG } else { 0 };
        self.execute_webhook(self.http.post(url).json(&json!({ "content": content, "flags": flags })))
            .await
    }

    async fn execute_webhook(&self, request: RequestBuilder) -> Result<(), ChatError> {
        let response =
            request.send().await.map_err(|error| ChatError::Request(error.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let header_wait = retry_after_header(&response);
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ChatError::RateLimited { retry_after: rate_limit_wait(header_wait, &body) });
        }
        debug!(
            event_name = "chat.discord.webhook_rejected",
            status = status.as_u16(),
            "discord api rejected interaction webhook"
        );
        Err(ChatError::Api { status: status.as_u16(), detail: truncate_detail(&body) })
    }
}

struct Target<'a> {
    channel_id: &'a ChannelId,
    message_id: Option<&'a MessageId>,
}

fn classify_failure(
    status: StatusCode,
    code: Option<u64>,
    body: &str,
    target: &Target<'_>,
) -> ChatError {
    let channel_gone = || ChatError::ChannelUnavailable(target.channel_id.clone());
    match (status, code) {
        (_, Some(UNKNOWN_CHANNEL)) | (_, Some(MISSING_ACCESS)) => channel_gone(),
        (StatusCode::FORBIDDEN, _) => channel_gone(),
        (_, Some(UNKNOWN_MESSAGE)) | (StatusCode::NOT_FOUND, _) => match target.message_id {
            Some(message_id) => ChatError::MessageNotFound {
                channel_id: target.channel_id.clone(),
                message_id: message_id.clone(),
            },
            None => channel_gone(),
        },
        _ => ChatError::Api { status: status.as_u16(), detail: truncate_detail(body) },
    }
}

/// Seconds to wait, preferring the JSON `retry_after` over the header.
fn rate_limit_wait(header: Option<Duration>, body: &str) -> Duration {
    serde_json::from_str::<RateLimitBody>(body)
        .ok()
        .and_then(|body| body.retry_after)
        .and_then(seconds)
        .or(header)
        .unwrap_or(DEFAULT_RATE_LIMIT_WAIT)
}

fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .and_then(seconds)
}

fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}

fn truncate_detail(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Path form of an emoji: unicode as-is, custom emoji as `name:id`.
fn emoji_path(emoji: &str) -> &str {
    let Some(inner) = emoji.strip_prefix('<').and_then(|rest| rest.strip_suffix('>')) else {
        return emoji;
    };
    inner.strip_prefix("a:").or_else(|| inner.strip_prefix(':')).unwrap_or(inner)
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    id: String,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct WireEmoji {
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireReaction {
    count: u32,
    emoji: WireEmoji,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    channel_id: String,
    author: WireUser,
    #[serde(default)]
    content: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    reactions: Vec<WireReaction>,
}

impl WireEmoji {
    fn key(&self) -> Option<String> {
        match (&self.name, &self.id) {
            (Some(name), Some(id)) => Some(format!("{name}:{id}")),
            (Some(name), None) => Some(name.clone()),
            (None, _) => None,
        }
    }
}

impl From<WireUser> for ChatUser {
    fn from(user: WireUser) -> Self {
        Self { id: user.id, bot: user.bot }
    }
}

impl From<WireMessage> for ChatMessage {
    fn from(message: WireMessage) -> Self {
        let reactions = message
            .reactions
            .into_iter()
            .filter_map(|reaction| {
                reaction.emoji.key().map(|emoji| ReactionSummary { emoji, count: reaction.count })
            })
            .collect();
        Self {
            id: MessageId(message.id),
            channel_id: ChannelId(message.channel_id),
            author: message.author.into(),
            content: message.content,
            created_at: message.timestamp,
            reactions,
        }
    }
}

#[async_trait]
impl ChatPlatform for DiscordRestClient {
    fn message_char_limit(&self) -> usize {
        DEFAULT_MESSAGE_CHAR_LIMIT
    }

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        let url = self.endpoint(&["channels", &channel_id.0, "messages"])?;
        let request = self.request(Method::POST, url).json(&json!({ "content": content }));
        let target = Target { channel_id, message_id: None };
        let message: WireMessage = self.execute_json(request, &target).await?;
        Ok(message.into())
    }

    async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<(), ChatError> {
        let url = self.endpoint(&["channels", &channel_id.0, "messages", &message_id.0])?;
        let request = self.request(Method::PATCH, url).json(&json!({ "content": content }));
        let target = Target { channel_id, message_id: Some(message_id) };
        self.execute(request, &target).await?;
        Ok(())
    }

    async fn fetch_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<ChatMessage, ChatError> {
        let url = self.endpoint(&["channels", &channel_id.0, "messages", &message_id.0])?;
        let target = Target { channel_id, message_id: Some(message_id) };
        let message: WireMessage =
            self.execute_json(self.request(Method::GET, url), &target).await?;
        Ok(message.into())
    }

    async fn reaction_users(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<Vec<ChatUser>, ChatError> {
        let target = Target { channel_id, message_id: Some(message_id) };
        let mut users = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut url = self.endpoint(&[
                "channels",
                &channel_id.0,
                "messages",
                &message_id.0,
                "reactions",
                emoji_path(emoji),
            ])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("limit", &REACTION_PAGE_SIZE.to_string());
                if let Some(after) = &after {
                    query.append_pair("after", after);
                }
            }

            let page: Vec<WireUser> =
                self.execute_json(self.request(Method::GET, url), &target).await?;
            let page_len = page.len();
            after = page.last().map(|user| user.id.clone());
            users.extend(page.into_iter().map(ChatUser::from));

            if page_len < REACTION_PAGE_SIZE {
                return Ok(users);
            }
        }
    }

    async fn add_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), ChatError> {
        let url = self.endpoint(&[
            "channels",
            &channel_id.0,
            "messages",
            &message_id.0,
            "reactions",
            emoji_path(emoji),
            "@me",
        ])?;
        let target = Target { channel_id, message_id: Some(message_id) };
        self.execute(self.request(Method::PUT, url), &target).await?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        channel_id: &ChannelId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let mut url = self.endpoint(&["channels", &channel_id.0, "messages"])?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.clamp(1, MESSAGE_PAGE_MAX).to_string());
        let target = Target { channel_id, message_id: None };
        let messages: Vec<WireMessage> =
            self.execute_json(self.request(Method::GET, url), &target).await?;
        Ok(messages.into_iter().map(ChatMessage::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use reqwest::StatusCode;
    use secrecy::SecretString;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use tallybot_core::domain::poll::{ChannelId, MessageId};

    use super::{classify_failure, emoji_path, rate_limit_wait, DiscordRestClient, Target, WireMessage};
    use crate::platform::{ChatError, ChatMessage, ChatPlatform};

    const MESSAGE_JSON: &str = r#"{"id":"2","channel_id":"1","author":{"id":"9","bot":true},"content":"poll","timestamp":"2026-10-16T09:00:00+00:00","reactions":[]}"#;

    fn http_response(status_line: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn rate_limited(retry_after: &str) -> String {
        http_response("429 Too Many Requests", &format!(r#"{{"message":"You are being rate limited.","retry_after":{retry_after},"global":false}}"#))
    }

    /// Serves the scripted responses in order, repeating the last one.
    async fn scripted_api(responses: Vec<String>) -> (DiscordRestClient, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let mut buffer = vec![0_u8; 8192];
                let mut read = 0;
                while read < buffer.len() {
                    let n = socket.read(&mut buffer[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                    if buffer[..read].windows(4).any(|window| window == b"\r\n\r\n") {
                        break;
                    }
                }
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let response = &responses[index.min(responses.len() - 1)];
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        let client = DiscordRestClient::new(
            &format!("http://{address}/api/v10"),
            SecretString::from("token".to_owned()),
            Duration::from_secs(5),
        )
        .expect("client");
        (client, hits)
    }

    fn poll_message() -> (ChannelId, MessageId) {
        (ChannelId("1".to_owned()), MessageId("2".to_owned()))
    }

    #[tokio::test]
    async fn short_rate_limit_is_waited_out_and_retried() {
        let (client, hits) =
            scripted_api(vec![rate_limited("0.01"), http_response("200 OK", MESSAGE_JSON)]).await;
        let (channel, message) = poll_message();

        let fetched = client.fetch_message(&channel, &message).await.expect("fetch after retry");

        assert_eq!(fetched.id, message);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_rate_limit_surfaces_as_transient_error() {
        let (client, hits) = scripted_api(vec![rate_limited("0.01")]).await;
        let (channel, message) = poll_message();

        let error = client.fetch_message(&channel, &message).await.expect_err("still limited");

        assert!(error.is_transient(), "unexpected error: {error:?}");
        assert!(!error.is_gone());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn long_rate_limit_is_not_waited_inline() {
        let (client, hits) = scripted_api(vec![rate_limited("60")]).await;
        let (channel, message) = poll_message();

        let error = client.edit_message(&channel, &message, "tally").await.expect_err("limited");

        assert_eq!(error, ChatError::RateLimited { retry_after: Duration::from_secs(60) });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rate_limit_wait_prefers_body_then_header() {
        assert_eq!(rate_limit_wait(None, r#"{"retry_after":0.5}"#), Duration::from_millis(500));
        assert_eq!(rate_limit_wait(Some(Duration::from_secs(3)), "busy"), Duration::from_secs(3));
        assert_eq!(rate_limit_wait(None, r#"{"retry_after":-1}"#), Duration::from_secs(1));
    }

    fn client() -> DiscordRestClient {
        DiscordRestClient::new(
            "https://discord.com/api/v10",
            SecretString::from("token".to_owned()),
            Duration::from_secs(5),
        )
        .expect("client")
    }

    #[test]
    fn endpoint_appends_encoded_segments_to_base_path() {
        let url = client()
            .endpoint(&["channels", "1", "messages", "2", "reactions", "🇦", "@me"])
            .expect("endpoint");

        assert_eq!(
            url.as_str(),
            "https://discord.com/api/v10/channels/1/messages/2/reactions/%F0%9F%87%A6/@me"
        );
    }

    #[test]
    fn interaction_webhook_endpoints_keep_the_token_segment() {
        let url = client()
            .endpoint(&["webhooks", "42", "tok.en-_x", "messages", "@original"])
            .expect("endpoint");

        assert_eq!(url.as_str(), "https://discord.com/api/v10/webhooks/42/tok.en-_x/messages/@original");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let result = DiscordRestClient::new(
            "not a url",
            SecretString::from("token".to_owned()),
            Duration::from_secs(5),
        );
        assert!(matches!(result, Err(ChatError::Request(_))));
    }

    #[test]
    fn failures_map_to_lifecycle_errors() {
        let channel = ChannelId("C".to_owned());
        let message = MessageId("M".to_owned());
        let with_message = Target { channel_id: &channel, message_id: Some(&message) };
        let channel_only = Target { channel_id: &channel, message_id: None };

        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, Some(10_008), "", &with_message),
            ChatError::MessageNotFound { .. }
        ));
        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, Some(10_003), "", &with_message),
            ChatError::ChannelUnavailable(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::FORBIDDEN, None, "", &with_message),
            ChatError::ChannelUnavailable(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::NOT_FOUND, None, "", &channel_only),
            ChatError::ChannelUnavailable(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::INTERNAL_SERVER_ERROR, None, "boom", &with_message),
            ChatError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn custom_emoji_markup_is_reduced_to_path_form() {
        assert_eq!(emoji_path("🔥"), "🔥");
        assert_eq!(emoji_path("<:party:123>"), "party:123");
        assert_eq!(emoji_path("<a:dance:77>"), "dance:77");
        assert_eq!(emoji_path("angry:12"), "angry:12");
    }

    #[test]
    fn wire_message_decodes_reactions_and_bot_author() {
        let raw = r#"{
            "id": "42",
            "channel_id": "7",
            "author": { "id": "99", "username": "tally", "bot": true },
            "content": "hello",
            "timestamp": "2026-10-16T09:00:00.000000+00:00",
            "reactions": [
                { "count": 3, "me": false, "emoji": { "id": null, "name": "👍" } },
                { "count": 1, "me": true, "emoji": { "id": "555", "name": "party" } }
            ]
        }"#;

        let wire: WireMessage = serde_json::from_str(raw).expect("decode");
        let message = ChatMessage::from(wire);

        assert!(message.author.bot);
        assert_eq!(message.reaction_counts(), vec![("👍".to_owned(), 3), ("party:555".to_owned(), 1)]);
    }
}
