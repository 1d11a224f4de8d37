//! Inbound Discord interactions received over HTTP.
//!
//! The HTTP endpoint verifies and decodes each interaction, answers Discord
//! right away with a deferral, and queues the command. [`InteractionTransport`]
//! drains that queue for the gateway runner and delivers the final reply
//! through the interaction webhook.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::commands::{CommandReply, SlashCommandPayload};
use crate::discord::{DiscordRestClient, EPHEMERAL_FLAG};
use crate::events::{ChatEnvelope, ChatEvent};
use crate::gateway::{GatewayTransport, TransportError};
use crate::platform::ChatError;

pub const SIGNATURE_HEADER: &str = "x-signature-ed25519";
pub const TIMESTAMP_HEADER: &str = "x-signature-timestamp";

const PING: u8 = 1;
const APPLICATION_COMMAND: u8 = 2;

const PONG: u8 = 1;
const CHANNEL_MESSAGE: u8 = 4;
const DEFERRED_CHANNEL_MESSAGE: u8 = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InteractionError {
    #[error("interaction public key is not a valid ed25519 key")]
    InvalidPublicKey,
    #[error("interaction signature is invalid")]
    InvalidSignature,
    #[error("interaction payload could not be decoded: {0}")]
    Decode(String),
    #[error("interaction queue is closed")]
    QueueClosed,
}

pub struct InteractionVerifier {
    key: VerifyingKey,
}

impl InteractionVerifier {
    /// Builds a verifier from the application's hex-encoded public key.
    pub fn from_hex(public_key: &str) -> Result<Self, InteractionError> {
        let bytes = hex_decode(public_key.trim()).ok_or(InteractionError::InvalidPublicKey)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| InteractionError::InvalidPublicKey)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| InteractionError::InvalidPublicKey)?;
        Ok(Self { key })
    }

    /// Discord signs `timestamp || body`.
    pub fn verify(
        &self,
        signature_hex: &str,
        timestamp: &str,
        body: &[u8],
    ) -> Result<(), InteractionError> {
        let signature_bytes =
            hex_decode(signature_hex.trim()).ok_or(InteractionError::InvalidSignature)?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| InteractionError::InvalidSignature)?;

        let mut message = Vec::with_capacity(timestamp.len() + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(body);
        self.key.verify(&message, &signature).map_err(|_| InteractionError::InvalidSignature)
    }
}

fn hex_decode(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|index| input.get(index..index + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// A slash command waiting for its deferred reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingCommand {
    pub interaction_id: String,
    pub token: String,
    pub payload: SlashCommandPayload,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Ping,
    Command(PendingCommand),
    Unsupported { kind: u8 },
}

impl Inbound {
    /// The immediate HTTP body Discord expects for this interaction.
    pub fn immediate_response(&self) -> Value {
        match self {
            Self::Ping => json!({ "type": PONG }),
            Self::Command(_) => json!({ "type": DEFERRED_CHANNEL_MESSAGE }),
            Self::Unsupported { .. } => json!({
                "type": CHANNEL_MESSAGE,
                "data": { "content": "This interaction is not supported.", "flags": EPHEMERAL_FLAG },
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireInteraction {
    id: String,
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    token: String,
    channel_id: Option<String>,
    guild_id: Option<String>,
    data: Option<WireCommandData>,
    member: Option<WireMember>,
    user: Option<WireInteractionUser>,
}

#[derive(Debug, Deserialize)]
struct WireCommandData {
    name: String,
    #[serde(default)]
    options: Vec<WireCommandOption>,
}

#[derive(Debug, Deserialize)]
struct WireCommandOption {
    name: String,
    value: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    user: WireInteractionUser,
}

#[derive(Debug, Deserialize)]
struct WireInteractionUser {
    id: String,
}

pub fn parse_interaction(body: &[u8]) -> Result<Inbound, InteractionError> {
    let interaction: WireInteraction =
        serde_json::from_slice(body).map_err(|error| InteractionError::Decode(error.to_string()))?;

    match interaction.kind {
        PING => Ok(Inbound::Ping),
        APPLICATION_COMMAND => {
            let data = interaction
                .data
                .ok_or_else(|| InteractionError::Decode("command interaction without data".to_owned()))?;
            let channel_id = interaction.channel_id.ok_or_else(|| {
                InteractionError::Decode("command interaction without channel".to_owned())
            })?;
            let user_id = interaction
                .member
                .map(|member| member.user.id)
                .or_else(|| interaction.user.map(|user| user.id))
                .unwrap_or_default();

            let options: BTreeMap<String, String> = data
                .options
                .into_iter()
                .filter_map(|option| option.value.map(|value| (option.name, option_text(value))))
                .collect();

            Ok(Inbound::Command(PendingCommand {
                payload: SlashCommandPayload {
                    command: format!("/{}", data.name),
                    options,
                    channel_id,
                    guild_id: interaction.guild_id,
                    user_id,
                    request_id: interaction.id.clone(),
                },
                interaction_id: interaction.id,
                token: interaction.token,
            }))
        }
        kind => Ok(Inbound::Unsupported { kind }),
    }
}

fn option_text(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

/// Delivers the final reply of a deferred interaction.
#[async_trait]
pub trait InteractionResponder: Send + Sync {
    async fn deliver(&self, token: &str, reply: &CommandReply) -> Result<(), ChatError>;
}

pub struct DiscordInteractionResponder {
    client: Arc<DiscordRestClient>,
    application_id: String,
}

impl DiscordInteractionResponder {
    pub fn new(client: Arc<DiscordRestClient>, application_id: impl Into<String>) -> Self {
        Self { client, application_id: application_id.into() }
    }
}

#[async_trait]
impl InteractionResponder for DiscordInteractionResponder {
    async fn deliver(&self, token: &str, reply: &CommandReply) -> Result<(), ChatError> {
        if !reply.ephemeral {
            return self.client.edit_original_response(&self.application_id, token, &reply.content).await;
        }
        // A deferral is public; swap it for a follow-up only the caller sees.
        self.client.delete_original_response(&self.application_id, token).await?;
        self.client.create_followup(&self.application_id, token, &reply.content, true).await
    }
}

type PendingTokens = Arc<Mutex<HashMap<String, String>>>;

fn tokens(pending: &PendingTokens) -> MutexGuard<'_, HashMap<String, String>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct InteractionSender {
    queue: mpsc::Sender<ChatEnvelope>,
    pending: PendingTokens,
}

impl InteractionSender {
    pub async fn submit(&self, command: PendingCommand) -> Result<(), InteractionError> {
        let envelope_id = command.interaction_id;
        tokens(&self.pending).insert(envelope_id.clone(), command.token);
        let envelope = ChatEnvelope {
            envelope_id: envelope_id.clone(),
            event: ChatEvent::SlashCommand(command.payload),
        };
        if self.queue.send(envelope).await.is_err() {
            tokens(&self.pending).remove(&envelope_id);
            return Err(InteractionError::QueueClosed);
        }
        Ok(())
    }
}

pub struct InteractionTransport {
    queue: tokio::sync::Mutex<mpsc::Receiver<ChatEnvelope>>,
    pending: PendingTokens,
    responder: Arc<dyn InteractionResponder>,
}

pub fn interaction_channel(
    capacity: usize,
    responder: Arc<dyn InteractionResponder>,
) -> (InteractionSender, InteractionTransport) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let pending = PendingTokens::default();
    (
        InteractionSender { queue: sender, pending: pending.clone() },
        InteractionTransport { queue: tokio::sync::Mutex::new(receiver), pending, responder },
    )
}

#[async_trait]
impl GatewayTransport for InteractionTransport {
    /// The HTTP response already deferred the interaction; only the final
    /// reply goes through here.
    async fn next_envelope(&self) -> Option<ChatEnvelope> {
        self.queue.lock().await.recv().await
    }

    async fn respond(&self, envelope_id: &str, reply: &CommandReply) -> Result<(), TransportError> {
        let token = tokens(&self.pending).remove(envelope_id).ok_or_else(|| {
            TransportError::Respond(format!("no pending interaction `{envelope_id}`"))
        })?;
        self.responder
            .deliver(&token, reply)
            .await
            .map_err(|error| TransportError::Respond(error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use ed25519_dalek::{Signer, SigningKey};
    use serde_json::json;

    use super::{
        hex_decode, interaction_channel, parse_interaction, Inbound, InteractionError,
        InteractionResponder, InteractionVerifier,
    };
    use crate::commands::CommandReply;
    use crate::events::ChatEvent;
    use crate::gateway::{GatewayTransport, TransportError};
    use crate::platform::ChatError;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|byte| format!("{byte:02x}")).collect()
    }

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7_u8; 32])
    }

    #[test]
    fn verifies_signature_over_timestamp_and_body() {
        let key = signing_key();
        let verifier =
            InteractionVerifier::from_hex(&hex(key.verifying_key().as_bytes())).expect("verifier");
        let body = br#"{"type":1}"#;
        let signature = key.sign(&[b"1700000000".as_slice(), body.as_slice()].concat());

        assert!(verifier.verify(&hex(&signature.to_bytes()), "1700000000", body).is_ok());
        assert_eq!(
            verifier.verify(&hex(&signature.to_bytes()), "1700000001", body),
            Err(InteractionError::InvalidSignature)
        );
        assert_eq!(
            verifier.verify("zz", "1700000000", body),
            Err(InteractionError::InvalidSignature)
        );
    }

    #[test]
    fn rejects_malformed_public_keys() {
        assert!(matches!(
            InteractionVerifier::from_hex("abcd"),
            Err(InteractionError::InvalidPublicKey)
        ));
        assert!(matches!(
            InteractionVerifier::from_hex("not hex at all"),
            Err(InteractionError::InvalidPublicKey)
        ));
        assert_eq!(hex_decode("0aFF"), Some(vec![0x0a, 0xff]));
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let inbound = parse_interaction(br#"{"id":"1","type":1,"token":"t"}"#).expect("parse");
        assert_eq!(inbound, Inbound::Ping);
        assert_eq!(inbound.immediate_response(), json!({ "type": 1 }));
    }

    #[test]
    fn application_command_becomes_slash_payload() {
        let body = json!({
            "id": "900",
            "type": 2,
            "token": "secret-token",
            "channel_id": "100",
            "guild_id": "1",
            "member": { "user": { "id": "U1" } },
            "data": {
                "name": "poll-from-likes",
                "options": [
                    { "name": "count", "type": 4, "value": 3 },
                    { "name": "channel", "type": 7, "value": "200" }
                ]
            }
        });

        let inbound = parse_interaction(body.to_string().as_bytes()).expect("parse");
        let Inbound::Command(command) = &inbound else {
            panic!("expected a command, got {inbound:?}");
        };

        assert_eq!(command.interaction_id, "900");
        assert_eq!(command.token, "secret-token");
        assert_eq!(command.payload.command, "/poll-from-likes");
        assert_eq!(command.payload.options.get("count").map(String::as_str), Some("3"));
        assert_eq!(command.payload.options.get("channel").map(String::as_str), Some("200"));
        assert_eq!(command.payload.user_id, "U1");
        assert_eq!(command.payload.guild_id.as_deref(), Some("1"));
        assert_eq!(inbound.immediate_response(), json!({ "type": 5 }));
    }

    #[test]
    fn component_interactions_are_unsupported() {
        let inbound = parse_interaction(br#"{"id":"1","type":3,"token":"t"}"#).expect("parse");
        assert_eq!(inbound, Inbound::Unsupported { kind: 3 });
        assert!(parse_interaction(b"{").is_err());
    }

    #[derive(Default)]
    struct RecordingResponder {
        delivered: Mutex<Vec<(String, CommandReply)>>,
    }

    #[async_trait]
    impl InteractionResponder for RecordingResponder {
        async fn deliver(&self, token: &str, reply: &CommandReply) -> Result<(), ChatError> {
            self.delivered.lock().expect("lock").push((token.to_owned(), reply.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn queued_commands_are_answered_through_their_token() {
        let responder = Arc::new(RecordingResponder::default());
        let (sender, transport) = interaction_channel(4, responder.clone());
        let body = json!({
            "id": "901",
            "type": 2,
            "token": "tok-901",
            "channel_id": "100",
            "user": { "id": "U2" },
            "data": { "name": "poll-results" }
        });
        let Inbound::Command(command) =
            parse_interaction(body.to_string().as_bytes()).expect("parse")
        else {
            panic!("expected a command");
        };

        sender.submit(command).await.expect("submit");
        let envelope = transport.next_envelope().await.expect("envelope");
        assert_eq!(envelope.envelope_id, "901");
        assert!(matches!(envelope.event, ChatEvent::SlashCommand(ref payload) if payload.command == "/poll-results"));

        transport.respond("901", &CommandReply::public("done")).await.expect("respond");
        let delivered = responder.delivered.lock().expect("lock").clone();
        assert_eq!(delivered, vec![("tok-901".to_owned(), CommandReply::public("done"))]);

        assert!(matches!(
            transport.respond("901", &CommandReply::public("again")).await,
            Err(TransportError::Respond(_))
        ));
    }

    #[tokio::test]
    async fn stream_ends_when_every_sender_is_dropped() {
        let (sender, transport) = interaction_channel(1, Arc::new(RecordingResponder::default()));
        drop(sender);
        assert_eq!(transport.next_envelope().await, None);
    }
}
