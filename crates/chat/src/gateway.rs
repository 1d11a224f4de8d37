use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::commands::CommandReply;
use crate::events::{ChatEnvelope, ChatEvent, EventContext, EventDispatcher, HandlerResult};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport reply failed: {0}")]
    Respond(String),
}

/// Source of inbound interactions. The stream ends when `next_envelope`
/// yields `None`; `respond` delivers the final reply for an envelope.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    async fn next_envelope(&self) -> Option<ChatEnvelope>;
    async fn respond(&self, envelope_id: &str, reply: &CommandReply) -> Result<(), TransportError>;
}

/// Used when slash commands are not configured: the stream is empty.
#[derive(Default)]
pub struct NoopGatewayTransport;

#[async_trait]
impl GatewayTransport for NoopGatewayTransport {
    async fn next_envelope(&self) -> Option<ChatEnvelope> {
        None
    }

    async fn respond(&self, _envelope_id: &str, _reply: &CommandReply) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct GatewayRunner {
    transport: Arc<dyn GatewayTransport>,
    dispatcher: EventDispatcher,
}

impl GatewayRunner {
    pub fn new(transport: Arc<dyn GatewayTransport>, dispatcher: EventDispatcher) -> Self {
        Self { transport, dispatcher }
    }

    /// Pumps envelopes through the dispatcher until the transport closes.
    /// Handler and reply failures are logged; they never stop the pump.
    pub async fn run(&self) {
        while let Some(envelope) = self.transport.next_envelope().await {
            self.handle(envelope).await;
        }
        info!(
            event_name = "ingress.chat.stream_closed",
            correlation_id = "gateway",
            "gateway transport stream closed"
        );
    }

    async fn handle(&self, envelope: ChatEnvelope) {
        let (command, channel_id) = correlation_fields(&envelope);

        info!(
            event_name = "ingress.chat.envelope_received",
            envelope_id = %envelope.envelope_id,
            event_type = ?envelope.event.event_type(),
            correlation_id = %envelope.envelope_id,
            command = command.unwrap_or("none"),
            channel_id = channel_id.unwrap_or("unknown"),
            "received chat envelope"
        );

        let context = EventContext { correlation_id: envelope.envelope_id.clone() };
        let reply = match self.dispatcher.dispatch(&envelope, &context).await {
            Ok(HandlerResult::Responded(reply)) => reply,
            Ok(HandlerResult::Processed | HandlerResult::Ignored) => return,
            Err(error) => {
                warn!(
                    envelope_id = %envelope.envelope_id,
                    correlation_id = %envelope.envelope_id,
                    command = command.unwrap_or("none"),
                    channel_id = channel_id.unwrap_or("unknown"),
                    error = %error,
                    "event dispatch failed; continuing gateway loop"
                );
                CommandReply::ephemeral(format!(
                    "Something went wrong handling that command. (ref: {})",
                    envelope.envelope_id
                ))
            }
        };

        if let Err(error) = self.transport.respond(&envelope.envelope_id, &reply).await {
            warn!(
                event_name = "ingress.chat.reply_sent",
                envelope_id = %envelope.envelope_id,
                correlation_id = %envelope.envelope_id,
                error = %error,
                "failed to deliver command reply"
            );
        }
    }
}

fn correlation_fields(envelope: &ChatEnvelope) -> (Option<&str>, Option<&str>) {
    match &envelope.event {
        ChatEvent::SlashCommand(payload) => {
            (Some(payload.command.as_str()), Some(payload.channel_id.as_str()))
        }
        ChatEvent::Unsupported { .. } => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Arc;

    use super::{GatewayRunner, GatewayTransport, TransportError};
    use crate::commands::{CommandReply, SlashCommandPayload};
    use crate::events::{default_dispatcher, ChatEnvelope, ChatEvent, EventDispatcher};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct ScriptedTransport {
        state: Mutex<ScriptedState>,
    }

    #[derive(Default)]
    struct ScriptedState {
        envelopes: VecDeque<ChatEnvelope>,
        reads: usize,
        fail_replies: bool,
        replies: Vec<(String, CommandReply)>,
    }

    impl ScriptedTransport {
        fn with_envelopes(envelopes: Vec<ChatEnvelope>) -> Self {
            Self {
                state: Mutex::new(ScriptedState {
                    envelopes: envelopes.into(),
                    ..ScriptedState::default()
                }),
            }
        }

        fn failing_replies(mut self) -> Self {
            self.state.get_mut().fail_replies = true;
            self
        }

        async fn reads(&self) -> usize {
            self.state.lock().await.reads
        }

        async fn replies(&self) -> Vec<(String, CommandReply)> {
            self.state.lock().await.replies.clone()
        }
    }

    #[async_trait]
    impl GatewayTransport for ScriptedTransport {
        async fn next_envelope(&self) -> Option<ChatEnvelope> {
            let mut state = self.state.lock().await;
            state.reads += 1;
            state.envelopes.pop_front()
        }

        async fn respond(
            &self,
            envelope_id: &str,
            reply: &CommandReply,
        ) -> Result<(), TransportError> {
            let mut state = self.state.lock().await;
            state.replies.push((envelope_id.to_owned(), reply.clone()));
            if state.fail_replies {
                return Err(TransportError::Respond("interaction token expired".to_owned()));
            }
            Ok(())
        }
    }

    fn slash(envelope_id: &str, command: &str) -> ChatEnvelope {
        ChatEnvelope {
            envelope_id: envelope_id.to_owned(),
            event: ChatEvent::SlashCommand(SlashCommandPayload {
                command: command.to_owned(),
                options: BTreeMap::new(),
                channel_id: "100".to_owned(),
                guild_id: None,
                user_id: "U1".to_owned(),
                request_id: format!("req-{envelope_id}"),
            }),
        }
    }

    #[tokio::test]
    async fn run_returns_once_the_stream_closes() {
        let transport = Arc::new(ScriptedTransport::with_envelopes(vec![ChatEnvelope {
            envelope_id: "env-1".to_owned(),
            event: ChatEvent::Unsupported { event_type: "test".to_owned() },
        }]));

        GatewayRunner::new(transport.clone(), EventDispatcher::default()).run().await;

        assert_eq!(transport.reads().await, 2);
        assert!(transport.replies().await.is_empty());
    }

    #[tokio::test]
    async fn command_replies_are_delivered_through_transport() {
        let transport =
            Arc::new(ScriptedTransport::with_envelopes(vec![slash("env-help", "/poll-help")]));

        GatewayRunner::new(transport.clone(), default_dispatcher()).run().await;

        let replies = transport.replies().await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, "env-help");
        assert!(replies[0].1.content.contains("/poll-results"));
    }

    #[tokio::test]
    async fn failed_replies_do_not_stop_the_pump() {
        let transport = Arc::new(
            ScriptedTransport::with_envelopes(vec![
                slash("env-1", "/poll-help"),
                slash("env-2", "/poll-help"),
            ])
            .failing_replies(),
        );

        GatewayRunner::new(transport.clone(), default_dispatcher()).run().await;

        let replied: Vec<String> =
            transport.replies().await.into_iter().map(|(envelope_id, _)| envelope_id).collect();
        assert_eq!(replied, vec!["env-1", "env-2"]);
        assert_eq!(transport.reads().await, 3);
    }

    #[test]
    fn extracts_command_and_channel_correlation_fields() {
        let envelope = ChatEnvelope {
            envelope_id: "env-2".to_owned(),
            event: ChatEvent::SlashCommand(SlashCommandPayload {
                command: "/poll-results".to_owned(),
                options: BTreeMap::new(),
                channel_id: "C1".to_owned(),
                guild_id: None,
                user_id: "U1".to_owned(),
                request_id: "req-2".to_owned(),
            }),
        };

        let (command, channel_id) = super::correlation_fields(&envelope);
        assert_eq!(command, Some("/poll-results"));
        assert_eq!(channel_id, Some("C1"));
    }
}
