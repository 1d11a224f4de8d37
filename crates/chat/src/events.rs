use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::commands::{
    CommandReply, CommandRouteError, CommandRouter, NoopPollCommandService, PollCommandService,
    SlashCommandPayload,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatEnvelope {
    pub envelope_id: String,
    pub event: ChatEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChatEvent {
    SlashCommand(SlashCommandPayload),
    Unsupported { event_type: String },
}

impl ChatEvent {
    pub fn event_type(&self) -> ChatEventType {
        match self {
            Self::SlashCommand(_) => ChatEventType::SlashCommand,
            Self::Unsupported { .. } => ChatEventType::Unsupported,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChatEventType {
    SlashCommand,
    Unsupported,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Responded(CommandReply),
    Processed,
    Ignored,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventHandlerError {
    #[error(transparent)]
    Route(#[from] CommandRouteError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Handler(#[from] EventHandlerError),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> ChatEventType;
    async fn handle(
        &self,
        envelope: &ChatEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<ChatEventType, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(handler.event_type(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        envelope: &ChatEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, DispatchError> {
        let Some(handler) = self.handlers.get(&envelope.event.event_type()) else {
            return Ok(HandlerResult::Ignored);
        };

        handler.handle(envelope, ctx).await.map_err(DispatchError::from)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// Dispatcher wired to a real command service.
pub fn dispatcher_for<S>(service: S) -> EventDispatcher
where
    S: PollCommandService + 'static,
{
    let mut dispatcher = EventDispatcher::new();
    dispatcher.register(SlashCommandHandler::new(service));
    dispatcher
}

pub fn default_dispatcher() -> EventDispatcher {
    dispatcher_for(NoopPollCommandService)
}

pub struct SlashCommandHandler<S> {
    router: CommandRouter<S>,
}

impl<S> SlashCommandHandler<S>
where
    S: PollCommandService,
{
    pub fn new(service: S) -> Self {
        Self { router: CommandRouter::new(service) }
    }
}

#[async_trait]
impl<S> EventHandler for SlashCommandHandler<S>
where
    S: PollCommandService + 'static,
{
    fn event_type(&self) -> ChatEventType {
        ChatEventType::SlashCommand
    }

    async fn handle(
        &self,
        envelope: &ChatEnvelope,
        _ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let ChatEvent::SlashCommand(payload) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        let reply = self.router.route(payload).await?;
        Ok(HandlerResult::Responded(reply))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;

    use tallybot_core::domain::poll::ChannelId;

    use super::{
        default_dispatcher, dispatcher_for, ChatEnvelope, ChatEvent, DispatchError,
        EventContext, EventDispatcher, EventHandlerError, HandlerResult,
    };
    use crate::commands::{
        CommandContext, CommandReply, CommandRouteError, PollCommandService, SlashCommandPayload,
    };

    fn slash(command: &str) -> ChatEnvelope {
        ChatEnvelope {
            envelope_id: "env-1".to_owned(),
            event: ChatEvent::SlashCommand(SlashCommandPayload {
                command: command.to_owned(),
                options: BTreeMap::new(),
                channel_id: "100".to_owned(),
                guild_id: None,
                user_id: "U1".to_owned(),
                request_id: "req-1".to_owned(),
            }),
        }
    }

    #[tokio::test]
    async fn default_dispatcher_registers_slash_commands() {
        let dispatcher = default_dispatcher();
        assert_eq!(dispatcher.handler_count(), 1);

        let result =
            dispatcher.dispatch(&slash("/poll-help"), &EventContext::default()).await.expect("dispatch");
        assert!(matches!(result, HandlerResult::Responded(reply) if reply.ephemeral));
    }

    #[tokio::test]
    async fn unregistered_event_types_are_ignored() {
        let dispatcher = EventDispatcher::new();
        let envelope = ChatEnvelope {
            envelope_id: "env-2".to_owned(),
            event: ChatEvent::Unsupported { event_type: "MESSAGE_CREATE".to_owned() },
        };

        let result = dispatcher.dispatch(&envelope, &EventContext::default()).await.expect("dispatch");
        assert_eq!(result, HandlerResult::Ignored);
    }

    struct FailingService;

    #[async_trait]
    impl PollCommandService for FailingService {
        async fn create_from_likes(
            &self,
            _count: Option<usize>,
            _source_channel: ChannelId,
            _context: &CommandContext,
        ) -> Result<CommandReply, CommandRouteError> {
            Err(CommandRouteError::Service("store offline".to_owned()))
        }

        async fn poll_results(
            &self,
            _context: &CommandContext,
        ) -> Result<CommandReply, CommandRouteError> {
            Err(CommandRouteError::Service("store offline".to_owned()))
        }
    }

    #[tokio::test]
    async fn service_failures_surface_as_dispatch_errors() {
        let dispatcher = dispatcher_for(FailingService);

        let error = dispatcher
            .dispatch(&slash("/poll-results"), &EventContext::default())
            .await
            .expect_err("service failure");
        assert_eq!(
            error,
            DispatchError::Handler(EventHandlerError::Route(CommandRouteError::Service(
                "store offline".to_owned()
            )))
        );
    }
}
