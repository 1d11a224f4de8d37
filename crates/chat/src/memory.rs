//! In-process chat platform used by tests and local dry runs.
//!
//! Messages, reactors, and failures are all scriptable. Every call is
//! recorded so tests can assert on what the poll lifecycle actually did.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use tallybot_core::domain::poll::{ChannelId, MessageId};

use crate::platform::{
    ChatError, ChatMessage, ChatPlatform, ChatUser, ReactionSummary, DEFAULT_MESSAGE_CHAR_LIMIT,
};

pub const DEFAULT_BOT_USER_ID: &str = "tallybot";

pub struct InMemoryChatPlatform {
    bot_user: ChatUser,
    message_char_limit: usize,
    state: Mutex<PlatformState>,
}

#[derive(Default)]
struct PlatformState {
    next_id: u64,
    channels: HashMap<ChannelId, Vec<ChatMessage>>,
    reactors: HashMap<(MessageId, String), Vec<ChatUser>>,
    unavailable: HashSet<ChannelId>,
    fail_edits: Option<ChatError>,
    fail_reaction_reads: Option<ChatError>,
    reaction_read_delay: Option<Duration>,
    edits: Vec<(MessageId, String)>,
    reaction_reads: usize,
}

impl Default for InMemoryChatPlatform {
    fn default() -> Self {
        Self::new(ChatUser::bot(DEFAULT_BOT_USER_ID))
    }
}

impl InMemoryChatPlatform {
    pub fn new(bot_user: ChatUser) -> Self {
        Self {
            bot_user,
            message_char_limit: DEFAULT_MESSAGE_CHAR_LIMIT,
            state: Mutex::new(PlatformState { next_id: 1_000, ..PlatformState::default() }),
        }
    }

    pub fn with_message_char_limit(mut self, limit: usize) -> Self {
        self.message_char_limit = limit;
        self
    }

    pub fn bot_user(&self) -> &ChatUser {
        &self.bot_user
    }

    fn state(&self) -> MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_channel(&self, channel_id: &ChannelId) {
        self.state().channels.entry(channel_id.clone()).or_default();
    }

    /// Appends a message authored by someone else. Reaction summaries on the
    /// message are kept as given.
    pub fn seed_message(&self, message: ChatMessage) {
        self.state().channels.entry(message.channel_id.clone()).or_default().push(message);
    }

    /// Replaces the reactors of `emoji` on a message and refreshes its summary.
    pub fn set_reactors(&self, message_id: &MessageId, emoji: &str, users: Vec<ChatUser>) {
        let mut state = self.state();
        let count = users.len() as u32;
        state.reactors.insert((message_id.clone(), emoji.to_owned()), users);
        if let Some(message) = find_message_mut(&mut state.channels, message_id) {
            upsert_summary(&mut message.reactions, emoji, count);
        }
    }

    pub fn delete_message(&self, channel_id: &ChannelId, message_id: &MessageId) {
        if let Some(messages) = self.state().channels.get_mut(channel_id) {
            messages.retain(|message| &message.id != message_id);
        }
    }

    pub fn set_channel_unavailable(&self, channel_id: &ChannelId, unavailable: bool) {
        let mut state = self.state();
        if unavailable {
            state.unavailable.insert(channel_id.clone());
        } else {
            state.unavailable.remove(channel_id);
        }
    }

    pub fn fail_edits_with(&self, error: Option<ChatError>) {
        self.state().fail_edits = error;
    }

    pub fn fail_reaction_reads_with(&self, error: Option<ChatError>) {
        self.state().fail_reaction_reads = error;
    }

    /// Makes every `reaction_users` call sleep first.
    pub fn set_reaction_read_delay(&self, delay: Option<Duration>) {
        self.state().reaction_read_delay = delay;
    }

    pub fn message(&self, message_id: &MessageId) -> Option<ChatMessage> {
        let state = self.state();
        state
            .channels
            .values()
            .flat_map(|messages| messages.iter())
            .find(|message| &message.id == message_id)
            .cloned()
    }

    pub fn messages_in(&self, channel_id: &ChannelId) -> Vec<ChatMessage> {
        self.state().channels.get(channel_id).cloned().unwrap_or_default()
    }

    /// Every successful edit applied to `message_id`, oldest first.
    pub fn edits_of(&self, message_id: &MessageId) -> Vec<String> {
        self.state()
            .edits
            .iter()
            .filter(|(id, _)| id == message_id)
            .map(|(_, content)| content.clone())
            .collect()
    }

    pub fn reactors_of(&self, message_id: &MessageId, emoji: &str) -> Vec<ChatUser> {
        self.state().reactors.get(&(message_id.clone(), emoji.to_owned())).cloned().unwrap_or_default()
    }

    pub fn reaction_read_count(&self) -> usize {
        self.state().reaction_reads
    }

    fn check_channel(state: &PlatformState, channel_id: &ChannelId) -> Result<(), ChatError> {
        if state.unavailable.contains(channel_id) || !state.channels.contains_key(channel_id) {
            return Err(ChatError::ChannelUnavailable(channel_id.clone()));
        }
        Ok(())
    }

    fn locate<'a>(
        state: &'a mut PlatformState,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<&'a mut ChatMessage, ChatError> {
        Self::check_channel(state, channel_id)?;
        state
            .channels
            .get_mut(channel_id)
            .and_then(|messages| messages.iter_mut().find(|message| &message.id == message_id))
            .ok_or_else(|| ChatError::MessageNotFound {
                channel_id: channel_id.clone(),
                message_id: message_id.clone(),
            })
    }
}

fn find_message_mut<'a>(
    channels: &'a mut HashMap<ChannelId, Vec<ChatMessage>>,
    message_id: &MessageId,
) -> Option<&'a mut ChatMessage> {
    channels.values_mut().flat_map(|messages| messages.iter_mut()).find(|m| &m.id == message_id)
}

fn upsert_summary(reactions: &mut Vec<ReactionSummary>, emoji: &str, count: u32) {
    match reactions.iter_mut().find(|reaction| reaction.emoji == emoji) {
        Some(existing) => existing.count = count,
        None => reactions.push(ReactionSummary { emoji: emoji.to_owned(), count }),
    }
    reactions.retain(|reaction| reaction.count > 0);
}

#[async_trait]
impl ChatPlatform for InMemoryChatPlatform {
    fn message_char_limit(&self) -> usize {
        self.message_char_limit
    }

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        content: &str,
    ) -> Result<ChatMessage, ChatError> {
        let mut state = self.state();
        Self::check_channel(&state, channel_id)?;
        if content.chars().count() > self.message_char_limit {
            return Err(ChatError::Api {
                status: 400,
                detail: format!("content exceeds {} characters", self.message_char_limit),
            });
        }

        state.next_id += 1;
        let message = ChatMessage {
            id: MessageId(state.next_id.to_string()),
            channel_id: channel_id.clone(),
            author: self.bot_user.clone(),
            content: content.to_owned(),
            created_at: Utc::now(),
            reactions: Vec::new(),
        };
        state.channels.entry(channel_id.clone()).or_default().push(message.clone());
        Ok(message)
    }

    async fn edit_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<(), ChatError> {
        let mut state = self.state();
        if let Some(error) = state.fail_edits.clone() {
            return Err(error);
        }
        if content.chars().count() > self.message_char_limit {
            return Err(ChatError::Api {
                status: 400,
                detail: format!("content exceeds {} characters", self.message_char_limit),
            });
        }

        let message = Self::locate(&mut state, channel_id, message_id)?;
        message.content = content.to_owned();
        state.edits.push((message_id.clone(), content.to_owned()));
        Ok(())
    }

    async fn fetch_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<ChatMessage, ChatError> {
        let mut state = self.state();
        Self::locate(&mut state, channel_id, message_id).map(|message| message.clone())
    }

    async fn reaction_users(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<Vec<ChatUser>, ChatError> {
        let delay = self.state().reaction_read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.reaction_reads += 1;
        if let Some(error) = state.fail_reaction_reads.clone() {
            return Err(error);
        }
        Self::locate(&mut state, channel_id, message_id)?;
        Ok(state.reactors.get(&(message_id.clone(), emoji.to_owned())).cloned().unwrap_or_default())
    }

    async fn add_reaction(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
        emoji: &str,
    ) -> Result<(), ChatError> {
        let mut state = self.state();
        Self::locate(&mut state, channel_id, message_id)?;

        let key = (message_id.clone(), emoji.to_owned());
        let users = state.reactors.entry(key).or_default();
        if !users.iter().any(|user| user.id == self.bot_user.id) {
            users.push(self.bot_user.clone());
        }
        let count = users.len() as u32;
        let message = Self::locate(&mut state, channel_id, message_id)?;
        upsert_summary(&mut message.reactions, emoji, count);
        Ok(())
    }

    async fn recent_messages(
        &self,
        channel_id: &ChannelId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let state = self.state();
        Self::check_channel(&state, channel_id)?;
        Ok(state
            .channels
            .get(channel_id)
            .map(|messages| messages.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
