//! Chat integration - the platform seam for the poll bot
//!
//! This crate provides the chat-facing side of tallybot:
//! - **Platform** (`platform`) - `ChatPlatform` trait: send, edit, fetch, reactions
//! - **Discord** (`discord`) - REST v10 implementation of the platform
//! - **Memory** (`memory`) - scriptable in-process platform for tests
//! - **Commands** (`commands`) - `/poll-from-likes`, `/poll-results`, `/poll-help`
//! - **Events** (`events`) - envelope dispatch to command handlers
//! - **Gateway** (`gateway`) - pumps inbound interactions through the dispatcher
//! - **Interactions** (`interactions`) - signed HTTP interactions queued for the gateway
//!
//! # Architecture
//!
//! ```text
//! Gateway → EventDispatcher → CommandRouter → PollCommandService
//!                                                   ↓
//!                         ChatPlatform ← poll lifecycle
//! ```

pub mod commands;
pub mod discord;
pub mod events;
pub mod gateway;
pub mod interactions;
pub mod memory;
pub mod platform;

pub use discord::DiscordRestClient;
pub use memory::InMemoryChatPlatform;
pub use platform::{jump_link, ChatError, ChatMessage, ChatPlatform, ChatUser, ReactionSummary};
