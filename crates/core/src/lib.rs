//! Tallybot core - poll domain model, rendering, ranking, and configuration.
//!
//! Everything in this crate is free of I/O except configuration loading:
//! - **Domain** (`domain::poll`) - `PollRecord`, options, ids, status lifecycle
//! - **Rendering** (`render`) - vote counts to the text shown in chat
//! - **Ranking** (`ranking`) - choosing poll options from recent messages
//! - **Config** (`config`) - layered TOML/env configuration
//! - **Errors** (`errors`) - domain, application, and interface error taxonomy

pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod ranking;
pub mod render;

pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::poll::{
    ChannelId, MessageId, PollId, PollOption, PollRecord, PollStatus, VoteSnapshot,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use ranking::{Candidate, RankedCandidate, RankingPolicy};
pub use render::{render, RenderLimits, RenderMode};
