use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Platform message id of the poll message. Doubles as the poll's primary key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PollId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl PollId {
    pub fn message_id(&self) -> MessageId {
        MessageId(self.0.clone())
    }
}

impl From<MessageId> for PollId {
    fn from(value: MessageId) -> Self {
        Self(value.0)
    }
}

impl fmt::Display for PollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Active,
    Finalized,
}

impl PollStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Finalized => "finalized",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub emoji: String,
    pub label: String,
    pub source_ref: String,
    pub votes: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSnapshot {
    pub timestamp: DateTime<Utc>,
    pub votes: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollRecord {
    pub id: PollId,
    pub channel_id: ChannelId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub options: Vec<PollOption>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<VoteSnapshot>,
    pub status: PollStatus,
}

impl PollRecord {
    pub fn new(
        id: PollId,
        channel_id: ChannelId,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        options: Vec<PollOption>,
    ) -> Result<Self, DomainError> {
        let record = Self {
            id,
            channel_id,
            created_at,
            expires_at,
            options,
            history: Vec::new(),
            status: PollStatus::Active,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.expires_at <= self.created_at {
            return Err(DomainError::InvariantViolation(format!(
                "poll {} expires at or before its creation time",
                self.id
            )));
        }
        if self.options.is_empty() {
            return Err(DomainError::InvariantViolation(format!(
                "poll {} has no options",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for option in &self.options {
            if !seen.insert(option.emoji.as_str()) {
                return Err(DomainError::InvariantViolation(format!(
                    "poll {} reuses emoji `{}`",
                    self.id, option.emoji
                )));
            }
        }

        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == PollStatus::Active
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn vote_counts(&self) -> Vec<u32> {
        self.options.iter().map(|option| option.votes).collect()
    }

    /// Overwrites every option's votes with freshly observed counts.
    ///
    /// Returns whether any count changed. A snapshot is appended to `history`
    /// only on change, keeping at most `history_limit` entries.
    pub fn apply_counts(
        &mut self,
        counts: &[u32],
        observed_at: DateTime<Utc>,
        history_limit: usize,
    ) -> Result<bool, DomainError> {
        if !self.is_active() {
            return Err(DomainError::FrozenPoll(self.id.clone()));
        }
        if counts.len() != self.options.len() {
            return Err(DomainError::InvariantViolation(format!(
                "poll {} has {} options but {} counts were observed",
                self.id,
                self.options.len(),
                counts.len()
            )));
        }

        let changed = self.vote_counts() != counts;
        if !changed {
            return Ok(false);
        }

        for (option, count) in self.options.iter_mut().zip(counts) {
            option.votes = *count;
        }

        if history_limit > 0 {
            self.history.push(VoteSnapshot { timestamp: observed_at, votes: counts.to_vec() });
            let overflow = self.history.len().saturating_sub(history_limit);
            if overflow > 0 {
                self.history.drain(..overflow);
            }
        }

        Ok(true)
    }

    pub fn finalize(&mut self) -> Result<(), DomainError> {
        if self.status != PollStatus::Active {
            return Err(DomainError::InvalidPollTransition {
                from: self.status,
                to: PollStatus::Finalized,
            });
        }
        self.status = PollStatus::Finalized;
        Ok(())
    }
}
