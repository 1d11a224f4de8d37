//! Picks the poll options out of recent channel history.
//!
//! Messages inside the source window are scored by a weighted sum of their
//! positive reactions and the top K are kept in rank order. Equal scores keep
//! their input order, so the same history always yields the same poll.

use chrono::{DateTime, Duration, Utc};

use crate::domain::poll::MessageId;

pub const EMPTY_CONTENT_PLACEHOLDER: &str = "[No text content]";

/// Regional indicator symbols, assigned to options in rank order.
pub const OPTION_EMOJI: [&str; 20] = [
    "🇦", "🇧", "🇨", "🇩", "🇪", "🇫", "🇬", "🇭", "🇮", "🇯", "🇰", "🇱", "🇲", "🇳", "🇴", "🇵", "🇶",
    "🇷", "🇸", "🇹",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactionWeight {
    pub emoji: String,
    pub weight: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankingPolicy {
    pub weights: Vec<ReactionWeight>,
    pub window: Duration,
    pub top_k: usize,
}

impl Default for RankingPolicy {
    fn default() -> Self {
        Self {
            weights: ["👍", "❤️", "🔥", "💯"]
                .into_iter()
                .map(|emoji| ReactionWeight { emoji: emoji.to_string(), weight: 1 })
                .collect(),
            window: Duration::days(7),
            top_k: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub source_ref: MessageId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub reaction_counts: Vec<(String, u32)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankedCandidate {
    pub source_ref: MessageId,
    pub content: String,
    pub score: u32,
}

impl RankingPolicy {
    pub fn score(&self, reaction_counts: &[(String, u32)]) -> u32 {
        self.weights
            .iter()
            .map(|weight| {
                reaction_counts
                    .iter()
                    .filter(|(emoji, _)| *emoji == weight.emoji)
                    .map(|(_, count)| count.saturating_mul(weight.weight))
                    .fold(0_u32, u32::saturating_add)
            })
            .fold(0_u32, u32::saturating_add)
    }

    pub fn rank<I>(&self, candidates: I, now: DateTime<Utc>) -> Vec<RankedCandidate>
    where
        I: IntoIterator<Item = Candidate>,
    {
        let window_start = now - self.window;
        let mut ranked: Vec<RankedCandidate> = candidates
            .into_iter()
            .filter(|candidate| candidate.created_at > window_start)
            .map(|candidate| RankedCandidate {
                score: self.score(&candidate.reaction_counts),
                source_ref: candidate.source_ref,
                content: if candidate.content.trim().is_empty() {
                    EMPTY_CONTENT_PLACEHOLDER.to_string()
                } else {
                    candidate.content
                },
            })
            .collect();

        ranked.sort_by(|left, right| right.score.cmp(&left.score));
        ranked.truncate(self.top_k);
        ranked
    }
}

pub fn option_emoji(index: usize) -> Option<&'static str> {
    OPTION_EMOJI.get(index).copied()
}

/// First `word_budget` words of `content`, whitespace collapsed.
///
/// The flag reports whether words were dropped.
pub fn summarize_label(content: &str, word_budget: usize) -> (String, bool) {
    let words: Vec<&str> = content.split_whitespace().collect();
    let truncated = words.len() > word_budget;
    (words.into_iter().take(word_budget).collect::<Vec<_>>().join(" "), truncated)
}
