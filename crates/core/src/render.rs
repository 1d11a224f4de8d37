//! Tally rendering: vote counts to the text shown in the poll message.
//!
//! Rendering is pure and deterministic. Output never exceeds
//! `RenderLimits::message_char_limit` characters; overflow is cut and marked
//! with an ellipsis instead of failing.

use crate::domain::poll::PollOption;

pub const BAR_WIDTH: usize = 20;
pub const FILLED_GLYPH: char = '█';
pub const EMPTY_GLYPH: char = '░';
pub const ELLIPSIS: char = '…';

const LIVE_HEADER: &str = "📊 **Live Poll Results:**";
const FINAL_HEADER: &str = "🏁 **Final Poll Results:**";
const OVERFLOW_RESERVE: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderMode {
    Live,
    Final,
}

impl RenderMode {
    pub fn header(&self) -> &'static str {
        match self {
            Self::Live => LIVE_HEADER,
            Self::Final => FINAL_HEADER,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderLimits {
    pub message_char_limit: usize,
    pub label_char_budget: usize,
}

impl Default for RenderLimits {
    fn default() -> Self {
        Self { message_char_limit: 2_000, label_char_budget: 80 }
    }
}

pub fn render(options: &[PollOption], mode: RenderMode, limits: RenderLimits) -> String {
    let max_votes = options.iter().map(|option| option.votes).max().unwrap_or(0).max(1);

    let mut content = String::from(mode.header());
    for option in options {
        content.push_str("\n\n");
        content.push_str(&option.emoji);
        content.push(' ');
        content.push_str(&truncate_label(&option.label, limits.label_char_budget));
        content.push('\n');
        content.push_str(&bar(option.votes, max_votes, BAR_WIDTH));
        content.push(' ');
        content.push_str(&vote_phrase(option.votes));
    }

    clamp_to_limit(content, limits.message_char_limit)
}

/// Proportional bar: `round(votes / max_votes * width)` filled glyphs.
pub fn bar(votes: u32, max_votes: u32, width: usize) -> String {
    let max_votes = u64::from(max_votes.max(1));
    let votes = u64::from(votes).min(max_votes);
    let width_u64 = width as u64;
    let filled = ((votes * width_u64 * 2 + max_votes) / (max_votes * 2)) as usize;

    let mut rendered = String::with_capacity(width * FILLED_GLYPH.len_utf8());
    rendered.extend(std::iter::repeat(FILLED_GLYPH).take(filled));
    rendered.extend(std::iter::repeat(EMPTY_GLYPH).take(width - filled));
    rendered
}

pub fn vote_phrase(votes: u32) -> String {
    if votes == 1 {
        "1 vote".to_string()
    } else {
        format!("{votes} votes")
    }
}

pub fn truncate_label(label: &str, budget: usize) -> String {
    if label.chars().count() <= budget {
        return label.to_string();
    }
    let mut truncated: String = label.chars().take(budget).collect();
    truncated.push(ELLIPSIS);
    truncated
}

/// Cuts `content` to `limit - 5` characters plus an ellipsis when it is over `limit`.
pub fn clamp_to_limit(content: String, limit: usize) -> String {
    if content.chars().count() <= limit {
        return content;
    }
    let mut clamped: String = content.chars().take(limit.saturating_sub(OVERFLOW_RESERVE)).collect();
    clamped.push(ELLIPSIS);
    clamped
}
