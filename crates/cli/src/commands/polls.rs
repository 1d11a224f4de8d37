use chrono::{DateTime, Utc};
use serde::Serialize;
use tallybot_core::config::{AppConfig, LoadOptions};
use tallybot_core::domain::poll::PollRecord;
use tallybot_db::{JsonFilePollStore, PollStore};

use super::{block_on, CommandResult, EXIT_CONFIG, EXIT_STORE};

const COMMAND: &str = "polls";

#[derive(Debug, Serialize)]
struct PollSummary {
    id: String,
    channel_id: String,
    status: &'static str,
    expires_at: DateTime<Utc>,
    total_votes: u32,
    tallies: Vec<OptionTally>,
}

#[derive(Debug, Serialize)]
struct OptionTally {
    emoji: String,
    label: String,
    votes: u32,
}

impl From<&PollRecord> for PollSummary {
    fn from(record: &PollRecord) -> Self {
        Self {
            id: record.id.0.clone(),
            channel_id: record.channel_id.0.clone(),
            status: record.status.as_str(),
            expires_at: record.expires_at,
            total_votes: record.options.iter().map(|option| option.votes).sum(),
            tallies: record
                .options
                .iter()
                .map(|option| OptionTally {
                    emoji: option.emoji.clone(),
                    label: option.label.clone(),
                    votes: option.votes,
                })
                .collect(),
        }
    }
}

pub fn run(json_output: bool) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(COMMAND, "config_validation", error.to_string(), EXIT_CONFIG)
        }
    };

    let store = JsonFilePollStore::new(config.store.path.clone());
    let polls = match block_on(store.load()) {
        Ok(Ok(polls)) => polls,
        Ok(Err(error)) => {
            return CommandResult::failure(COMMAND, "store_unreadable", error.to_string(), EXIT_STORE)
        }
        Err(error) => {
            return CommandResult::failure(COMMAND, "runtime", error.to_string(), EXIT_STORE)
        }
    };

    // Newest expiry first, matching what `/poll-results` would pick per channel.
    let mut summaries: Vec<PollSummary> = polls.values().map(PollSummary::from).collect();
    summaries.sort_by(|left, right| right.expires_at.cmp(&left.expires_at));

    let message = format!("{} stored poll(s) in `{}`", summaries.len(), config.store.path.display());
    if json_output {
        let data = serde_json::to_value(&summaries).ok();
        return CommandResult::success_with_data(COMMAND, message, data);
    }

    let mut lines = vec![message];
    for summary in &summaries {
        let tallies = summary
            .tallies
            .iter()
            .map(|tally| format!("{} {}", tally.emoji, tally.votes))
            .collect::<Vec<_>>()
            .join("  ");
        lines.push(format!(
            "- {} [{}] channel {} expires {} | {}",
            summary.id,
            summary.status,
            summary.channel_id,
            summary.expires_at.to_rfc3339(),
            tallies
        ));
    }
    CommandResult { exit_code: 0, output: lines.join("\n") }
}
