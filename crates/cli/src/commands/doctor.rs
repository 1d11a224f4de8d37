use serde::Serialize;
use tallybot_core::config::{AppConfig, LoadOptions};
use tallybot_db::{JsonFilePollStore, PollStore};

use super::{block_on, CommandResult, EXIT_CHECKS_FAILED};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { EXIT_CHECKS_FAILED };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_interactions(&config));
            checks.push(check_store(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["interaction_endpoint", "store_readability"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_interactions(config: &AppConfig) -> DoctorCheck {
    match config.discord.interactions() {
        Some((application_id, _)) => DoctorCheck {
            name: "interaction_endpoint",
            status: CheckStatus::Pass,
            details: format!("slash commands enabled for application `{application_id}`"),
        },
        None => DoctorCheck {
            name: "interaction_endpoint",
            status: CheckStatus::Skipped,
            details: "discord.application_id/public_key not set; slash commands are disabled"
                .to_string(),
        },
    }
}

fn check_store(config: &AppConfig) -> DoctorCheck {
    let store = JsonFilePollStore::new(config.store.path.clone());
    let loaded = match block_on(store.load()) {
        Ok(loaded) => loaded,
        Err(error) => {
            return DoctorCheck {
                name: "store_readability",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            };
        }
    };

    match loaded {
        Ok(polls) => {
            let active = polls.values().filter(|poll| poll.is_active()).count();
            DoctorCheck {
                name: "store_readability",
                status: CheckStatus::Pass,
                details: format!(
                    "`{}` readable ({} polls, {active} active)",
                    config.store.path.display(),
                    polls.len()
                ),
            }
        }
        Err(error) => DoctorCheck {
            name: "store_readability",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
