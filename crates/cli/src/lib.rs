pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "tallybot",
    about = "Tallybot operator CLI",
    long_about = "Inspect tallybot configuration, check runtime readiness, and list stored polls.",
    after_help = "Examples:\n  tallybot doctor --json\n  tallybot config\n  tallybot polls --json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, Discord settings, and poll store readability")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "List stored polls with status, expiry, and current tallies")]
    Polls {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Polls { json } => commands::polls::run(json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
