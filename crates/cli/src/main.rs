use std::process::ExitCode;

fn main() -> ExitCode {
    tallybot_cli::run()
}
