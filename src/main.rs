use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use gemini_cli_usage::app;
use gemini_cli_usage::cli::{Cli, Commands};
use gemini_cli_usage::config::EngineSettings;
use gemini_cli_usage::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("gemini-cli-usage error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let settings = EngineSettings::from_env();

    match cli.command {
        Some(Commands::Sessions {
            limit,
            since,
            session_id,
            json,
        }) => {
            app::print_sessions(settings, limit, since.as_deref(), session_id, json)?;
            Ok(0)
        }
        Some(Commands::Watch { json }) => {
            app::run_watch(settings, json)?;
            Ok(0)
        }
        Some(Commands::Status) | None => {
            app::print_status(&settings)?;
            Ok(0)
        }
    }
}
