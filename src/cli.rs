use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "gemini-cli-usage",
    version,
    about = "Incremental token usage reporting for Gemini CLI session files"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print usage rows, most recently updated session first.
    Sessions {
        /// Result-cache key forwarded to the engine.
        #[arg(long)]
        limit: Option<usize>,
        /// Only sessions updated at or after this time (RFC 3339 or epoch milliseconds).
        #[arg(long, value_name = "TIME")]
        since: Option<String>,
        /// Restrict output to a single session id.
        #[arg(long)]
        session_id: Option<String>,
        /// Emit a JSON array instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Stream newly appended assistant messages until interrupted.
    Watch {
        /// Emit one JSON object per line.
        #[arg(long)]
        json: bool,
    },
    /// Print storage location and engine settings.
    Status,
}
