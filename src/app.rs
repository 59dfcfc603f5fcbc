use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::activity::ActivityUpdate;
use crate::config::{self, EngineSettings};
use crate::engine::{SessionQuery, UsageEngine};
use crate::paths::{chats_dirs, list_session_files};
use crate::usage::UsageRow;
use crate::util::{format_local_ms, format_tokens, human_duration, parse_timestamp_ms, truncate};

const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn print_sessions(
    settings: EngineSettings,
    limit: Option<usize>,
    since: Option<&str>,
    session_id: Option<String>,
    json: bool,
) -> Result<()> {
    let since = since.map(parse_since).transpose()?;
    let mut engine = UsageEngine::new(settings);
    let rows = engine.query(&SessionQuery {
        limit,
        since,
        session_id,
    });
    engine.shutdown();

    if json {
        let out = serde_json::to_string_pretty(rows.as_slice())
            .context("failed to serialize usage rows")?;
        println!("{out}");
        return Ok(());
    }

    if rows.is_empty() {
        println!("No Gemini CLI usage found under {}", engine.storage_root().display());
        return Ok(());
    }
    for row in rows.iter() {
        println!("{}", row_line(row));
    }
    Ok(())
}

pub fn run_watch(settings: EngineSettings, json: bool) -> Result<()> {
    let stop = install_stop_signal()?;
    let mut engine = UsageEngine::new(settings);
    if !engine.storage_root().exists() {
        bail!(
            "Gemini CLI session directory not found: {}",
            engine.storage_root().display()
        );
    }

    engine.start_watch(move |update: &ActivityUpdate| {
        let line = if json {
            serde_json::to_string(update).unwrap_or_default()
        } else {
            activity_line(update)
        };
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    });
    eprintln!(
        "Watching {} for new Gemini CLI messages (Ctrl+C to stop)",
        engine.storage_root().display()
    );

    while !stop.load(Ordering::Relaxed) {
        thread::sleep(WATCH_POLL_INTERVAL);
    }
    engine.stop_watch();
    Ok(())
}

pub fn print_status(settings: &EngineSettings) -> Result<()> {
    let root = settings.tmp_path();
    let dirs = chats_dirs(&root);
    let session_files: usize = dirs.iter().map(|dir| list_session_files(dir).len()).sum();

    println!("gemini-cli-usage status");
    println!("home: {}", settings.gemini_home.display());
    println!("installed: {}", config::is_installed(&settings.gemini_home));
    println!("sessions_root: {}", root.display());
    println!("chats_dirs: {}", dirs.len());
    for dir in &dirs {
        println!("  - {}", dir.display());
    }
    println!("session_files: {session_files}");
    println!(
        "result_cache_ttl: {}",
        human_duration(settings.result_cache_ttl)
    );
    println!(
        "reconciliation_interval: {}",
        human_duration(settings.reconciliation_interval)
    );
    println!(
        "aggregate_cache_capacity: {}",
        settings.aggregate_cache_capacity
    );
    Ok(())
}

/// Accepts RFC 3339 / ISO-8601 timestamps or raw epoch milliseconds.
pub fn parse_since(raw: &str) -> Result<i64> {
    let trimmed = raw.trim();
    if let Ok(ms) = trimmed.parse::<i64>() {
        return Ok(ms);
    }
    parse_timestamp_ms(trimmed)
        .with_context(|| format!("invalid --since value {trimmed:?}; expected RFC 3339 or epoch ms"))
}

fn row_line(row: &UsageRow) -> String {
    let cache = row
        .tokens
        .cache_read
        .map(|cached| format!(" cache {}", format_tokens(cached)))
        .unwrap_or_default();
    let name = row
        .session_name
        .as_deref()
        .map(|name| format!("  {}", truncate(name, 48)))
        .unwrap_or_default();
    format!(
        "{}  {}  {}  in {} out {}{}{}",
        format_local_ms(row.timestamp),
        truncate(&row.session_id, 36),
        row.model_id,
        format_tokens(row.tokens.input),
        format_tokens(row.tokens.output),
        cache,
        name
    )
}

fn activity_line(update: &ActivityUpdate) -> String {
    let mut extras = String::new();
    if let Some(cached) = update.tokens.cache_read {
        extras.push_str(&format!(" cache {}", format_tokens(cached)));
    }
    if let Some(reasoning) = update.tokens.reasoning {
        extras.push_str(&format!(" reasoning {}", format_tokens(reasoning)));
    }
    format!(
        "{}  {}  {}  in {} out {}{}",
        format_local_ms(update.timestamp),
        truncate(&update.session_id, 36),
        update.message_id,
        format_tokens(update.tokens.input),
        format_tokens(update.tokens.output),
        extras
    )
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}
