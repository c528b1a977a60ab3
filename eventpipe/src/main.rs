//! eventpipe - command-line front end for the eventpipe telemetry pipeline
//!
//! This tool provides commands for:
//! - Inspecting the effective configuration
//! - Inspecting or restarting the persisted session
//! - Tracking single events and replaying JSON-lines event streams
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/eventpipe/state.db (~/.local/share/eventpipe/state.db)
//! - Config: $XDG_CONFIG_HOME/eventpipe/config.toml (~/.config/eventpipe/config.toml)
//! - Logs: $XDG_STATE_HOME/eventpipe/eventpipe.log (with --verbose)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eventpipe_core::clock::{Clock, SystemClock};
use eventpipe_core::{Config, Database, Event, Pipeline, Properties, SessionManager};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "eventpipe")]
#[command(about = "Batch and deliver telemetry events")]
#[command(version)]
struct Args {
    /// Write logs to the XDG state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration and validate it
    Config,

    /// Inspect or restart the persisted session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Track a single event and wait for delivery
    Track {
        /// Event name
        name: String,

        /// Event property as key=value (value parsed as JSON when possible)
        #[arg(short, long = "prop", value_parser = parse_property)]
        props: Vec<(String, Value)>,

        /// Seconds to wait for in-flight sends before exiting
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Track JSON-lines events read from stdin until EOF or Ctrl+C
    Replay {
        /// Seconds to wait for in-flight sends before exiting
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// Show the persisted session
    Status,

    /// Close the current session and start a new one
    New {
        /// Seconds to wait for in-flight sends before exiting
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

/// One line of `replay` input
#[derive(Debug, Deserialize)]
struct ReplayLine {
    name: String,
    /// Defaults to the time the line is read
    timestamp: Option<i64>,
    #[serde(default)]
    properties: Properties,
}

fn parse_property(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty property key in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    // Held for the whole run so buffered log lines are flushed on exit
    let _log_guard = if args.verbose {
        Some(eventpipe_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Config => cmd_config(&config),
        Command::Session {
            action: SessionAction::Status,
        } => cmd_session_status(&config),
        Command::Session {
            action: SessionAction::New { timeout },
        } => cmd_session_new(&config, timeout).await,
        Command::Track {
            name,
            props,
            timeout,
        } => cmd_track(&config, name, props, timeout).await,
        Command::Replay { timeout } => cmd_replay(&config, timeout).await,
    }
}

fn open_database() -> Result<Arc<Database>> {
    let db_path = Config::database_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    db.migrate().context("failed to run database migrations")?;
    Ok(Arc::new(db))
}

fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let db = open_database()?;
    let pipeline = Pipeline::from_config(config, db).context("failed to build pipeline")?;
    if config.destinations.is_empty() {
        println!("No destinations configured; events will not be uploaded.");
    }
    Ok(pipeline)
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn cmd_config(config: &Config) -> Result<()> {
    println!("# {}", Config::config_path().display());
    print!("{}", config.to_toml()?);
    println!();

    match config.validate() {
        Ok(()) => {
            println!("Configuration OK");
            Ok(())
        }
        Err(e) => bail!("invalid configuration: {e}"),
    }
}

fn cmd_session_status(config: &Config) -> Result<()> {
    let manager = SessionManager::new(
        open_database()?,
        Arc::new(SystemClock),
        config.session.max_session_age(),
    );

    let Some(session) = manager.load_persisted() else {
        println!("No session");
        return Ok(());
    };

    let active = manager.is_resumable(&session);

    println!("Session ID:      {}", session.id);
    println!("Started:         {}", format_timestamp(session.id));
    println!(
        "Last activity:   {}",
        format_timestamp(session.last_event_timestamp)
    );
    println!(
        "State:           {}",
        if active { "active" } else { "expired" }
    );
    Ok(())
}

async fn cmd_session_new(config: &Config, timeout: u64) -> Result<()> {
    let pipeline = build_pipeline(config)?;
    pipeline.start_new_session();

    let session_id = pipeline.session().session_id();
    finish(pipeline, timeout).await?;

    match session_id {
        Some(id) => println!("Started session {id}"),
        None => println!("No session started"),
    }
    Ok(())
}

async fn cmd_track(
    config: &Config,
    name: String,
    props: Vec<(String, Value)>,
    timeout: u64,
) -> Result<()> {
    let pipeline = build_pipeline(config)?;
    pipeline.start();

    let properties: Properties = props.into_iter().collect();
    pipeline
        .track(name.as_str(), properties)
        .context("failed to track event")?;
    println!("Tracked {name}");

    finish(pipeline, timeout).await
}

async fn cmd_replay(config: &Config, timeout: u64) -> Result<()> {
    let pipeline = build_pipeline(config)?;
    pipeline.start();

    let clock = SystemClock;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tracked = 0usize;
    let mut skipped = 0usize;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nShutting down...");
                None
            }
        };
        let Some(line) = line else { break };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<ReplayLine>(line) {
            Ok(parsed) => {
                let event = Event::new(parsed.name, parsed.timestamp.unwrap_or_else(|| clock.now()))
                    .with_properties(parsed.properties);
                pipeline.track_event(event).context("failed to track event")?;
                tracked += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed replay line");
                eprintln!("skipping malformed line: {e}");
                skipped += 1;
            }
        }
    }

    println!("Replayed {tracked} events ({skipped} skipped)");
    finish(pipeline, timeout).await
}

/// Drain the pipeline and print per-destination delivery results.
async fn finish(pipeline: Pipeline, timeout: u64) -> Result<()> {
    let drained = pipeline
        .drain(Duration::from_secs(timeout))
        .await
        .context("failed to drain pipeline")?;

    for status in pipeline.status().await? {
        let stats = &status.stats;
        println!(
            "{}: {} sent, {} failed, {} evicted, {} pending",
            status.name,
            stats.events_sent,
            stats.events_failed,
            stats.events_evicted,
            status.queue.pending
        );
    }

    if !drained {
        println!("Timed out after {timeout}s with events still pending");
    }
    Ok(())
}
