mod config;
mod error;
mod executor;
mod fold;
mod legacy;
mod query;
mod record_store;
mod storage;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use config::Config;
use executor::{format_summary, ExecutionRequest, ExecutionRunner};
use query::{QueryEngine, MAX_LIST_LIMIT};
use record_store::RecordStore;
use storage::{ExecutionRecord, ExecutionStatus};

#[derive(Parser)]
#[command(name = "xl", version)]
#[command(about = "Run code under a timeout and browse the execution history")]
struct Cli {
    /// Log directory (overrides EXECLOG_DIR and the config file)
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute code and record the execution
    Run {
        /// Code or command to execute (wrap commands with pipes in quotes)
        #[arg(required = true)]
        code: String,
        /// python, shell, auto, or any other label (run through the shell)
        #[arg(long, short)]
        kind: Option<String>,
        /// Free-text description stored with the execution
        #[arg(long, short)]
        description: Option<String>,
        /// Hard deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Print the final record as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// List recent executions, newest first
    List {
        /// Maximum number of executions (capped at 50)
        #[arg(long, short)]
        limit: Option<usize>,
    },
    /// Show every event of one execution
    Show {
        id: String,
        /// Print the folded record instead of the raw events
        #[arg(long)]
        record: bool,
    },
    /// Latest events across recent executions
    Latest {
        #[arg(long)]
        max_entries: Option<usize>,
        #[arg(long)]
        files: Option<usize>,
    },
    /// All events from the most recent execution files
    All {
        #[arg(long)]
        max_files: Option<usize>,
        #[arg(long)]
        max_entries: Option<usize>,
    },
    /// Import whole-record JSON snapshots written by the older wrapper
    Import {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::new()?;

    let log_dir = cli.log_dir.clone().unwrap_or_else(|| config.effective_log_dir());
    let store = RecordStore::open(&log_dir, config.store_options())
        .with_context(|| format!("failed to open log directory {}", log_dir.display()))?;
    tracing::debug!(dir = %store.dir().display(), "using log directory");

    let engine = QueryEngine::new(store.clone());
    let query = &config.query;

    match cli.command {
        Commands::Run {
            code,
            kind,
            description,
            timeout_ms,
            json,
        } => {
            let runner = ExecutionRunner::new(store.clone(), config.runner_options());
            let record = runner.execute(ExecutionRequest {
                code,
                kind,
                description,
                timeout_ms,
            })?;

            if json {
                print_json(&record)?;
            } else {
                print_record(&record);
            }
        }
        Commands::List { limit } => {
            let limit = limit.unwrap_or(query.list_limit).min(MAX_LIST_LIMIT);
            print_json(&engine.list_recent(limit)?)?;
        }
        Commands::Show { id, record } => {
            let shown = if record {
                engine.get_record(&id).and_then(|r| Ok(serde_json::to_value(r)?))
            } else {
                engine.get_by_id(&id).and_then(|d| Ok(serde_json::to_value(d)?))
            };
            match shown {
                Ok(value) => print_json(&value)?,
                Err(e) if e.is_not_found() => {
                    eprintln!("{} {}", "Execution not found:".red().bold(), id);
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Latest { max_entries, files } => {
            let feed = engine.latest_across_all(
                max_entries.unwrap_or(query.latest_max_entries),
                files.unwrap_or(query.latest_files_to_scan),
            )?;
            print_json(&feed)?;
        }
        Commands::All {
            max_files,
            max_entries,
        } => {
            let feed = engine.all_recent_entries(
                max_files.unwrap_or(query.all_max_files),
                max_entries.unwrap_or(query.all_max_entries),
            )?;
            print_json(&feed)?;
        }
        Commands::Import { files } => {
            for file in files {
                let id = legacy::import_file(&store, &file)
                    .with_context(|| format!("failed to import {}", file.display()))?;
                println!("{} {}", "Imported".green().bold(), id);
            }
        }
    }

    store.close()?;
    Ok(())
}

// Logs go to stderr so stdout stays parseable
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_record(record: &ExecutionRecord) {
    let summary = format_summary(record);
    let mut lines = summary.lines();

    if let Some(header) = lines.next() {
        println!("{}", header.bold());
    }
    for line in lines {
        match line {
            "Output:" => println!("{}", line.cyan().bold()),
            "Errors:" => println!("{}", line.red().bold()),
            l if l.starts_with("Status:") => {
                let status = match record.status {
                    ExecutionStatus::Completed => record.status.as_str().green(),
                    ExecutionStatus::Running => record.status.as_str().yellow(),
                    ExecutionStatus::Error | ExecutionStatus::Timeout => {
                        record.status.as_str().red()
                    }
                };
                println!("{} {}", "Status:".yellow(), status.bold());
            }
            l if l.starts_with("Execution time:") => println!("{}", l.dimmed()),
            l => println!("{}", l),
        }
    }
    println!("{} {}", "Recorded as".dimmed(), record.id.green());
}
