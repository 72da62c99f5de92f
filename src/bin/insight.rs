//! Command-line front end
//!
//! Run with: cargo run --bin insight -- ask "top 5 stores by revenue this month"

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sql_insight_agent::clarification::ClarificationType;
use sql_insight_agent::learning::{ListFilter, StatusFilter};
use sql_insight_agent::{AgentConfig, CancelFlag, InsightService, QueryOptions, QueryResolution};
use std::collections::HashMap;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "insight")]
#[command(about = "Natural-language analytics over the sales database")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question
    Ask {
        query: String,

        /// Clarification answer as axis=value (e.g. period="this month"); repeatable
        #[arg(long = "answer", value_parser = parse_answer)]
        answers: Vec<(ClarificationType, String)>,
    },

    /// Work the failed-query queue
    Failed {
        #[command(subcommand)]
        action: FailedAction,
    },

    /// Embed product rows into the semantic search index
    IndexProducts {
        /// Product query; must select id and name
        #[arg(long)]
        query: Option<String>,
    },
}

#[derive(Subcommand)]
enum FailedAction {
    List {
        /// pending, resolved, ignored or all
        #[arg(long, default_value = "all")]
        status: String,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    Show {
        id: String,
    },
    Resolve {
        id: String,
        #[arg(long)]
        sql: String,
        #[arg(long = "by")]
        resolved_by: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    Ignore {
        id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Replace the notes (omit --notes to clear them)
    Notes {
        id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    Delete {
        id: String,
    },
}

fn parse_answer(raw: &str) -> std::result::Result<(ClarificationType, String), String> {
    let (axis, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected axis=value, got '{}'", raw))?;
    let axis = axis.parse::<ClarificationType>().map_err(|e| e.to_string())?;
    Ok((axis, value.trim().to_string()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = AgentConfig::from_env().context("Invalid configuration")?;
    let service = InsightService::from_config(&config)
        .await
        .context("Failed to start service")?;

    match args.command {
        Command::Ask { query, answers } => {
            let cancel = CancelFlag::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, finishing the current step");
                    on_signal.cancel();
                }
            });

            let options = QueryOptions {
                clarification_answers: if answers.is_empty() {
                    None
                } else {
                    Some(answers.into_iter().collect::<HashMap<_, _>>())
                },
                cancel,
            };
            let resolution = service.resolve_query(&query, options).await?;
            match &resolution {
                QueryResolution::Answered(answer) => {
                    info!("Answered with {} observation(s)", answer.observations.len());
                    for warning in &answer.warnings {
                        warn!("{}", warning);
                    }
                }
                QueryResolution::NeedsClarification(_) => {
                    info!("Clarification needed; rerun with --answer axis=value")
                }
                QueryResolution::NeedsManualResolution(ticket) => {
                    info!("Failed query {} opened", ticket.ticket_id)
                }
            }
            print_json(&resolution)?;
        }
        Command::Failed { action } => {
            let store = service.failed_queries();
            match action {
                FailedAction::List { status, page, limit } => {
                    let status: StatusFilter = status.parse()?;
                    print_json(&store.list(ListFilter { status, page, limit }).await?)?;
                }
                FailedAction::Show { id } => print_json(&store.get(&id).await?)?,
                FailedAction::Resolve {
                    id,
                    sql,
                    resolved_by,
                    notes,
                } => print_json(&store.resolve(&id, &sql, resolved_by, notes).await?)?,
                FailedAction::Ignore { id, notes } => print_json(&store.ignore(&id, notes).await?)?,
                FailedAction::Notes { id, notes } => {
                    print_json(&store.update_notes(&id, notes).await?)?
                }
                FailedAction::Delete { id } => {
                    store.delete(&id).await?;
                    println!("Deleted {}", id);
                }
            }
        }
        Command::IndexProducts { query } => {
            let report = match query {
                Some(q) => service.indexer().index_query(&q).await?,
                None => service.indexer().index_all().await?,
            };
            print_json(&report)?;
        }
    }

    Ok(())
}
