//! The `mnemo task` subcommands: operator access to the queue directly
//! against the database. A running broker picks up enqueued work on its
//! next tick; cancellation here relies on the claim guards rather than a
//! `task:cancel` frame (use the REST endpoint on a live broker for that).

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use uuid::Uuid;

use mnemo_db::models::{TaskKind, TaskStatus};
use mnemo_db::pool;
use mnemo_db::queries::tasks::{self, TaskFilter};

use crate::config::MnemoConfig;
use crate::serve_cmd::TaskView;

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Enqueue a task
    Enqueue {
        /// Task kind (observation, summarize, embedding, vector-sync,
        /// context-gen, doc-gen, semantic-search, compression)
        kind: String,
        /// Payload as a UTF-8 string (mutually exclusive with --payload-hex)
        #[arg(long)]
        payload: Option<String>,
        /// Payload as hex-encoded bytes
        #[arg(long)]
        payload_hex: Option<String>,
        /// Required capability; defaults to the kind name
        #[arg(long)]
        capability: Option<String>,
        /// Fallback capability, repeatable, tried in order
        #[arg(long = "fallback")]
        fallbacks: Vec<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long, default_value_t = 3)]
        max_retries: i32,
    },
    /// Print a task as JSON
    Get { id: Uuid },
    /// Cancel a task
    Cancel {
        id: Uuid,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// List tasks
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

pub async fn run(config: &MnemoConfig, command: TaskCommands) -> Result<()> {
    let pg_pool = pool::create_pool(&config.db_config).await?;

    let outcome = match command {
        TaskCommands::Enqueue {
            kind,
            payload,
            payload_hex,
            capability,
            fallbacks,
            priority,
            max_retries,
        } => {
            let kind: TaskKind = kind.parse()?;
            let payload = match (payload, payload_hex) {
                (Some(text), None) => text.into_bytes(),
                (None, Some(hex_text)) => {
                    hex::decode(&hex_text).context("invalid --payload-hex")?
                }
                (None, None) => bail!("one of --payload or --payload-hex is required"),
                (Some(_), Some(_)) => bail!("--payload and --payload-hex are mutually exclusive"),
            };
            if max_retries < 0 {
                bail!("--max-retries must be non-negative");
            }
            let capability = capability.unwrap_or_else(|| kind.to_string());

            let task = tasks::insert_task(
                &pg_pool,
                Uuid::new_v4(),
                kind,
                &capability,
                &fallbacks,
                priority,
                &payload,
                max_retries,
            )
            .await?;
            println!("{}", task.id);
            Ok(())
        }

        TaskCommands::Get { id } => {
            let task = tasks::get_task(&pg_pool, id)
                .await?
                .with_context(|| format!("task {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&TaskView::from(task))?);
            Ok(())
        }

        TaskCommands::Cancel { id, reason } => {
            match tasks::cancel_task(&pg_pool, id, &reason).await? {
                Some(_) => {
                    println!("cancelled {id}");
                    Ok(())
                }
                None => match tasks::get_task(&pg_pool, id).await? {
                    Some(task) => bail!("task {id} is already terminal ({})", task.status),
                    None => bail!("task {id} not found"),
                },
            }
        }

        TaskCommands::List {
            status,
            kind,
            limit,
        } => {
            let filter = TaskFilter {
                status: status
                    .map(|s| s.parse::<TaskStatus>())
                    .transpose()?,
                kind: kind.map(|k| k.parse::<TaskKind>()).transpose()?,
            };
            let rows = tasks::list_tasks(&pg_pool, &filter, limit.clamp(1, 1000), 0).await?;
            println!(
                "{:<38} {:<16} {:<11} {:<24} {:>6} {:>5}",
                "id", "kind", "status", "capability", "prio", "retry"
            );
            for task in rows {
                println!(
                    "{:<38} {:<16} {:<11} {:<24} {:>6} {:>5}",
                    task.id,
                    task.kind.to_string(),
                    task.status.to_string(),
                    task.required_capability,
                    task.priority,
                    format!("{}/{}", task.retry_count, task.max_retries),
                );
            }
            Ok(())
        }
    };

    pg_pool.close().await;
    outcome
}
