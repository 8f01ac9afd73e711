use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;

use conductor::config::ServerSettings;
use conductor::db::{ConductorDb, DbHandle};
use conductor::github::{EnvTokenProvider, GithubForgeFactory, TokenProvider};
use conductor::metrics::MetricsCollector;
use conductor::notify::{NotificationSender, NotifyTargets};
use conductor::processor::subtask::SubtaskProcessor;
use conductor::processor::task::TaskProcessor;
use conductor::processor::ProcessorContext;
use conductor::queue::{JobQueue, QUEUE_NOTIFICATIONS, QUEUE_SUBTASKS, QUEUE_TASKS};
use conductor::server::{start_server, AppState};
use conductor::workspace::WorkspaceManager;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Autonomous software-engineering orchestrator")]
pub struct Cli {
    #[arg(long, default_value = ".conductor/conductor.db", global = true)]
    pub db_path: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook server and queue workers
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8744")]
        port: u16,

        /// Directory holding per-task working trees
        #[arg(long, default_value = ".conductor/workspaces")]
        workspaces_root: PathBuf,

        /// Permissive CORS for local development
        #[arg(long)]
        dev: bool,
    },
    /// Initialize the database and exit
    Init,
    /// Show recent tasks
    Status {
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            workspaces_root,
            dev,
        } => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("conductor=info,warn")),
                )
                .init();
            let settings = ServerSettings {
                port,
                db_path: cli.db_path,
                workspaces_root,
                dev_mode: dev,
                ..Default::default()
            };
            serve(settings).await
        }
        Commands::Init => {
            init_db(&cli.db_path)?;
            println!("Database initialized at {}", cli.db_path.display());
            Ok(())
        }
        Commands::Status { limit } => print_status(&cli.db_path, limit).await,
    }
}

fn init_db(db_path: &PathBuf) -> Result<ConductorDb> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    ConductorDb::new(db_path)
}

async fn serve(settings: ServerSettings) -> Result<()> {
    let db = DbHandle::new(init_db(&settings.db_path)?);
    let queue = JobQueue::new(db.clone());
    let tokens: Arc<dyn TokenProvider> = Arc::new(EnvTokenProvider);

    std::fs::create_dir_all(settings.workspaces_root.join(".scratch"))
        .context("Failed to create workspaces root")?;

    let ctx = Arc::new(ProcessorContext {
        db: db.clone(),
        queue: queue.clone(),
        forge_factory: Arc::new(GithubForgeFactory::new(tokens.clone())),
        tokens,
        invoker: Arc::new(conductor::agent::AgentRunner::new(settings.agent_cmd.clone())),
        workspaces: Arc::new(WorkspaceManager::new(settings.workspaces_root.clone())),
        metrics: Arc::new(MetricsCollector::new()),
        settings,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut workers = Vec::new();
    {
        let queue = queue.clone();
        let handler = Arc::new(TaskProcessor::new(ctx.clone()));
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            queue.run_worker(QUEUE_TASKS, 2, handler, rx).await;
        }));
    }
    {
        let queue = queue.clone();
        let handler = Arc::new(SubtaskProcessor::new(ctx.clone()));
        let rx = shutdown_rx.clone();
        let concurrency = ctx.settings.subtask_concurrency;
        workers.push(tokio::spawn(async move {
            queue.run_worker(QUEUE_SUBTASKS, concurrency, handler, rx).await;
        }));
    }
    {
        let queue = queue.clone();
        let handler = Arc::new(NotificationSender::new(db.clone(), NotifyTargets::from_env()));
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            queue.run_worker(QUEUE_NOTIFICATIONS, 5, handler, rx).await;
        }));
    }
    {
        let queue = queue.clone();
        let rx = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            queue.run_pruner(rx).await;
        }));
    }

    let result = start_server(Arc::new(AppState::new(ctx))).await;

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    result
}

async fn print_status(db_path: &PathBuf, limit: i64) -> Result<()> {
    let db = DbHandle::new(ConductorDb::new(db_path)?);
    let tasks = db.call(move |db| db.list_recent_tasks(limit)).await?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!(
        "{:<38} {:<14} {:<28} {}",
        style("TASK").bold(),
        style("STATUS").bold(),
        style("BRANCH").bold(),
        style("PR").bold()
    );
    for task in tasks {
        let status = match task.status {
            conductor::db::models::TaskStatus::Done => style(task.status.to_string()).green(),
            conductor::db::models::TaskStatus::Failed => style(task.status.to_string()).red(),
            conductor::db::models::TaskStatus::HumanReview => {
                style(task.status.to_string()).yellow()
            }
            _ => style(task.status.to_string()).cyan(),
        };
        println!(
            "{:<38} {:<14} {:<28} {}",
            truncate(&task.title, 36),
            status,
            task.branch_name.as_deref().unwrap_or("-"),
            task.pull_request_url.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max - 1).collect();
        format!("{}…", cut)
    }
}
