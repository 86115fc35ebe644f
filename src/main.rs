use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use foreman::api::{self, AppState};
use foreman::config::Config;
use foreman::db::Database;
use foreman::executor::{CliExecutor, RateLimited, RateLimiter};
use foreman::lifecycle::Lifecycle;
use foreman::planner::Planner;
use foreman::progress::ProgressTracker;
use foreman::registry::RunRegistry;
use foreman::runner::TaskRunner;
use foreman::scheduler::Scheduler;

type Reasoner = Arc<RateLimited<CliExecutor>>;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(about = "Orchestrates hierarchical work through bounded agent loops")]
struct Cli {
    /// Config file to use instead of the one in the user's config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the observer API and the scheduler
    Serve {
        /// Port for HTTP API
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Override the number of tasks run at once
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Run ready tasks until nothing is left to do
    Run {
        /// Override the number of tasks run at once
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Break a component (or with --project, every component of a project)
    /// down into tasks
    #[command(group = clap::ArgGroup::new("target").required(true).args(["component_id", "project"]))]
    Plan {
        component_id: Option<Uuid>,

        /// Plan every component of this project, parents first
        #[arg(long)]
        project: Option<Uuid>,
    },
    /// Show a task and its progress
    Status { task_id: Uuid },
    /// Send a failed task back to the scheduler
    Retry { task_id: Uuid },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "foreman=debug,tower_http=debug".into()),
    );

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Everything a command needs, wired from one config.
struct Core {
    config: Config,
    lifecycle: Lifecycle,
    registry: RunRegistry,
    executor: Reasoner,
}

impl Core {
    fn open(config: Config) -> anyhow::Result<Self> {
        let db = match &config.database_path {
            Some(path) => Database::open(path.clone()),
            None => Database::open_default(),
        }
        .context("Failed to open database")?;
        db.migrate().context("Failed to migrate database")?;

        let tracker = ProgressTracker::new(db.clone(), config.tracker.clone());
        let lifecycle = Lifecycle::new(db, tracker);
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let executor = Arc::new(RateLimited::new(
            CliExecutor::new(config.executor.clone()),
            limiter,
        ));

        Ok(Self {
            config,
            lifecycle,
            registry: RunRegistry::new(),
            executor,
        })
    }

    fn scheduler(&self, concurrency: Option<usize>) -> Scheduler<Reasoner> {
        let mut scheduler_config = self.config.scheduler.clone();
        if let Some(n) = concurrency {
            scheduler_config.max_concurrent_tasks = n;
        }
        let runner = TaskRunner::new(
            self.lifecycle.clone(),
            self.executor.clone(),
            self.config.runner.clone(),
        );
        Scheduler::new(
            self.lifecycle.clone(),
            runner,
            self.registry.clone(),
            scheduler_config,
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    let core = Core::open(config)?;

    match cli.command.unwrap_or(Commands::Serve {
        port: 3000,
        concurrency: None,
    }) {
        Commands::Serve { port, concurrency } => serve(core, port, concurrency).await?,
        Commands::Run { concurrency } => {
            let scheduler = core.scheduler(concurrency);
            scheduler.reap_orphans()?;
            let summary = scheduler.run_until_idle().await?;
            core.lifecycle.tracker().flush_dirty()?;
            println!(
                "{} completed, {} failed",
                summary.completed, summary.failed
            );
        }
        Commands::Plan {
            component_id,
            project,
        } => {
            let planner = Planner::new(
                core.lifecycle.clone(),
                core.executor.clone(),
                core.config.workspace_root(),
            );
            let tasks = match (project, component_id) {
                (Some(project_id), _) => {
                    let plan = planner.plan_project(project_id).await?;
                    for skipped in &plan.skipped {
                        println!("skipped {} (already has tasks)", skipped);
                    }
                    plan.components.into_iter().flat_map(|c| c.tasks).collect()
                }
                (None, Some(component_id)) => planner.plan_component(component_id).await?,
                (None, None) => anyhow::bail!("Give a component id or --project"),
            };
            for task in tasks {
                println!("{}  [{}]  {}", task.id, task.status, task.title);
            }
        }
        Commands::Status { task_id } => {
            let task = core
                .lifecycle
                .db()
                .get_task(task_id)?
                .ok_or_else(|| anyhow::anyhow!("Task {} not found", task_id))?;
            let progress = core.lifecycle.tracker().progress_of(&task)?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Commands::Retry { task_id } => {
            let task = core.lifecycle.retry(task_id)?;
            println!("{}  [{}]  {}", task.id, task.status, task.title);
        }
    }

    Ok(())
}

async fn serve(core: Core, port: u16, concurrency: Option<usize>) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let scheduler = core.scheduler(concurrency);
    let reaped = scheduler.reap_orphans()?;
    if reaped > 0 {
        tracing::warn!("Failed {} tasks orphaned by a previous run", reaped);
    }

    let checkpointer = core.lifecycle.tracker().spawn_checkpointer(shutdown.clone());
    let scheduler_shutdown = shutdown.clone();
    let scheduler_task = tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    let app = api::create_router(AppState::new(
        core.lifecycle.clone(),
        core.registry.clone(),
        core.config.delete_policy,
    ));
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("foreman listening on http://127.0.0.1:{}", port);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            tracing::info!("Shutting down");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    let summary = scheduler_task.await??;
    tracing::info!(
        completed = summary.completed,
        failed = summary.failed,
        "Scheduler drained"
    );
    checkpointer.await?;
    Ok(())
}
