//! BIRTHNON CI: workflow engine and webhook server.
//!
//! Runs the BIRTHNON GitHub Actions workflow (test, then deploy from `main`)
//! as local processes. `serve` receives GitHub webhooks and runs builds in
//! the background; `run` and `plan` work against a local checkout.

mod actions;
mod cache;
mod config;
mod dashboard;
mod db;
mod executor;
mod metrics;
mod models;
mod routes;
mod schema;
mod secrets;
mod services;
mod workflow;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::actions::CheckoutSource;
use crate::cache::CacheStore;
use crate::config::CiConfig;
use crate::executor::{Conclusion, NoopObserver, RunRequest, RunnerSettings, WorkflowRunner};
use crate::secrets::Secrets;
use crate::services::build_service::BuildStore;
use crate::services::error_service::ErrorStore;
use crate::services::executor::{spawn_executor, ExecutorContext};
use crate::services::github_service::StatusReporter;
use crate::workflow::{Event, Workflow};

#[derive(Parser)]
#[command(name = "birthnon-ci", about = "BIRTHNON CI/CD workflow runner")]
struct Cli {
    /// Workflow file (defaults to the built-in BIRTHNON workflow)
    #[arg(long, global = true, env = "CI_WORKFLOW")]
    workflow: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Receive GitHub webhooks and run builds
    Serve {
        /// Server port
        #[arg(short, long, env = "CI_PORT", default_value = "9090")]
        port: u16,
    },
    /// Run the workflow once against a local checkout
    Run {
        /// Repository checkout
        #[arg(long, default_value = ".")]
        path: PathBuf,

        #[command(flatten)]
        event: EventArgs,
    },
    /// Show which jobs an event would run
    Plan {
        #[command(flatten)]
        event: EventArgs,
    },
    /// Print the pip cache key for a checkout
    CacheKey {
        #[arg(long, default_value = ".")]
        path: PathBuf,

        #[arg(long, default_value = "bscore/requirements.txt")]
        lock_file: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EventKind {
    Push,
    PullRequest,
    Manual,
}

#[derive(Args)]
struct EventArgs {
    #[arg(long, value_enum, default_value_t = EventKind::Push)]
    event: EventKind,

    /// Pushed branch, or the head branch of a pull request
    #[arg(long, default_value = "main")]
    branch: String,

    /// Target branch of a pull request
    #[arg(long, default_value = "main")]
    base: String,

    #[arg(long, default_value = "HEAD")]
    sha: String,

    /// Pull request number
    #[arg(long, default_value_t = 1)]
    pr: u64,
}

impl EventArgs {
    fn to_event(&self) -> Event {
        match self.event {
            EventKind::Push => Event::Push {
                branch: self.branch.clone(),
                sha: self.sha.clone(),
            },
            EventKind::PullRequest => Event::PullRequest {
                number: self.pr,
                base_branch: self.base.clone(),
                head_branch: self.branch.clone(),
                sha: self.sha.clone(),
            },
            EventKind::Manual => Event::Manual {
                branch: self.branch.clone(),
                sha: self.sha.clone(),
            },
        }
    }
}

fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_workflow(path: Option<&Path>) -> anyhow::Result<Workflow> {
    let workflow = match path {
        Some(path) => Workflow::load(path)?,
        None => Workflow::birthnon()?,
    };
    Ok(workflow)
}

fn runner_settings(config: &CiConfig) -> RunnerSettings {
    RunnerSettings {
        cache: CacheStore::new(&config.cache_dir),
        default_step_timeout: config.step_timeout(),
        temp_dir: std::env::temp_dir().join("birthnon-ci").join("runner"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { port } => serve(cli.workflow.as_deref(), port).await,
        Command::Run { path, event } => run_once(cli.workflow.as_deref(), &path, &event).await,
        Command::Plan { event } => plan(cli.workflow.as_deref(), &event),
        Command::CacheKey { path, lock_file } => {
            let key = cache::pip_cache_key(cache::runner_os(), &path, &lock_file)?;
            println!("{key}");
            Ok(())
        }
    }
}

async fn serve(workflow_path: Option<&Path>, port: u16) -> anyhow::Result<()> {
    tracing::info!("Starting BIRTHNON CI server...");

    let config = CiConfig::from_env();
    let workflow = load_workflow(workflow_path.or(config.workflow_path.as_deref()))?;
    tracing::info!(
        workflow = %workflow.name,
        jobs = workflow.jobs.len(),
        "Workflow loaded"
    );

    tokio::fs::create_dir_all(&config.workspace_dir)
        .await
        .with_context(|| format!("creating {}", config.workspace_dir.display()))?;

    let secrets = Secrets::from_env(workflow.referenced_secrets());
    let (store, errors) = match &config.database_url {
        Some(url) => {
            let pool = db::connect(url, config.db_pool_size)?;
            tracing::info!("Running CI migration...");
            db::run_migration(&pool).await?;
            (BuildStore::postgres(pool.clone()), ErrorStore::postgres(pool))
        }
        None => (BuildStore::memory(), ErrorStore::memory()),
    };
    let reporter = StatusReporter::new(&config.github_token, &config.dashboard_url);

    let ctx = Arc::new(ExecutorContext {
        store: store.clone(),
        errors: errors.clone(),
        reporter: reporter.clone(),
        runner: WorkflowRunner::new(runner_settings(&config), secrets),
        workflow: workflow.clone(),
        config: config.clone(),
    });
    let queue = spawn_executor(ctx);

    let state = routes::CiRouterState {
        store,
        errors,
        queue,
        reporter,
        workflow: Arc::new(workflow),
        config,
    };
    let app = routes::ci_router(state)
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http());

    metrics::init_metrics();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("BIRTHNON CI server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run_once(workflow_path: Option<&Path>, path: &Path, args: &EventArgs) -> anyhow::Result<()> {
    let workflow = load_workflow(workflow_path)?;
    // Webhook settings are irrelevant for a one-off run.
    let config = CiConfig::from_lookup(|key| std::env::var(key).ok());
    let path = path
        .canonicalize()
        .with_context(|| format!("checkout {} not found", path.display()))?;

    let runner = WorkflowRunner::new(
        runner_settings(&config),
        Secrets::from_env(workflow.referenced_secrets()),
    );
    let request = RunRequest {
        build_id: 0,
        event: args.to_event(),
        repository: config.github_repo.clone(),
        source: CheckoutSource::Local { path, pull: false },
    };

    let report = runner.run(&workflow, &request, &NoopObserver).await?;
    if !report.triggered {
        println!("Event does not trigger '{}'", workflow.name);
        return Ok(());
    }

    for job in &report.jobs {
        println!("{} [{}] {}ms", job.name, job.conclusion.as_str(), job.duration_ms);
        for step in &job.steps {
            println!("  {:>2}. {} [{}]", step.sequence, step.name, step.conclusion.as_str());
            if step.conclusion == Conclusion::Failure {
                for line in step.stderr.lines().rev().take(20).collect::<Vec<_>>().into_iter().rev() {
                    println!("      {line}");
                }
            }
        }
    }

    if !report.succeeded() {
        anyhow::bail!("workflow '{}' failed", workflow.name);
    }
    Ok(())
}

fn plan(workflow_path: Option<&Path>, args: &EventArgs) -> anyhow::Result<()> {
    let workflow = load_workflow(workflow_path)?;
    let event = args.to_event();
    let workspace = std::env::current_dir()?;
    let config = CiConfig::from_lookup(|key| std::env::var(key).ok());

    match executor::plan(&workflow, &event, &config.github_repo, &workspace)? {
        None => println!("Event does not trigger '{}'", workflow.name),
        Some(jobs) => {
            for job in jobs {
                let verdict = if job.runs { "run" } else { "skip" };
                if job.needs.is_empty() {
                    println!("{verdict:<4} {}", job.id);
                } else {
                    println!("{verdict:<4} {} (needs {})", job.id, job.needs.join(", "));
                }
            }
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
