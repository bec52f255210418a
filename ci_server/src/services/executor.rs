//! Build executor: background task that runs queued builds.
//!
//! Webhooks and the trigger API enqueue build ids; the executor runs each
//! through the workflow runner, at most `max_concurrent_builds` at a time,
//! and records progress in the build store. Builds against a local checkout
//! share one working tree and run one at a time.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::actions::CheckoutSource;
use crate::config::CiConfig;
use crate::executor::{RunRequest, WorkflowRunner};
use crate::models::build::{Build, BuildStatus};
use crate::services::build_service::{BuildRecorder, BuildStore};
use crate::services::error_service::ErrorStore;
use crate::services::github_service::StatusReporter;
use crate::workflow::Workflow;

const QUEUE_CAPACITY: usize = 64;

/// Everything a build run needs.
pub struct ExecutorContext {
    pub store: BuildStore,
    pub errors: ErrorStore,
    pub reporter: StatusReporter,
    pub runner: WorkflowRunner,
    pub workflow: Workflow,
    pub config: CiConfig,
}

/// Sending side of the build queue.
#[derive(Clone)]
pub struct BuildQueue {
    tx: mpsc::Sender<i64>,
    depth: Arc<AtomicUsize>,
}

impl BuildQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<i64>) {
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Self {
            tx,
            depth: Arc::new(AtomicUsize::new(0)),
        };
        (queue, rx)
    }

    pub fn enqueue(&self, build_id: i64) -> anyhow::Result<()> {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if let Err(e) = self.tx.try_send(build_id) {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            anyhow::bail!("build queue unavailable: {e}");
        }
        crate::metrics::queue_depth(depth);
        Ok(())
    }
}

/// Start the executor loop; returns the queue to feed it.
pub fn spawn_executor(ctx: Arc<ExecutorContext>) -> BuildQueue {
    let (queue, rx) = BuildQueue::channel(QUEUE_CAPACITY);
    tokio::spawn(run_executor(rx, queue.depth.clone(), ctx));
    queue
}

/// Builds allowed to run at once.
fn concurrency_limit(config: &CiConfig) -> usize {
    if config.local_path.is_some() {
        1
    } else {
        config.max_concurrent_builds.max(1)
    }
}

async fn run_executor(mut rx: mpsc::Receiver<i64>, depth: Arc<AtomicUsize>, ctx: Arc<ExecutorContext>) {
    let limit = concurrency_limit(&ctx.config);
    tracing::info!(
        workspace = %ctx.config.workspace_dir.display(),
        max_concurrent = limit,
        "Build executor started"
    );

    let semaphore = Arc::new(Semaphore::new(limit));
    while let Some(build_id) = rx.recv().await {
        let remaining = depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        crate::metrics::queue_depth(remaining);

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            execute_build(&ctx, build_id).await;
            drop(permit);
        });
    }

    tracing::info!("Build executor stopped");
}

fn checkout_source(config: &CiConfig, build: &Build) -> CheckoutSource {
    match &config.local_path {
        Some(path) => CheckoutSource::Local {
            path: path.clone(),
            pull: true,
        },
        None => CheckoutSource::Remote {
            clone_url: format!("https://github.com/{}.git", build.repo),
            workspace: config.workspace_dir.join(build.id.to_string()),
        },
    }
}

/// Run one build to completion.
pub async fn execute_build(ctx: &ExecutorContext, build_id: i64) {
    let build = match ctx.store.get_build(build_id).await {
        Ok(Some(build)) => build,
        Ok(None) => {
            tracing::warn!(build_id, "Queued build no longer exists");
            return;
        }
        Err(e) => {
            tracing::error!(build_id, "Failed to load build: {e:#}");
            return;
        }
    };

    tracing::info!(
        build_id,
        repo = %build.repo,
        branch = %build.branch(),
        "Executing build"
    );

    if let Err(e) = ctx.store.update_status(build_id, BuildStatus::Running).await {
        tracing::error!(build_id, "Failed to mark build running: {e:#}");
        return;
    }

    let source = checkout_source(&ctx.config, &build);
    let cloned: Option<PathBuf> = source.is_remote().then(|| source.workspace().to_path_buf());
    let request = RunRequest {
        build_id,
        event: build.event.clone(),
        repository: build.repo.clone(),
        source,
    };
    let recorder = BuildRecorder {
        store: ctx.store.clone(),
        errors: ctx.errors.clone(),
        build_id,
    };

    let (status, description) = match ctx.runner.run(&ctx.workflow, &request, &recorder).await {
        Ok(report) if !report.triggered => (BuildStatus::Skipped, "No workflow jobs for this event"),
        Ok(report) => {
            let status = BuildStatus::from(report.conclusion);
            let description = match status {
                BuildStatus::Failure => "Build failed",
                _ => "Build passed",
            };
            (status, description)
        }
        Err(e) => {
            tracing::error!(build_id, "Workflow error: {e}");
            let summary = serde_json::json!({ "error": e.to_string() });
            if let Err(e) = ctx.store.set_summary(build_id, summary).await {
                tracing::warn!(build_id, "Failed to store build summary: {e:#}");
            }
            (BuildStatus::Failure, "Workflow error")
        }
    };

    if let Err(e) = ctx.store.update_status(build_id, status).await {
        tracing::error!(build_id, "Failed to finish build: {e:#}");
    }

    if let Ok(Some(finished)) = ctx.store.get_build(build_id).await {
        tracing::info!(
            build_id,
            status = finished.status.as_str(),
            duration_ms = finished.duration_ms.unwrap_or_default(),
            "Build finished"
        );
        ctx.reporter.report(&finished, description).await;
    }

    // Only clean up clones, never a local checkout.
    if let Some(workspace) = cloned {
        let _ = tokio::fs::remove_dir_all(&workspace).await;
    }
}
