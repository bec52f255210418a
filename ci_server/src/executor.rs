//! Workflow executor: runs the jobs of a workflow for one event.
//!
//! Jobs run one after another in dependency order. Steps run sequentially as
//! shell commands or built-in actions; the first failing step fails the job
//! and the remaining steps are skipped. Jobs whose `needs` did not succeed are
//! skipped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::actions::{self, Action, ActionContext, CheckoutSource, PendingSave};
use crate::cache::{self, CacheStore};
use crate::secrets::{LogRedactor, Secrets};
use crate::workflow::expr::{ExprError, JobState, Scope};
use crate::workflow::{Event, Job, JobGraph, Step, Workflow, WorkflowError};

/// Bytes kept from the tail of each output stream.
pub const MAX_OUTPUT_BYTES: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conclusion {
    Success,
    Failure,
    Skipped,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    pub sequence: usize,
    pub conclusion: Conclusion,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
}

impl StepReport {
    fn skipped(name: String, sequence: usize, reason: &str) -> Self {
        Self {
            name,
            sequence,
            conclusion: Conclusion::Skipped,
            exit_code: None,
            duration_ms: 0,
            stdout: String::new(),
            stderr: reason.to_string(),
        }
    }

    fn errored(name: String, sequence: usize, message: String) -> Self {
        Self {
            name,
            sequence,
            conclusion: Conclusion::Failure,
            exit_code: Some(-1),
            duration_ms: 0,
            stdout: String::new(),
            stderr: message,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub id: String,
    pub name: String,
    pub conclusion: Conclusion,
    pub duration_ms: u64,
    pub steps: Vec<StepReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// False when the event did not match the workflow's triggers.
    pub triggered: bool,
    pub conclusion: Conclusion,
    pub duration_ms: u64,
    pub jobs: Vec<JobReport>,
}

impl RunReport {
    pub fn job(&self, id: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.id == id)
    }

    pub fn succeeded(&self) -> bool {
        self.conclusion != Conclusion::Failure
    }
}

/// Progress callbacks, used by the server to record build state.
#[async_trait]
pub trait RunObserver: Send + Sync {
    async fn job_started(&self, _job_id: &str, _name: &str) {}
    async fn step_finished(&self, _job_id: &str, _step: &StepReport) {}
    async fn job_finished(&self, _job: &JobReport) {}
}

pub struct NoopObserver;

#[async_trait]
impl RunObserver for NoopObserver {}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub build_id: i64,
    pub event: Event,
    /// `owner/name`, exposed as `github.repository`.
    pub repository: String,
    pub source: CheckoutSource,
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub cache: CacheStore,
    pub default_step_timeout: Duration,
    /// Scratch space for `GITHUB_ENV` / `GITHUB_PATH` files.
    pub temp_dir: PathBuf,
}

pub struct WorkflowRunner {
    settings: RunnerSettings,
    secrets: Secrets,
    redactor: LogRedactor,
}

/// Expression scope with the `github` and `runner` contexts for an event.
pub fn event_scope(
    event: &Event,
    repository: &str,
    workspace: &Path,
    run_id: i64,
    temp_dir: &Path,
    secrets: Secrets,
) -> Scope {
    let mut github = BTreeMap::new();
    github.insert("ref".to_string(), event.git_ref());
    github.insert("ref_name".to_string(), event.ref_name());
    github.insert("sha".to_string(), event.sha().to_string());
    github.insert("event_name".to_string(), event.name().to_string());
    github.insert("repository".to_string(), repository.to_string());
    github.insert("workspace".to_string(), workspace.display().to_string());
    github.insert("run_id".to_string(), run_id.to_string());
    if let Event::PullRequest {
        base_branch,
        head_branch,
        ..
    } = event
    {
        github.insert("base_ref".to_string(), base_branch.clone());
        github.insert("head_ref".to_string(), head_branch.clone());
    }

    let mut runner = BTreeMap::new();
    runner.insert("os".to_string(), cache::runner_os().to_string());
    runner.insert("temp".to_string(), temp_dir.display().to_string());

    Scope {
        github,
        runner,
        secrets,
        workspace: workspace.to_path_buf(),
        ..Scope::default()
    }
}

/// Interpolate `vars` in order, each visible to the ones after it.
fn extend_env(scope: &mut Scope, vars: &IndexMap<String, String>) -> Result<(), ExprError> {
    for (key, value) in vars {
        let value = scope.interpolate(value)?;
        scope.env.insert(key.clone(), value);
    }
    Ok(())
}

impl WorkflowRunner {
    pub fn new(settings: RunnerSettings, secrets: Secrets) -> Self {
        let redactor = secrets.redactor();
        Self {
            settings,
            secrets,
            redactor,
        }
    }

    pub async fn run(
        &self,
        workflow: &Workflow,
        request: &RunRequest,
        observer: &dyn RunObserver,
    ) -> Result<RunReport, WorkflowError> {
        let start = Instant::now();

        if !workflow.on.matches(&request.event) {
            tracing::info!(
                build_id = request.build_id,
                event = request.event.name(),
                branch = request.event.branch(),
                "Event does not match workflow triggers"
            );
            return Ok(RunReport {
                triggered: false,
                conclusion: Conclusion::Skipped,
                duration_ms: 0,
                jobs: Vec::new(),
            });
        }

        let graph = JobGraph::from_workflow(workflow)?;
        let mut results: BTreeMap<String, String> = BTreeMap::new();
        let mut jobs = Vec::new();

        for job_id in graph.execution_order() {
            let job = &workflow.jobs[&job_id];
            let mut scope = event_scope(
                &request.event,
                &request.repository,
                request.source.workspace(),
                request.build_id,
                &self.settings.temp_dir,
                self.secrets.clone(),
            );
            scope.github.insert("job".to_string(), job_id.clone());

            for dependency in graph.dependencies(&job_id) {
                let result = results
                    .get(&dependency)
                    .cloned()
                    .unwrap_or_else(|| Conclusion::Skipped.as_str().to_string());
                if result != Conclusion::Success.as_str() {
                    scope.state.failed = true;
                }
                scope.needs.insert(dependency, result);
            }

            let condition = extend_env(&mut scope, &workflow.env)
                .and_then(|()| scope.condition(job.if_cond.as_deref()));

            let report = match condition {
                Ok(true) => {
                    let run = JobRun::new(self, workflow, request, &job_id, job, scope);
                    run.execute(observer).await
                }
                Ok(false) => {
                    tracing::info!(
                        build_id = request.build_id,
                        job = %job_id,
                        "Job skipped (condition not met or dependency did not succeed)"
                    );
                    JobReport {
                        id: job_id.clone(),
                        name: job.display_name(&job_id),
                        conclusion: Conclusion::Skipped,
                        duration_ms: 0,
                        steps: Vec::new(),
                    }
                }
                Err(e) => {
                    tracing::error!(build_id = request.build_id, job = %job_id, "Invalid job condition: {e}");
                    JobReport {
                        id: job_id.clone(),
                        name: job.display_name(&job_id),
                        conclusion: Conclusion::Failure,
                        duration_ms: 0,
                        steps: vec![StepReport::errored(
                            "Evaluate job condition".to_string(),
                            1,
                            e.to_string(),
                        )],
                    }
                }
            };

            observer.job_finished(&report).await;
            results.insert(job_id.clone(), report.conclusion.as_str().to_string());
            jobs.push(report);
        }

        let conclusion = if jobs.iter().any(|j| j.conclusion == Conclusion::Failure) {
            Conclusion::Failure
        } else {
            Conclusion::Success
        };

        Ok(RunReport {
            triggered: true,
            conclusion,
            duration_ms: start.elapsed().as_millis() as u64,
            jobs,
        })
    }
}

/// Mutable state of one executing job.
struct JobRun<'a> {
    runner: &'a WorkflowRunner,
    workflow: &'a Workflow,
    request: &'a RunRequest,
    job_id: &'a str,
    job: &'a Job,
    scope: Scope,
    temp_dir: PathBuf,
    path_prepend: Vec<PathBuf>,
    pending_saves: Vec<PendingSave>,
}

struct CommandOutcome {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl<'a> JobRun<'a> {
    fn new(
        runner: &'a WorkflowRunner,
        workflow: &'a Workflow,
        request: &'a RunRequest,
        job_id: &'a str,
        job: &'a Job,
        scope: Scope,
    ) -> Self {
        let temp_dir = runner
            .settings
            .temp_dir
            .join(format!("{}-{job_id}", request.build_id));
        Self {
            runner,
            workflow,
            request,
            job_id,
            job,
            scope,
            temp_dir,
            path_prepend: Vec::new(),
            pending_saves: Vec::new(),
        }
    }

    async fn execute(mut self, observer: &dyn RunObserver) -> JobReport {
        let start = Instant::now();
        let build_id = self.request.build_id;
        let name = self.job.display_name(self.job_id);
        observer.job_started(self.job_id, &name).await;
        tracing::info!(build_id, job = %self.job_id, "Job started");

        self.scope.state = JobState::default();
        let mut steps = Vec::with_capacity(self.job.steps.len());
        let mut failed = false;

        let setup = match tokio::fs::create_dir_all(&self.temp_dir).await {
            Ok(()) => extend_env(&mut self.scope, &self.job.env).map_err(|e| e.to_string()),
            Err(e) => Err(format!("failed to create {}: {e}", self.temp_dir.display())),
        };
        if let Err(message) = setup {
            let report = StepReport::errored("Set up job".to_string(), 1, message);
            observer.step_finished(self.job_id, &report).await;
            steps.push(report);
            failed = true;
        }

        let offset = steps.len();
        for (index, step) in self.job.steps.iter().enumerate() {
            let sequence = offset + index + 1;
            self.scope.state.failed = failed;
            let step_name = self.runner.redactor.redact(
                &self
                    .scope
                    .interpolate(&step.display_name())
                    .unwrap_or_else(|_| step.display_name()),
            );

            let report = match self.scope.condition(step.if_cond.as_deref()) {
                Ok(false) => {
                    let reason = if failed {
                        "Skipped (previous step failed)"
                    } else {
                        "Skipped (condition not met)"
                    };
                    StepReport::skipped(step_name, sequence, reason)
                }
                Err(e) => StepReport::errored(step_name, sequence, e.to_string()),
                Ok(true) => self.run_step(step, step_name, sequence).await,
            };

            let outcome = report.conclusion;
            if outcome == Conclusion::Failure {
                if step.continue_on_error {
                    tracing::warn!(build_id, job = %self.job_id, step = %report.name, "Step failed, continuing on error");
                } else {
                    failed = true;
                }
            }
            if let Some(id) = &step.id {
                self.scope
                    .steps
                    .insert(id.clone(), outcome.as_str().to_string());
            }

            observer.step_finished(self.job_id, &report).await;
            steps.push(report);
        }

        if !failed {
            self.save_caches().await;
        }
        let _ = tokio::fs::remove_dir_all(&self.temp_dir).await;

        let conclusion = if failed {
            Conclusion::Failure
        } else {
            Conclusion::Success
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(build_id, job = %self.job_id, conclusion = conclusion.as_str(), duration_ms, "Job finished");

        JobReport {
            id: self.job_id.to_string(),
            name,
            conclusion,
            duration_ms,
            steps,
        }
    }

    async fn run_step(&mut self, step: &Step, name: String, sequence: usize) -> StepReport {
        let start = Instant::now();
        let build_id = self.request.build_id;

        // Step env is visible to the step's own expressions.
        let mut scope = self.scope.clone();
        if let Err(e) = extend_env(&mut scope, &step.env) {
            return StepReport::errored(name, sequence, e.to_string());
        }

        let result = match (&step.uses, &step.run) {
            (Some(uses), _) => self.run_action(uses, step, &scope).await,
            (None, Some(script)) => self.run_script(script, step, &scope).await,
            (None, None) => Err("step needs `uses` or `run`".to_string()),
        };

        let outcome = result.unwrap_or_else(|message| CommandOutcome {
            exit_code: -1,
            stdout: String::new(),
            stderr: message,
        });

        let duration_ms = start.elapsed().as_millis() as u64;
        crate::metrics::step_duration(self.job_id, &name, duration_ms);

        let conclusion = if outcome.exit_code == 0 {
            tracing::info!(build_id, job = %self.job_id, step = %name, duration_ms, "Step passed");
            Conclusion::Success
        } else {
            tracing::warn!(build_id, job = %self.job_id, step = %name, exit_code = outcome.exit_code, "Step failed");
            Conclusion::Failure
        };

        StepReport {
            name,
            sequence,
            conclusion,
            exit_code: Some(outcome.exit_code),
            duration_ms,
            stdout: truncate_output(self.runner.redactor.redact(&outcome.stdout)),
            stderr: truncate_output(self.runner.redactor.redact(&outcome.stderr)),
        }
    }

    fn current_path(&self) -> String {
        let mut parts: Vec<String> = self
            .path_prepend
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        if let Ok(path) = std::env::var("PATH") {
            parts.push(path);
        }
        parts.join(":")
    }

    fn timeout(&self, step: &Step) -> Duration {
        step.timeout_minutes
            .or(self.job.timeout_minutes)
            .map(|m| Duration::from_secs(m * 60))
            .unwrap_or(self.runner.settings.default_step_timeout)
    }

    async fn run_action(
        &mut self,
        uses: &str,
        step: &Step,
        scope: &Scope,
    ) -> Result<CommandOutcome, String> {
        let action =
            Action::parse(uses).ok_or_else(|| format!("unsupported action `{uses}`"))?;

        let mut with = IndexMap::new();
        for (key, value) in &step.with {
            with.insert(key.clone(), scope.interpolate(value).map_err(|e| e.to_string())?);
        }

        tracing::info!(build_id = self.request.build_id, job = %self.job_id, action = uses, "Running action");

        let path = self.current_path();
        let ctx = ActionContext {
            source: &self.request.source,
            event: &self.request.event,
            cache: &self.runner.settings.cache,
            path: &path,
        };

        let run = actions::run(action, &ctx, &with);
        let output = match tokio::time::timeout(self.timeout(step), run).await {
            Ok(result) => result.map_err(|e| format!("{e:#}"))?,
            Err(_) => return Err(format!("Action timed out after {:?}", self.timeout(step))),
        };

        // Newest entries take precedence.
        for dir in output.path_prepend.into_iter().rev() {
            self.path_prepend.insert(0, dir);
        }
        for (key, value) in output.env {
            self.scope.env.insert(key, value);
        }
        self.pending_saves.extend(output.post_save);

        Ok(CommandOutcome {
            exit_code: 0,
            stdout: output.stdout,
            stderr: String::new(),
        })
    }

    async fn run_script(
        &mut self,
        script: &str,
        step: &Step,
        scope: &Scope,
    ) -> Result<CommandOutcome, String> {
        let script = scope.interpolate(script).map_err(|e| e.to_string())?;

        let workspace = self.request.source.workspace();
        let cwd = match self.job.working_directory(step, self.workflow) {
            Some(dir) => workspace.join(scope.interpolate(dir).map_err(|e| e.to_string())?),
            None => workspace.to_path_buf(),
        };

        let env_file = self.temp_dir.join(format!("step-{}.env", command_file_stem(step)));
        let path_file = env_file.with_extension("path");
        for file in [&env_file, &path_file] {
            tokio::fs::write(file, b"")
                .await
                .map_err(|e| format!("failed to create {}: {e}", file.display()))?;
        }

        let mut env = self.runner_env(scope);
        env.insert("GITHUB_ENV".to_string(), env_file.display().to_string());
        env.insert("GITHUB_PATH".to_string(), path_file.display().to_string());
        env.insert("PATH".to_string(), self.current_path());

        tracing::info!(
            build_id = self.request.build_id,
            job = %self.job_id,
            command = %self.runner.redactor.redact(&script),
            cwd = %cwd.display(),
            "Running step"
        );

        let timeout = self.timeout(step);
        let mut cmd = Command::new("bash");
        cmd.args(["--noprofile", "--norc", "-eo", "pipefail", "-c", &script])
            .current_dir(&cwd)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so a timeout takes down everything the script started.
        #[cfg(unix)]
        cmd.process_group(0);

        let outcome = match cmd.spawn() {
            Err(e) => CommandOutcome {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("Failed to execute command: {e}"),
            },
            Ok(child) => {
                let pgid = child.id();
                match tokio::time::timeout(timeout, child.wait_with_output()).await {
                    Ok(Ok(output)) => CommandOutcome {
                        exit_code: output.status.code().unwrap_or(-1),
                        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    },
                    Ok(Err(e)) => CommandOutcome {
                        exit_code: -1,
                        stdout: String::new(),
                        stderr: format!("Failed to execute command: {e}"),
                    },
                    Err(_) => {
                        kill_process_group(pgid);
                        tracing::warn!(
                            build_id = self.request.build_id,
                            job = %self.job_id,
                            timeout = ?timeout,
                            "Step timed out, killed its process group"
                        );
                        CommandOutcome {
                            exit_code: -1,
                            stdout: String::new(),
                            stderr: format!("Step timed out after {timeout:?}"),
                        }
                    }
                }
            }
        };

        if let Ok(content) = tokio::fs::read_to_string(&env_file).await {
            for (key, value) in parse_env_file(&content) {
                self.scope.env.insert(key, value);
            }
        }
        if let Ok(content) = tokio::fs::read_to_string(&path_file).await {
            for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
                self.path_prepend.insert(0, PathBuf::from(line));
            }
        }

        Ok(outcome)
    }

    /// Runner-provided variables plus the `env` context.
    fn runner_env(&self, scope: &Scope) -> IndexMap<String, String> {
        let event = &self.request.event;
        let mut env = IndexMap::new();
        env.insert("CI".to_string(), "true".to_string());
        env.insert("CI_BUILD_ID".to_string(), self.request.build_id.to_string());
        env.insert("CI_BRANCH".to_string(), event.branch().to_string());
        env.insert("CI_COMMIT".to_string(), event.sha().to_string());
        env.insert(
            "GITHUB_WORKSPACE".to_string(),
            self.request.source.workspace().display().to_string(),
        );
        env.insert("GITHUB_REF".to_string(), event.git_ref());
        env.insert("GITHUB_REF_NAME".to_string(), event.ref_name());
        env.insert("GITHUB_SHA".to_string(), event.sha().to_string());
        env.insert("GITHUB_EVENT_NAME".to_string(), event.name().to_string());
        env.insert("GITHUB_REPOSITORY".to_string(), self.request.repository.clone());
        env.insert("GITHUB_JOB".to_string(), self.job_id.to_string());
        env.insert("RUNNER_OS".to_string(), cache::runner_os().to_string());
        env.insert("RUNNER_TEMP".to_string(), self.temp_dir.display().to_string());
        for (key, value) in &scope.env {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    async fn save_caches(&mut self) {
        for save in std::mem::take(&mut self.pending_saves) {
            let store = self.runner.settings.cache.clone();
            let key = save.key.clone();
            let result =
                tokio::task::spawn_blocking(move || store.save(&save.paths, &save.key)).await;
            match result {
                Ok(Ok(true)) => tracing::info!(build_id = self.request.build_id, key = %key, "Cache saved"),
                Ok(Ok(false)) => tracing::debug!(key = %key, "Cache entry exists or nothing to save"),
                Ok(Err(e)) => tracing::warn!(key = %key, "Cache save failed: {e:#}"),
                Err(e) => tracing::warn!(key = %key, "Cache save task failed: {e}"),
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: Option<u32>) {
    let Some(pgid) = pgid.and_then(|id| libc::pid_t::try_from(id).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created by process_group(0).
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(pgid, "killpg failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: Option<u32>) {}

/// Unique-enough file stem for a step's command files.
fn command_file_stem(step: &Step) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    match &step.id {
        Some(id) => format!("{id}-{n}"),
        None => n.to_string(),
    }
}

/// Parse `KEY=VALUE` lines and `KEY<<DELIM` blocks from a `GITHUB_ENV` file.
pub fn parse_env_file(content: &str) -> IndexMap<String, String> {
    let mut vars = IndexMap::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        if let Some((key, delimiter)) = line.split_once("<<") {
            if !key.contains('=') {
                let mut value = Vec::new();
                for body in lines.by_ref() {
                    if body == delimiter {
                        break;
                    }
                    value.push(body);
                }
                vars.insert(key.trim().to_string(), value.join("\n"));
                continue;
            }
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if !key.is_empty() {
                vars.insert(key.to_string(), value.to_string());
            }
        }
    }

    vars
}

fn truncate_output(text: String) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text;
    }
    let mut start = text.len() - MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...truncated...\n{}", &text[start..])
}

/// What a run would do for `event`, assuming every job succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedJob {
    pub id: String,
    pub name: String,
    pub runs: bool,
    pub needs: Vec<String>,
}

/// Plan the jobs for an event. `None` when the triggers do not match.
pub fn plan(
    workflow: &Workflow,
    event: &Event,
    repository: &str,
    workspace: &Path,
) -> Result<Option<Vec<PlannedJob>>, WorkflowError> {
    if !workflow.on.matches(event) {
        return Ok(None);
    }

    let graph = JobGraph::from_workflow(workflow)?;
    let mut runs: BTreeMap<String, bool> = BTreeMap::new();
    let mut planned = Vec::new();

    for job_id in graph.execution_order() {
        let job = &workflow.jobs[&job_id];
        let mut scope = event_scope(
            event,
            repository,
            workspace,
            0,
            &std::env::temp_dir(),
            Secrets::default(),
        );
        let needs = graph.dependencies(&job_id);
        for dependency in &needs {
            let ran = runs.get(dependency).copied().unwrap_or(false);
            if !ran {
                scope.state.failed = true;
            }
            let result = if ran { "success" } else { "skipped" };
            scope.needs.insert(dependency.clone(), result.to_string());
        }

        // Conditions that cannot be evaluated statically count as "runs".
        let will_run = scope.condition(job.if_cond.as_deref()).unwrap_or(true);
        runs.insert(job_id.clone(), will_run);
        planned.push(PlannedJob {
            name: job.display_name(&job_id),
            id: job_id,
            runs: will_run,
            needs,
        });
    }

    Ok(Some(planned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Fixture {
        _cache: tempfile::TempDir,
        _temp: tempfile::TempDir,
        workspace: tempfile::TempDir,
        runner: WorkflowRunner,
    }

    fn fixture(secrets: Secrets) -> Fixture {
        let cache_dir = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let workspace = tempfile::tempdir().unwrap();
        let runner = WorkflowRunner::new(
            RunnerSettings {
                cache: CacheStore::new(cache_dir.path()),
                default_step_timeout: Duration::from_secs(30),
                temp_dir: temp.path().to_path_buf(),
            },
            secrets,
        );
        Fixture {
            _cache: cache_dir,
            _temp: temp,
            workspace,
            runner,
        }
    }

    fn request(fx: &Fixture, event: Event) -> RunRequest {
        RunRequest {
            build_id: 1,
            event,
            repository: "birthnon/bscore".to_string(),
            source: CheckoutSource::Local {
                path: fx.workspace.path().to_path_buf(),
                pull: false,
            },
        }
    }

    fn push(branch: &str) -> Event {
        Event::Push {
            branch: branch.to_string(),
            sha: "0123456789abcdef".to_string(),
        }
    }

    fn pull_request() -> Event {
        Event::PullRequest {
            number: 4,
            base_branch: "main".to_string(),
            head_branch: "feature/x".to_string(),
            sha: "fedcba9876543210".to_string(),
        }
    }

    /// Same job graph and gating as the BIRTHNON workflow, with portable commands.
    fn pipeline(test_command: &str) -> Workflow {
        Workflow::from_yaml(&format!(
            r#"
on:
  push:
    branches: [main]
  pull_request:
    branches: [main]
env:
  PYTHON_VERSION: "3.12.7"
jobs:
  test:
    steps:
      - name: Install dependencies
        run: echo "installing for $PYTHON_VERSION"
      - name: Run migrations
        run: echo migrate
      - name: Run tests
        run: {test_command}
      - name: After tests
        run: echo after
  deploy:
    needs: test
    if: github.ref == 'refs/heads/main'
    steps:
      - name: Collect static files
        run: echo collectstatic
      - name: Deploy to server
        run: echo "${{{{ secrets.DO_USERNAME || 'root' }}}}@${{{{ secrets.DO_HOST }}}}"
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_push_to_main_deploys_after_tests() {
        let fx = fixture(Secrets::from_pairs([("DO_HOST", "203.0.113.9")]));
        let report = fx
            .runner
            .run(&pipeline("echo ok"), &request(&fx, push("main")), &NoopObserver)
            .await
            .unwrap();

        assert!(report.triggered);
        assert_eq!(report.conclusion, Conclusion::Success);
        let order: Vec<&str> = report.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(order, vec!["test", "deploy"]);

        let test = report.job("test").unwrap();
        assert!(test.steps.iter().all(|s| s.conclusion == Conclusion::Success));
        assert!(test.steps[0].stdout.contains("installing for 3.12.7"));

        let deploy = report.job("deploy").unwrap();
        assert_eq!(deploy.conclusion, Conclusion::Success);
        assert_eq!(deploy.steps[1].stdout.trim(), "root@***");
    }

    #[tokio::test]
    async fn test_failing_tests_prevent_deploy() {
        let fx = fixture(Secrets::default());
        let report = fx
            .runner
            .run(&pipeline("exit 3"), &request(&fx, push("main")), &NoopObserver)
            .await
            .unwrap();

        assert_eq!(report.conclusion, Conclusion::Failure);
        let test = report.job("test").unwrap();
        assert_eq!(test.conclusion, Conclusion::Failure);
        assert_eq!(test.steps[2].exit_code, Some(3));
        assert_eq!(test.steps[3].conclusion, Conclusion::Skipped);
        assert_eq!(test.steps[3].stderr, "Skipped (previous step failed)");

        let deploy = report.job("deploy").unwrap();
        assert_eq!(deploy.conclusion, Conclusion::Skipped);
        assert!(deploy.steps.is_empty());
    }

    #[tokio::test]
    async fn test_pull_request_tests_without_deploy() {
        let fx = fixture(Secrets::default());
        let report = fx
            .runner
            .run(&pipeline("echo ok"), &request(&fx, pull_request()), &NoopObserver)
            .await
            .unwrap();

        assert_eq!(report.conclusion, Conclusion::Success);
        assert_eq!(report.job("test").unwrap().conclusion, Conclusion::Success);
        assert_eq!(report.job("deploy").unwrap().conclusion, Conclusion::Skipped);
    }

    #[tokio::test]
    async fn test_other_branch_not_triggered() {
        let fx = fixture(Secrets::default());
        let report = fx
            .runner
            .run(&pipeline("echo ok"), &request(&fx, push("develop")), &NoopObserver)
            .await
            .unwrap();
        assert!(!report.triggered);
        assert!(report.jobs.is_empty());
    }

    #[tokio::test]
    async fn test_env_and_path_files_carry_to_later_steps() {
        let fx = fixture(Secrets::default());
        std::fs::create_dir_all(fx.workspace.path().join("tools")).unwrap();
        let wf = Workflow::from_yaml(
            r#"
on: push
jobs:
  build:
    steps:
      - run: |
          echo "DJANGO_SETTINGS_MODULE=bscore.settings" >> "$GITHUB_ENV"
          echo "$GITHUB_WORKSPACE/tools" >> "$GITHUB_PATH"
      - run: |
          echo "$DJANGO_SETTINGS_MODULE"
          echo "$PATH" | cut -d: -f1
      - run: echo "${{ env.DJANGO_SETTINGS_MODULE }}"
"#,
        )
        .unwrap();

        let report = fx
            .runner
            .run(&wf, &request(&fx, push("main")), &NoopObserver)
            .await
            .unwrap();
        let steps = &report.job("build").unwrap().steps;
        let lines: Vec<&str> = steps[1].stdout.lines().collect();
        assert_eq!(lines[0], "bscore.settings");
        assert_eq!(
            lines[1],
            fx.workspace.path().join("tools").display().to_string()
        );
        assert_eq!(steps[2].stdout.trim(), "bscore.settings");
    }

    #[tokio::test]
    async fn test_working_directory_and_runner_env() {
        let fx = fixture(Secrets::default());
        std::fs::create_dir_all(fx.workspace.path().join("bscore")).unwrap();
        let wf = Workflow::from_yaml(
            r#"
on: push
jobs:
  test:
    steps:
      - working-directory: bscore
        run: |
          basename "$PWD"
          echo "$CI $GITHUB_REF $CI_BRANCH $GITHUB_EVENT_NAME"
"#,
        )
        .unwrap();

        let report = fx
            .runner
            .run(&wf, &request(&fx, push("main")), &NoopObserver)
            .await
            .unwrap();
        let stdout = &report.job("test").unwrap().steps[0].stdout;
        assert_eq!(stdout, "bscore\ntrue refs/heads/main main push\n");
    }

    #[tokio::test]
    async fn test_always_and_continue_on_error() {
        let fx = fixture(Secrets::default());
        let wf = Workflow::from_yaml(
            r#"
on: push
jobs:
  test:
    steps:
      - id: flaky
        run: exit 1
        continue-on-error: true
      - run: echo still-running
      - run: exit 2
      - if: always()
        run: echo cleanup
      - if: failure()
        run: echo report-failure
      - run: echo never
"#,
        )
        .unwrap();

        let report = fx
            .runner
            .run(&wf, &request(&fx, push("main")), &NoopObserver)
            .await
            .unwrap();
        let job = report.job("test").unwrap();
        let conclusions: Vec<Conclusion> = job.steps.iter().map(|s| s.conclusion).collect();
        assert_eq!(
            conclusions,
            vec![
                Conclusion::Failure,
                Conclusion::Success,
                Conclusion::Failure,
                Conclusion::Success,
                Conclusion::Success,
                Conclusion::Skipped,
            ]
        );
        assert_eq!(job.conclusion, Conclusion::Failure);
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let fx = fixture(Secrets::default());
        let runner = WorkflowRunner::new(
            RunnerSettings {
                default_step_timeout: Duration::from_millis(200),
                ..fx.runner.settings.clone()
            },
            Secrets::default(),
        );
        let wf = Workflow::from_yaml("on: push\njobs:\n  t:\n    steps:\n      - run: sleep 5\n")
            .unwrap();

        let report = runner
            .run(&wf, &request(&fx, push("main")), &NoopObserver)
            .await
            .unwrap();
        let step = &report.job("t").unwrap().steps[0];
        assert_eq!(step.conclusion, Conclusion::Failure);
        assert!(step.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let fx = fixture(Secrets::default());
        let runner = WorkflowRunner::new(
            RunnerSettings {
                default_step_timeout: Duration::from_millis(300),
                ..fx.runner.settings.clone()
            },
            Secrets::default(),
        );
        let wf = Workflow::from_yaml(
            "on: push\njobs:\n  t:\n    steps:\n      - run: sh -c 'sleep 1; touch marker'\n",
        )
        .unwrap();

        let report = runner
            .run(&wf, &request(&fx, push("main")), &NoopObserver)
            .await
            .unwrap();
        let step = &report.job("t").unwrap().steps[0];
        assert_eq!(step.conclusion, Conclusion::Failure);
        assert!(step.stderr.contains("300ms"), "{}", step.stderr);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!fx.workspace.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_secret_in_step_name_is_masked() {
        let fx = fixture(Secrets::from_pairs([("DO_HOST", "203.0.113.9")]));
        let wf = Workflow::from_yaml(
            r#"
on: push
jobs:
  deploy:
    steps:
      - name: Deploy to ${{ secrets.DO_HOST }}
        run: "true"
"#,
        )
        .unwrap();
        let recorder = Recorder::default();
        let report = fx
            .runner
            .run(&wf, &request(&fx, push("main")), &recorder)
            .await
            .unwrap();

        assert_eq!(report.job("deploy").unwrap().steps[0].name, "Deploy to ***");
        assert!(recorder.names.lock().unwrap().iter().all(|n| !n.contains("203.0.113.9")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_setup_python_rejects_mismatched_interpreter() {
        use std::os::unix::fs::PermissionsExt;

        let fx = fixture(Secrets::default());
        let stub_dir = fx.workspace.path().join("stub");
        std::fs::create_dir_all(&stub_dir).unwrap();
        let stub = stub_dir.join("python3.99");
        std::fs::write(&stub, "#!/bin/sh\necho 'Python 3.11.9'\n").unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let wf = Workflow::from_yaml(
            r#"
on: push
jobs:
  test:
    steps:
      - run: echo "$GITHUB_WORKSPACE/stub" >> "$GITHUB_PATH"
      - uses: actions/setup-python@v5
        with:
          python-version: "3.99.1"
      - run: echo never
"#,
        )
        .unwrap();
        let report = fx
            .runner
            .run(&wf, &request(&fx, push("main")), &NoopObserver)
            .await
            .unwrap();

        let job = report.job("test").unwrap();
        assert_eq!(job.conclusion, Conclusion::Failure);
        let setup = &job.steps[1];
        assert_eq!(setup.conclusion, Conclusion::Failure);
        assert!(setup.stderr.contains("no Python interpreter matching 3.99.1"), "{}", setup.stderr);
        assert!(setup.stderr.contains("Python 3.11.9"), "{}", setup.stderr);
        assert_eq!(job.steps[2].conclusion, Conclusion::Skipped);
    }

    #[tokio::test]
    async fn test_unsupported_action_fails_step() {
        let fx = fixture(Secrets::default());
        let wf = Workflow::from_yaml(
            "on: push\njobs:\n  t:\n    steps:\n      - uses: docker/login-action@v3\n",
        )
        .unwrap();
        let report = fx
            .runner
            .run(&wf, &request(&fx, push("main")), &NoopObserver)
            .await
            .unwrap();
        let step = &report.job("t").unwrap().steps[0];
        assert_eq!(step.conclusion, Conclusion::Failure);
        assert!(step.stderr.contains("unsupported action"));
    }

    #[tokio::test]
    async fn test_cache_saved_after_successful_job() {
        let fx = fixture(Secrets::default());
        let wf = Workflow::from_yaml(
            r#"
on: push
jobs:
  t:
    steps:
      - uses: actions/cache@v4
        with:
          path: pip-cache
          key: ${{ runner.os }}-pip-fixed
      - run: mkdir -p pip-cache && echo wheel > pip-cache/pkg.whl
"#,
        )
        .unwrap();

        let report = fx
            .runner
            .run(&wf, &request(&fx, push("main")), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(report.conclusion, Conclusion::Success);

        let key = format!("{}-pip-fixed", cache::runner_os());
        assert!(fx.runner.settings.cache.find(&key, &[]).unwrap().is_exact());
    }

    #[tokio::test]
    async fn test_failed_job_does_not_save_cache() {
        let fx = fixture(Secrets::default());
        let wf = Workflow::from_yaml(
            r#"
on: push
jobs:
  t:
    steps:
      - uses: actions/cache@v4
        with:
          path: pip-cache
          key: ${{ runner.os }}-pip-broken
      - run: mkdir -p pip-cache && echo wheel > pip-cache/pkg.whl && exit 1
"#,
        )
        .unwrap();

        let report = fx
            .runner
            .run(&wf, &request(&fx, push("main")), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(report.conclusion, Conclusion::Failure);

        let key = format!("{}-pip-broken", cache::runner_os());
        assert!(matches!(
            fx.runner.settings.cache.find(&key, &[]).unwrap(),
            cache::CacheOutcome::Miss
        ));
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        names: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RunObserver for Recorder {
        async fn job_started(&self, job_id: &str, _name: &str) {
            self.events.lock().unwrap().push(format!("start {job_id}"));
        }
        async fn step_finished(&self, job_id: &str, step: &StepReport) {
            self.names.lock().unwrap().push(step.name.clone());
            self.events
                .lock()
                .unwrap()
                .push(format!("step {job_id}#{} {}", step.sequence, step.conclusion.as_str()));
        }
        async fn job_finished(&self, job: &JobReport) {
            self.events
                .lock()
                .unwrap()
                .push(format!("finish {} {}", job.id, job.conclusion.as_str()));
        }
    }

    #[tokio::test]
    async fn test_observer_sees_progress() {
        let fx = fixture(Secrets::default());
        let recorder = Recorder::default();
        fx.runner
            .run(&pipeline("exit 1"), &request(&fx, push("main")), &recorder)
            .await
            .unwrap();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "start test",
                "step test#1 success",
                "step test#2 success",
                "step test#3 failure",
                "step test#4 skipped",
                "finish test failure",
                "finish deploy skipped",
            ]
        );
    }

    #[test]
    fn test_plan_for_birthnon() {
        let wf = Workflow::birthnon().unwrap();
        let ws = Path::new("/work");

        let on_main = plan(&wf, &push("main"), "birthnon/bscore", ws).unwrap().unwrap();
        assert_eq!(
            on_main.iter().map(|j| (j.id.as_str(), j.runs)).collect::<Vec<_>>(),
            vec![("test", true), ("deploy", true)]
        );
        assert_eq!(on_main[1].needs, vec!["test"]);

        let on_pr = plan(&wf, &pull_request(), "birthnon/bscore", ws).unwrap().unwrap();
        assert_eq!(
            on_pr.iter().map(|j| (j.id.as_str(), j.runs)).collect::<Vec<_>>(),
            vec![("test", true), ("deploy", false)]
        );

        assert!(plan(&wf, &push("develop"), "birthnon/bscore", ws)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_env_file() {
        let vars = parse_env_file("A=1\nB=x=y\n\nNOTES<<EOF\nline one\nline two\nEOF\nC=3\n");
        assert_eq!(vars["A"], "1");
        assert_eq!(vars["B"], "x=y");
        assert_eq!(vars["NOTES"], "line one\nline two");
        assert_eq!(vars["C"], "3");
    }

    #[test]
    fn test_truncate_output_keeps_tail() {
        let long = format!("{}END", "é".repeat(MAX_OUTPUT_BYTES));
        let truncated = truncate_output(long);
        assert!(truncated.starts_with("...truncated...\n"));
        assert!(truncated.ends_with("END"));
        assert!(truncated.len() <= MAX_OUTPUT_BYTES + "...truncated...\n".len());
    }
}
