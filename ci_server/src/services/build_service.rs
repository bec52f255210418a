//! Build bookkeeping: creation, throttling, status transitions and KPIs.
//!
//! Builds are stored in Postgres. Without a database they are kept in
//! memory, capped at `MEMORY_BUILD_LIMIT`, and lost on restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use crate::dashboard::kpi::{self, AvgBuildDuration, BuildSuccessRate, BuildsByStatus};
use crate::db::{self, DbPool};
use crate::executor::{Conclusion, JobReport, RunObserver, StepReport};
use crate::models::build::{Build, BuildRow, BuildStatus, NewBuild, NewBuildRow};
use crate::models::build_step::{millis, JobRecord, JobRow, NewJobRow, NewStepRow, StepRecord, StepRow};
use crate::schema::{ci_build_jobs, ci_build_steps, ci_builds};
use crate::services::error_service::ErrorStore;

/// Builds kept by the in-memory store; older finished builds are dropped.
pub const MEMORY_BUILD_LIMIT: usize = 500;

/// Build store shared by the routes and the executor.
#[derive(Clone)]
pub struct BuildStore {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Postgres(DbPool),
    Memory(Arc<RwLock<MemoryBuilds>>),
}

impl BuildStore {
    pub fn postgres(pool: DbPool) -> Self {
        Self {
            backend: Backend::Postgres(pool),
        }
    }

    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::default()),
        }
    }

    /// Create a new pending build record.
    pub async fn create_build(&self, new_build: NewBuild) -> anyhow::Result<Build> {
        let build = match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                insert_build(&mut conn, new_build).await?
            }
            Backend::Memory(builds) => write(builds).insert(new_build),
        };

        crate::metrics::build_status_changed(BuildStatus::Pending.as_str());
        tracing::info!(
            build_id = build.id,
            event = build.event.name(),
            branch = %build.branch(),
            "Build created"
        );
        Ok(build)
    }

    /// Check if a build with this fingerprint was created within the throttle window.
    pub async fn is_duplicate(&self, fingerprint: &str, throttle_secs: u64) -> anyhow::Result<bool> {
        let since = cutoff(i64::try_from(throttle_secs).ok().and_then(TimeDelta::try_seconds));
        match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                let count: i64 = ci_builds::table
                    .filter(ci_builds::fingerprint.eq(fingerprint))
                    .filter(ci_builds::created_at.gt(since))
                    .count()
                    .get_result(&mut conn)
                    .await?;
                Ok(count > 0)
            }
            Backend::Memory(builds) => Ok(read(builds)
                .by_id
                .values()
                .any(|b| b.fingerprint == fingerprint && b.created_at > since)),
        }
    }

    /// Move a build to `status`, stamping start and finish times.
    pub async fn update_status(&self, build_id: i64, status: BuildStatus) -> anyhow::Result<()> {
        let not_found = || anyhow::anyhow!("Build not found: {build_id}");
        let duration_ms = match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                let mut build = fetch_build(&mut conn, build_id)
                    .await?
                    .ok_or_else(not_found)?;
                stamp(&mut build, status);
                diesel::update(ci_builds::table.find(build_id))
                    .set((
                        ci_builds::status.eq(status.as_str()),
                        ci_builds::started_at.eq(build.started_at),
                        ci_builds::finished_at.eq(build.finished_at),
                        ci_builds::duration_ms.eq(build.duration_ms),
                    ))
                    .execute(&mut conn)
                    .await?;
                build.duration_ms
            }
            Backend::Memory(builds) => {
                let mut builds = write(builds);
                let build = builds.by_id.get_mut(&build_id).ok_or_else(not_found)?;
                stamp(build, status);
                build.duration_ms
            }
        };

        crate::metrics::build_status_changed(status.as_str());
        if let (true, Some(ms)) = (status.is_terminal(), duration_ms) {
            crate::metrics::build_duration(status.as_str(), u64::try_from(ms).unwrap_or_default());
        }
        Ok(())
    }

    /// Attach a JSON summary (e.g. an error that stopped the run).
    pub async fn set_summary(&self, build_id: i64, summary: serde_json::Value) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                diesel::update(ci_builds::table.find(build_id))
                    .set(ci_builds::summary.eq(Some(summary)))
                    .execute(&mut conn)
                    .await?;
            }
            Backend::Memory(builds) => {
                if let Some(build) = write(builds).by_id.get_mut(&build_id) {
                    build.summary = Some(summary);
                }
            }
        }
        Ok(())
    }

    /// A build with its jobs and steps.
    pub async fn get_build(&self, build_id: i64) -> anyhow::Result<Option<Build>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                let Some(mut build) = fetch_build(&mut conn, build_id).await? else {
                    return Ok(None);
                };
                build.jobs = load_jobs(&mut conn, build_id).await?;
                Ok(Some(build))
            }
            Backend::Memory(builds) => Ok(read(builds).by_id.get(&build_id).cloned()),
        }
    }

    /// Get the latest build for a branch.
    pub async fn get_latest(&self, branch: &str) -> anyhow::Result<Option<Build>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                let row = ci_builds::table
                    .filter(ci_builds::branch.eq(branch))
                    .order(ci_builds::id.desc())
                    .select(BuildRow::as_select())
                    .first(&mut conn)
                    .await
                    .optional()?;
                let Some(row) = row else {
                    return Ok(None);
                };
                let jobs = load_jobs(&mut conn, row.id).await?;
                Ok(Some(row.into_build(jobs)?))
            }
            Backend::Memory(builds) => Ok(read(builds)
                .by_id
                .values()
                .rev()
                .find(|b| b.branch() == branch)
                .cloned()),
        }
    }

    /// Newest first, without job detail.
    pub async fn list_builds(&self, limit: usize) -> anyhow::Result<Vec<Build>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                let rows: Vec<BuildRow> = ci_builds::table
                    .order(ci_builds::id.desc())
                    .limit(i64::try_from(limit).unwrap_or(i64::MAX))
                    .select(BuildRow::as_select())
                    .load(&mut conn)
                    .await?;
                rows.into_iter().map(|row| row.into_build(Vec::new())).collect()
            }
            Backend::Memory(builds) => Ok(read(builds)
                .by_id
                .values()
                .rev()
                .take(limit)
                .map(|b| Build {
                    jobs: Vec::new(),
                    ..b.clone()
                })
                .collect()),
        }
    }

    pub async fn start_job(&self, build_id: i64, job_key: &str, name: &str) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                diesel::insert_into(ci_build_jobs::table)
                    .values(&NewJobRow {
                        build_id,
                        job_key,
                        name,
                        status: BuildStatus::Running.as_str(),
                        duration_ms: None,
                    })
                    .execute(&mut conn)
                    .await?;
            }
            Backend::Memory(builds) => {
                if let Some(build) = write(builds).by_id.get_mut(&build_id) {
                    build.jobs.push(JobRecord {
                        id: job_key.to_string(),
                        name: name.to_string(),
                        status: BuildStatus::Running,
                        started_at: Utc::now(),
                        duration_ms: None,
                        steps: Vec::new(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Append a finished step to the job's latest attempt.
    pub async fn record_step(&self, build_id: i64, job_key: &str, step: &StepRecord) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                let job_id = current_job(&mut conn, build_id, job_key)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("job {job_key} of build {build_id} was never started"))?;
                diesel::insert_into(ci_build_steps::table)
                    .values(&NewStepRow::new(job_id, step))
                    .execute(&mut conn)
                    .await?;
            }
            Backend::Memory(builds) => {
                if let Some(job) = write(builds).job_mut(build_id, job_key) {
                    job.steps.push(step.clone());
                }
            }
        }
        Ok(())
    }

    /// Close a job. Jobs that never started (skipped) are recorded with their steps.
    pub async fn finish_job(&self, build_id: i64, report: &JobReport) -> anyhow::Result<()> {
        let status = BuildStatus::from(report.conclusion);
        let duration_ms = Some(millis(report.duration_ms));
        match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                if let Some(job_id) = current_job(&mut conn, build_id, &report.id).await? {
                    diesel::update(ci_build_jobs::table.find(job_id))
                        .set((
                            ci_build_jobs::status.eq(status.as_str()),
                            ci_build_jobs::duration_ms.eq(duration_ms),
                        ))
                        .execute(&mut conn)
                        .await?;
                    return Ok(());
                }

                let job_id: i64 = diesel::insert_into(ci_build_jobs::table)
                    .values(&NewJobRow {
                        build_id,
                        job_key: &report.id,
                        name: &report.name,
                        status: status.as_str(),
                        duration_ms,
                    })
                    .returning(ci_build_jobs::id)
                    .get_result(&mut conn)
                    .await?;
                let steps: Vec<StepRecord> = report.steps.iter().map(StepRecord::from).collect();
                if !steps.is_empty() {
                    let rows: Vec<NewStepRow<'_>> =
                        steps.iter().map(|s| NewStepRow::new(job_id, s)).collect();
                    diesel::insert_into(ci_build_steps::table)
                        .values(&rows)
                        .execute(&mut conn)
                        .await?;
                }
            }
            Backend::Memory(builds) => {
                let mut builds = write(builds);
                if let Some(job) = builds.job_mut(build_id, &report.id) {
                    job.status = status;
                    job.duration_ms = duration_ms;
                } else if let Some(build) = builds.by_id.get_mut(&build_id) {
                    build.jobs.push(JobRecord {
                        id: report.id.clone(),
                        name: report.name.clone(),
                        status,
                        started_at: Utc::now(),
                        duration_ms,
                        steps: report.steps.iter().map(StepRecord::from).collect(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Build success rate over N days (success vs failure only).
    pub async fn success_rate(&self, days: i32) -> anyhow::Result<BuildSuccessRate> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                kpi::query_success_rate(&mut conn, days).await
            }
            Backend::Memory(builds) => {
                let builds = read(builds);
                let recent = builds.created_since(days);
                let count = |status| recent.iter().filter(|b| b.status == status).count() as i64;
                let success = count(BuildStatus::Success);
                let total = success + count(BuildStatus::Failure);
                Ok(BuildSuccessRate {
                    total,
                    success,
                    rate: if total == 0 {
                        0.0
                    } else {
                        success as f64 / total as f64
                    },
                })
            }
        }
    }

    /// Average build duration over N days.
    pub async fn avg_duration(&self, days: i32) -> anyhow::Result<AvgBuildDuration> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                kpi::query_avg_duration(&mut conn, days).await
            }
            Backend::Memory(builds) => {
                let builds = read(builds);
                let durations: Vec<i64> = builds
                    .created_since(days)
                    .iter()
                    .filter_map(|b| b.duration_ms)
                    .collect();
                let count = durations.len() as i64;
                Ok(AvgBuildDuration {
                    avg_ms: (count > 0).then(|| durations.iter().sum::<i64>() as f64 / count as f64),
                    count,
                })
            }
        }
    }

    pub async fn builds_by_status(&self, days: i32) -> anyhow::Result<Vec<BuildsByStatus>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                kpi::query_builds_by_status(&mut conn, days).await
            }
            Backend::Memory(builds) => {
                let mut counts: HashMap<&'static str, i64> = HashMap::new();
                for build in read(builds).created_since(days) {
                    *counts.entry(build.status.as_str()).or_default() += 1;
                }
                let mut rows: Vec<BuildsByStatus> = counts
                    .into_iter()
                    .map(|(status, count)| BuildsByStatus {
                        status: status.to_string(),
                        count,
                    })
                    .collect();
                rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.status.cmp(&b.status)));
                Ok(rows)
            }
        }
    }
}

/// `now - span`; spans past the calendar's range reach back to the epoch.
fn cutoff(span: Option<TimeDelta>) -> DateTime<Utc> {
    span.and_then(|span| Utc::now().checked_sub_signed(span))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

fn stamp(build: &mut Build, status: BuildStatus) {
    let now = Utc::now();
    build.status = status;
    if status == BuildStatus::Running && build.started_at.is_none() {
        build.started_at = Some(now);
    }
    if status.is_terminal() {
        build.finished_at = Some(now);
        let start = build.started_at.unwrap_or(build.created_at);
        build.duration_ms = Some((now - start).num_milliseconds().max(0));
    }
}

async fn insert_build(conn: &mut AsyncPgConnection, new_build: NewBuild) -> anyhow::Result<Build> {
    let row = diesel::insert_into(ci_builds::table)
        .values(&NewBuildRow::from(new_build))
        .returning(BuildRow::as_returning())
        .get_result(conn)
        .await?;
    row.into_build(Vec::new())
}

async fn fetch_build(conn: &mut AsyncPgConnection, build_id: i64) -> anyhow::Result<Option<Build>> {
    let row = ci_builds::table
        .find(build_id)
        .select(BuildRow::as_select())
        .first(conn)
        .await
        .optional()?;
    row.map(|row| row.into_build(Vec::new())).transpose()
}

/// Id of the newest attempt of `job_key` in a build.
async fn current_job(
    conn: &mut AsyncPgConnection,
    build_id: i64,
    job_key: &str,
) -> anyhow::Result<Option<i64>> {
    let id = ci_build_jobs::table
        .filter(ci_build_jobs::build_id.eq(build_id))
        .filter(ci_build_jobs::job_key.eq(job_key))
        .order(ci_build_jobs::id.desc())
        .select(ci_build_jobs::id)
        .first(conn)
        .await
        .optional()?;
    Ok(id)
}

async fn load_jobs(conn: &mut AsyncPgConnection, build_id: i64) -> anyhow::Result<Vec<JobRecord>> {
    let jobs: Vec<JobRow> = ci_build_jobs::table
        .filter(ci_build_jobs::build_id.eq(build_id))
        .order(ci_build_jobs::id.asc())
        .select(JobRow::as_select())
        .load(conn)
        .await?;
    let job_ids: Vec<i64> = jobs.iter().map(|j| j.id).collect();
    let steps: Vec<StepRow> = ci_build_steps::table
        .filter(ci_build_steps::job_id.eq_any(job_ids))
        .order((ci_build_steps::job_id.asc(), ci_build_steps::sequence.asc()))
        .select(StepRow::as_select())
        .load(conn)
        .await?;

    let mut by_job: HashMap<i64, Vec<StepRecord>> = HashMap::new();
    for step in steps {
        by_job.entry(step.job_id).or_default().push(step.try_into()?);
    }
    jobs.into_iter()
        .map(|job| {
            let steps = by_job.remove(&job.id).unwrap_or_default();
            job.into_record(steps)
        })
        .collect()
}

#[derive(Default)]
struct MemoryBuilds {
    next_id: i64,
    by_id: BTreeMap<i64, Build>,
}

impl MemoryBuilds {
    fn insert(&mut self, new_build: NewBuild) -> Build {
        self.next_id += 1;
        let build = Build {
            id: self.next_id,
            repo: new_build.repo,
            event: new_build.event,
            author: new_build.author,
            message: new_build.message,
            fingerprint: new_build.fingerprint,
            status: BuildStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            summary: None,
            jobs: Vec::new(),
        };
        self.by_id.insert(build.id, build.clone());
        self.evict();
        build
    }

    /// Drop the oldest finished builds beyond the limit.
    fn evict(&mut self) {
        while self.by_id.len() > MEMORY_BUILD_LIMIT {
            let oldest = self
                .by_id
                .values()
                .find(|b| b.status.is_terminal())
                .map(|b| b.id);
            match oldest {
                Some(id) => self.by_id.remove(&id),
                None => break,
            };
        }
    }

    fn job_mut(&mut self, build_id: i64, job_key: &str) -> Option<&mut JobRecord> {
        self.by_id
            .get_mut(&build_id)
            .and_then(|b| b.jobs.iter_mut().rev().find(|j| j.id == job_key))
    }

    fn created_since(&self, days: i32) -> Vec<&Build> {
        let since = cutoff(TimeDelta::try_days(i64::from(days.max(0))));
        self.by_id.values().filter(|b| b.created_at >= since).collect()
    }
}

fn read(builds: &RwLock<MemoryBuilds>) -> RwLockReadGuard<'_, MemoryBuilds> {
    builds.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(builds: &RwLock<MemoryBuilds>) -> RwLockWriteGuard<'_, MemoryBuilds> {
    builds.write().unwrap_or_else(PoisonError::into_inner)
}

/// Records workflow progress against one build.
pub struct BuildRecorder {
    pub store: BuildStore,
    pub errors: ErrorStore,
    pub build_id: i64,
}

#[async_trait]
impl RunObserver for BuildRecorder {
    async fn job_started(&self, job_id: &str, name: &str) {
        if let Err(e) = self.store.start_job(self.build_id, job_id, name).await {
            tracing::warn!(build_id = self.build_id, job = job_id, "Failed to record job start: {e:#}");
        }
    }

    async fn step_finished(&self, job_id: &str, step: &StepReport) {
        if step.conclusion == Conclusion::Failure {
            let output = if step.stderr.trim().is_empty() {
                &step.stdout
            } else {
                &step.stderr
            };
            if let Err(e) = self
                .errors
                .record_error(self.build_id, job_id, &step.name, output)
                .await
            {
                tracing::warn!(build_id = self.build_id, job = job_id, "Failed to record error: {e:#}");
            }
        }
        if let Err(e) = self
            .store
            .record_step(self.build_id, job_id, &StepRecord::from(step))
            .await
        {
            tracing::warn!(build_id = self.build_id, job = job_id, "Failed to record step: {e:#}");
        }
    }

    async fn job_finished(&self, report: &JobReport) {
        if let Err(e) = self.store.finish_job(self.build_id, report).await {
            tracing::warn!(build_id = self.build_id, job = %report.id, "Failed to record job result: {e:#}");
        }
    }
}
