//! Per-job and per-step progress of a build.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::executor::StepReport;
use crate::models::build::BuildStatus;
use crate::schema::{ci_build_jobs, ci_build_steps};

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub steps: Vec<StepRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub sequence: i32,
    pub status: BuildStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: i64,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

impl From<&StepReport> for StepRecord {
    fn from(report: &StepReport) -> Self {
        Self {
            name: report.name.clone(),
            sequence: i32::try_from(report.sequence).unwrap_or(i32::MAX),
            status: report.conclusion.into(),
            exit_code: report.exit_code,
            duration_ms: millis(report.duration_ms),
            finished_at: Utc::now(),
            stdout: report.stdout.clone(),
            stderr: report.stderr.clone(),
        }
    }
}

/// Clamp a `u64` millisecond count into a BIGINT column.
pub fn millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ci_build_jobs)]
pub struct JobRow {
    pub id: i64,
    pub job_key: String,
    pub name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
}

impl JobRow {
    pub fn into_record(self, steps: Vec<StepRecord>) -> anyhow::Result<JobRecord> {
        Ok(JobRecord {
            id: self.job_key,
            name: self.name,
            status: self.status.parse()?,
            started_at: self.started_at,
            duration_ms: self.duration_ms,
            steps,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = ci_build_jobs)]
pub struct NewJobRow<'a> {
    pub build_id: i64,
    pub job_key: &'a str,
    pub name: &'a str,
    pub status: &'a str,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ci_build_steps)]
pub struct StepRow {
    pub job_id: i64,
    pub name: String,
    pub sequence: i32,
    pub status: String,
    pub exit_code: Option<i32>,
    pub duration_ms: i64,
    pub finished_at: DateTime<Utc>,
    pub stdout: String,
    pub stderr: String,
}

impl TryFrom<StepRow> for StepRecord {
    type Error = anyhow::Error;

    fn try_from(row: StepRow) -> anyhow::Result<Self> {
        Ok(Self {
            name: row.name,
            sequence: row.sequence,
            status: row.status.parse()?,
            exit_code: row.exit_code,
            duration_ms: row.duration_ms,
            finished_at: row.finished_at,
            stdout: row.stdout,
            stderr: row.stderr,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = ci_build_steps)]
pub struct NewStepRow<'a> {
    pub job_id: i64,
    pub name: &'a str,
    pub sequence: i32,
    pub status: &'a str,
    pub exit_code: Option<i32>,
    pub duration_ms: i64,
    pub finished_at: DateTime<Utc>,
    pub stdout: &'a str,
    pub stderr: &'a str,
}

impl<'a> NewStepRow<'a> {
    pub fn new(job_id: i64, step: &'a StepRecord) -> Self {
        Self {
            job_id,
            name: &step.name,
            sequence: step.sequence,
            status: step.status.as_str(),
            exit_code: step.exit_code,
            duration_ms: step.duration_ms,
            finished_at: step.finished_at,
            stdout: &step.stdout,
            stderr: &step.stderr,
        }
    }
}
