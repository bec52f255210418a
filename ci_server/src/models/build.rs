//! A workflow run, triggered by a webhook or the API.

use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::executor::Conclusion;
use crate::models::build_step::JobRecord;
use crate::schema::ci_builds;
use crate::workflow::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failure,
    Skipped,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Running => "running",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Skipped => "skipped",
            BuildStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Pending | BuildStatus::Running)
    }

    /// Commit status state for the GitHub statuses API.
    pub fn github_state(&self) -> &'static str {
        match self {
            BuildStatus::Pending | BuildStatus::Running => "pending",
            BuildStatus::Success | BuildStatus::Skipped => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Cancelled => "error",
        }
    }
}

impl FromStr for BuildStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => BuildStatus::Pending,
            "running" => BuildStatus::Running,
            "success" => BuildStatus::Success,
            "failure" => BuildStatus::Failure,
            "skipped" => BuildStatus::Skipped,
            "cancelled" => BuildStatus::Cancelled,
            other => anyhow::bail!("unknown build status `{other}`"),
        })
    }
}

impl From<Conclusion> for BuildStatus {
    fn from(conclusion: Conclusion) -> Self {
        match conclusion {
            Conclusion::Success => BuildStatus::Success,
            Conclusion::Failure => BuildStatus::Failure,
            Conclusion::Skipped => BuildStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Build {
    pub id: i64,
    pub repo: String,
    #[serde(flatten)]
    pub event: Event,
    pub author: Option<String>,
    pub message: Option<String>,
    pub fingerprint: String,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
    pub jobs: Vec<JobRecord>,
}

impl Build {
    pub fn branch(&self) -> &str {
        self.event.branch()
    }
}

/// Input for `BuildStore::create_build`.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub repo: String,
    pub event: Event,
    pub author: Option<String>,
    pub message: Option<String>,
    pub fingerprint: String,
}

impl NewBuild {
    /// Dedup key: same commit, branch and trigger.
    pub fn fingerprint_for(event: &Event) -> String {
        match event {
            Event::Push { branch, sha } => format!("{sha}-{branch}-push"),
            Event::PullRequest {
                number,
                head_branch,
                sha,
                ..
            } => format!("{sha}-{head_branch}-pr{number}"),
            Event::Manual { branch, sha } => format!("{sha}-{branch}-manual"),
        }
    }
}

/// Row of `ci_builds`.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ci_builds)]
pub struct BuildRow {
    pub id: i64,
    pub repo: String,
    pub trigger_event: String,
    pub branch: String,
    pub base_branch: Option<String>,
    pub commit_sha: String,
    pub pr_number: Option<i64>,
    pub author: Option<String>,
    pub message: Option<String>,
    pub fingerprint: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub summary: Option<serde_json::Value>,
}

impl BuildRow {
    pub fn into_build(self, jobs: Vec<JobRecord>) -> anyhow::Result<Build> {
        let event = match self.trigger_event.as_str() {
            "push" => Event::Push {
                branch: self.branch,
                sha: self.commit_sha,
            },
            "pull_request" => Event::PullRequest {
                number: self
                    .pr_number
                    .and_then(|n| u64::try_from(n).ok())
                    .with_context(|| format!("build {} has no pull request number", self.id))?,
                base_branch: self.base_branch.unwrap_or_default(),
                head_branch: self.branch,
                sha: self.commit_sha,
            },
            "workflow_dispatch" => Event::Manual {
                branch: self.branch,
                sha: self.commit_sha,
            },
            other => anyhow::bail!("build {} has unknown trigger `{other}`", self.id),
        };

        Ok(Build {
            id: self.id,
            repo: self.repo,
            event,
            author: self.author,
            message: self.message,
            fingerprint: self.fingerprint,
            status: self.status.parse()?,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            duration_ms: self.duration_ms,
            summary: self.summary,
            jobs,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = ci_builds)]
pub struct NewBuildRow {
    pub repo: String,
    pub trigger_event: String,
    pub branch: String,
    pub base_branch: Option<String>,
    pub commit_sha: String,
    pub pr_number: Option<i64>,
    pub author: Option<String>,
    pub message: Option<String>,
    pub fingerprint: String,
    pub status: String,
}

impl From<NewBuild> for NewBuildRow {
    fn from(new: NewBuild) -> Self {
        let (base_branch, pr_number) = match &new.event {
            Event::PullRequest {
                number,
                base_branch,
                ..
            } => (Some(base_branch.clone()), i64::try_from(*number).ok()),
            Event::Push { .. } | Event::Manual { .. } => (None, None),
        };
        Self {
            trigger_event: new.event.name().to_string(),
            branch: new.event.branch().to_string(),
            commit_sha: new.event.sha().to_string(),
            base_branch,
            pr_number,
            repo: new.repo,
            author: new.author,
            message: new.message,
            fingerprint: new.fingerprint,
            status: BuildStatus::Pending.as_str().to_string(),
        }
    }
}
