//! REST API for builds.

use serde::{Deserialize, Serialize};

use crate::models::build::{Build, BuildStatus, NewBuild};
use crate::services::build_service::BuildStore;
use crate::workflow::Event;

const MAX_LIST_LIMIT: usize = 100;

/// Request body for manually triggering a build.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerRequest {
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
}

/// Response for a triggered build.
#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub id: i64,
    pub status: BuildStatus,
}

/// Create a manual build; the caller enqueues it.
pub async fn trigger_build(
    store: &BuildStore,
    repo: &str,
    req: TriggerRequest,
) -> anyhow::Result<Build> {
    let event = Event::Manual {
        branch: req
            .branch
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "main".to_string()),
        sha: req
            .commit_sha
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "HEAD".to_string()),
    };

    store
        .create_build(NewBuild {
            repo: repo.to_string(),
            fingerprint: NewBuild::fingerprint_for(&event),
            event,
            author: Some("manual".to_string()),
            message: Some("Manual trigger via API".to_string()),
        })
        .await
}

/// List builds, newest first, with a capped limit.
pub async fn list_builds(store: &BuildStore, limit: Option<usize>) -> anyhow::Result<Vec<Build>> {
    store
        .list_builds(limit.unwrap_or(20).min(MAX_LIST_LIMIT))
        .await
}
