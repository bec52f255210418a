//! GitHub webhook handler: receives push/PR events, creates builds.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};

use crate::models::build::{BuildStatus, NewBuild};
use crate::routes::CiRouterState;
use crate::services::github_service;
use crate::workflow::Event;

/// A webhook payload reduced to what a build needs.
#[derive(Debug, PartialEq)]
pub struct ParsedEvent {
    pub repo: String,
    pub event: Event,
    pub author: Option<String>,
    pub message: Option<String>,
}

/// Handle an incoming GitHub webhook payload.
pub async fn handle_webhook(
    state: &CiRouterState,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !github_service::validate_signature(&state.config.github_webhook_secret, &body, signature) {
        tracing::warn!("Webhook signature validation failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let payload: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    let parsed = match event_type {
        "push" => parse_push(&payload),
        "pull_request" => parse_pull_request(&payload),
        "ping" => {
            tracing::info!("Received GitHub ping webhook");
            return Ok(StatusCode::OK);
        }
        _ => {
            tracing::debug!("Ignoring webhook event: {}", event_type);
            return Ok(StatusCode::OK);
        }
    };

    match parsed {
        Some(parsed) => create_build(state, parsed).await,
        None => Ok(StatusCode::OK),
    }
}

pub fn parse_push(payload: &serde_json::Value) -> Option<ParsedEvent> {
    if payload["deleted"].as_bool().unwrap_or(false) {
        return None;
    }
    let sha = payload["after"].as_str().filter(|s| !s.is_empty())?;
    let branch = payload["ref"]
        .as_str()?
        .strip_prefix("refs/heads/")
        .filter(|b| !b.is_empty())?;

    Some(ParsedEvent {
        repo: payload["repository"]["full_name"].as_str()?.to_string(),
        event: Event::Push {
            branch: branch.to_string(),
            sha: sha.to_string(),
        },
        author: payload["pusher"]["name"].as_str().map(str::to_string),
        message: payload["head_commit"]["message"].as_str().map(str::to_string),
    })
}

pub fn parse_pull_request(payload: &serde_json::Value) -> Option<ParsedEvent> {
    let action = payload["action"].as_str().unwrap_or_default();
    if !matches!(action, "opened" | "synchronize" | "reopened") {
        return None;
    }

    let pr = &payload["pull_request"];
    let sha = pr["head"]["sha"].as_str().filter(|s| !s.is_empty())?;
    let head_branch = pr["head"]["ref"].as_str().filter(|s| !s.is_empty())?;
    let base_branch = pr["base"]["ref"].as_str().filter(|s| !s.is_empty())?;

    Some(ParsedEvent {
        repo: payload["repository"]["full_name"].as_str()?.to_string(),
        event: Event::PullRequest {
            number: payload["number"].as_u64()?,
            base_branch: base_branch.to_string(),
            head_branch: head_branch.to_string(),
            sha: sha.to_string(),
        },
        author: pr["user"]["login"].as_str().map(str::to_string),
        message: pr["title"].as_str().map(str::to_string),
    })
}

async fn create_build(state: &CiRouterState, parsed: ParsedEvent) -> Result<StatusCode, StatusCode> {
    if !parsed.repo.eq_ignore_ascii_case(&state.config.github_repo) {
        tracing::debug!("Ignoring webhook for unconfigured repo: {}", parsed.repo);
        return Ok(StatusCode::OK);
    }

    if !state.workflow.on.matches(&parsed.event) {
        tracing::debug!(
            event = parsed.event.name(),
            branch = parsed.event.branch(),
            "Event does not match workflow triggers"
        );
        return Ok(StatusCode::OK);
    }

    let fingerprint = NewBuild::fingerprint_for(&parsed.event);
    let duplicate = state
        .store
        .is_duplicate(&fingerprint, state.config.throttle_window_secs)
        .await
        .map_err(|e| {
            tracing::error!("Throttle check failed: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    if duplicate {
        tracing::info!("Duplicate build throttled: {}", fingerprint);
        return Ok(StatusCode::OK);
    }

    let build = state
        .store
        .create_build(NewBuild {
            repo: parsed.repo,
            event: parsed.event,
            author: parsed.author,
            message: parsed.message,
            fingerprint,
        })
        .await
        .map_err(|e| {
            tracing::error!("Failed to create build: {e:#}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    enqueue(state, build.id).await
}

/// Queue a freshly created build and report it as pending.
pub async fn enqueue(state: &CiRouterState, build_id: i64) -> Result<StatusCode, StatusCode> {
    if let Err(e) = state.queue.enqueue(build_id) {
        tracing::error!(build_id, "Failed to queue build: {e}");
        if let Err(e) = state.store.update_status(build_id, BuildStatus::Cancelled).await {
            tracing::warn!(build_id, "Failed to cancel unqueued build: {e:#}");
        }
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    if let Ok(Some(build)) = state.store.get_build(build_id).await {
        state.reporter.report(&build, "Build queued").await;
    }
    Ok(StatusCode::CREATED)
}
