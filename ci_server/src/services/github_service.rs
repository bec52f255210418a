//! GitHub integration: webhook validation and commit statuses.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::models::build::{Build, BuildStatus};

type HmacSha256 = Hmac<Sha256>;

/// Status context shown on commits and pull requests.
pub const STATUS_CONTEXT: &str = "birthnon-ci";

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let Some(sig) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// Posts commit statuses for builds. A no-op without a token.
#[derive(Clone)]
pub struct StatusReporter {
    client: reqwest::Client,
    token: String,
    dashboard_url: String,
}

impl StatusReporter {
    pub fn new(token: &str, dashboard_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.to_string(),
            dashboard_url: dashboard_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn target_url(&self, build_id: i64) -> String {
        format!("{}/api/builds/{build_id}", self.dashboard_url)
    }

    /// Report the build's current status. Failures are logged, never returned.
    pub async fn report(&self, build: &Build, description: &str) {
        if let Err(e) = self
            .post_status(
                &build.repo,
                build.event.sha(),
                build.status,
                description,
                &self.target_url(build.id),
            )
            .await
        {
            tracing::warn!(build_id = build.id, "GitHub status update failed: {e:#}");
        }
    }

    pub async fn post_status(
        &self,
        repo: &str,
        sha: &str,
        status: BuildStatus,
        description: &str,
        target_url: &str,
    ) -> anyhow::Result<()> {
        if self.token.is_empty() {
            tracing::debug!("GitHub token not set, skipping status update");
            return Ok(());
        }

        let url = format!("https://api.github.com/repos/{repo}/statuses/{sha}");
        let body = serde_json::json!({
            "state": status.github_state(),
            "description": description,
            "target_url": target_url,
            "context": STATUS_CONTEXT,
        });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", STATUS_CONTEXT)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("{status} {text}");
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
