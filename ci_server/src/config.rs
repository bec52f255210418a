//! CI server configuration: loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct CiConfig {
    /// GitHub webhook secret for HMAC validation.
    pub github_webhook_secret: String,
    /// GitHub personal access token for commit statuses.
    pub github_token: String,
    /// Throttle window in seconds between duplicate builds.
    pub throttle_window_secs: u64,
    /// Maximum number of builds running at once.
    pub max_concurrent_builds: usize,
    /// Base URL for GitHub status links.
    pub dashboard_url: String,
    /// Parent directory for per-build clones.
    pub workspace_dir: PathBuf,
    /// Root of the `actions/cache` store.
    pub cache_dir: PathBuf,
    /// Default step timeout when the workflow sets none.
    pub step_timeout_secs: u64,
    /// Run against this checkout (with `git pull`) instead of cloning.
    pub local_path: Option<PathBuf>,
    /// `owner/name` of the repository the workflow belongs to.
    pub github_repo: String,
    /// Workflow file to load instead of the built-in one.
    pub workflow_path: Option<PathBuf>,
    /// Postgres URL for build history. Unset keeps history in memory.
    pub database_url: Option<String>,
    pub db_pool_size: usize,
}

impl CiConfig {
    pub fn from_env() -> Self {
        let config = Self::from_lookup(|key| std::env::var(key).ok());

        if config.github_webhook_secret.is_empty() {
            tracing::warn!("CI_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }
        if config.github_token.is_empty() {
            tracing::warn!("CI_GITHUB_TOKEN not set -- GitHub status updates disabled");
        }
        if config.database_url.is_none() {
            tracing::warn!("DATABASE_URL not set -- build history is kept in memory only");
        }

        config
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(value: Option<String>, default: T) -> T {
            value.and_then(|s| s.parse().ok()).unwrap_or(default)
        }

        let github_webhook_secret = lookup("CI_WEBHOOK_SECRET").unwrap_or_default();
        let github_token = lookup("CI_GITHUB_TOKEN").unwrap_or_default();
        let throttle_window_secs = parsed(lookup("CI_THROTTLE_WINDOW"), 60);
        let max_concurrent_builds = parsed(lookup("CI_MAX_CONCURRENT"), 1usize).max(1);
        let dashboard_url = lookup("CI_DASHBOARD_URL")
            .unwrap_or_else(|| "http://localhost:9090".to_string());
        let workspace_dir = lookup("CI_WORKSPACE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("birthnon-ci").join("workspaces"));
        let cache_dir = lookup("CI_CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs::cache_dir().map(|d| d.join("birthnon-ci")))
            .unwrap_or_else(|| std::env::temp_dir().join("birthnon-ci").join("cache"));
        let step_timeout_secs = parsed(lookup("CI_STEP_TIMEOUT"), 3600);
        let local_path = lookup("CI_LOCAL_PATH")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let github_repo =
            lookup("CI_GITHUB_REPO").unwrap_or_else(|| "birthnon/birthnon".to_string());
        let workflow_path = lookup("CI_WORKFLOW")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let database_url = lookup("DATABASE_URL").filter(|s| !s.is_empty());
        let db_pool_size = parsed(lookup("CI_DB_POOL_SIZE"), 8usize).max(1);

        Self {
            github_webhook_secret,
            github_token,
            throttle_window_secs,
            max_concurrent_builds,
            dashboard_url,
            workspace_dir,
            cache_dir,
            step_timeout_secs,
            local_path,
            github_repo,
            workflow_path,
            database_url,
            db_pool_size,
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CiConfig::from_lookup(|_| None);
        assert!(config.github_webhook_secret.is_empty());
        assert_eq!(config.throttle_window_secs, 60);
        assert_eq!(config.max_concurrent_builds, 1);
        assert_eq!(config.step_timeout(), Duration::from_secs(3600));
        assert!(config.local_path.is_none());
        assert!(config.workflow_path.is_none());
        assert_eq!(config.github_repo, "birthnon/birthnon");
        assert!(config.database_url.is_none());
        assert_eq!(config.db_pool_size, 8);
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("CI_WEBHOOK_SECRET", "s3cret"),
            ("CI_THROTTLE_WINDOW", "5"),
            ("CI_MAX_CONCURRENT", "0"),
            ("CI_STEP_TIMEOUT", "not-a-number"),
            ("CI_LOCAL_PATH", "/srv/birthnon"),
            ("CI_CACHE_DIR", "/var/cache/ci"),
            ("DATABASE_URL", "postgres://ci@localhost/ci"),
            ("CI_DB_POOL_SIZE", "0"),
        ]);
        let config = CiConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.github_webhook_secret, "s3cret");
        assert_eq!(config.throttle_window_secs, 5);
        // Zero would stall the executor.
        assert_eq!(config.max_concurrent_builds, 1);
        assert_eq!(config.step_timeout_secs, 3600);
        assert_eq!(config.local_path, Some(PathBuf::from("/srv/birthnon")));
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/ci"));
        assert_eq!(config.database_url.as_deref(), Some("postgres://ci@localhost/ci"));
        assert_eq!(config.db_pool_size, 1);
    }
}
