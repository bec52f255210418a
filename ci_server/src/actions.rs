//! Built-in implementations of the `uses:` actions the workflow relies on.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use indexmap::IndexMap;
use tokio::process::Command;

use crate::cache::{self, CacheOutcome, CacheStore};
use crate::workflow::Event;

/// Where a run gets its source tree from.
#[derive(Debug, Clone)]
pub enum CheckoutSource {
    /// An existing working copy, optionally refreshed with `git pull --ff-only`.
    Local { path: PathBuf, pull: bool },
    /// Cloned into `workspace` from `clone_url`.
    Remote { clone_url: String, workspace: PathBuf },
}

impl CheckoutSource {
    pub fn workspace(&self) -> &Path {
        match self {
            CheckoutSource::Local { path, .. } => path,
            CheckoutSource::Remote { workspace, .. } => workspace,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, CheckoutSource::Remote { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Checkout,
    SetupPython,
    Cache,
}

impl Action {
    /// Resolve `owner/name@ref`; the ref is ignored.
    pub fn parse(uses: &str) -> Option<Self> {
        let name = uses.split('@').next().unwrap_or(uses).trim();
        match name {
            "actions/checkout" => Some(Action::Checkout),
            "actions/setup-python" => Some(Action::SetupPython),
            "actions/cache" => Some(Action::Cache),
            _ => None,
        }
    }
}

/// Cache entry to write once the job has succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSave {
    pub paths: Vec<PathBuf>,
    pub key: String,
}

#[derive(Debug, Default)]
pub struct ActionOutput {
    pub stdout: String,
    /// Directories to prepend to `PATH` for the rest of the job.
    pub path_prepend: Vec<PathBuf>,
    /// Variables exported to the rest of the job.
    pub env: IndexMap<String, String>,
    pub post_save: Option<PendingSave>,
}

pub struct ActionContext<'a> {
    pub source: &'a CheckoutSource,
    pub event: &'a Event,
    pub cache: &'a CacheStore,
    /// `PATH` as the step would see it.
    pub path: &'a str,
}

/// Run an action with already-interpolated `with:` inputs.
pub async fn run(
    action: Action,
    ctx: &ActionContext<'_>,
    with: &IndexMap<String, String>,
) -> anyhow::Result<ActionOutput> {
    match action {
        Action::Checkout => checkout(ctx).await,
        Action::SetupPython => setup_python(ctx, with).await,
        Action::Cache => restore_cache(ctx, with).await,
    }
}

async fn git(args: &[&str], cwd: Option<&Path>) -> anyhow::Result<std::process::Output> {
    let mut cmd = Command::new("git");
    cmd.args(args).kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.output()
        .await
        .with_context(|| format!("failed to run git {}", args.join(" ")))
}

/// Run git and fail unless it exits zero. Returns trimmed stdout.
async fn git_ok(args: &[&str], cwd: Option<&Path>) -> anyhow::Result<String> {
    let output = git(args, cwd).await?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// The commit a build is pinned to; `None` for symbolic refs such as `HEAD`.
fn pinned_sha(event: &Event) -> Option<&str> {
    let sha = event.sha();
    (sha.len() >= 7 && sha.chars().all(|c| c.is_ascii_hexdigit())).then_some(sha)
}

async fn checkout(ctx: &ActionContext<'_>) -> anyhow::Result<ActionOutput> {
    let branch = ctx.event.branch();
    let pinned = pinned_sha(ctx.event);
    let workspace = ctx.source.workspace();

    match ctx.source {
        CheckoutSource::Local { path, pull } => {
            if !path.is_dir() {
                bail!("source directory {} does not exist", path.display());
            }
            if *pull {
                git_ok(&["fetch", "--quiet", "origin"], Some(path.as_path())).await?;
                let target = pinned.map_or_else(|| format!("origin/{branch}"), str::to_string);
                git_ok(&["checkout", "--force", "--detach", &target], Some(path.as_path()))
                    .await
                    .with_context(|| format!("cannot check out {target}"))?;
            }
        }
        CheckoutSource::Remote { clone_url, .. } => {
            if workspace.join(".git").is_dir() {
                git_ok(&["fetch", "--depth", "1", "origin", branch], Some(workspace)).await?;
                git_ok(&["checkout", "--force", "FETCH_HEAD"], Some(workspace)).await?;
            } else {
                tokio::fs::create_dir_all(workspace).await?;
                let target = workspace.to_string_lossy();
                git_ok(
                    &[
                        "clone",
                        "--depth",
                        "1",
                        "--branch",
                        branch,
                        clone_url.as_str(),
                        target.as_ref(),
                    ],
                    None,
                )
                .await?;
            }

            if let Some(sha) = pinned {
                let head = git_ok(&["rev-parse", "HEAD"], Some(workspace)).await?;
                if !head.starts_with(sha) {
                    git_ok(&["fetch", "--depth", "1", "origin", sha], Some(workspace))
                        .await
                        .with_context(|| format!("commit {sha} is not available from origin"))?;
                    git_ok(&["checkout", "--force", "FETCH_HEAD"], Some(workspace)).await?;
                }
            }
        }
    }

    // Whatever the mode, the tree under test must be the build's commit.
    let head = match (pinned, git_ok(&["rev-parse", "HEAD"], Some(workspace)).await) {
        (Some(sha), Ok(head)) if !head.starts_with(sha) => {
            bail!("checkout is at {head} but the build is for {sha}")
        }
        (Some(sha), Err(e)) => {
            return Err(e.context(format!("cannot verify {sha} in {}", workspace.display())))
        }
        (_, Ok(head)) => Some(head),
        (None, Err(_)) => None,
    };

    let stdout = match head {
        Some(head) => format!("Checked out {branch} at {head} in {}\n", workspace.display()),
        None => format!("Using local source {}\n", workspace.display()),
    };
    Ok(ActionOutput {
        stdout,
        ..ActionOutput::default()
    })
}

/// Directory of the job-local virtualenv.
pub const VENV_DIR: &str = ".birthnon-venv";

/// Whether `python --version` output satisfies a requested version such as
/// `3.12.7`, `3.12` or `3.x`.
pub fn version_matches(reported: &str, requested: &str) -> bool {
    let Some(actual) = reported.split_whitespace().nth(1) else {
        return false;
    };
    let wanted: Vec<&str> = requested.trim().split('.').collect();
    let actual: Vec<&str> = actual.split('.').collect();
    if wanted.len() > actual.len() {
        return false;
    }
    wanted
        .iter()
        .zip(&actual)
        .all(|(w, a)| *w == "x" || *w == "*" || w == a)
}

async fn setup_python(
    ctx: &ActionContext<'_>,
    with: &IndexMap<String, String>,
) -> anyhow::Result<ActionOutput> {
    let requested = with
        .get("python-version")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .context("setup-python requires `python-version`")?;

    let minor: Vec<&str> = requested.split('.').take(2).collect();
    let candidates = [format!("python{}", minor.join(".")), "python3".to_string(), "python".to_string()];

    let mut found = Vec::new();
    let mut interpreter = None;
    for candidate in &candidates {
        let output = Command::new(candidate)
            .arg("--version")
            .env("PATH", ctx.path)
            .output()
            .await;
        let Ok(output) = output else { continue };
        let reported = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
        .trim()
        .to_string();
        if version_matches(&reported, &requested) {
            interpreter = Some((candidate.clone(), reported));
            break;
        }
        found.push(reported);
    }

    let Some((python, reported)) = interpreter else {
        bail!(
            "no Python interpreter matching {requested} (found: {})",
            if found.is_empty() { "none".to_string() } else { found.join(", ") }
        );
    };

    let venv = ctx.source.workspace().join(VENV_DIR);
    if !venv.join("bin").is_dir() {
        let output = Command::new(&python)
            .args(["-m", "venv"])
            .arg(&venv)
            .env("PATH", ctx.path)
            .output()
            .await
            .context("failed to create virtualenv")?;
        if !output.status.success() {
            bail!(
                "virtualenv creation failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }

    let mut out = ActionOutput {
        stdout: format!("Using {reported} ({python}) in {}\n", venv.display()),
        path_prepend: vec![venv.join("bin")],
        ..ActionOutput::default()
    };
    out.env
        .insert("pythonLocation".to_string(), venv.display().to_string());
    out.env
        .insert("VIRTUAL_ENV".to_string(), venv.display().to_string());
    Ok(out)
}

async fn restore_cache(
    ctx: &ActionContext<'_>,
    with: &IndexMap<String, String>,
) -> anyhow::Result<ActionOutput> {
    let key = with
        .get("key")
        .map(|k| k.trim().to_string())
        .context("cache requires `key`")?;
    let raw_paths = with.get("path").context("cache requires `path`")?;
    let workspace = ctx.source.workspace();
    let paths: Vec<PathBuf> = cache::parse_list(raw_paths)
        .iter()
        .map(|p| cache::expand_path(p, workspace))
        .collect();
    if paths.is_empty() {
        bail!("cache `path` is empty");
    }
    let restore_keys = with
        .get("restore-keys")
        .map(|k| cache::parse_list(k))
        .unwrap_or_default();

    cache::validate_key(&key)?;

    // A broken entry must not fail the build; it is reported and treated as a miss.
    let store = ctx.cache.clone();
    let restored = {
        let (paths, key) = (paths.clone(), key.clone());
        tokio::task::spawn_blocking(move || store.restore(&paths, &key, &restore_keys)).await
    };
    let mut warning = String::new();
    let outcome = match restored {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            tracing::warn!(key = %key, "Cache restore failed, continuing without cache: {e:#}");
            warning = format!("Warning: cache restore failed: {e:#}\n");
            CacheOutcome::Miss
        }
        Err(e) => {
            tracing::warn!(key = %key, "Cache restore task failed: {e}");
            warning = format!("Warning: cache restore failed: {e}\n");
            CacheOutcome::Miss
        }
    };

    let (stdout, label) = match &outcome {
        CacheOutcome::Exact(k) => (format!("Cache restored from key: {k}\n"), "hit"),
        CacheOutcome::Partial(k) => (format!("Cache restored from restore key: {k}\n"), "partial"),
        CacheOutcome::Miss => (format!("{warning}Cache not found for input keys: {key}\n"), "miss"),
    };
    crate::metrics::cache_lookup(label);

    Ok(ActionOutput {
        stdout,
        post_save: (!outcome.is_exact()).then(|| PendingSave { paths, key }),
        ..ActionOutput::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Event {
        Event::Push {
            branch: "main".to_string(),
            sha: "HEAD".to_string(),
        }
    }

    #[test]
    fn test_parse_action() {
        assert_eq!(Action::parse("actions/checkout@v4"), Some(Action::Checkout));
        assert_eq!(Action::parse("actions/setup-python@v5"), Some(Action::SetupPython));
        assert_eq!(Action::parse("actions/cache@v4"), Some(Action::Cache));
        assert_eq!(Action::parse("docker/login-action@v3"), None);
    }

    #[test]
    fn test_version_matches() {
        assert!(version_matches("Python 3.12.7", "3.12.7"));
        assert!(version_matches("Python 3.12.7", "3.12"));
        assert!(version_matches("Python 3.12.7", "3.x"));
        assert!(!version_matches("Python 3.11.9", "3.12"));
        assert!(!version_matches("Python 3.12", "3.12.7"));
        assert!(!version_matches("garbage", "3.12"));
    }

    #[tokio::test]
    async fn test_local_checkout_requires_directory() {
        let store = CacheStore::new("/tmp/unused");
        let ev = event();
        let missing = CheckoutSource::Local {
            path: PathBuf::from("/definitely/not/a/checkout"),
            pull: false,
        };
        let ctx = ActionContext {
            source: &missing,
            event: &ev,
            cache: &store,
            path: "/usr/bin:/bin",
        };
        assert!(run(Action::Checkout, &ctx, &IndexMap::new()).await.is_err());

        let dir = tempfile::tempdir().unwrap();
        let present = CheckoutSource::Local {
            path: dir.path().to_path_buf(),
            pull: false,
        };
        let ctx = ActionContext {
            source: &present,
            ..ctx
        };
        let out = run(Action::Checkout, &ctx, &IndexMap::new()).await.unwrap();
        assert!(out.stdout.contains("Using local source"));
    }

    fn git_sync(dir: &Path, args: &[&str]) -> String {
        let out = std::process::Command::new("git")
            .args(["-c", "commit.gpgsign=false"])
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "ci")
            .env("GIT_AUTHOR_EMAIL", "ci@example.com")
            .env("GIT_COMMITTER_NAME", "ci")
            .env("GIT_COMMITTER_EMAIL", "ci@example.com")
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {args:?}: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    fn commit(dir: &Path, file: &str) -> String {
        std::fs::write(dir.join(file), file).unwrap();
        git_sync(dir, &["add", "."]);
        git_sync(dir, &["commit", "-q", "-m", file]);
        git_sync(dir, &["rev-parse", "HEAD"])
    }

    fn upstream() -> (tempfile::TempDir, Vec<String>) {
        let dir = tempfile::tempdir().unwrap();
        git_sync(dir.path(), &["init", "-q", "-b", "main"]);
        let shas = vec![commit(dir.path(), "a"), commit(dir.path(), "b")];
        (dir, shas)
    }

    fn push_at(sha: &str) -> Event {
        Event::Push {
            branch: "main".to_string(),
            sha: sha.to_string(),
        }
    }

    #[tokio::test]
    async fn test_local_checkout_verifies_commit() {
        let (repo, shas) = upstream();
        let store = CacheStore::new("/tmp/unused");
        let source = CheckoutSource::Local {
            path: repo.path().to_path_buf(),
            pull: false,
        };

        let stale = push_at(&shas[0]);
        let ctx = ActionContext {
            source: &source,
            event: &stale,
            cache: &store,
            path: "",
        };
        let err = run(Action::Checkout, &ctx, &IndexMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("the build is for"), "{err:#}");

        let current = push_at(&shas[1][..12]);
        let ctx = ActionContext {
            event: &current,
            ..ctx
        };
        let out = run(Action::Checkout, &ctx, &IndexMap::new()).await.unwrap();
        assert!(out.stdout.contains(&shas[1]));
    }

    #[tokio::test]
    async fn test_local_pull_checks_out_build_commit() {
        let (origin, shas) = upstream();
        let parent = tempfile::tempdir().unwrap();
        let origin_path = origin.path().to_string_lossy().to_string();
        git_sync(parent.path(), &["clone", "-q", &origin_path, "work"]);
        let work = parent.path().join("work");
        let newest = commit(origin.path(), "c");

        let store = CacheStore::new("/tmp/unused");
        let source = CheckoutSource::Local {
            path: work.clone(),
            pull: true,
        };

        for (event, expected) in [
            (push_at(&shas[0]), shas[0].clone()),
            (push_at(&newest), newest.clone()),
            (
                Event::Manual {
                    branch: "main".to_string(),
                    sha: "HEAD".to_string(),
                },
                newest.clone(),
            ),
        ] {
            let ctx = ActionContext {
                source: &source,
                event: &event,
                cache: &store,
                path: "",
            };
            run(Action::Checkout, &ctx, &IndexMap::new()).await.unwrap();
            assert_eq!(git_sync(&work, &["rev-parse", "HEAD"]), expected);
        }

        let unknown = push_at("deadbeefdeadbeef");
        let ctx = ActionContext {
            source: &source,
            event: &unknown,
            cache: &store,
            path: "",
        };
        assert!(run(Action::Checkout, &ctx, &IndexMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_remote_checkout_fails_on_unknown_commit() {
        let (origin, shas) = upstream();
        let parent = tempfile::tempdir().unwrap();
        let store = CacheStore::new("/tmp/unused");
        let source = CheckoutSource::Remote {
            clone_url: origin.path().to_string_lossy().to_string(),
            workspace: parent.path().join("ws"),
        };

        let head = push_at(&shas[1]);
        let ctx = ActionContext {
            source: &source,
            event: &head,
            cache: &store,
            path: "",
        };
        let out = run(Action::Checkout, &ctx, &IndexMap::new()).await.unwrap();
        assert!(out.stdout.contains(&shas[1]));

        let unknown = push_at("deadbeefdeadbeef");
        let ctx = ActionContext {
            event: &unknown,
            ..ctx
        };
        let err = run(Action::Checkout, &ctx, &IndexMap::new()).await.unwrap_err();
        assert!(format!("{err:#}").contains("deadbeefdeadbeef"));
    }

    #[tokio::test]
    async fn test_unreadable_cache_entry_is_a_miss() {
        let root = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let store = CacheStore::new(root.path());
        let ev = event();
        let source = CheckoutSource::Local {
            path: ws.path().to_path_buf(),
            pull: false,
        };
        let ctx = ActionContext {
            source: &source,
            event: &ev,
            cache: &store,
            path: "",
        };

        std::fs::create_dir_all(ws.path().join("pip-cache")).unwrap();
        std::fs::write(ws.path().join("pip-cache/wheel"), "w").unwrap();
        store
            .save(&[ws.path().join("pip-cache")], "Linux-pip-abc")
            .unwrap();
        for entry in std::fs::read_dir(root.path()).unwrap() {
            std::fs::write(entry.unwrap().path(), b"not a tarball").unwrap();
        }

        let mut with = IndexMap::new();
        with.insert("path".to_string(), "pip-cache".to_string());
        with.insert("key".to_string(), "Linux-pip-abc".to_string());
        let out = run(Action::Cache, &ctx, &with).await.unwrap();
        assert!(out.stdout.contains("cache restore failed"));
        assert!(out.stdout.contains("Cache not found"));
        assert!(out.post_save.is_some());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cache_miss_schedules_save() {
        let root = tempfile::tempdir().unwrap();
        let ws = tempfile::tempdir().unwrap();
        let store = CacheStore::new(root.path());
        let ev = event();
        let source = CheckoutSource::Local {
            path: ws.path().to_path_buf(),
            pull: false,
        };
        let ctx = ActionContext {
            source: &source,
            event: &ev,
            cache: &store,
            path: "",
        };

        let mut with = IndexMap::new();
        with.insert("path".to_string(), "pip-cache".to_string());
        with.insert("key".to_string(), "Linux-pip-123".to_string());
        with.insert("restore-keys".to_string(), "Linux-pip-\n".to_string());

        let out = run(Action::Cache, &ctx, &with).await.unwrap();
        assert!(out.stdout.starts_with("Cache not found"));
        assert_eq!(
            out.post_save,
            Some(PendingSave {
                paths: vec![ws.path().join("pip-cache")],
                key: "Linux-pip-123".to_string(),
            })
        );

        std::fs::create_dir_all(ws.path().join("pip-cache")).unwrap();
        std::fs::write(ws.path().join("pip-cache/wheel"), "w").unwrap();
        store
            .save(&[ws.path().join("pip-cache")], "Linux-pip-123")
            .unwrap();

        let out = run(Action::Cache, &ctx, &with).await.unwrap();
        assert!(out.stdout.starts_with("Cache restored from key"));
        assert!(out.post_save.is_none());
    }

    #[tokio::test]
    async fn test_setup_python_requires_version() {
        let store = CacheStore::new("/tmp/unused");
        let ev = event();
        let source = CheckoutSource::Local {
            path: PathBuf::from("/tmp"),
            pull: false,
        };
        let ctx = ActionContext {
            source: &source,
            event: &ev,
            cache: &store,
            path: "",
        };
        let err = run(Action::SetupPython, &ctx, &IndexMap::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("python-version"));
    }
}
