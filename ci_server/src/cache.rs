//! Dependency cache for the `actions/cache` step.
//!
//! Entries are gzip tarballs under the cache root, one per key. Entries are
//! immutable: saving an existing key is a no-op.

use std::fs::File;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::workflow::expr::{hash_files, ExprError};

const MAX_KEY_LENGTH: usize = 512;
const ARCHIVE_SUFFIX: &str = ".tar.gz";
/// Never produced by `sanitize_key`.
const HASH_SEPARATOR: char = '+';
/// Keeps file names under the 255-byte limit.
const MAX_STEM_NAME: usize = 200;

/// Result of a cache restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    /// The primary key was found.
    Exact(String),
    /// A restore-key prefix matched this entry.
    Partial(String),
    Miss,
}

impl CacheOutcome {
    pub fn is_exact(&self) -> bool {
        matches!(self, CacheOutcome::Exact(_))
    }
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}{ARCHIVE_SUFFIX}", entry_stem(key)))
    }

    /// Look up the primary key, then each restore prefix (newest entry wins).
    pub fn find(&self, key: &str, restore_keys: &[String]) -> anyhow::Result<CacheOutcome> {
        Ok(self
            .lookup(key, restore_keys)?
            .map_or(CacheOutcome::Miss, |(outcome, _)| outcome))
    }

    fn lookup(
        &self,
        key: &str,
        restore_keys: &[String],
    ) -> anyhow::Result<Option<(CacheOutcome, PathBuf)>> {
        validate_key(key)?;
        let exact = self.entry_path(key);
        if exact.is_file() {
            return Ok(Some((CacheOutcome::Exact(key.to_string()), exact)));
        }
        if !self.root.is_dir() {
            return Ok(None);
        }

        for prefix in restore_keys {
            let prefix = sanitize_key(prefix);
            let mut newest: Option<(SystemTime, String, PathBuf)> = None;

            for entry in std::fs::read_dir(&self.root)
                .with_context(|| format!("reading cache root {}", self.root.display()))?
            {
                let entry = entry?;
                let file_name = entry.file_name().to_string_lossy().to_string();
                let Some((name, _hash)) = file_name
                    .strip_suffix(ARCHIVE_SUFFIX)
                    .and_then(|stem| stem.rsplit_once(HASH_SEPARATOR))
                else {
                    continue;
                };
                if !name.starts_with(&prefix) {
                    continue;
                }
                let modified = entry.metadata()?.modified()?;
                if newest.as_ref().map_or(true, |(t, ..)| modified > *t) {
                    newest = Some((modified, name.to_string(), entry.path()));
                }
            }

            if let Some((_, name, path)) = newest {
                return Ok(Some((CacheOutcome::Partial(name), path)));
            }
        }

        Ok(None)
    }

    /// Restore `paths` from the best matching entry. An entry that cannot be
    /// unpacked is removed so the next successful job can save it again.
    pub fn restore(
        &self,
        paths: &[PathBuf],
        key: &str,
        restore_keys: &[String],
    ) -> anyhow::Result<CacheOutcome> {
        let Some((outcome, archive)) = self.lookup(key, restore_keys)? else {
            return Ok(CacheOutcome::Miss);
        };

        if let Err(e) = unpack(&archive, paths) {
            if let Err(remove) = std::fs::remove_file(&archive) {
                tracing::warn!(entry = %archive.display(), "Could not evict cache entry: {remove}");
            }
            return Err(e.context(format!("restoring cache entry {}", archive.display())));
        }
        Ok(outcome)
    }

    /// Archive existing `paths` under `key`. Returns false when the key already
    /// exists or nothing could be saved.
    pub fn save(&self, paths: &[PathBuf], key: &str) -> anyhow::Result<bool> {
        validate_key(key)?;
        let target = self.entry_path(key);
        if target.exists() {
            return Ok(false);
        }
        if !paths.iter().any(|p| p.exists()) {
            return Ok(false);
        }

        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating cache root {}", self.root.display()))?;
        let mut staging = tempfile::NamedTempFile::new_in(&self.root)
            .with_context(|| format!("staging cache entry in {}", self.root.display()))?;

        {
            let mut builder =
                tar::Builder::new(GzEncoder::new(staging.as_file_mut(), Compression::default()));
            builder.follow_symlinks(false);
            for (index, path) in paths.iter().enumerate() {
                if path.is_dir() {
                    builder.append_dir_all(index.to_string(), path)?;
                } else if path.is_file() {
                    builder.append_path_with_name(path, index.to_string())?;
                }
            }
            builder.into_inner()?.finish()?;
        }

        // Concurrent saves of one key: the first to publish wins.
        match staging.persist_noclobber(&target) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error)
                .with_context(|| format!("publishing cache entry {}", target.display())),
        }
    }
}

fn unpack(archive: &Path, paths: &[PathBuf]) -> anyhow::Result<()> {
    let file = File::open(archive)
        .with_context(|| format!("opening cache entry {}", archive.display()))?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));

    for entry in tar.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let mut components = entry_path.components();

        let index: usize = match components.next() {
            Some(Component::Normal(first)) => first
                .to_str()
                .and_then(|s| s.parse().ok())
                .context("malformed cache entry")?,
            _ => bail!("malformed cache entry {}", entry_path.display()),
        };
        let Some(target_root) = paths.get(index) else {
            continue;
        };

        let rest: PathBuf = components.collect();
        if rest.components().any(|c| !matches!(c, Component::Normal(_))) {
            bail!("refusing to unpack {} outside cache path", entry_path.display());
        }

        let target = if rest.as_os_str().is_empty() {
            target_root.clone()
        } else {
            target_root.join(rest)
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}

pub fn validate_key(key: &str) -> anyhow::Result<()> {
    if key.trim().is_empty() {
        bail!("cache key must not be empty");
    }
    if key.len() > MAX_KEY_LENGTH {
        bail!("cache key exceeds {MAX_KEY_LENGTH} characters");
    }
    if key.contains(',') {
        bail!("cache key must not contain commas");
    }
    Ok(())
}

fn sanitize_key(key: &str) -> String {
    key.chars()
        .take(MAX_STEM_NAME)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Readable name plus a digest of the raw key, so keys that sanitize alike
/// still get distinct files.
fn entry_stem(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{}{HASH_SEPARATOR}{}", sanitize_key(key), hex::encode(&digest[..8]))
}

/// Split a newline-separated action input, dropping blank lines.
pub fn parse_list(input: &str) -> Vec<String> {
    input
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Expand `~` to the home directory; relative paths are workspace-relative.
pub fn expand_path(raw: &str, workspace: &Path) -> PathBuf {
    let home = || dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));
    if raw == "~" {
        return home();
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        return home().join(rest);
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// `runner.os` for the host.
pub fn runner_os() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "macos" => "macOS",
        "windows" => "Windows",
        other => other,
    }
}

/// The pip cache key the BIRTHNON workflow computes:
/// `<os>-pip-<hashFiles(lock_file)>`.
pub fn pip_cache_key(os: &str, workspace: &Path, lock_file: &str) -> Result<String, ExprError> {
    let hash = hash_files(workspace, &[lock_file.to_string()])?;
    Ok(format!("{os}-pip-{hash}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populate(dir: &Path) {
        std::fs::create_dir_all(dir.join("wheels")).unwrap();
        std::fs::write(dir.join("wheels/django.whl"), b"wheel-bytes").unwrap();
        std::fs::write(dir.join("selfcheck.json"), b"{}").unwrap();
    }

    #[test]
    fn test_save_then_exact_restore() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let pip = work.path().join("pip");
        populate(&pip);

        let store = CacheStore::new(root.path());
        assert!(store.save(&[pip.clone()], "Linux-pip-abc").unwrap());
        assert!(!store.save(&[pip.clone()], "Linux-pip-abc").unwrap());

        std::fs::remove_dir_all(&pip).unwrap();
        let outcome = store.restore(&[pip.clone()], "Linux-pip-abc", &[]).unwrap();
        assert_eq!(outcome, CacheOutcome::Exact("Linux-pip-abc".to_string()));
        assert_eq!(std::fs::read(pip.join("wheels/django.whl")).unwrap(), b"wheel-bytes");
        assert!(pip.join("selfcheck.json").is_file());
    }

    #[test]
    fn test_restore_key_prefix_fallback() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let pip = work.path().join("pip");
        populate(&pip);

        let store = CacheStore::new(root.path());
        store.save(&[pip.clone()], "Linux-pip-old").unwrap();
        std::fs::remove_dir_all(&pip).unwrap();

        let outcome = store
            .restore(&[pip.clone()], "Linux-pip-new", &["Linux-pip-".to_string()])
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Partial("Linux-pip-old".to_string()));
        assert!(!outcome.is_exact());
        assert!(pip.join("wheels/django.whl").is_file());
    }

    #[test]
    fn test_miss() {
        let root = tempfile::tempdir().unwrap();
        let store = CacheStore::new(root.path().join("absent"));
        let outcome = store
            .restore(&[PathBuf::from("/nonexistent")], "Linux-pip-x", &["macOS-".to_string()])
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Miss);
    }

    #[test]
    fn test_single_file_path() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let file = work.path().join("lock.txt");
        std::fs::write(&file, "pinned").unwrap();

        let store = CacheStore::new(root.path());
        assert!(store.save(&[file.clone()], "lock").unwrap());
        std::fs::remove_file(&file).unwrap();
        store.restore(&[file.clone()], "lock", &[]).unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "pinned");
    }

    #[test]
    fn test_keys_that_sanitize_alike_stay_distinct() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let pip = work.path().join("pip");
        populate(&pip);

        let store = CacheStore::new(root.path());
        assert!(store.save(&[pip.clone()], "a b").unwrap());
        assert_eq!(store.find("a_b", &[]).unwrap(), CacheOutcome::Miss);
        assert!(store.save(&[pip.clone()], "a_b").unwrap());
        assert!(store.find("a b", &[]).unwrap().is_exact());
        assert!(store.find("a_b", &[]).unwrap().is_exact());
    }

    #[test]
    fn test_corrupt_entry_is_evicted() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let pip = work.path().join("pip");
        let store = CacheStore::new(root.path());

        let archive = store.entry_path("Linux-pip-abc");
        std::fs::write(&archive, b"not a tarball").unwrap();
        assert!(store.restore(&[pip.clone()], "Linux-pip-abc", &[]).is_err());
        assert!(!archive.exists());

        populate(&pip);
        assert!(store.save(&[pip.clone()], "Linux-pip-abc").unwrap());
        std::fs::remove_dir_all(&pip).unwrap();
        assert!(store.restore(&[pip.clone()], "Linux-pip-abc", &[]).unwrap().is_exact());
        assert!(pip.join("wheels/django.whl").is_file());
    }

    #[test]
    fn test_save_leaves_no_staging_files() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let pip = work.path().join("pip");
        populate(&pip);

        let store = CacheStore::new(root.path());
        store.save(&[pip.clone()], "Linux-pip-abc").unwrap();
        let names: Vec<String> = std::fs::read_dir(root.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("Linux-pip-abc+"));
        assert!(names[0].ends_with(".tar.gz"));
    }

    #[test]
    fn test_nothing_to_save() {
        let root = tempfile::tempdir().unwrap();
        let store = CacheStore::new(root.path());
        assert!(!store.save(&[PathBuf::from("/definitely/not/here")], "k").unwrap());
    }

    #[test]
    fn test_invalid_keys() {
        let store = CacheStore::new("/tmp/unused");
        assert!(store.find("", &[]).is_err());
        assert!(store.find("a,b", &[]).is_err());
        assert!(store.find(&"x".repeat(513), &[]).is_err());
    }

    #[test]
    fn test_parse_list_and_expand() {
        assert_eq!(
            parse_list("  Linux-pip-\n\n  Linux-\n"),
            vec!["Linux-pip-", "Linux-"]
        );

        let ws = Path::new("/work");
        assert_eq!(expand_path("static", ws), PathBuf::from("/work/static"));
        assert_eq!(expand_path("/abs", ws), PathBuf::from("/abs"));
        assert!(expand_path("~/.cache/pip", ws).ends_with(".cache/pip"));
    }

    #[test]
    fn test_pip_cache_key() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(ws.path().join("bscore")).unwrap();
        std::fs::write(ws.path().join("bscore/requirements.txt"), "Django\n").unwrap();

        let key = pip_cache_key("Linux", ws.path(), "bscore/requirements.txt").unwrap();
        assert!(key.starts_with("Linux-pip-"));
        assert_eq!(key.len(), "Linux-pip-".len() + 64);
    }
}
