//! Error fingerprinting and deduplication across builds.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use regex::Regex;

use crate::db::{self, DbPool};
use crate::models::error::{CiError, ErrorOccurrence, ErrorRow, NewErrorRow, NewOccurrenceRow};
use crate::schema::{ci_error_occurrences, ci_errors};

static NUMERIC_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+\b").unwrap());
static PATH_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/[a-zA-Z0-9_./-]+").unwrap());

const MAX_TITLE_CHARS: usize = 200;
const MAX_OCCURRENCES: usize = 50;

/// Normalize error text for fingerprinting: remove numbers, paths, whitespace.
pub fn normalize(text: &str) -> String {
    let text = NUMERIC_REGEX.replace_all(text, "N");
    let text = PATH_REGEX.replace_all(&text, "PATH");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Generate a fingerprint from normalized error text.
pub fn fingerprint(normalized: &str) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(normalized.as_bytes());
    hex::encode(&hash[..16])
}

/// Classify error category from step name and output.
pub fn classify_category(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if any(&["timed out", "timeout"]) {
        "timeout"
    } else if any(&["pip", "no matching distribution", "could not find a version", "requirements"]) {
        "dependency"
    } else if any(&["migrat"]) {
        "migration"
    } else if any(&["collectstatic", "staticfiles", "static files"]) {
        "static"
    } else if any(&["sshpass", "ssh:", "deploy", "permission denied", "connection refused"]) {
        "deploy"
    } else if any(&["test", "assertionerror", "failed (failures", "failed (errors"]) {
        "test"
    } else {
        "runtime"
    }
}

/// The most telling line of a failure: the last non-empty one.
fn title(raw_text: &str) -> String {
    let line = raw_text
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .unwrap_or("Unknown error");
    line.chars().take(MAX_TITLE_CHARS).collect()
}

/// Distinct errors kept by the in-memory store; the least recently seen go first.
pub const MEMORY_ERROR_LIMIT: usize = 1000;

/// Error log keyed by fingerprint.
#[derive(Clone)]
pub struct ErrorStore {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Postgres(DbPool),
    Memory(Arc<RwLock<HashMap<String, CiError>>>),
}

impl ErrorStore {
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

    /// Record a failed step, creating or updating the deduplicated record.
    /// Returns the fingerprint.
    pub async fn record_error(
        &self,
        build_id: i64,
        job: &str,
        step_name: &str,
        raw_text: &str,
    ) -> anyhow::Result<String> {
        let normalized = normalize(raw_text);
        let fp = fingerprint(&normalized);
        let category = classify_category(&format!("{step_name}\n{raw_text}"));
        let now = chrono::Utc::now();

        let occurrences = match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                let title = title(raw_text);
                let (error_id, count): (i64, i32) = diesel::insert_into(ci_errors::table)
                    .values(&NewErrorRow {
                        fingerprint: &fp,
                        category,
                        title: &title,
                        first_seen_at: now,
                        last_seen_at: now,
                        occurrence_count: 1,
                        normalized_text: &normalized,
                    })
                    .on_conflict(ci_errors::fingerprint)
                    .do_update()
                    .set((
                        ci_errors::occurrence_count.eq(ci_errors::occurrence_count + 1),
                        ci_errors::last_seen_at.eq(now),
                    ))
                    .returning((ci_errors::id, ci_errors::occurrence_count))
                    .get_result(&mut conn)
                    .await?;

                diesel::insert_into(ci_error_occurrences::table)
                    .values(&NewOccurrenceRow {
                        error_id,
                        build_id,
                        job,
                        step_name,
                        seen_at: now,
                    })
                    .execute(&mut conn)
                    .await?;
                count
            }
            Backend::Memory(errors) => {
                let mut errors = errors.write().unwrap_or_else(PoisonError::into_inner);
                let error = errors.entry(fp.clone()).or_insert_with(|| CiError {
                    fingerprint: fp.clone(),
                    category: category.to_string(),
                    title: title(raw_text),
                    first_seen_at: now,
                    last_seen_at: now,
                    occurrence_count: 0,
                    normalized_text: normalized,
                    occurrences: Vec::new(),
                });
                error.occurrence_count = error.occurrence_count.saturating_add(1);
                error.last_seen_at = now;
                error.occurrences.push(ErrorOccurrence {
                    build_id,
                    job: job.to_string(),
                    step_name: step_name.to_string(),
                    seen_at: now,
                });
                if error.occurrences.len() > MAX_OCCURRENCES {
                    error.occurrences.remove(0);
                }
                let count = error.occurrence_count;
                evict_stale(&mut errors);
                count
            }
        };

        tracing::info!(
            build_id,
            fingerprint = %fp,
            category,
            occurrences,
            "Error recorded"
        );
        crate::metrics::error_recorded(category);
        Ok(fp)
    }

    /// All errors, most recently seen first.
    pub async fn list(&self) -> anyhow::Result<Vec<CiError>> {
        match &self.backend {
            Backend::Postgres(pool) => {
                let mut conn = db::conn(pool).await?;
                let rows: Vec<ErrorRow> = ci_errors::table
                    .order(ci_errors::last_seen_at.desc())
                    .select(ErrorRow::as_select())
                    .load(&mut conn)
                    .await?;
                let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
                let seen: Vec<(i64, ErrorOccurrence)> = ci_error_occurrences::table
                    .filter(ci_error_occurrences::error_id.eq_any(ids))
                    .order(ci_error_occurrences::id.asc())
                    .select((
                        ci_error_occurrences::error_id,
                        (
                            ci_error_occurrences::build_id,
                            ci_error_occurrences::job,
                            ci_error_occurrences::step_name,
                            ci_error_occurrences::seen_at,
                        ),
                    ))
                    .load(&mut conn)
                    .await?;

                let mut by_error: HashMap<i64, Vec<ErrorOccurrence>> = HashMap::new();
                for (error_id, occurrence) in seen {
                    by_error.entry(error_id).or_default().push(occurrence);
                }
                Ok(rows
                    .into_iter()
                    .map(|row| {
                        let mut occurrences = by_error.remove(&row.id).unwrap_or_default();
                        let excess = occurrences.len().saturating_sub(MAX_OCCURRENCES);
                        occurrences.drain(..excess);
                        row.into_error(occurrences)
                    })
                    .collect())
            }
            Backend::Memory(errors) => {
                let errors = errors.read().unwrap_or_else(PoisonError::into_inner);
                let mut list: Vec<CiError> = errors.values().cloned().collect();
                list.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
                Ok(list)
            }
        }
    }
}

fn evict_stale(errors: &mut HashMap<String, CiError>) {
    while errors.len() > MEMORY_ERROR_LIMIT {
        let stalest = errors
            .values()
            .min_by_key(|e| e.last_seen_at)
            .map(|e| e.fingerprint.clone());
        match stalest {
            Some(fp) => errors.remove(&fp),
            None => break,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_volatile_parts() {
        let a = normalize("Ran 12 tests\nFile /home/runner/work/bscore/views.py, line 41");
        let b = normalize("Ran 13 tests\nFile /tmp/ws/bscore/views.py, line 7");
        assert_eq!(a, b);
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 32);
    }

    #[test]
    fn test_classify_django_pipeline_failures() {
        assert_eq!(
            classify_category("Install dependencies\nERROR: No matching distribution found for Djangoo==9.9"),
            "dependency"
        );
        assert_eq!(
            classify_category("Run migrations\ndjango.db.utils.OperationalError: no such table"),
            "migration"
        );
        assert_eq!(
            classify_category("Run tests\nAssertionError: 200 != 404\nFAILED (failures=1)"),
            "test"
        );
        assert_eq!(
            classify_category("Collect static files\nCommandError: STATIC_ROOT not set"),
            "static"
        );
        assert_eq!(
            classify_category("Deploy to server\nssh: connect to host 203.0.113.9 port 22: Connection refused"),
            "deploy"
        );
        assert_eq!(classify_category("Run tests\nStep timed out after 3600s"), "timeout");
        assert_eq!(classify_category("Run script\nsegfault"), "runtime");
    }

    #[tokio::test]
    async fn test_record_deduplicates() {
        let store = ErrorStore::memory();
        let first = store
            .record_error(1, "test", "Run tests", "Ran 3 tests\nFAILED (failures=1)")
            .await
            .unwrap();
        let second = store
            .record_error(2, "test", "Run tests", "Ran 4 tests\nFAILED (failures=2)")
            .await
            .unwrap();
        assert_eq!(first, second);

        store
            .record_error(3, "deploy", "Deploy to server", "Permission denied, please try again.")
            .await
            .unwrap();
        let list = store.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].category, "deploy");

        let error = &list[1];
        assert_eq!(error.fingerprint, first);
        assert_eq!(error.occurrence_count, 2);
        assert_eq!(error.category, "test");
        assert_eq!(error.title, "FAILED (failures=1)");
        assert_eq!(
            error.occurrences.iter().map(|o| o.build_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_memory_log_is_bounded() {
        let store = ErrorStore::memory();
        for n in 0..=MEMORY_ERROR_LIMIT {
            store
                .record_error(1, "test", "Run script", &format!("unique failure {}", "x".repeat(n)))
                .await
                .unwrap();
        }
        let list = store.list().await.unwrap();
        assert_eq!(list.len(), MEMORY_ERROR_LIMIT);
        assert!(list.iter().all(|e| e.normalized_text != "unique failure"));
    }

    #[test]
    fn test_title_is_char_safe() {
        let long = "é".repeat(500);
        assert_eq!(title(&long).chars().count(), MAX_TITLE_CHARS);
        assert_eq!(title("\n\n"), "Unknown error");
    }
}
