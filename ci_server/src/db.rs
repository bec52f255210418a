//! Postgres connection pool and schema setup.

use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};

pub type DbPool = Pool<AsyncPgConnection>;

/// Build history tables. Idempotent, applied at startup.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ci_builds (
    id              BIGSERIAL PRIMARY KEY,
    repo            VARCHAR(255) NOT NULL,
    trigger_event   VARCHAR(32) NOT NULL,
    branch          VARCHAR(255) NOT NULL,
    base_branch     VARCHAR(255),
    commit_sha      VARCHAR(64) NOT NULL,
    pr_number       BIGINT,
    author          VARCHAR(255),
    message         TEXT,
    fingerprint     TEXT NOT NULL,
    status          VARCHAR(32) NOT NULL DEFAULT 'pending',
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at      TIMESTAMPTZ,
    finished_at     TIMESTAMPTZ,
    duration_ms     BIGINT,
    summary         JSONB
);

CREATE INDEX IF NOT EXISTS idx_ci_builds_fingerprint ON ci_builds (fingerprint, created_at);
CREATE INDEX IF NOT EXISTS idx_ci_builds_branch ON ci_builds (branch, id);
CREATE INDEX IF NOT EXISTS idx_ci_builds_created ON ci_builds (created_at);

CREATE TABLE IF NOT EXISTS ci_build_jobs (
    id              BIGSERIAL PRIMARY KEY,
    build_id        BIGINT NOT NULL REFERENCES ci_builds(id) ON DELETE CASCADE,
    job_key         VARCHAR(255) NOT NULL,
    name            VARCHAR(255) NOT NULL,
    status          VARCHAR(32) NOT NULL,
    started_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    duration_ms     BIGINT
);

CREATE INDEX IF NOT EXISTS idx_ci_build_jobs_build ON ci_build_jobs (build_id);

CREATE TABLE IF NOT EXISTS ci_build_steps (
    id              BIGSERIAL PRIMARY KEY,
    job_id          BIGINT NOT NULL REFERENCES ci_build_jobs(id) ON DELETE CASCADE,
    name            TEXT NOT NULL,
    sequence        INTEGER NOT NULL,
    status          VARCHAR(32) NOT NULL,
    exit_code       INTEGER,
    duration_ms     BIGINT NOT NULL DEFAULT 0,
    finished_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    stdout          TEXT NOT NULL DEFAULT '',
    stderr          TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_ci_build_steps_job ON ci_build_steps (job_id);

CREATE TABLE IF NOT EXISTS ci_errors (
    id               BIGSERIAL PRIMARY KEY,
    fingerprint      VARCHAR(64) NOT NULL UNIQUE,
    category         VARCHAR(32) NOT NULL,
    title            VARCHAR(255) NOT NULL,
    first_seen_at    TIMESTAMPTZ NOT NULL,
    last_seen_at     TIMESTAMPTZ NOT NULL,
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    normalized_text  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ci_errors_last_seen ON ci_errors (last_seen_at);

CREATE TABLE IF NOT EXISTS ci_error_occurrences (
    id              BIGSERIAL PRIMARY KEY,
    error_id        BIGINT NOT NULL REFERENCES ci_errors(id) ON DELETE CASCADE,
    build_id        BIGINT NOT NULL REFERENCES ci_builds(id) ON DELETE CASCADE,
    job             VARCHAR(255) NOT NULL,
    step_name       TEXT NOT NULL,
    seen_at         TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_ci_error_occurrences_error ON ci_error_occurrences (error_id);
"#;

/// Open a pool against `database_url`.
pub fn connect(database_url: &str, max_size: usize) -> anyhow::Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))
}

pub async fn conn(pool: &DbPool) -> anyhow::Result<Object<AsyncPgConnection>> {
    pool.get()
        .await
        .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))
}

/// Create the build history tables.
pub async fn run_migration(pool: &DbPool) -> anyhow::Result<()> {
    let mut conn = conn(pool).await?;
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("CI migration failed: {e}"))?;
    tracing::info!("Build history schema ready");
    Ok(())
}
