//! KPI queries for the build dashboard.

use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Integer, Nullable, Text};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::Serialize;

pub const DEFAULT_DAYS: i32 = 30;
/// Ten years; longer windows are clamped.
pub const MAX_DAYS: i32 = 3650;

/// Clamp a requested window to `1..=MAX_DAYS`.
pub fn window_days(requested: Option<i64>) -> i32 {
    let days = requested.unwrap_or(i64::from(DEFAULT_DAYS));
    i32::try_from(days.clamp(1, i64::from(MAX_DAYS))).unwrap_or(DEFAULT_DAYS)
}

/// Build success rate over N days (success vs failure only).
#[derive(Debug, PartialEq, Serialize, QueryableByName)]
pub struct BuildSuccessRate {
    #[diesel(sql_type = BigInt)]
    pub total: i64,
    #[diesel(sql_type = BigInt)]
    pub success: i64,
    #[diesel(sql_type = Double)]
    pub rate: f64,
}

pub async fn query_success_rate(
    conn: &mut AsyncPgConnection,
    days: i32,
) -> anyhow::Result<BuildSuccessRate> {
    let result = diesel::sql_query(
        "SELECT \
            COUNT(*) AS total, \
            COUNT(*) FILTER (WHERE status = 'success') AS success, \
            COALESCE(COUNT(*) FILTER (WHERE status = 'success')::float / NULLIF(COUNT(*), 0), 0) AS rate \
         FROM ci_builds \
         WHERE created_at >= NOW() - make_interval(days => $1) \
           AND status IN ('success', 'failure')",
    )
    .bind::<Integer, _>(days)
    .get_result(conn)
    .await?;
    Ok(result)
}

/// Average build duration over N days.
#[derive(Debug, PartialEq, Serialize, QueryableByName)]
pub struct AvgBuildDuration {
    #[diesel(sql_type = Nullable<Double>)]
    pub avg_ms: Option<f64>,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

pub async fn query_avg_duration(
    conn: &mut AsyncPgConnection,
    days: i32,
) -> anyhow::Result<AvgBuildDuration> {
    let result = diesel::sql_query(
        "SELECT \
            AVG(duration_ms)::float AS avg_ms, \
            COUNT(*) AS count \
         FROM ci_builds \
         WHERE created_at >= NOW() - make_interval(days => $1) \
           AND duration_ms IS NOT NULL",
    )
    .bind::<Integer, _>(days)
    .get_result(conn)
    .await?;
    Ok(result)
}

/// Build count grouped by status.
#[derive(Debug, PartialEq, Serialize, QueryableByName)]
pub struct BuildsByStatus {
    #[diesel(sql_type = Text)]
    pub status: String,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

pub async fn query_builds_by_status(
    conn: &mut AsyncPgConnection,
    days: i32,
) -> anyhow::Result<Vec<BuildsByStatus>> {
    let results = diesel::sql_query(
        "SELECT status, COUNT(*) AS count \
         FROM ci_builds \
         WHERE created_at >= NOW() - make_interval(days => $1) \
         GROUP BY status \
         ORDER BY count DESC, status",
    )
    .bind::<Integer, _>(days)
    .load(conn)
    .await?;
    Ok(results)
}
