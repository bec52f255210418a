//! Deduplicated failure records across builds.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;

use crate::schema::{ci_error_occurrences, ci_errors};

#[derive(Debug, Clone, Serialize)]
pub struct CiError {
    pub fingerprint: String,
    pub category: String,
    pub title: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub occurrence_count: i32,
    pub normalized_text: String,
    /// Most recent occurrences, oldest first.
    pub occurrences: Vec<ErrorOccurrence>,
}

#[derive(Debug, Clone, Serialize, Queryable)]
pub struct ErrorOccurrence {
    pub build_id: i64,
    pub job: String,
    pub step_name: String,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ci_errors)]
pub struct ErrorRow {
    pub id: i64,
    pub fingerprint: String,
    pub category: String,
    pub title: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub occurrence_count: i32,
    pub normalized_text: String,
}

impl ErrorRow {
    pub fn into_error(self, occurrences: Vec<ErrorOccurrence>) -> CiError {
        CiError {
            fingerprint: self.fingerprint,
            category: self.category,
            title: self.title,
            first_seen_at: self.first_seen_at,
            last_seen_at: self.last_seen_at,
            occurrence_count: self.occurrence_count,
            normalized_text: self.normalized_text,
            occurrences,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = ci_errors)]
pub struct NewErrorRow<'a> {
    pub fingerprint: &'a str,
    pub category: &'a str,
    pub title: &'a str,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub occurrence_count: i32,
    pub normalized_text: &'a str,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = ci_error_occurrences)]
pub struct NewOccurrenceRow<'a> {
    pub error_id: i64,
    pub build_id: i64,
    pub job: &'a str,
    pub step_name: &'a str,
    pub seen_at: DateTime<Utc>,
}
