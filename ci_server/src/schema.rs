//! Diesel table definitions for build history.
//!
//! Tables: ci_builds, ci_build_jobs, ci_build_steps, ci_errors,
//! ci_error_occurrences. Created by `db::MIGRATION_SQL`.

diesel::table! {
    ci_builds (id) {
        id -> Int8,
        repo -> Varchar,
        trigger_event -> Varchar,
        branch -> Varchar,
        base_branch -> Nullable<Varchar>,
        commit_sha -> Varchar,
        pr_number -> Nullable<Int8>,
        author -> Nullable<Varchar>,
        message -> Nullable<Text>,
        fingerprint -> Varchar,
        status -> Varchar,
        created_at -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        finished_at -> Nullable<Timestamptz>,
        duration_ms -> Nullable<Int8>,
        summary -> Nullable<Jsonb>,
    }
}

diesel::table! {
    ci_build_jobs (id) {
        id -> Int8,
        build_id -> Int8,
        job_key -> Varchar,
        name -> Varchar,
        status -> Varchar,
        started_at -> Timestamptz,
        duration_ms -> Nullable<Int8>,
    }
}

diesel::table! {
    ci_build_steps (id) {
        id -> Int8,
        job_id -> Int8,
        name -> Varchar,
        sequence -> Int4,
        status -> Varchar,
        exit_code -> Nullable<Int4>,
        duration_ms -> Int8,
        finished_at -> Timestamptz,
        stdout -> Text,
        stderr -> Text,
    }
}

diesel::table! {
    ci_errors (id) {
        id -> Int8,
        fingerprint -> Varchar,
        category -> Varchar,
        title -> Varchar,
        first_seen_at -> Timestamptz,
        last_seen_at -> Timestamptz,
        occurrence_count -> Int4,
        normalized_text -> Text,
    }
}

diesel::table! {
    ci_error_occurrences (id) {
        id -> Int8,
        error_id -> Int8,
        build_id -> Int8,
        job -> Varchar,
        step_name -> Varchar,
        seen_at -> Timestamptz,
    }
}

diesel::joinable!(ci_build_jobs -> ci_builds (build_id));
diesel::joinable!(ci_build_steps -> ci_build_jobs (job_id));
diesel::joinable!(ci_error_occurrences -> ci_errors (error_id));
diesel::joinable!(ci_error_occurrences -> ci_builds (build_id));

diesel::allow_tables_to_appear_in_same_query!(
    ci_builds,
    ci_build_jobs,
    ci_build_steps,
    ci_errors,
    ci_error_occurrences,
);
