//! Diesel table definitions for the signaler's relational store.
//!
//! Tables: build_summary, build_stage_details, credentials, polling_repos.

diesel::table! {
    build_summary (id) {
        id -> Int8,
        hash -> Varchar,
        account -> Varchar,
        repo -> Varchar,
        branch -> Varchar,
        status -> Varchar,
        signaled_by -> Varchar,
        credentials_id -> Int8,
        failed -> Bool,
        queuetime -> Nullable<Timestamptz>,
        starttime -> Nullable<Timestamptz>,
        buildtime -> Float8,
    }
}

diesel::table! {
    build_stage_details (id) {
        id -> Int8,
        build_id -> Int8,
        stage -> Varchar,
        error -> Text,
        starttime -> Timestamptz,
        runtime -> Float8,
        status -> Int4,
        messages -> Jsonb,
    }
}

diesel::table! {
    credentials (id) {
        id -> Int8,
        account -> Varchar,
        identifier -> Varchar,
        cred_type -> Varchar,
        cred_sub_type -> Varchar,
        additional_fields -> Jsonb,
    }
}

diesel::table! {
    polling_repos (id) {
        id -> Int8,
        account -> Varchar,
        repo -> Varchar,
        cron_string -> Varchar,
        branches -> Varchar,
        last_cron_time -> Nullable<Timestamptz>,
        last_hashes -> Jsonb,
        credentials_id -> Int8,
    }
}

diesel::joinable!(build_stage_details -> build_summary (build_id));

diesel::allow_tables_to_appear_in_same_query!(
    build_summary,
    build_stage_details,
    credentials,
    polling_repos,
);
