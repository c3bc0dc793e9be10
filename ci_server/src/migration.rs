//! Schema migration for the signaler's tables.

use diesel_async::AsyncPgConnection;
use diesel_async::SimpleAsyncConnection;

/// SQL migration for the relational store.
///
/// Idempotent; run on every `serve` and by `relay-ci migrate`.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS build_summary (
    id              BIGSERIAL PRIMARY KEY,
    hash            VARCHAR(64) NOT NULL,
    account         VARCHAR(100) NOT NULL,
    repo            VARCHAR(100) NOT NULL,
    branch          VARCHAR(255) NOT NULL,
    status          VARCHAR(32) NOT NULL DEFAULT 'nil',
    signaled_by     VARCHAR(32) NOT NULL,
    credentials_id  BIGINT NOT NULL,
    failed          BOOLEAN NOT NULL DEFAULT FALSE,
    queuetime       TIMESTAMPTZ,
    starttime       TIMESTAMPTZ,
    buildtime       DOUBLE PRECISION NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_build_summary_hash ON build_summary (hash);
CREATE INDEX IF NOT EXISTS idx_build_summary_repo ON build_summary (account, repo);

CREATE TABLE IF NOT EXISTS build_stage_details (
    id              BIGSERIAL PRIMARY KEY,
    build_id        BIGINT NOT NULL REFERENCES build_summary(id) ON DELETE CASCADE,
    stage           VARCHAR(100) NOT NULL,
    error           TEXT NOT NULL DEFAULT '',
    starttime       TIMESTAMPTZ NOT NULL,
    runtime         DOUBLE PRECISION NOT NULL,
    status          INTEGER NOT NULL,
    messages        JSONB NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_build_stage_details_build ON build_stage_details (build_id);

CREATE TABLE IF NOT EXISTS credentials (
    id                  BIGSERIAL PRIMARY KEY,
    account             VARCHAR(100) NOT NULL,
    identifier          VARCHAR(100) NOT NULL,
    cred_type           VARCHAR(16) NOT NULL,
    cred_sub_type       VARCHAR(16) NOT NULL,
    additional_fields   JSONB NOT NULL DEFAULT '{}',
    UNIQUE (account, identifier, cred_sub_type)
);

CREATE INDEX IF NOT EXISTS idx_credentials_account ON credentials (account, cred_type);

CREATE TABLE IF NOT EXISTS polling_repos (
    id              BIGSERIAL PRIMARY KEY,
    account         VARCHAR(100) NOT NULL,
    repo            VARCHAR(100) NOT NULL,
    cron_string     VARCHAR(100) NOT NULL,
    branches        VARCHAR(1000) NOT NULL,
    last_cron_time  TIMESTAMPTZ,
    last_hashes     JSONB NOT NULL DEFAULT '{}',
    credentials_id  BIGINT NOT NULL,
    UNIQUE (account, repo)
);
"#;

/// Run the migration.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("migration failed: {e}"))?;
    Ok(())
}
