//! Postgres implementation of the signaler's storage traits.

mod rows;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};

use ci_signal::models::credential::{CredType, Credential, SubCredType};
use ci_signal::models::poll::{PollRequest, PollState};
use ci_signal::models::summary::{BuildStatus, BuildSummary, StageResult, SummaryStart};
use ci_signal::store::{BuildStageStore, BuildSummaryStore, CredentialStore, PollStore};
use ci_signal::{Error, Result};

use crate::schema::{build_stage_details, build_summary, credentials, polling_repos};
use rows::{
    hashes_from_json, CredRow, NewCred, NewPoll, NewStage, NewSummary, PollRow, StageRow,
    SummaryRow,
};

pub type DbPool = Pool<AsyncPgConnection>;

/// Build the connection pool.
pub fn create_pool(database_url: &str, max_size: usize) -> anyhow::Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))
}

fn db_err(e: diesel::result::Error) -> Error {
    match e {
        diesel::result::Error::NotFound => Error::NotFound("no matching row".to_string()),
        other => Error::Storage(other.to_string()),
    }
}

/// LIKE pattern for a commit hash prefix. Only hex digits are accepted so
/// the input cannot carry `%` or `_` wildcards.
fn hash_prefix_pattern(partial_hash: &str) -> Result<String> {
    if partial_hash.is_empty() || !partial_hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Validation(format!(
            "{partial_hash:?} is not a commit hash prefix"
        )));
    }
    Ok(format!("{partial_hash}%"))
}

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Storage(format!("diesel pool: {e}")))
    }

    async fn status_of(conn: &mut AsyncPgConnection, id: i64) -> Result<BuildStatus> {
        let status: Option<String> = build_summary::table
            .find(id)
            .select(build_summary::status)
            .first(conn)
            .await
            .optional()
            .map_err(db_err)?;
        status.ok_or_else(|| Error::not_found_sum(id))?.parse()
    }
}

/// A conditional update that matched nothing lost a race with another writer.
fn check_updated(rows: usize, id: i64, from: BuildStatus, to: BuildStatus) -> Result<()> {
    if rows == 0 {
        return Err(Error::InvalidTransition {
            id,
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn insert_cred(&self, cred: &Credential, overwrite_ok: bool) -> Result<i64> {
        let mut conn = self.conn().await?;
        let existing: Option<i64> = credentials::table
            .filter(credentials::account.eq(&cred.account))
            .filter(credentials::identifier.eq(&cred.identifier))
            .filter(credentials::cred_sub_type.eq(cred.sub_type.as_str()))
            .select(credentials::id)
            .first(&mut *conn)
            .await
            .optional()
            .map_err(db_err)?;

        if let Some(id) = existing {
            if !overwrite_ok {
                return Err(Error::Validation(format!(
                    "credential {} {} already exists for {}",
                    cred.sub_type, cred.identifier, cred.account
                )));
            }
            diesel::update(credentials::table.find(id))
                .set(credentials::additional_fields.eq(serde_json::Value::Object(cred.fields.clone())))
                .execute(&mut *conn)
                .await
                .map_err(db_err)?;
            return Ok(id);
        }

        diesel::insert_into(credentials::table)
            .values(NewCred::from(cred))
            .returning(credentials::id)
            .get_result(&mut *conn)
            .await
            .map_err(db_err)
    }

    async fn update_cred(&self, cred: &Credential) -> Result<()> {
        let mut conn = self.conn().await?;
        let rows = diesel::update(
            credentials::table
                .filter(credentials::account.eq(&cred.account))
                .filter(credentials::identifier.eq(&cred.identifier))
                .filter(credentials::cred_sub_type.eq(cred.sub_type.as_str())),
        )
        .set(credentials::additional_fields.eq(serde_json::Value::Object(cred.fields.clone())))
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        if rows == 0 {
            return Err(Error::not_found_cred(cred.sub_type, &cred.account));
        }
        Ok(())
    }

    async fn delete_cred(&self, cred: &Credential) -> Result<()> {
        let mut conn = self.conn().await?;
        let rows = diesel::delete(
            credentials::table
                .filter(credentials::account.eq(&cred.account))
                .filter(credentials::identifier.eq(&cred.identifier))
                .filter(credentials::cred_sub_type.eq(cred.sub_type.as_str())),
        )
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        if rows == 0 {
            return Err(Error::not_found_cred(cred.sub_type, &cred.account));
        }
        Ok(())
    }

    async fn retrieve_cred(
        &self,
        sub_type: SubCredType,
        identifier: &str,
        account: &str,
    ) -> Result<Credential> {
        let mut conn = self.conn().await?;
        let row: Option<CredRow> = credentials::table
            .filter(credentials::cred_sub_type.eq(sub_type.as_str()))
            .filter(credentials::identifier.eq(identifier))
            .filter(credentials::account.eq(account))
            .select(CredRow::as_select())
            .first(&mut *conn)
            .await
            .optional()
            .map_err(db_err)?;
        row.ok_or_else(|| Error::not_found_cred(sub_type, account))?
            .try_into()
    }

    async fn retrieve_cred_by_id(&self, id: i64) -> Result<Credential> {
        let mut conn = self.conn().await?;
        let row: Option<CredRow> = credentials::table
            .find(id)
            .select(CredRow::as_select())
            .first(&mut *conn)
            .await
            .optional()
            .map_err(db_err)?;
        row.ok_or_else(|| Error::NotFound(format!("no credential found with id {id}")))?
            .try_into()
    }

    async fn retrieve_creds_by_type(&self, cred_type: CredType) -> Result<Vec<Credential>> {
        let mut conn = self.conn().await?;
        let rows: Vec<CredRow> = credentials::table
            .filter(credentials::cred_type.eq(cred_type.as_str()))
            .order(credentials::id.asc())
            .select(CredRow::as_select())
            .load(&mut *conn)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(Credential::try_from).collect()
    }

    async fn retrieve_cred_by_subtype_and_account(
        &self,
        sub_type: SubCredType,
        account: &str,
    ) -> Result<Vec<Credential>> {
        let mut conn = self.conn().await?;
        let rows: Vec<CredRow> = credentials::table
            .filter(credentials::cred_sub_type.eq(sub_type.as_str()))
            .filter(credentials::account.eq(account))
            .order(credentials::id.asc())
            .select(CredRow::as_select())
            .load(&mut *conn)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(Credential::try_from).collect()
    }

    async fn get_vcs_types_from_account(&self, account: &str) -> Result<Vec<SubCredType>> {
        let mut conn = self.conn().await?;
        let names: Vec<String> = credentials::table
            .filter(credentials::account.eq(account))
            .filter(credentials::cred_type.eq(CredType::Vcs.as_str()))
            .select(credentials::cred_sub_type)
            .distinct()
            .load(&mut *conn)
            .await
            .map_err(db_err)?;
        let mut types = names
            .iter()
            .map(|n| n.parse())
            .collect::<Result<Vec<SubCredType>>>()?;
        types.sort();
        Ok(types)
    }
}

#[async_trait]
impl BuildSummaryStore for PgStore {
    async fn add_sum_start(&self, start: &SummaryStart) -> Result<i64> {
        let mut conn = self.conn().await?;
        diesel::insert_into(build_summary::table)
            .values(NewSummary {
                hash: &start.hash,
                account: &start.account,
                repo: &start.repo,
                branch: &start.branch,
                status: BuildStatus::Nil.as_str(),
                signaled_by: start.signaled_by.as_str(),
                credentials_id: start.credentials_id,
            })
            .returning(build_summary::id)
            .get_result(&mut *conn)
            .await
            .map_err(db_err)
    }

    async fn set_queue_time(&self, id: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let from = Self::status_of(&mut conn, id).await?;
        from.ensure_transition(BuildStatus::Queued, id)?;
        let rows = diesel::update(
            build_summary::table
                .find(id)
                .filter(build_summary::status.eq(from.as_str())),
        )
        .set((
            build_summary::queuetime.eq(Utc::now()),
            build_summary::status.eq(BuildStatus::Queued.as_str()),
        ))
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        check_updated(rows, id, from, BuildStatus::Queued)
    }

    async fn start_build(&self, id: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let from = Self::status_of(&mut conn, id).await?;
        from.ensure_transition(BuildStatus::Running, id)?;
        let rows = diesel::update(
            build_summary::table
                .find(id)
                .filter(build_summary::status.eq(from.as_str())),
        )
        .set((
            build_summary::starttime.eq(Utc::now()),
            build_summary::status.eq(BuildStatus::Running.as_str()),
        ))
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        check_updated(rows, id, from, BuildStatus::Running)
    }

    async fn update_sum(&self, failed: bool, duration: f64, id: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let from = Self::status_of(&mut conn, id).await?;
        let next = from.completion(failed);
        from.ensure_transition(next, id)?;
        let rows = diesel::update(
            build_summary::table
                .find(id)
                .filter(build_summary::status.eq(from.as_str())),
        )
        .set((
            build_summary::failed.eq(failed),
            build_summary::buildtime.eq(duration),
            build_summary::status.eq(next.as_str()),
        ))
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        check_updated(rows, id, from, next)
    }

    async fn retrieve_latest_sum(&self, partial_hash: &str) -> Result<BuildSummary> {
        let mut conn = self.conn().await?;
        let row: Option<SummaryRow> = build_summary::table
            .filter(build_summary::hash.like(hash_prefix_pattern(partial_hash)?))
            .order(build_summary::id.desc())
            .select(SummaryRow::as_select())
            .first(&mut *conn)
            .await
            .optional()
            .map_err(db_err)?;
        row.ok_or_else(|| Error::not_found_sum(partial_hash))?
            .try_into()
    }

    async fn retrieve_last_few_sums(
        &self,
        repo: &str,
        account: &str,
        limit: i64,
    ) -> Result<Vec<BuildSummary>> {
        let mut conn = self.conn().await?;
        let rows: Vec<SummaryRow> = build_summary::table
            .filter(build_summary::repo.eq(repo))
            .filter(build_summary::account.eq(account))
            .order(build_summary::id.desc())
            .limit(limit.max(0))
            .select(SummaryRow::as_select())
            .load(&mut *conn)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(BuildSummary::try_from).collect()
    }

    async fn retrieve_sum_by_build_id(&self, id: i64) -> Result<BuildSummary> {
        let mut conn = self.conn().await?;
        let row: Option<SummaryRow> = build_summary::table
            .find(id)
            .select(SummaryRow::as_select())
            .first(&mut *conn)
            .await
            .optional()
            .map_err(db_err)?;
        row.ok_or_else(|| Error::not_found_sum(id))?.try_into()
    }
}

#[async_trait]
impl BuildStageStore for PgStore {
    async fn add_stage_detail(&self, stage: &StageResult) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(build_stage_details::table)
            .values(NewStage::from(stage))
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn retrieve_stage_detail(&self, build_id: i64) -> Result<Vec<StageResult>> {
        let mut conn = self.conn().await?;
        let rows: Vec<StageRow> = build_stage_details::table
            .filter(build_stage_details::build_id.eq(build_id))
            .order(build_stage_details::id.asc())
            .select(StageRow::as_select())
            .load(&mut *conn)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(StageResult::try_from).collect()
    }
}

#[async_trait]
impl PollStore for PgStore {
    async fn insert_poll(&self, poll: &PollRequest, credentials_id: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::insert_into(polling_repos::table)
            .values(NewPoll {
                account: &poll.account,
                repo: &poll.repo,
                cron_string: &poll.cron,
                branches: poll.branches_joined(),
                credentials_id,
            })
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_poll(&self, poll: &PollRequest) -> Result<()> {
        let mut conn = self.conn().await?;
        let rows = diesel::update(
            polling_repos::table
                .filter(polling_repos::account.eq(&poll.account))
                .filter(polling_repos::repo.eq(&poll.repo)),
        )
        .set((
            polling_repos::cron_string.eq(&poll.cron),
            polling_repos::branches.eq(poll.branches_joined()),
        ))
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        if rows == 0 {
            return Err(Error::NotFound(format!(
                "no poll found for {}",
                poll.acct_repo()
            )));
        }
        Ok(())
    }

    async fn poll_exists(&self, account: &str, repo: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let count: i64 = polling_repos::table
            .filter(polling_repos::account.eq(account))
            .filter(polling_repos::repo.eq(repo))
            .count()
            .get_result(&mut *conn)
            .await
            .map_err(db_err)?;
        Ok(count > 0)
    }

    async fn delete_poll(&self, account: &str, repo: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        diesel::delete(
            polling_repos::table
                .filter(polling_repos::account.eq(account))
                .filter(polling_repos::repo.eq(repo)),
        )
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_all_polls(&self) -> Result<Vec<PollRequest>> {
        let mut conn = self.conn().await?;
        let rows: Vec<PollRow> = polling_repos::table
            .order(polling_repos::id.asc())
            .select(PollRow::as_select())
            .load(&mut *conn)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(PollRequest::from).collect())
    }

    async fn get_last_data(&self, account: &str, repo: &str) -> Result<PollState> {
        let mut conn = self.conn().await?;
        let row: Option<PollRow> = polling_repos::table
            .filter(polling_repos::account.eq(account))
            .filter(polling_repos::repo.eq(repo))
            .select(PollRow::as_select())
            .first(&mut *conn)
            .await
            .optional()
            .map_err(db_err)?;
        let row =
            row.ok_or_else(|| Error::NotFound(format!("no poll found for {account}/{repo}")))?;
        Ok(PollState {
            last_cron_time: row.last_cron_time,
            last_hashes: hashes_from_json(row.last_hashes)?,
        })
    }

    async fn set_last_data(
        &self,
        account: &str,
        repo: &str,
        hashes: &HashMap<String, String>,
    ) -> Result<()> {
        let mut conn = self.conn().await?;
        let hashes = serde_json::to_value(hashes)
            .map_err(|e| Error::Storage(format!("last_hashes: {e}")))?;
        let rows = diesel::update(
            polling_repos::table
                .filter(polling_repos::account.eq(account))
                .filter(polling_repos::repo.eq(repo)),
        )
        .set((
            polling_repos::last_cron_time.eq(Utc::now()),
            polling_repos::last_hashes.eq(hashes),
        ))
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
        if rows == 0 {
            return Err(Error::NotFound(format!("no poll found for {account}/{repo}")));
        }
        Ok(())
    }
}
