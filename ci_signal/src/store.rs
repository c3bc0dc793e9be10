//! Capability traits for everything the signaling core persists or
//! publishes: credentials, build summaries, stage details, poll state,
//! secrets and the task queue.
//!
//! Implementations must be `Send + Sync`; the core calls them from
//! independent concurrent tasks and never holds a lock across calls.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::models::credential::{CredType, Credential, SubCredType};
use crate::models::poll::{PollRequest, PollState};
use crate::models::summary::{BuildSummary, StageResult, SummaryStart};

/// Non-secret credential records.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert the record and return its id. An existing record with the
    /// same (subtype, identifier, account) is replaced only when
    /// `overwrite_ok` is set.
    async fn insert_cred(&self, cred: &Credential, overwrite_ok: bool) -> Result<i64>;

    async fn update_cred(&self, cred: &Credential) -> Result<()>;

    async fn delete_cred(&self, cred: &Credential) -> Result<()>;

    async fn retrieve_cred(
        &self,
        sub_type: SubCredType,
        identifier: &str,
        account: &str,
    ) -> Result<Credential>;

    async fn retrieve_cred_by_id(&self, id: i64) -> Result<Credential>;

    async fn retrieve_creds_by_type(&self, cred_type: CredType) -> Result<Vec<Credential>>;

    async fn retrieve_cred_by_subtype_and_account(
        &self,
        sub_type: SubCredType,
        account: &str,
    ) -> Result<Vec<Credential>>;

    /// Distinct VCS subtypes registered for an account.
    async fn get_vcs_types_from_account(&self, account: &str) -> Result<Vec<SubCredType>>;
}

/// `build_summary` rows.
#[async_trait]
pub trait BuildSummaryStore: Send + Sync {
    /// Insert a row with status NIL and return its id.
    async fn add_sum_start(&self, start: &SummaryStart) -> Result<i64>;

    /// NIL to QUEUED, stamping the queue time.
    async fn set_queue_time(&self, id: i64) -> Result<()>;

    /// QUEUED to RUNNING, stamping the start time.
    async fn start_build(&self, id: i64) -> Result<()>;

    /// Record completion. A failed row that never left NIL becomes
    /// FAILED_PRESTART.
    async fn update_sum(&self, failed: bool, duration: f64, id: i64) -> Result<()>;

    /// Newest build whose hash starts with `partial_hash`.
    async fn retrieve_latest_sum(&self, partial_hash: &str) -> Result<BuildSummary>;

    async fn retrieve_last_few_sums(
        &self,
        repo: &str,
        account: &str,
        limit: i64,
    ) -> Result<Vec<BuildSummary>>;

    async fn retrieve_sum_by_build_id(&self, id: i64) -> Result<BuildSummary>;
}

/// `build_stage_details` rows.
#[async_trait]
pub trait BuildStageStore: Send + Sync {
    async fn add_stage_detail(&self, stage: &StageResult) -> Result<()>;

    async fn retrieve_stage_detail(&self, build_id: i64) -> Result<Vec<StageResult>>;
}

/// `polling_repos` rows.
#[async_trait]
pub trait PollStore: Send + Sync {
    async fn insert_poll(&self, poll: &PollRequest, credentials_id: i64) -> Result<()>;

    async fn update_poll(&self, poll: &PollRequest) -> Result<()>;

    async fn poll_exists(&self, account: &str, repo: &str) -> Result<bool>;

    async fn delete_poll(&self, account: &str, repo: &str) -> Result<()>;

    async fn get_all_polls(&self) -> Result<Vec<PollRequest>>;

    async fn get_last_data(&self, account: &str, repo: &str) -> Result<PollState>;

    async fn set_last_data(
        &self,
        account: &str,
        repo: &str,
        hashes: &HashMap<String, String>,
    ) -> Result<()>;
}

/// Everything the relational store provides.
pub trait Storage: CredentialStore + BuildSummaryStore + BuildStageStore + PollStore {}

impl<T> Storage for T where T: CredentialStore + BuildSummaryStore + BuildStageStore + PollStore {}

/// Secret half of credentials, plus throwaway tokens for workers.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read the payload at `path`. Missing paths are `NotFound`; any
    /// other failure is `SecretStoreUnavailable`.
    async fn get_user_auth_data(
        &self,
        path: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>>;

    async fn add_user_auth_data(
        &self,
        path: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;

    async fn delete_path(&self, path: &str) -> Result<()>;

    /// Mint a short-lived single-use token.
    async fn create_throwaway_token(&self) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Build,
    PollPlease,
    NoPollPlease,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Build => "build",
            Topic::PollPlease => "poll_please",
            Topic::NoPollPlease => "no_poll_please",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message queue. `publish` resolves only once the broker accepted (or
/// refused) the message.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn publish(&self, topic: Topic, body: Vec<u8>) -> Result<()>;
}

/// Serialize `message` as JSON and publish it.
pub async fn write_message<T>(queue: &dyn TaskQueue, topic: Topic, message: &T) -> Result<()>
where
    T: Serialize + Sync,
{
    let body = serde_json::to_vec(message)
        .map_err(|e| Error::Internal(format!("unable to encode {topic} message: {e}")))?;
    queue.publish(topic, body).await
}
