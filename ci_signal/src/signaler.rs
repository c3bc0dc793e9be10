//! Viability check, durable summary row and task enqueue for one build.
//!
//! The ordering is fixed: viability, then the NIL summary row, then
//! validation, throwaway token and enqueue, then the QUEUED or
//! FAILED_PRESTART status update. Everything from the insert on runs on
//! its own task, so a caller that stops waiting cannot leave the row in
//! NIL.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::credential::split_acct_repo;
use crate::models::summary::{StageResult, SummaryStart, HOOKHANDLER_VALIDATION};
use crate::models::task::WerkerTask;
use crate::models::trigger::Commit;
use crate::store::{write_message, SecretStore, Storage, TaskQueue, Topic};
use crate::viability::{self, Viability};

pub const PASSED_VALIDATION: &str = "Passed initial validation \u{2713}";
pub const FAILED_VALIDATION: &str = "Failed initial validation";

#[derive(Clone)]
pub struct Signaler {
    store: Arc<dyn Storage>,
    secrets: Arc<dyn SecretStore>,
    queue: Arc<dyn TaskQueue>,
}

impl Signaler {
    pub fn new(
        store: Arc<dyn Storage>,
        secrets: Arc<dyn SecretStore>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            store,
            secrets,
            queue,
        }
    }

    /// Dispatch `task` if it is viable and return the new build id.
    ///
    /// A non-viable task returns `NotViable` without writing anything.
    /// Any failure after the summary row exists marks it FAILED_PRESTART
    /// before the error is returned.
    pub async fn check_viable_then_queue_and_store(
        &self,
        mut task: WerkerTask,
        force: bool,
        commits: &[Commit],
    ) -> Result<i64> {
        if let Viability::NotViable(reason) =
            viability::check(&task.build_conf, &task.branch, force, commits)
        {
            tracing::info!(
                acct_repo = %task.full_name,
                branch = %task.branch,
                hash = %task.checkout_hash,
                "not queuing build: {reason}"
            );
            return Err(Error::NotViable(reason));
        }
        task.force = force;

        let (account, repo) = split_acct_repo(&task.full_name)?;
        let start = SummaryStart {
            hash: task.checkout_hash.clone(),
            account: account.to_string(),
            repo: repo.to_string(),
            branch: task.branch.clone(),
            signaled_by: task.signaled_by,
            credentials_id: task.credentials_id,
        };

        let signaler = self.clone();
        let dispatch = tokio::spawn(async move { signaler.store_and_queue(start, task).await });
        match dispatch.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("dispatch task did not finish: {e}");
                Err(Error::Internal(format!("dispatch aborted: {e}")))
            }
        }
    }

    async fn store_and_queue(&self, start: SummaryStart, task: WerkerTask) -> Result<i64> {
        let id = self.store.add_sum_start(&start).await.map_err(|e| {
            tracing::error!(acct_repo = %task.full_name, "unable to store summary details to db: {e}");
            Error::Internal(format!("unable to store build summary: {e}"))
        })?;
        self.queue_and_record(id, task).await.map(|()| id)
    }

    async fn queue_and_record(&self, id: i64, mut task: WerkerTask) -> Result<()> {
        let mut stage = StageResult::begin(id, HOOKHANDLER_VALIDATION);

        let result = match self.validate_and_queue(id, &mut task).await {
            Ok(()) => {
                stage.finish(0, PASSED_VALIDATION, "");
                if let Err(e) = self.store.set_queue_time(id).await {
                    // The task is already with a worker; it will move the row on.
                    tracing::error!(build_id = id, "unable to update queue time in build summary table: {e}");
                }
                tracing::info!(
                    build_id = id,
                    acct_repo = %task.full_name,
                    branch = %task.branch,
                    hash = %task.checkout_hash,
                    "Build queued"
                );
                Ok(())
            }
            Err(e) => {
                stage.finish(1, FAILED_VALIDATION, &e.to_string());
                if let Err(mark) = self.store.update_sum(true, 0.0, id).await {
                    tracing::error!(build_id = id, "unable to mark build failed prestart: {mark}");
                }
                tracing::warn!(build_id = id, acct_repo = %task.full_name, "Build failed before start: {e}");
                Err(e)
            }
        };

        if let Err(e) = self.store.add_stage_detail(&stage).await {
            tracing::error!(build_id = id, "unable to store hookhandler stage details to db: {e}");
        }
        result
    }

    async fn validate_and_queue(&self, id: i64, task: &mut WerkerTask) -> Result<()> {
        task.build_conf.validate()?;

        task.vault_token = self.secrets.create_throwaway_token().await?;
        task.id = id;

        if let Err(e) = write_message(self.queue.as_ref(), Topic::Build, &*task).await {
            tracing::warn!(
                build_id = id,
                "throwaway token was issued but the task never reached the queue; it expires unused"
            );
            return Err(e);
        }
        Ok(())
    }
}
