//! Build records as the worker and the API see them.

use std::sync::Arc;

use crate::credentials::CredentialResolver;
use crate::error::Result;
use crate::models::summary::{BuildSummary, StageResult};
use crate::store::Storage;
use crate::vcs::HandlerFactory;

#[derive(Clone)]
pub struct BuildReporter {
    store: Arc<dyn Storage>,
    creds: CredentialResolver,
    factory: Arc<dyn HandlerFactory>,
}

impl BuildReporter {
    pub fn new(
        store: Arc<dyn Storage>,
        creds: CredentialResolver,
        factory: Arc<dyn HandlerFactory>,
    ) -> Self {
        Self {
            store,
            creds,
            factory,
        }
    }

    pub async fn start_build(&self, id: i64) -> Result<()> {
        self.store.start_build(id).await?;
        tracing::info!(build_id = id, "Build started");
        Ok(())
    }

    /// Record the result; pull-request builds also get a PR comment.
    ///
    /// The comment is best-effort: the status update already happened.
    pub async fn complete_build(
        &self,
        id: i64,
        failed: bool,
        duration: f64,
        pr_id: Option<i64>,
    ) -> Result<BuildSummary> {
        self.store.update_sum(failed, duration, id).await?;
        let sum = self.store.retrieve_sum_by_build_id(id).await?;
        tracing::info!(build_id = id, status = %sum.status, duration, "Build finished");

        if let Some(pr_id) = pr_id {
            if let Err(e) = self.comment(&sum, pr_id, failed).await {
                tracing::warn!(build_id = id, pr_id, "unable to post pr comment: {e}");
            }
        }
        Ok(sum)
    }

    async fn comment(&self, sum: &BuildSummary, pr_id: i64, failed: bool) -> Result<()> {
        let cred = self.creds.get_cred_by_id(sum.credentials_id, false).await?;
        let conn = self.factory.connect(&cred).await?;
        let acct_repo = format!("{}/{}", sum.account, sum.repo);
        conn.handler
            .post_pr_comment(&acct_repo, pr_id, &sum.hash, failed, sum.id)
            .await
    }

    pub async fn summary(&self, id: i64) -> Result<BuildSummary> {
        self.store.retrieve_sum_by_build_id(id).await
    }

    pub async fn latest_for_hash(&self, partial_hash: &str) -> Result<BuildSummary> {
        self.store.retrieve_latest_sum(partial_hash).await
    }

    pub async fn last_few(&self, account: &str, repo: &str, limit: i64) -> Result<Vec<BuildSummary>> {
        self.store.retrieve_last_few_sums(repo, account, limit).await
    }

    pub async fn stages(&self, id: i64) -> Result<Vec<StageResult>> {
        self.store.retrieve_stage_detail(id).await
    }
}
