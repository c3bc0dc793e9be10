//! Repository registration: webhooks and polling.

use std::sync::Arc;

use crate::cron::{validate_schedule, CronWriter};
use crate::error::{Error, Result};
use crate::models::credential::SubCredType;
use crate::models::poll::PollRequest;
use crate::store::{write_message, Storage, TaskQueue, Topic};
use crate::trigger::TriggerService;

#[derive(Clone)]
pub struct RepoService {
    triggers: TriggerService,
    store: Arc<dyn Storage>,
    queue: Arc<dyn TaskQueue>,
    cron: Option<CronWriter>,
    hook_base_url: String,
}

impl RepoService {
    pub fn new(
        triggers: TriggerService,
        store: Arc<dyn Storage>,
        queue: Arc<dyn TaskQueue>,
        hook_base_url: impl Into<String>,
    ) -> Self {
        Self {
            triggers,
            store,
            queue,
            cron: None,
            hook_base_url: hook_base_url.into(),
        }
    }

    /// Also maintain cron entries for polled repos.
    pub fn with_cron(mut self, cron: CronWriter) -> Self {
        self.cron = Some(cron);
        self
    }

    /// Callback URL the VCS should post events for `vcs_type` to.
    pub fn callback_url(&self, vcs_type: SubCredType) -> String {
        format!(
            "{}/webhook/{}",
            self.hook_base_url.trim_end_matches('/'),
            vcs_type.as_str().to_ascii_lowercase()
        )
    }

    /// Register our webhook on the repository; returns the callback URL.
    pub async fn watch_repo(&self, acct_repo: &str, vcs_type: Option<SubCredType>) -> Result<String> {
        let ctx = self.triggers.connect(acct_repo, vcs_type).await?;
        let links = ctx.conn.handler.get_repo_links(acct_repo).await?;
        let callback = self.callback_url(ctx.cred.sub_type);
        ctx.conn
            .handler
            .create_webhook(&links.hooks, &callback)
            .await?;
        tracing::info!(acct_repo = %acct_repo, callback = %callback, "Webhook registered");
        Ok(callback)
    }

    /// Start (or reschedule) polling a repository.
    pub async fn poll_repo(&self, poll: PollRequest) -> Result<()> {
        if poll.account.is_empty() || poll.repo.is_empty() {
            return Err(Error::Validation("account and repo are required".to_string()));
        }
        if poll.branches.is_empty() {
            return Err(Error::Validation("at least one branch is required".to_string()));
        }
        validate_schedule(&poll.cron)?;

        let acct_repo = poll.acct_repo();
        let cred = self
            .triggers
            .credentials()
            .resolve(&acct_repo, None, true)
            .await?;

        if self.store.poll_exists(&poll.account, &poll.repo).await? {
            self.store.update_poll(&poll).await?;
        } else {
            self.store
                .insert_poll(&poll, cred.id.unwrap_or_default())
                .await?;
        }

        write_message(self.queue.as_ref(), Topic::PollPlease, &poll).await?;
        if let Some(cron) = &self.cron {
            cron.write(&poll).await?;
        }
        tracing::info!(acct_repo = %acct_repo, cron = %poll.cron, "Repo polling scheduled");
        Ok(())
    }

    pub async fn delete_poll(&self, account: &str, repo: &str) -> Result<()> {
        self.store.delete_poll(account, repo).await?;
        let poll = PollRequest {
            account: account.to_string(),
            repo: repo.to_string(),
            cron: String::new(),
            branches: Vec::new(),
        };
        write_message(self.queue.as_ref(), Topic::NoPollPlease, &poll).await?;
        if let Some(cron) = &self.cron {
            cron.remove(account, repo).await?;
        }
        tracing::info!(account = %account, repo = %repo, "Repo polling removed");
        Ok(())
    }

    pub async fn list_polls(&self) -> Result<Vec<PollRequest>> {
        self.store.get_all_polls().await
    }
}
