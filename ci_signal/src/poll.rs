//! One poll cycle for a repository: compare each branch head with the
//! last hash seen, signal builds for branches that moved, then persist
//! the new hash map.

use std::collections::HashMap;

use crate::error::Result;
use crate::models::credential::split_acct_repo;
use crate::models::trigger::Trigger;
use crate::store::Storage;
use crate::trigger::{Dispatch, TriggerService, VcsContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    /// Head unchanged since the last cycle.
    UpToDate,
    Dispatched(Dispatch),
    /// The branch moved but the trigger was rejected (not viable, nothing to build).
    NotBuilt(String),
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub branches: Vec<(String, BranchOutcome)>,
    /// The map written back to storage.
    pub last_hashes: HashMap<String, String>,
}

impl PollReport {
    pub fn outcome(&self, branch: &str) -> Option<&BranchOutcome> {
        self.branches
            .iter()
            .find(|(b, _)| b == branch)
            .map(|(_, o)| o)
    }
}

/// Run one cycle for `acct_repo` over `branches`.
///
/// A branch without a last-known hash always builds. Per-branch errors
/// are logged and recorded, never retried here; the hash map is written
/// back whatever happened so a fixed branch is not re-triggered forever.
pub async fn change_check(
    service: &TriggerService,
    store: &dyn Storage,
    acct_repo: &str,
    branches: &[String],
) -> Result<PollReport> {
    let (account, repo) = split_acct_repo(acct_repo)?;

    let previous = match store.get_last_data(account, repo).await {
        Ok(state) => state.last_hashes,
        Err(e) => {
            tracing::warn!(acct_repo = %acct_repo, "could not get last poll data, every branch will build: {e}");
            HashMap::new()
        }
    };

    let mut report = PollReport {
        branches: Vec::new(),
        last_hashes: previous.clone(),
    };

    let ctx = match service.connect(acct_repo, None).await {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!(acct_repo = %acct_repo, "unable to connect to vcs for poll: {e}");
            persist(store, account, repo, &report.last_hashes).await;
            return Err(e);
        }
    };

    for branch in branches {
        let last = previous.get(branch).filter(|h| !h.is_empty()).cloned();
        let outcome = poll_branch(service, &ctx, acct_repo, branch, last, &mut report.last_hashes).await;
        report.branches.push((branch.clone(), outcome));
    }

    persist(store, account, repo, &report.last_hashes).await;
    Ok(report)
}

async fn poll_branch(
    service: &TriggerService,
    ctx: &VcsContext,
    acct_repo: &str,
    branch: &str,
    last: Option<String>,
    hashes: &mut HashMap<String, String>,
) -> BranchOutcome {
    let handler = ctx.conn.handler.as_ref();
    let head = match handler.get_branch_last_commit_data(acct_repo, branch).await {
        Ok(head) => head,
        Err(e) => {
            tracing::error!(acct_repo = %acct_repo, branch = %branch, "unable to get branch head: {e}");
            return BranchOutcome::Failed(e.to_string());
        }
    };

    if last.as_deref() == Some(head.hash.as_str()) {
        tracing::debug!(acct_repo = %acct_repo, branch = %branch, "no new commits");
        return BranchOutcome::UpToDate;
    }
    hashes.insert(branch.to_string(), head.hash.clone());

    let commits = match &last {
        Some(last) => handler
            .get_commit_log(acct_repo, branch, last)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(acct_repo = %acct_repo, branch = %branch, "unable to get commit log: {e}");
                Vec::new()
            }),
        None => {
            tracing::info!(acct_repo = %acct_repo, branch = %branch, "no last hash found, building regardless");
            Vec::new()
        }
    };

    let trigger = Trigger::Poll {
        repo: acct_repo.to_string(),
        branch: branch.to_string(),
        last_known_hash: last,
        head_commit: head.hash,
        commits,
    };

    let result = match service.resolve(ctx, trigger).await {
        Ok(target) => service.signal(ctx, target).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(dispatch) => BranchOutcome::Dispatched(dispatch),
        Err(e) if e.is_silent() => {
            tracing::info!(acct_repo = %acct_repo, branch = %branch, "{e}");
            BranchOutcome::NotBuilt(e.to_string())
        }
        Err(e) => {
            tracing::error!(acct_repo = %acct_repo, branch = %branch, "unable to signal poll build: {e}");
            BranchOutcome::Failed(e.to_string())
        }
    }
}

async fn persist(store: &dyn Storage, account: &str, repo: &str, hashes: &HashMap<String, String>) {
    if let Err(e) = store.set_last_data(account, repo, hashes).await {
        tracing::error!(account = %account, repo = %repo, "unable to set last poll data: {e}");
    }
}
