//! Turns a [`Trigger`] into one (account, repo, branch, commit) target,
//! resolves credentials and config once, and hands the task to the
//! [`Signaler`].

use std::sync::Arc;

use crate::buildconf;
use crate::credentials::CredentialResolver;
use crate::error::{Error, Result};
use crate::models::credential::{split_acct_repo, Credential, SubCredType};
use crate::models::summary::{BuildSummary, SignaledBy};
use crate::models::task::{ChangesetData, WerkerTask};
use crate::models::trigger::{Commit, Trigger};
use crate::signaler::Signaler;
use crate::store::Storage;
use crate::vcs::{Connected, HandlerFactory};

/// What happened to a trigger that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Queued { build_id: i64, hash: String },
    /// The commit has no build file; nothing to do.
    NoBuildFile { hash: String },
}

/// Credential plus connected handler for one repository.
#[derive(Clone)]
pub struct VcsContext {
    pub cred: Credential,
    pub conn: Connected,
}

/// A trigger reduced to the single commit it builds.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub acct_repo: String,
    pub branch: String,
    pub hash: String,
    /// Base commit for the changed-files diff.
    pub previous: Option<String>,
    pub commits: Vec<Commit>,
    pub signaled_by: SignaledBy,
    pub force: bool,
    pub pr_id: Option<i64>,
}

#[derive(Clone)]
pub struct TriggerService {
    creds: CredentialResolver,
    factory: Arc<dyn HandlerFactory>,
    store: Arc<dyn Storage>,
    signaler: Signaler,
}

impl TriggerService {
    pub fn new(
        creds: CredentialResolver,
        factory: Arc<dyn HandlerFactory>,
        store: Arc<dyn Storage>,
        signaler: Signaler,
    ) -> Self {
        Self {
            creds,
            factory,
            store,
            signaler,
        }
    }

    pub fn credentials(&self) -> &CredentialResolver {
        &self.creds
    }

    pub async fn handle(&self, trigger: Trigger) -> Result<Dispatch> {
        let acct_repo = trigger.repo().to_string();
        let ctx = self.connect(&acct_repo, trigger.vcs_type()).await?;
        let target = self.resolve(&ctx, trigger).await?;
        self.signal(&ctx, target).await
    }

    /// Resolve the credential for `acct_repo` and connect its handler.
    pub async fn connect(
        &self,
        acct_repo: &str,
        vcs_type: Option<SubCredType>,
    ) -> Result<VcsContext> {
        let cred = self.creds.resolve(acct_repo, vcs_type, false).await?;
        let conn = self.factory.connect(&cred).await?;
        Ok(VcsContext { cred, conn })
    }

    /// Reduce a trigger to its target commit.
    pub async fn resolve(&self, ctx: &VcsContext, trigger: Trigger) -> Result<Target> {
        let signaled_by = trigger.signaled_by();
        match trigger {
            Trigger::Push {
                repo,
                branch,
                head_commit,
                previous_commit,
                commits,
                ..
            } => {
                if head_commit.is_empty() {
                    return Err(Error::NoBuildEvent(format!(
                        "push to {repo} has no head commit"
                    )));
                }
                Ok(Target {
                    acct_repo: repo,
                    branch,
                    hash: head_commit,
                    previous: previous_commit,
                    commits,
                    signaled_by,
                    force: false,
                    pr_id: None,
                })
            }
            Trigger::PullRequest {
                repo,
                source_branch,
                source_commit,
                destination_commit,
                pr_id,
                ..
            } => {
                if source_commit.is_empty() {
                    return Err(Error::NoBuildEvent(format!(
                        "pull request {pr_id} on {repo} has no source commit"
                    )));
                }
                Ok(Target {
                    acct_repo: repo,
                    branch: source_branch,
                    hash: source_commit,
                    previous: Some(destination_commit).filter(|h| !h.is_empty()),
                    commits: Vec::new(),
                    signaled_by,
                    force: false,
                    pr_id: Some(pr_id),
                })
            }
            Trigger::Poll {
                repo,
                branch,
                last_known_hash,
                head_commit,
                commits,
            } => Ok(Target {
                acct_repo: repo,
                branch,
                hash: head_commit,
                previous: last_known_hash,
                commits,
                signaled_by,
                force: false,
                pr_id: None,
            }),
            Trigger::ManualRequest {
                repo,
                hash,
                branch,
                force,
            } => self.resolve_manual(ctx, repo, hash, branch, force).await,
        }
    }

    /// Fetch config, build the task and dispatch it.
    pub async fn signal(&self, ctx: &VcsContext, target: Target) -> Result<Dispatch> {
        let handler = ctx.conn.handler.as_ref();
        let conf = match buildconf::fetch_and_validate(handler, &target.acct_repo, &target.hash)
            .await
        {
            Ok(conf) => conf,
            Err(Error::FileNotFound { .. }) => {
                tracing::info!(
                    acct_repo = %target.acct_repo,
                    hash = %target.hash,
                    "no build file at commit, nothing to build"
                );
                return Ok(Dispatch::NoBuildFile { hash: target.hash });
            }
            Err(e) => return Err(e),
        };

        let mut task = WerkerTask::initial(
            conf,
            &target.hash,
            &ctx.conn.token,
            &target.branch,
            &target.acct_repo,
            target.signaled_by,
            ctx.cred.sub_type,
            ctx.cred.id.unwrap_or_default(),
        );
        task.pr_id = target.pr_id;
        task.changeset_data = self.changeset(ctx, &target).await;

        let build_id = self
            .signaler
            .check_viable_then_queue_and_store(task, target.force, &target.commits)
            .await?;
        Ok(Dispatch::Queued {
            build_id,
            hash: target.hash,
        })
    }

    async fn changeset(&self, ctx: &VcsContext, target: &Target) -> ChangesetData {
        let files = ctx
            .conn
            .handler
            .get_changed_files(&target.acct_repo, &target.hash, target.previous.as_deref())
            .await;
        match files {
            Ok(files_changed) => ChangesetData {
                branch: target.branch.clone(),
                files_changed,
                commit_texts: target.commits.iter().map(|c| c.message.clone()).collect(),
            },
            Err(e) => {
                tracing::warn!(
                    acct_repo = %target.acct_repo,
                    hash = %target.hash,
                    "unable to generate changeset, changeset data will only include branch: {e}"
                );
                ChangesetData::branch_only(&target.branch)
            }
        }
    }

    async fn resolve_manual(
        &self,
        ctx: &VcsContext,
        acct_repo: String,
        hash: Option<String>,
        branch: Option<String>,
        force: bool,
    ) -> Result<Target> {
        let (account, repo) = split_acct_repo(&acct_repo)?;
        let hash = hash.filter(|h| !h.is_empty());
        let branch = branch.filter(|b| !b.is_empty());

        let previous = match &hash {
            Some(h) => self.previous_build(h).await?,
            None => None,
        };
        if let Some(sum) = &previous {
            if sum.account != account || sum.repo != repo {
                return Err(Error::Validation(format!(
                    "hash {} belongs to {}/{}, not {acct_repo}",
                    sum.hash, sum.account, sum.repo
                )));
            }
        }

        let (hash, branch) = match (hash, branch) {
            (None, None) => {
                return Err(Error::Validation(
                    "a branch or a hash is required to build".to_string(),
                ))
            }
            (None, Some(branch)) => {
                let head = ctx
                    .conn
                    .handler
                    .get_branch_last_commit_data(&acct_repo, &branch)
                    .await
                    .map_err(|e| match e {
                        Error::BranchNotFound { .. } => Error::Validation(e.to_string()),
                        other => other,
                    })?;
                (head.hash, branch)
            }
            (Some(hash), Some(branch)) => {
                let full = previous.map(|sum| sum.hash).unwrap_or(hash);
                (full, branch)
            }
            (Some(hash), None) => match previous {
                Some(sum) => (sum.hash, sum.branch),
                None => {
                    return Err(Error::Validation(format!(
                        "branch is required when hash {hash} has never been built"
                    )))
                }
            },
        };

        Ok(Target {
            acct_repo,
            branch,
            hash,
            previous: None,
            commits: Vec::new(),
            signaled_by: SignaledBy::Requested,
            force,
            pr_id: None,
        })
    }

    async fn previous_build(&self, partial_hash: &str) -> Result<Option<BuildSummary>> {
        match self.store.retrieve_latest_sum(partial_hash).await {
            Ok(sum) => Ok(Some(sum)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => {
                tracing::error!(hash = %partial_hash, "unable to look up previous build: {e}");
                Err(e)
            }
        }
    }
}
