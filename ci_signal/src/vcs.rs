//! VCS handler capability.
//!
//! Concrete Bitbucket and GitHub clients live with the server; the core
//! only sees [`VcsHandler`] and asks a [`HandlerFactory`] for one.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::credential::{Credential, SubCredType};
use crate::models::trigger::Commit;

/// Head of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchHead {
    pub hash: String,
    pub last_commit_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoLinks {
    pub hooks: String,
    pub commits: String,
    pub branches: String,
    pub pull_requests: String,
}

#[async_trait]
pub trait VcsHandler: Send + Sync {
    fn vcs_type(&self) -> SubCredType;

    /// Raw file contents at a commit. An absent file is `FileNotFound`.
    async fn get_file(&self, path: &str, repo: &str, commit: &str) -> Result<Vec<u8>>;

    /// Unknown branches are `BranchNotFound`.
    async fn get_branch_last_commit_data(&self, repo: &str, branch: &str) -> Result<BranchHead>;

    /// Files changed between two commits; with no `earliest`, the files
    /// changed by `latest` itself.
    async fn get_changed_files(
        &self,
        repo: &str,
        latest: &str,
        earliest: Option<&str>,
    ) -> Result<Vec<String>>;

    /// Commits on `branch` newer than `since_hash`, newest first.
    async fn get_commit_log(&self, repo: &str, branch: &str, since_hash: &str) -> Result<Vec<Commit>>;

    async fn post_pr_comment(
        &self,
        repo: &str,
        pr_id: i64,
        hash: &str,
        failed: bool,
        build_id: i64,
    ) -> Result<()>;

    /// Register `callback_url` on the repository's hooks endpoint.
    async fn create_webhook(&self, hooks_url: &str, callback_url: &str) -> Result<()>;

    async fn get_repo_links(&self, repo: &str) -> Result<RepoLinks>;
}

/// A ready handler plus the access token the worker will clone with.
#[derive(Clone)]
pub struct Connected {
    pub handler: Arc<dyn VcsHandler>,
    pub token: String,
}

#[async_trait]
pub trait HandlerFactory: Send + Sync {
    async fn connect(&self, cred: &Credential) -> Result<Connected>;
}
