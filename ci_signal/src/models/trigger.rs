//! Canonical trigger representation shared by every event adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::credential::SubCredType;
use super::summary::SignaledBy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

/// API links of a pull request, passed through to the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrUrls {
    pub commits: String,
    pub comments: String,
    pub statuses: String,
    pub approve: String,
    pub decline: String,
    pub merge: String,
}

/// Something happened that might warrant a build.
///
/// `vcs_type` is set when the adapter knows which VCS sent the event
/// (webhooks); otherwise the credential resolver looks it up.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Push {
        repo: String,
        vcs_type: Option<SubCredType>,
        branch: String,
        head_commit: String,
        previous_commit: Option<String>,
        commits: Vec<Commit>,
    },
    PullRequest {
        repo: String,
        vcs_type: Option<SubCredType>,
        source_branch: String,
        source_commit: String,
        destination_branch: String,
        destination_commit: String,
        pr_id: i64,
        urls: PrUrls,
    },
    /// One branch of a poll cycle. `head_commit` is the branch head the
    /// poll adapter observed and `commits` the log since the last known hash.
    Poll {
        repo: String,
        branch: String,
        last_known_hash: Option<String>,
        head_commit: String,
        commits: Vec<Commit>,
    },
    ManualRequest {
        repo: String,
        hash: Option<String>,
        branch: Option<String>,
        force: bool,
    },
}

impl Trigger {
    pub fn repo(&self) -> &str {
        match self {
            Trigger::Push { repo, .. }
            | Trigger::PullRequest { repo, .. }
            | Trigger::Poll { repo, .. }
            | Trigger::ManualRequest { repo, .. } => repo,
        }
    }

    pub fn signaled_by(&self) -> SignaledBy {
        match self {
            Trigger::Push { .. } => SignaledBy::Push,
            Trigger::PullRequest { .. } => SignaledBy::PullRequest,
            Trigger::Poll { .. } => SignaledBy::Poll,
            Trigger::ManualRequest { .. } => SignaledBy::Requested,
        }
    }

    pub fn vcs_type(&self) -> Option<SubCredType> {
        match self {
            Trigger::Push { vcs_type, .. } | Trigger::PullRequest { vcs_type, .. } => *vcs_type,
            _ => None,
        }
    }
}
