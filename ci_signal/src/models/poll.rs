//! Polling registrations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    pub account: String,
    pub repo: String,
    pub cron: String,
    pub branches: Vec<String>,
}

impl PollRequest {
    pub fn acct_repo(&self) -> String {
        format!("{}/{}", self.account, self.repo)
    }

    /// Branches as stored in `polling_repos.branches`.
    pub fn branches_joined(&self) -> String {
        self.branches.join(",")
    }
}

/// Parse a comma-joined branch list, dropping blanks.
pub fn split_branches(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .map(str::to_string)
        .collect()
}

/// What the last poll cycle saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollState {
    pub last_cron_time: Option<DateTime<Utc>>,
    pub last_hashes: HashMap<String, String>,
}
