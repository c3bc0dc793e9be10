//! The unit of work handed to a build worker.

use serde::{Deserialize, Serialize};

use super::build_config::BuildConfig;
use super::credential::SubCredType;
use super::summary::SignaledBy;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetData {
    pub branch: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub commit_texts: Vec<String>,
}

impl ChangesetData {
    pub fn branch_only(branch: &str) -> Self {
        Self {
            branch: branch.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WerkerTask {
    /// Single-use secret-store token, minted at dispatch.
    pub vault_token: String,
    pub checkout_hash: String,
    pub build_conf: BuildConfig,
    pub vcs_token: String,
    pub vcs_type: SubCredType,
    pub full_name: String,
    pub branch: String,
    pub changeset_data: ChangesetData,
    pub id: i64,
    pub force: bool,
    pub signaled_by: SignaledBy,
    pub credentials_id: i64,
    /// Set for pull-request builds so the worker can comment back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_id: Option<i64>,
}

impl WerkerTask {
    /// A task without a build id or throwaway token; the signaler fills
    /// those in once the summary row exists.
    #[allow(clippy::too_many_arguments)]
    pub fn initial(
        build_conf: BuildConfig,
        checkout_hash: &str,
        vcs_token: &str,
        branch: &str,
        full_name: &str,
        signaled_by: SignaledBy,
        vcs_type: SubCredType,
        credentials_id: i64,
    ) -> Self {
        Self {
            vault_token: String::new(),
            checkout_hash: checkout_hash.to_string(),
            build_conf,
            vcs_token: vcs_token.to_string(),
            vcs_type,
            full_name: full_name.to_string(),
            branch: branch.to_string(),
            changeset_data: ChangesetData::branch_only(branch),
            id: 0,
            force: false,
            signaled_by,
            credentials_id,
            pr_id: None,
        }
    }
}
