//! Error taxonomy shared by every signaling component.

use crate::models::credential::SubCredType;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A credential, build summary or poll registration does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The account has more than one VCS credential and no type was given.
    #[error("there are multiple vcs types to the account {account}: {}", join_types(.types))]
    MultipleVcsTypes {
        account: String,
        types: Vec<SubCredType>,
    },

    /// The build config or branch filters reject this trigger.
    #[error("build not viable: {0}")]
    NotViable(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("secret store unavailable: {0}")]
    SecretStoreUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("unable to write to queue: {0}")]
    Queue(String),

    /// The requested file is absent at that commit.
    #[error("file {path} not found in {repo} at {commit}")]
    FileNotFound {
        path: String,
        repo: String,
        commit: String,
    },

    #[error("branch {branch} not found in {repo}")]
    BranchNotFound { repo: String, branch: String },

    #[error("vcs request failed: {0}")]
    Vcs(String),

    #[error("unable to parse build config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// A webhook arrived that carries nothing to build.
    #[error("nothing to build: {0}")]
    NoBuildEvent(String),

    #[error("unsupported event type {0}")]
    UnsupportedEvent(String),

    #[error("build {id} cannot move from {from} to {to}")]
    InvalidTransition { id: i64, from: String, to: String },

    /// One or both halves of a credential delete failed.
    #[error("{}", delete_message(.store, .secret))]
    CredentialDelete {
        store: Option<String>,
        secret: Option<String>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Outcomes that mean "no build happens" rather than a failure.
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            Error::NotViable(_) | Error::FileNotFound { .. } | Error::NoBuildEvent(_)
        )
    }

    /// Infrastructure failures the caller should surface as internal errors.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::SecretStoreUnavailable(_)
                | Error::Storage(_)
                | Error::Queue(_)
                | Error::Internal(_)
        )
    }

    pub fn not_found_cred(sub_type: SubCredType, account: &str) -> Self {
        Error::NotFound(format!("no credential found for {sub_type} {account}"))
    }

    pub fn not_found_sum(key: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("no build summary found for {key}"))
    }
}

fn join_types(types: &[SubCredType]) -> String {
    types
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn delete_message(store: &Option<String>, secret: &Option<String>) -> String {
    let mut parts = Vec::new();
    if let Some(e) = store {
        parts.push(format!("unable to delete un-sensitive data: {e}"));
    }
    if let Some(e) = secret {
        parts.push(format!("unable to delete sensitive data: {e}"));
    }
    parts.join("; ")
}
