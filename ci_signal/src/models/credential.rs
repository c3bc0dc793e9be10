//! Credentials: non-secret records kept in the relational store, secrets
//! kept in the secret store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Placeholder returned instead of a secret when hiding is requested.
pub const HIDDEN_SECRET: &str = "*********";

/// Key of the secret inside the secret-store payload.
pub const SECRET_KEY: &str = "clientsecret";

/// Parent family of a credential subtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredType {
    Vcs,
    Repo,
    K8s,
    Ssh,
    Generic,
}

impl CredType {
    pub fn as_str(self) -> &'static str {
        match self {
            CredType::Vcs => "vcs",
            CredType::Repo => "repo",
            CredType::K8s => "k8s",
            CredType::Ssh => "ssh",
            CredType::Generic => "generic",
        }
    }

    pub fn subtypes(self) -> &'static [SubCredType] {
        match self {
            CredType::Vcs => &[SubCredType::Bitbucket, SubCredType::Github],
            CredType::Repo => &[SubCredType::Nexus, SubCredType::Maven, SubCredType::Docker],
            CredType::K8s => &[SubCredType::Kubeconf],
            CredType::Ssh => &[SubCredType::SshKey],
            CredType::Generic => &[SubCredType::Env],
        }
    }
}

impl fmt::Display for CredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CredType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "vcs" => Ok(CredType::Vcs),
            "repo" => Ok(CredType::Repo),
            "k8s" => Ok(CredType::K8s),
            "ssh" => Ok(CredType::Ssh),
            "generic" => Ok(CredType::Generic),
            other => Err(Error::Validation(format!("unknown credential type {other}"))),
        }
    }
}

/// Concrete credential kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubCredType {
    Bitbucket,
    Github,
    Nexus,
    Maven,
    Docker,
    Kubeconf,
    #[serde(rename = "SSHKEY")]
    SshKey,
    Env,
}

impl SubCredType {
    pub fn as_str(self) -> &'static str {
        match self {
            SubCredType::Bitbucket => "BITBUCKET",
            SubCredType::Github => "GITHUB",
            SubCredType::Nexus => "NEXUS",
            SubCredType::Maven => "MAVEN",
            SubCredType::Docker => "DOCKER",
            SubCredType::Kubeconf => "KUBECONF",
            SubCredType::SshKey => "SSHKEY",
            SubCredType::Env => "ENV",
        }
    }

    pub fn parent(self) -> CredType {
        match self {
            SubCredType::Bitbucket | SubCredType::Github => CredType::Vcs,
            SubCredType::Nexus | SubCredType::Maven | SubCredType::Docker => CredType::Repo,
            SubCredType::Kubeconf => CredType::K8s,
            SubCredType::SshKey => CredType::Ssh,
            SubCredType::Env => CredType::Generic,
        }
    }

    /// Non-secret fields a credential of this subtype must carry.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            SubCredType::Bitbucket => &["clientId", "tokenURL"],
            SubCredType::Nexus | SubCredType::Maven | SubCredType::Docker => &["username", "url"],
            _ => &[],
        }
    }
}

impl fmt::Display for SubCredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubCredType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BITBUCKET" => Ok(SubCredType::Bitbucket),
            "GITHUB" => Ok(SubCredType::Github),
            "NEXUS" => Ok(SubCredType::Nexus),
            "MAVEN" => Ok(SubCredType::Maven),
            "DOCKER" => Ok(SubCredType::Docker),
            "KUBECONF" => Ok(SubCredType::Kubeconf),
            "SSHKEY" => Ok(SubCredType::SshKey),
            "ENV" => Ok(SubCredType::Env),
            other => Err(Error::Validation(format!("unknown credential subtype {other}"))),
        }
    }
}

/// Identifier under which a VCS credential is stored.
pub fn vcs_identifier(sub_type: SubCredType, account: &str) -> String {
    format!("{}/{}", sub_type.as_str(), account)
}

/// Secret-store path for a credential; a pure function of its keys.
pub fn secret_path(sub_type: SubCredType, account: &str, identifier: &str) -> String {
    format!(
        "secret/data/creds/{}/{}/{}/{}",
        sub_type.parent().as_str(),
        account,
        sub_type.as_str().to_ascii_lowercase(),
        identifier
    )
}

/// A credential with its secret half attached.
///
/// `id` is assigned by storage; `fields` holds the subtype-specific
/// non-secret values (URLs, client ids, usernames).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    #[serde(default)]
    pub id: Option<i64>,
    pub account: String,
    #[serde(default)]
    pub identifier: String,
    pub sub_type: SubCredType,
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub secret: String,
}

impl Credential {
    pub fn cred_type(&self) -> CredType {
        self.sub_type.parent()
    }

    pub fn secret_path(&self) -> String {
        secret_path(self.sub_type, &self.account, &self.identifier)
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }

    /// Fill in the canonical identifier for VCS credentials if absent.
    pub fn with_default_identifier(mut self) -> Self {
        if self.identifier.is_empty() && self.cred_type() == CredType::Vcs {
            self.identifier = vcs_identifier(self.sub_type, &self.account);
        }
        self
    }

    /// Required-field checks run before anything is written.
    pub fn validate_for_insert(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.account.trim().is_empty() {
            missing.push("account");
        }
        if self.identifier.trim().is_empty() {
            missing.push("identifier");
        }
        if self.secret.is_empty() {
            missing.push("secret");
        }
        for &name in self.sub_type.required_fields() {
            if self.field(name).map_or(true, |v| v.trim().is_empty()) {
                missing.push(name);
            }
        }
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "{} credential is missing required fields: {}",
                self.sub_type,
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// The secret-store payload for this credential.
    pub fn secret_payload(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert(
            SECRET_KEY.to_string(),
            serde_json::Value::String(self.secret.clone()),
        );
        map
    }
}

/// Split `account/repo` into its parts.
pub fn split_acct_repo(acct_repo: &str) -> Result<(&str, &str)> {
    match acct_repo.split_once('/') {
        Some((acct, repo)) if !acct.is_empty() && !repo.is_empty() && !repo.contains('/') => {
            Ok((acct, repo))
        }
        _ => Err(Error::Validation(format!(
            "{acct_repo} is not in the format account/repo"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bitbucket(fields: serde_json::Value) -> Credential {
        Credential {
            id: None,
            account: "acme".into(),
            identifier: String::new(),
            sub_type: SubCredType::Bitbucket,
            fields: fields.as_object().cloned().unwrap_or_default(),
            secret: "s3cret".into(),
        }
        .with_default_identifier()
    }

    #[test]
    fn vcs_identifier_is_subtype_slash_account() {
        let cred = bitbucket(json!({}));
        assert_eq!(cred.identifier, "BITBUCKET/acme");
    }

    #[test]
    fn secret_path_is_deterministic() {
        let a = secret_path(SubCredType::Github, "acme", "GITHUB/acme");
        let b = secret_path(SubCredType::Github, "acme", "GITHUB/acme");
        assert_eq!(a, b);
        assert_eq!(a, "secret/data/creds/vcs/acme/github/GITHUB/acme");
    }

    #[test]
    fn bitbucket_requires_client_id_and_token_url() {
        let err = bitbucket(json!({"clientId": "abc"}))
            .validate_for_insert()
            .unwrap_err();
        assert!(err.to_string().contains("tokenURL"));

        bitbucket(json!({"clientId": "abc", "tokenURL": "https://bitbucket.org/token"}))
            .validate_for_insert()
            .unwrap();
    }

    #[test]
    fn subtype_parsing_is_case_insensitive() {
        assert_eq!("github".parse::<SubCredType>().unwrap(), SubCredType::Github);
        assert_eq!("SshKey".parse::<SubCredType>().unwrap(), SubCredType::SshKey);
        assert!("svn".parse::<SubCredType>().is_err());
    }

    #[test]
    fn split_acct_repo_rejects_bad_shapes() {
        assert_eq!(split_acct_repo("acme/widgets").unwrap(), ("acme", "widgets"));
        assert!(split_acct_repo("acme").is_err());
        assert!(split_acct_repo("acme/").is_err());
        assert!(split_acct_repo("a/b/c").is_err());
    }
}
