//! Repository host clients and the factory that connects them from credentials.

pub mod bitbucket;
pub mod github;

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;

use ci_signal::models::credential::{Credential, SubCredType};
use ci_signal::vcs::{Connected, HandlerFactory};
use ci_signal::{Error, Result};

use bitbucket::BitbucketClient;
use github::GithubClient;

const USER_AGENT: &str = "relay-ci";

/// Connects a [`GithubClient`] or [`BitbucketClient`] for a VCS credential.
#[derive(Clone)]
pub struct VcsFactory {
    http: reqwest::Client,
    github_api: String,
    bitbucket_api: String,
    log_base_url: String,
    webhook_secret: String,
}

impl VcsFactory {
    pub fn new(
        http: reqwest::Client,
        github_api: &str,
        bitbucket_api: &str,
        log_base_url: &str,
        webhook_secret: &str,
    ) -> Self {
        Self {
            http,
            github_api: github_api.trim_end_matches('/').to_string(),
            bitbucket_api: bitbucket_api.trim_end_matches('/').to_string(),
            log_base_url: log_base_url.trim_end_matches('/').to_string(),
            webhook_secret: webhook_secret.to_string(),
        }
    }
}

#[async_trait]
impl HandlerFactory for VcsFactory {
    async fn connect(&self, cred: &Credential) -> Result<Connected> {
        match cred.sub_type {
            SubCredType::Github => {
                let client = GithubClient::new(
                    self.http.clone(),
                    &self.github_api,
                    &cred.secret,
                    &self.log_base_url,
                    &self.webhook_secret,
                );
                Ok(Connected {
                    handler: Arc::new(client),
                    token: cred.secret.clone(),
                })
            }
            SubCredType::Bitbucket => {
                let token = bitbucket::fetch_access_token(&self.http, cred).await?;
                let client = BitbucketClient::new(
                    self.http.clone(),
                    &self.bitbucket_api,
                    &token,
                    &self.log_base_url,
                );
                Ok(Connected {
                    handler: Arc::new(client),
                    token,
                })
            }
            other => Err(Error::Validation(format!("{other} is not a vcs type"))),
        }
    }
}

/// Text posted on a pull request when its build finishes.
pub(crate) fn pr_comment_text(log_base_url: &str, hash: &str, failed: bool, build_id: i64) -> String {
    let short = hash.get(..7).unwrap_or(hash);
    let outcome = if failed { "failed" } else { "passed" };
    format!("Build {build_id} of {short} {outcome}. Logs: {log_base_url}/{build_id}")
}

pub(crate) fn transport(e: reqwest::Error) -> Error {
    Error::Vcs(e.to_string())
}

/// Turn a non-success response into an error, with `on_404` for a missing resource.
pub(crate) async fn checked(
    resp: reqwest::Response,
    what: &str,
    on_404: impl FnOnce() -> Error,
) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(on_404());
    }
    let text = resp.text().await.unwrap_or_default();
    Err(Error::Vcs(format!("{what}: {status} {text}")))
}
