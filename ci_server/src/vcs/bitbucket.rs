//! Bitbucket Cloud 2.0 handler, authenticated through OAuth client credentials.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use ci_signal::models::credential::{Credential, SubCredType};
use ci_signal::models::trigger::Commit;
use ci_signal::vcs::{BranchHead, RepoLinks, VcsHandler};
use ci_signal::{Error, Result};

use super::{checked, pr_comment_text, transport, USER_AGENT};

/// Exchange the credential's client id and secret for an access token.
pub async fn fetch_access_token(http: &reqwest::Client, cred: &Credential) -> Result<String> {
    let (Some(client_id), Some(token_url)) = (cred.field("clientId"), cred.field("tokenURL")) else {
        return Err(Error::Validation(format!(
            "bitbucket credential for {} is missing clientId or tokenURL",
            cred.account
        )));
    };

    let resp = http
        .post(token_url)
        .basic_auth(client_id, Some(&cred.secret))
        .header("User-Agent", USER_AGENT)
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await
        .map_err(transport)?;
    let resp = checked(resp, token_url, || {
        Error::Vcs(format!("token endpoint {token_url} not found"))
    })
    .await?;
    let body: Value = resp.json().await.map_err(transport)?;

    body["access_token"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Error::Vcs("token response has no access_token".to_string()))
}

pub struct BitbucketClient {
    http: reqwest::Client,
    api: String,
    token: String,
    log_base_url: String,
}

impl BitbucketClient {
    pub fn new(http: reqwest::Client, api: &str, token: &str, log_base_url: &str) -> Self {
        Self {
            http,
            api: api.to_string(),
            token: token.to_string(),
            log_base_url: log_base_url.to_string(),
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .bearer_auth(&self.token)
            .header("User-Agent", USER_AGENT)
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .bearer_auth(&self.token)
            .header("User-Agent", USER_AGENT)
    }

    async fn get_json(&self, url: &str, on_404: impl FnOnce() -> Error) -> Result<Value> {
        let resp = self.get(url).send().await.map_err(transport)?;
        let resp = checked(resp, url, on_404).await?;
        resp.json().await.map_err(transport)
    }

    /// Walk a paginated listing, stopping once `keep` says no.
    async fn paged<T>(
        &self,
        first: String,
        on_404: impl Fn() -> Error,
        mut keep: impl FnMut(&Value) -> Option<T>,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next.take() {
            let page = self.get_json(&url, &on_404).await?;
            for value in page["values"].as_array().into_iter().flatten() {
                match keep(value) {
                    Some(item) => out.push(item),
                    None => return Ok(out),
                }
            }
            next = page["next"].as_str().map(str::to_string);
        }
        Ok(out)
    }
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn diffstat_path(entry: &Value) -> Option<String> {
    entry["new"]["path"]
        .as_str()
        .or_else(|| entry["old"]["path"].as_str())
        .map(str::to_string)
}

fn link(body: &Value, name: &str) -> String {
    body["links"][name]["href"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl VcsHandler for BitbucketClient {
    fn vcs_type(&self) -> SubCredType {
        SubCredType::Bitbucket
    }

    async fn get_file(&self, path: &str, repo: &str, commit: &str) -> Result<Vec<u8>> {
        let url = format!("{}/repositories/{repo}/src/{commit}/{path}", self.api);
        let resp = self.get(&url).send().await.map_err(transport)?;
        let resp = checked(resp, &url, || Error::FileNotFound {
            path: path.to_string(),
            repo: repo.to_string(),
            commit: commit.to_string(),
        })
        .await?;
        Ok(resp.bytes().await.map_err(transport)?.to_vec())
    }

    async fn get_branch_last_commit_data(&self, repo: &str, branch: &str) -> Result<BranchHead> {
        let url = format!("{}/repositories/{repo}/refs/branches/{branch}", self.api);
        let body = self
            .get_json(&url, || Error::BranchNotFound {
                repo: repo.to_string(),
                branch: branch.to_string(),
            })
            .await?;
        let hash = body["target"]["hash"]
            .as_str()
            .ok_or_else(|| Error::Vcs(format!("branch {branch} of {repo} has no target hash")))?;
        Ok(BranchHead {
            hash: hash.to_string(),
            last_commit_time: parse_time(&body["target"]["date"]),
        })
    }

    async fn get_changed_files(
        &self,
        repo: &str,
        latest: &str,
        earliest: Option<&str>,
    ) -> Result<Vec<String>> {
        let spec = match earliest {
            Some(earliest) => format!("{latest}..{earliest}"),
            None => latest.to_string(),
        };
        let url = format!("{}/repositories/{repo}/diffstat/{spec}", self.api);
        let mut files = self
            .paged(
                url,
                || Error::Vcs(format!("diffstat {spec} not found in {repo}")),
                |entry| Some(diffstat_path(entry)),
            )
            .await?
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        files.dedup();
        Ok(files)
    }

    async fn get_commit_log(&self, repo: &str, branch: &str, since_hash: &str) -> Result<Vec<Commit>> {
        let url = format!("{}/repositories/{repo}/commits/{branch}", self.api);
        self.paged(
            url,
            || Error::BranchNotFound {
                repo: repo.to_string(),
                branch: branch.to_string(),
            },
            |c| {
                let hash = c["hash"].as_str()?;
                if hash == since_hash {
                    return None;
                }
                Some(Commit {
                    hash: hash.to_string(),
                    message: c["message"].as_str().unwrap_or_default().to_string(),
                    author: c["author"]["raw"].as_str().unwrap_or_default().to_string(),
                    date: parse_time(&c["date"]),
                })
            },
        )
        .await
    }

    async fn post_pr_comment(
        &self,
        repo: &str,
        pr_id: i64,
        hash: &str,
        failed: bool,
        build_id: i64,
    ) -> Result<()> {
        let url = format!(
            "{}/repositories/{repo}/pullrequests/{pr_id}/comments",
            self.api
        );
        let body = json!({
            "content": { "raw": pr_comment_text(&self.log_base_url, hash, failed, build_id) }
        });
        let resp = self.post(&url).json(&body).send().await.map_err(transport)?;
        checked(resp, &url, || Error::NotFound(format!("pull request {pr_id} on {repo}"))).await?;
        Ok(())
    }

    async fn create_webhook(&self, hooks_url: &str, callback_url: &str) -> Result<()> {
        let body = json!({
            "description": "relay-ci",
            "url": callback_url,
            "active": true,
            "events": ["repo:push", "pullrequest:created", "pullrequest:updated"],
        });
        let resp = self
            .post(hooks_url)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        checked(resp, hooks_url, || Error::NotFound(format!("hooks endpoint {hooks_url}"))).await?;
        Ok(())
    }

    async fn get_repo_links(&self, repo: &str) -> Result<RepoLinks> {
        let url = format!("{}/repositories/{repo}", self.api);
        let body = self
            .get_json(&url, || Error::NotFound(format!("repository {repo}")))
            .await?;
        Ok(RepoLinks {
            hooks: link(&body, "hooks"),
            commits: link(&body, "commits"),
            branches: link(&body, "branches"),
            pull_requests: link(&body, "pullrequests"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diffstat_prefers_new_path() {
        let renamed = json!({"old": {"path": "a.rs"}, "new": {"path": "b.rs"}});
        let deleted = json!({"old": {"path": "gone.rs"}, "new": null});
        assert_eq!(diffstat_path(&renamed).as_deref(), Some("b.rs"));
        assert_eq!(diffstat_path(&deleted).as_deref(), Some("gone.rs"));
        assert_eq!(diffstat_path(&json!({})), None);
    }

    #[test]
    fn links_are_read_from_the_repository() {
        let body = json!({"links": {"hooks": {"href": "https://api.bitbucket.org/2.0/repositories/acme/widgets/hooks"}}});
        assert_eq!(
            link(&body, "hooks"),
            "https://api.bitbucket.org/2.0/repositories/acme/widgets/hooks"
        );
        assert_eq!(link(&body, "commits"), "");
    }

    #[tokio::test]
    async fn token_exchange_needs_client_fields() {
        let cred = Credential {
            id: Some(1),
            account: "acme".into(),
            identifier: "BITBUCKET/acme".into(),
            sub_type: SubCredType::Bitbucket,
            fields: serde_json::Map::new(),
            secret: "s".into(),
        };
        let err = fetch_access_token(&reqwest::Client::new(), &cred).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
