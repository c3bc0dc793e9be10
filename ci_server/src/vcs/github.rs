//! GitHub integration — webhook validation and the REST v3 handler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde_json::{json, Value};
use sha2::Sha256;

use ci_signal::models::credential::SubCredType;
use ci_signal::models::trigger::Commit;
use ci_signal::vcs::{BranchHead, RepoLinks, VcsHandler};
use ci_signal::{Error, Result};

use super::{checked, pr_comment_text, transport, USER_AGENT};

type HmacSha256 = Hmac<Sha256>;

const JSON_MEDIA: &str = "application/vnd.github+json";
const RAW_MEDIA: &str = "application/vnd.github.raw";

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// Handler for one GitHub account, authenticated with a token.
pub struct GithubClient {
    http: reqwest::Client,
    api: String,
    token: String,
    log_base_url: String,
    webhook_secret: String,
}

impl GithubClient {
    pub fn new(
        http: reqwest::Client,
        api: &str,
        token: &str,
        log_base_url: &str,
        webhook_secret: &str,
    ) -> Self {
        Self {
            http,
            api: api.to_string(),
            token: token.to_string(),
            log_base_url: log_base_url.to_string(),
            webhook_secret: webhook_secret.to_string(),
        }
    }

    /// A request carrying exactly one `Accept` media type.
    fn request(&self, method: Method, url: &str, accept: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", accept)
            .header("User-Agent", USER_AGENT)
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.request(Method::GET, url, JSON_MEDIA)
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        self.request(Method::POST, url, JSON_MEDIA)
    }

    /// Raw contents of `path` at `commit`, not the contents metadata object.
    fn file_request(&self, path: &str, repo: &str, commit: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/repos/{repo}/contents/{path}", self.api);
        self.request(Method::GET, &url, RAW_MEDIA)
            .query(&[("ref", commit)])
    }

    async fn get_json(&self, url: &str, on_404: impl FnOnce() -> Error) -> Result<Value> {
        let resp = self.get(url).send().await.map_err(transport)?;
        let resp = checked(resp, url, on_404).await?;
        resp.json().await.map_err(transport)
    }
}

fn file_names(body: &Value) -> Vec<String> {
    body["files"]
        .as_array()
        .map(|files| {
            files
                .iter()
                .filter_map(|f| f["filename"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl VcsHandler for GithubClient {
    fn vcs_type(&self) -> SubCredType {
        SubCredType::Github
    }

    async fn get_file(&self, path: &str, repo: &str, commit: &str) -> Result<Vec<u8>> {
        let url = format!("{repo}/contents/{path}");
        let resp = self
            .file_request(path, repo, commit)
            .send()
            .await
            .map_err(transport)?;
        let resp = checked(resp, &url, || Error::FileNotFound {
            path: path.to_string(),
            repo: repo.to_string(),
            commit: commit.to_string(),
        })
        .await?;
        Ok(resp.bytes().await.map_err(transport)?.to_vec())
    }

    async fn get_branch_last_commit_data(&self, repo: &str, branch: &str) -> Result<BranchHead> {
        let url = format!("{}/repos/{repo}/branches/{branch}", self.api);
        let body = self
            .get_json(&url, || Error::BranchNotFound {
                repo: repo.to_string(),
                branch: branch.to_string(),
            })
            .await?;
        let hash = body["commit"]["sha"]
            .as_str()
            .ok_or_else(|| Error::Vcs(format!("branch {branch} of {repo} has no commit sha")))?;
        Ok(BranchHead {
            hash: hash.to_string(),
            last_commit_time: parse_time(&body["commit"]["commit"]["committer"]["date"]),
        })
    }

    async fn get_changed_files(
        &self,
        repo: &str,
        latest: &str,
        earliest: Option<&str>,
    ) -> Result<Vec<String>> {
        let url = match earliest {
            Some(earliest) => format!("{}/repos/{repo}/compare/{earliest}...{latest}", self.api),
            None => format!("{}/repos/{repo}/commits/{latest}", self.api),
        };
        let body = self
            .get_json(&url, || Error::Vcs(format!("commit {latest} not found in {repo}")))
            .await?;
        Ok(file_names(&body))
    }

    async fn get_commit_log(&self, repo: &str, branch: &str, since_hash: &str) -> Result<Vec<Commit>> {
        let url = format!("{}/repos/{repo}/commits", self.api);
        let resp = self
            .get(&url)
            .query(&[("sha", branch), ("per_page", "100")])
            .send()
            .await
            .map_err(transport)?;
        let resp = checked(resp, &url, || Error::BranchNotFound {
            repo: repo.to_string(),
            branch: branch.to_string(),
        })
        .await?;
        let body: Value = resp.json().await.map_err(transport)?;

        Ok(body
            .as_array()
            .map(|commits| {
                commits
                    .iter()
                    .take_while(|c| c["sha"].as_str() != Some(since_hash))
                    .map(|c| Commit {
                        hash: c["sha"].as_str().unwrap_or_default().to_string(),
                        message: c["commit"]["message"].as_str().unwrap_or_default().to_string(),
                        author: c["commit"]["author"]["name"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        date: parse_time(&c["commit"]["author"]["date"]),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn post_pr_comment(
        &self,
        repo: &str,
        pr_id: i64,
        hash: &str,
        failed: bool,
        build_id: i64,
    ) -> Result<()> {
        let url = format!("{}/repos/{repo}/issues/{pr_id}/comments", self.api);
        let body = json!({ "body": pr_comment_text(&self.log_base_url, hash, failed, build_id) });
        let resp = self.post(&url).json(&body).send().await.map_err(transport)?;
        checked(resp, &url, || Error::NotFound(format!("pull request {pr_id} on {repo}"))).await?;
        Ok(())
    }

    async fn create_webhook(&self, hooks_url: &str, callback_url: &str) -> Result<()> {
        let mut config = json!({ "url": callback_url, "content_type": "json" });
        if !self.webhook_secret.is_empty() {
            config["secret"] = Value::String(self.webhook_secret.clone());
        }
        let body = json!({
            "name": "web",
            "active": true,
            "events": ["push", "pull_request"],
            "config": config,
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
        let base = format!("{}/repos/{repo}", self.api);
        Ok(RepoLinks {
            hooks: format!("{base}/hooks"),
            commits: format!("{base}/commits"),
            branches: format!("{base}/branches"),
            pull_requests: format!("{base}/pulls"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn accepts_valid_signature() {
        let body = br#"{"zen":"Design for failure."}"#;
        assert!(validate_signature("s3cret", body, &sign("s3cret", body)));
    }

    #[test]
    fn rejects_wrong_secret_or_garbage() {
        let body = b"{}";
        assert!(!validate_signature("s3cret", body, &sign("other", body)));
        assert!(!validate_signature("s3cret", body, "sha256=not-hex"));
        assert!(!validate_signature("s3cret", body, ""));
    }

    #[test]
    fn empty_secret_disables_validation() {
        assert!(validate_signature("", b"{}", ""));
    }

    fn client() -> GithubClient {
        GithubClient::new(
            reqwest::Client::new(),
            "https://api.github.test",
            "tok",
            "https://ci.example.com/builds",
            "",
        )
    }

    #[test]
    fn file_request_asks_for_raw_contents_only() {
        let req = client()
            .file_request("ocelot.yml", "acme/widgets", "abc123")
            .build()
            .unwrap();
        let accept: Vec<_> = req.headers().get_all("accept").iter().collect();
        assert_eq!(accept, [RAW_MEDIA]);
        assert_eq!(
            req.url().as_str(),
            "https://api.github.test/repos/acme/widgets/contents/ocelot.yml?ref=abc123"
        );
    }

    #[test]
    fn api_requests_ask_for_json() {
        let req = client()
            .get("https://api.github.test/repos/acme/widgets/branches/main")
            .build()
            .unwrap();
        let accept: Vec<_> = req.headers().get_all("accept").iter().collect();
        assert_eq!(accept, [JSON_MEDIA]);
        assert_eq!(req.headers()["authorization"], "Bearer tok");
    }

    #[test]
    fn compare_files_are_listed() {
        let body = json!({"files": [{"filename": "src/lib.rs"}, {"filename": "ocelot.yml"}]});
        assert_eq!(file_names(&body), ["src/lib.rs", "ocelot.yml"]);
        assert!(file_names(&json!({})).is_empty());
    }
}
