//! Vault KV v2 client backing the secret store.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};

use ci_signal::store::SecretStore;
use ci_signal::{Error, Result};

#[derive(Clone)]
pub struct VaultClient {
    http: reqwest::Client,
    addr: String,
    token: String,
    throwaway_ttl: String,
}

impl VaultClient {
    pub fn new(http: reqwest::Client, addr: &str, token: &str, throwaway_ttl: &str) -> Self {
        Self {
            http,
            addr: addr.trim_end_matches('/').to_string(),
            token: token.to_string(),
            throwaway_ttl: throwaway_ttl.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.addr, path.trim_start_matches('/'))
    }

    fn unavailable(e: reqwest::Error) -> Error {
        Error::SecretStoreUnavailable(e.to_string())
    }

    async fn rejected(resp: reqwest::Response, what: &str) -> Error {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        Error::SecretStoreUnavailable(format!("vault {what}: {status} {text}"))
    }
}

#[async_trait]
impl SecretStore for VaultClient {
    async fn get_user_auth_data(&self, path: &str) -> Result<Map<String, Value>> {
        let resp = self
            .http
            .get(self.url(path))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(Self::unavailable)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("no secret at {path}")));
        }
        if !resp.status().is_success() {
            return Err(Self::rejected(resp, "read").await);
        }

        let body: Value = resp.json().await.map_err(Self::unavailable)?;
        match &body["data"]["data"] {
            Value::Object(map) => Ok(map.clone()),
            _ => Err(Error::NotFound(format!("no secret data at {path}"))),
        }
    }

    async fn add_user_auth_data(&self, path: &str, data: Map<String, Value>) -> Result<()> {
        let resp = self
            .http
            .post(self.url(path))
            .header("X-Vault-Token", &self.token)
            .json(&json!({ "data": data }))
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !resp.status().is_success() {
            return Err(Self::rejected(resp, "write").await);
        }
        Ok(())
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        // Deleting the metadata removes every version, not just the latest.
        let metadata = path.replacen("/data/", "/metadata/", 1);
        let resp = self
            .http
            .delete(self.url(&metadata))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !resp.status().is_success() {
            return Err(Self::rejected(resp, "delete").await);
        }
        Ok(())
    }

    async fn create_throwaway_token(&self) -> Result<String> {
        let resp = self
            .http
            .post(self.url("auth/token/create"))
            .header("X-Vault-Token", &self.token)
            .json(&json!({
                "ttl": self.throwaway_ttl,
                "renewable": false,
                "display_name": "relay-ci-build",
            }))
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !resp.status().is_success() {
            return Err(Self::rejected(resp, "token create").await);
        }

        let body: Value = resp.json().await.map_err(Self::unavailable)?;
        body["auth"]["client_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::SecretStoreUnavailable("token create returned no client_token".to_string())
            })
    }
}
