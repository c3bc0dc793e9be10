//! Credential resolution: one record from the relational store merged
//! with its secret from the secret store.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::models::credential::{
    split_acct_repo, vcs_identifier, CredType, Credential, SubCredType, HIDDEN_SECRET, SECRET_KEY,
};
use crate::store::{SecretStore, Storage};

#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<dyn Storage>,
    secrets: Arc<dyn SecretStore>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn Storage>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { store, secrets }
    }

    /// Resolve the VCS credential for `acct_repo`.
    ///
    /// Without an explicit type the account must have exactly one VCS
    /// subtype registered.
    pub async fn resolve(
        &self,
        acct_repo: &str,
        explicit: Option<SubCredType>,
        hide_secret: bool,
    ) -> Result<Credential> {
        let account = match split_acct_repo(acct_repo) {
            Ok((account, _)) => account,
            Err(_) if !acct_repo.is_empty() && !acct_repo.contains('/') => acct_repo,
            Err(e) => return Err(e),
        };

        let sub_type = match explicit {
            Some(sub_type) => sub_type,
            None => self.vcs_type_for(account).await?,
        };

        let identifier = vcs_identifier(sub_type, account);
        self.get_cred(sub_type, &identifier, account, hide_secret)
            .await
    }

    /// The single VCS subtype registered for an account.
    pub async fn vcs_type_for(&self, account: &str) -> Result<SubCredType> {
        let mut types = self.store.get_vcs_types_from_account(account).await?;
        match types.len() {
            0 => Err(Error::NotFound(format!(
                "no vcs credentials configured for account {account}"
            ))),
            1 => Ok(types.remove(0)),
            _ => Err(Error::MultipleVcsTypes {
                account: account.to_string(),
                types,
            }),
        }
    }

    /// Fetch any credential by its keys and attach the secret.
    pub async fn get_cred(
        &self,
        sub_type: SubCredType,
        identifier: &str,
        account: &str,
        hide_secret: bool,
    ) -> Result<Credential> {
        let cred = self
            .store
            .retrieve_cred(sub_type, identifier, account)
            .await?;
        self.attach_secret(cred, hide_secret).await
    }

    pub async fn get_cred_by_id(&self, id: i64, hide_secret: bool) -> Result<Credential> {
        let cred = self.store.retrieve_cred_by_id(id).await?;
        self.attach_secret(cred, hide_secret).await
    }

    /// Every credential of one parent type.
    pub async fn list(&self, cred_type: CredType, hide_secret: bool) -> Result<Vec<Credential>> {
        let creds = self.store.retrieve_creds_by_type(cred_type).await?;
        let mut out = Vec::with_capacity(creds.len());
        for cred in creds {
            out.push(self.attach_secret(cred, hide_secret).await?);
        }
        Ok(out)
    }

    /// Whether a non-secret record exists for these keys.
    pub async fn exists(
        &self,
        sub_type: SubCredType,
        identifier: &str,
        account: &str,
    ) -> Result<bool> {
        match self.store.retrieve_cred(sub_type, identifier, account).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Validate, store the secret, then store the non-secret record.
    ///
    /// Without `overwrite_ok` an existing credential is rejected before
    /// anything is written.
    pub async fn add(&self, cred: Credential, overwrite_ok: bool) -> Result<i64> {
        let cred = cred.with_default_identifier();
        cred.validate_for_insert()?;

        if !overwrite_ok
            && self
                .exists(cred.sub_type, &cred.identifier, &cred.account)
                .await?
        {
            return Err(Error::Validation(format!(
                "credential {} {} already exists for {}",
                cred.sub_type, cred.identifier, cred.account
            )));
        }

        self.secrets
            .add_user_auth_data(&cred.secret_path(), cred.secret_payload())
            .await?;
        let id = self.store.insert_cred(&cred, overwrite_ok).await?;

        tracing::info!(
            cred_id = id,
            account = %cred.account,
            sub_type = %cred.sub_type,
            "Credential stored"
        );
        Ok(id)
    }

    /// Overwrite the secret (when given) and the non-secret fields.
    pub async fn update(&self, cred: Credential) -> Result<()> {
        let cred = cred.with_default_identifier();
        if !cred.secret.is_empty() {
            self.secrets
                .add_user_auth_data(&cred.secret_path(), cred.secret_payload())
                .await?;
        }
        self.store.update_cred(&cred).await
    }

    /// Delete both halves. Both deletes are attempted; a failure of
    /// either is reported on its own.
    pub async fn delete(&self, cred: Credential) -> Result<()> {
        let cred = cred.with_default_identifier();
        let store_err = self.store.delete_cred(&cred).await.err();
        let secret_err = self.secrets.delete_path(&cred.secret_path()).await.err();

        if store_err.is_none() && secret_err.is_none() {
            tracing::info!(account = %cred.account, sub_type = %cred.sub_type, "Credential deleted");
            return Ok(());
        }

        let err = Error::CredentialDelete {
            store: store_err.map(|e| e.to_string()),
            secret: secret_err.map(|e| e.to_string()),
        };
        tracing::error!(account = %cred.account, sub_type = %cred.sub_type, "{err}");
        Err(err)
    }

    async fn attach_secret(&self, mut cred: Credential, hide_secret: bool) -> Result<Credential> {
        if hide_secret {
            cred.secret = HIDDEN_SECRET.to_string();
            return Ok(cred);
        }

        let data = self
            .secrets
            .get_user_auth_data(&cred.secret_path())
            .await
            .map_err(|e| match e {
                Error::NotFound(msg) => Error::SecretStoreUnavailable(format!(
                    "credential {} {} has no secret: {msg}",
                    cred.sub_type, cred.identifier
                )),
                other => other,
            })?;

        cred.secret = data
            .get(SECRET_KEY)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::SecretStoreUnavailable(format!(
                    "secret payload for {} is missing {SECRET_KEY}",
                    cred.identifier
                ))
            })?;
        Ok(cred)
    }
}
