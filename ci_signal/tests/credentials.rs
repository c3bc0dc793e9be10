//! Credential storage round trips across both stores.

mod common;

use ci_signal::models::credential::{CredType, Credential, SubCredType, HIDDEN_SECRET};
use ci_signal::Error;
use common::Harness;
use proptest::prelude::*;

fn nexus(account: &str, url: &str, user: &str, secret: &str) -> Credential {
    let mut fields = serde_json::Map::new();
    fields.insert("url".into(), url.into());
    fields.insert("username".into(), user.into());
    Credential {
        id: None,
        account: account.into(),
        identifier: format!("nexus-{account}"),
        sub_type: SubCredType::Nexus,
        fields,
        secret: secret.into(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn resolve_returns_what_was_stored(
        account in "[a-z][a-z0-9]{0,11}",
        url in "https://[a-z]{1,10}\\.example\\.com",
        user in "[a-z]{1,10}",
        secret in "[ -~]{1,40}",
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = Harness::new();
            let cred = nexus(&account, &url, &user, &secret);
            h.creds.add(cred.clone(), false).await.unwrap();

            let got = h
                .creds
                .get_cred(SubCredType::Nexus, &cred.identifier, &account, false)
                .await
                .unwrap();
            prop_assert_eq!(&got.fields, &cred.fields);
            prop_assert_eq!(&got.secret, &secret);
            prop_assert_eq!(got.account, account.clone());
            Ok(())
        })?;
    }

    #[test]
    fn vcs_resolve_returns_what_was_stored(
        account in "[a-z][a-z0-9]{0,11}",
        token in "[A-Za-z0-9_]{1,40}",
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = Harness::new();
            h.add_github(&account, &token).await;
            let got = h
                .creds
                .resolve(&format!("{account}/repo"), None, false)
                .await
                .unwrap();
            prop_assert_eq!(got.secret, token.clone());
            prop_assert_eq!(got.identifier, format!("GITHUB/{account}"));
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn listing_hides_secrets_on_request() {
    let h = Harness::new();
    h.creds
        .add(nexus("acme", "https://nexus.acme.io", "ci", "pw"), false)
        .await
        .unwrap();
    h.add_github("acme", "gh").await;

    let hidden = h.creds.list(CredType::Repo, true).await.unwrap();
    assert_eq!(hidden.len(), 1);
    assert_eq!(hidden[0].secret, HIDDEN_SECRET);

    let shown = h.creds.list(CredType::Repo, false).await.unwrap();
    assert_eq!(shown[0].secret, "pw");

    let vcs = h.creds.list(CredType::Vcs, true).await.unwrap();
    assert_eq!(vcs.len(), 1);
}

#[tokio::test]
async fn update_overwrites_both_halves() {
    let h = Harness::new();
    let cred = nexus("acme", "https://old.example.com", "ci", "old");
    h.creds.add(cred.clone(), false).await.unwrap();

    let updated = nexus("acme", "https://new.example.com", "ci", "new");
    h.creds.update(updated.clone()).await.unwrap();

    let got = h
        .creds
        .get_cred(SubCredType::Nexus, &cred.identifier, "acme", false)
        .await
        .unwrap();
    assert_eq!(got.field("url"), Some("https://new.example.com"));
    assert_eq!(got.secret, "new");
}

#[tokio::test]
async fn invalid_credential_writes_nothing() {
    let h = Harness::new();
    let mut cred = nexus("acme", "https://nexus.acme.io", "ci", "pw");
    cred.fields.remove("username");

    let err = h.creds.add(cred.clone(), false).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(!h.secrets.contains(&cred.secret_path()));
    assert!(h.store.raw_creds().is_empty());
}

#[tokio::test]
async fn store_half_delete_failure_is_reported() {
    let h = Harness::new();
    let cred = nexus("acme", "https://nexus.acme.io", "ci", "pw");
    h.creds.add(cred.clone(), false).await.unwrap();
    h.store.fail_cred_delete(true);

    let err = h.creds.delete(cred.clone()).await.unwrap_err();
    match err {
        Error::CredentialDelete { store, secret } => {
            assert!(store.is_some());
            assert!(secret.is_none());
        }
        other => panic!("unexpected error {other:?}"),
    }
    // The secret half went even though the record could not be removed.
    assert!(!h.secrets.contains(&cred.secret_path()));
}
