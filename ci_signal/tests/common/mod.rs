#![allow(dead_code)]

use std::sync::Arc;

use ci_signal::credentials::CredentialResolver;
use ci_signal::memory::{
    MemoryHandlerFactory, MemoryQueue, MemorySecretStore, MemoryStorage, MemoryVcs,
};
use ci_signal::models::credential::{Credential, SubCredType};
use ci_signal::signaler::Signaler;
use ci_signal::trigger::TriggerService;

pub const MAIN_ONLY: &str = r#"
image: alpine:3.19
buildTool: make
branches:
  - main
stages:
  - name: build
    script:
      - make
"#;

pub struct Harness {
    pub store: Arc<MemoryStorage>,
    pub secrets: Arc<MemorySecretStore>,
    pub queue: Arc<MemoryQueue>,
    pub github: Arc<MemoryVcs>,
    pub bitbucket: Arc<MemoryVcs>,
    pub factory: Arc<MemoryHandlerFactory>,
    pub creds: CredentialResolver,
    pub signaler: Signaler,
    pub triggers: TriggerService,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStorage::new());
        let secrets = Arc::new(MemorySecretStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let github = Arc::new(MemoryVcs::new(SubCredType::Github));
        let bitbucket = Arc::new(MemoryVcs::new(SubCredType::Bitbucket));
        let factory = Arc::new(
            MemoryHandlerFactory::new()
                .with_handler(github.clone())
                .with_handler(bitbucket.clone()),
        );
        let creds = CredentialResolver::new(store.clone(), secrets.clone());
        let signaler = Signaler::new(store.clone(), secrets.clone(), queue.clone());
        let triggers = TriggerService::new(
            creds.clone(),
            factory.clone(),
            store.clone(),
            signaler.clone(),
        );
        Self {
            store,
            secrets,
            queue,
            github,
            bitbucket,
            factory,
            creds,
            signaler,
            triggers,
        }
    }

    pub async fn add_github(&self, account: &str, token: &str) -> i64 {
        self.creds
            .add(github_cred(account, token), false)
            .await
            .expect("store github credential")
    }

    pub async fn add_bitbucket(&self, account: &str, secret: &str) -> i64 {
        let mut fields = serde_json::Map::new();
        fields.insert("clientId".into(), "client".into());
        fields.insert("tokenURL".into(), "https://bitbucket.org/site/oauth2/access_token".into());
        self.creds
            .add(
                Credential {
                    id: None,
                    account: account.into(),
                    identifier: String::new(),
                    sub_type: SubCredType::Bitbucket,
                    fields,
                    secret: secret.into(),
                },
                false,
            )
            .await
            .expect("store bitbucket credential")
    }
}

pub fn github_cred(account: &str, token: &str) -> Credential {
    Credential {
        id: None,
        account: account.into(),
        identifier: String::new(),
        sub_type: SubCredType::Github,
        fields: serde_json::Map::new(),
        secret: token.into(),
    }
}
