use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tower::ServiceExt;

use ci_signal::builds::BuildReporter;
use ci_signal::credentials::CredentialResolver;
use ci_signal::memory::{
    MemoryHandlerFactory, MemoryQueue, MemorySecretStore, MemoryStorage, MemoryVcs,
};
use ci_signal::models::credential::SubCredType;
use ci_signal::repos::RepoService;
use ci_signal::signaler::Signaler;
use ci_signal::store::Topic;
use ci_signal::trigger::TriggerService;

use ci_signal::Error;

use super::{router, status_for, AppState};

const SECRET: &str = "hook-secret";

const BUILD_FILE: &str = r#"
image: alpine:3.19
buildTool: make
branches: [main]
stages:
  - name: build
    script: [make]
"#;

struct Fixture {
    app: Router,
    store: Arc<MemoryStorage>,
    queue: Arc<MemoryQueue>,
    github: Arc<MemoryVcs>,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryStorage::new());
    let secrets = Arc::new(MemorySecretStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let github = Arc::new(MemoryVcs::new(SubCredType::Github));
    let factory = Arc::new(MemoryHandlerFactory::new().with_handler(github.clone()));

    let creds = CredentialResolver::new(store.clone(), secrets.clone());
    let signaler = Signaler::new(store.clone(), secrets.clone(), queue.clone());
    let triggers = TriggerService::new(creds.clone(), factory.clone(), store.clone(), signaler);
    let repos = RepoService::new(
        triggers.clone(),
        store.clone(),
        queue.clone(),
        "https://ci.example.com",
    );
    let reporter = BuildReporter::new(store.clone(), creds, factory);

    let app = router(AppState {
        triggers,
        repos,
        reporter,
        webhook_secret: SECRET.to_string(),
        metrics: None,
    });
    Fixture {
        app,
        store,
        queue,
        github,
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn json_req(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn signed_github(event: &str, body: &Value) -> Request<Body> {
    let raw = body.to_string();
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(raw.as_bytes());
    let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    Request::builder()
        .method("POST")
        .uri("/webhook/github")
        .header("x-github-event", event)
        .header("x-hub-signature-256", sig)
        .header("content-type", "application/json")
        .body(Body::from(raw))
        .unwrap()
}

fn push(branch: &str, after: &str) -> Value {
    json!({
        "ref": format!("refs/heads/{branch}"),
        "before": "0000000000000000000000000000000000000001",
        "after": after,
        "deleted": false,
        "repository": {"full_name": "acme/widgets"},
        "head_commit": {"id": after, "message": "change", "timestamp": "2024-05-01T10:00:00Z"},
        "commits": [{"id": after, "message": "change", "timestamp": "2024-05-01T10:00:00Z"}],
    })
}

async fn with_github_cred(f: &Fixture) {
    let (status, body) = send(
        &f.app,
        json_req(
            "POST",
            "/api/creds",
            json!({"account": "acme", "subType": "GITHUB", "secret": "gh-token"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
}

#[tokio::test]
async fn health_is_ok() {
    let f = fixture();
    let req = Request::get("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&f.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn github_push_queues_a_build() {
    let f = fixture();
    with_github_cred(&f).await;
    f.github.add_file("acme/widgets", "c0ffee", "ocelot.yml", BUILD_FILE);

    let (status, body) = send(&f.app, signed_github("push", &push("main", "c0ffee"))).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["status"], "queued");
    assert_eq!(body["hash"], "c0ffee");
    assert_eq!(f.queue.build_tasks().len(), 1);
}

#[tokio::test]
async fn bad_signature_is_unauthorized() {
    let f = fixture();
    let req = Request::builder()
        .method("POST")
        .uri("/webhook/github")
        .header("x-github-event", "push")
        .header("x-hub-signature-256", "sha256=00")
        .body(Body::from(push("main", "c0ffee").to_string()))
        .unwrap();
    let (status, _) = send(&f.app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(f.store.summaries().is_empty());
}

#[tokio::test]
async fn non_matching_branch_is_answered_without_a_build() {
    let f = fixture();
    with_github_cred(&f).await;
    f.github.add_file("acme/widgets", "beef", "ocelot.yml", BUILD_FILE);

    let (status, body) = send(&f.app, signed_github("push", &push("feature", "beef"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "not_built");
    assert!(f.store.summaries().is_empty());
}

#[tokio::test]
async fn ping_and_unknown_events() {
    let f = fixture();
    let (status, body) = send(&f.app, signed_github("ping", &json!({"zen": "hi"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "not_built");

    let (status, _) = send(&f.app, signed_github("issues", &json!({}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn bitbucket_without_credentials_is_not_found() {
    let f = fixture();
    let body = json!({
        "repository": {"full_name": "acme/widgets"},
        "push": {"changes": [{
            "new": {"type": "branch", "name": "main", "target": {"hash": "abc", "message": "m", "date": "2024-05-01T10:00:00+00:00"}},
            "old": {"target": {"hash": "def"}},
            "commits": [{"hash": "abc", "message": "m", "date": "2024-05-01T10:00:00+00:00"}]
        }]}
    });
    let req = Request::builder()
        .method("POST")
        .uri("/webhook/bitbucket")
        .header("x-event-key", "repo:push")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, body) = send(&f.app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{body}");
}

#[tokio::test]
async fn manual_build_then_worker_reports() {
    let f = fixture();
    with_github_cred(&f).await;
    f.github.push_commit("acme/widgets", "main", "feed", "init");
    f.github.add_file("acme/widgets", "feed", "ocelot.yml", BUILD_FILE);

    let (status, body) = send(
        &f.app,
        json_req("POST", "/api/builds", json!({"acctRepo": "acme/widgets", "branch": "main"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    let id = body["buildId"].as_i64().unwrap();

    let (status, _) = send(
        &f.app,
        Request::post(format!("/api/builds/{id}/start"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(
        &f.app,
        json_req(
            "POST",
            &format!("/api/builds/{id}/complete"),
            json!({"failed": false, "duration": 3.5}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "PASSED");

    let (status, body) = send(
        &f.app,
        Request::get(format!("/api/builds/{id}/stages"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    let (status, body) = send(
        &f.app,
        Request::get("/api/repos/acme/widgets/builds?limit=5")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], id);
}

#[tokio::test]
async fn manual_build_on_unknown_branch_is_bad_request() {
    let f = fixture();
    with_github_cred(&f).await;
    let (status, _) = send(
        &f.app,
        json_req("POST", "/api/builds", json!({"acctRepo": "acme/widgets", "branch": "nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_build_is_not_found() {
    let f = fixture();
    let (status, body) = send(
        &f.app,
        Request::get("/api/builds/404").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn credentials_are_listed_hidden_by_default() {
    let f = fixture();
    with_github_cred(&f).await;
    let (status, body) = send(
        &f.app,
        Request::get("/api/creds?type=vcs").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["secret"], "*********");
    assert_eq!(body[0]["identifier"], "GITHUB/acme");

    let (status, _) = send(
        &f.app,
        Request::get("/api/creds?type=bogus").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn credential_existence_can_be_checked() {
    let f = fixture();
    let exists = |uri: &'static str| {
        let app = f.app.clone();
        async move { send(&app, Request::get(uri).body(Body::empty()).unwrap()).await }
    };

    let (status, body) = exists("/api/creds/exists?subType=GITHUB&account=acme").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exists"], false);

    with_github_cred(&f).await;
    let (_, body) = exists("/api/creds/exists?subType=github&account=acme").await;
    assert_eq!(body["exists"], true);

    let (status, _) = exists("/api/creds/exists?subType=NEXUS&account=acme").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_credential_is_rejected_without_touching_the_secret() {
    let f = fixture();
    with_github_cred(&f).await;
    let (status, _) = send(
        &f.app,
        json_req(
            "POST",
            "/api/creds",
            json!({"account": "acme", "subType": "GITHUB", "secret": "replaced"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(
        &f.app,
        Request::get("/api/creds?type=vcs&hide=false")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(body[0]["secret"], "gh-token");
}

#[tokio::test]
async fn polls_can_be_added_and_removed() {
    let f = fixture();
    with_github_cred(&f).await;
    let (status, _) = send(
        &f.app,
        json_req(
            "POST",
            "/api/polls",
            json!({"account": "acme", "repo": "widgets", "cron": "*/5 * * * *", "branches": ["main"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(f.queue.published(Topic::PollPlease).len(), 1);

    let (_, body) = send(&f.app, Request::get("/api/polls").body(Body::empty()).unwrap()).await;
    assert_eq!(body[0]["cron"], "*/5 * * * *");

    let (status, _) = send(
        &f.app,
        Request::delete("/api/polls/acme/widgets")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(f.queue.published(Topic::NoPollPlease).len(), 1);
}

#[tokio::test]
async fn watch_returns_the_callback() {
    let f = fixture();
    with_github_cred(&f).await;
    let (status, body) = send(
        &f.app,
        json_req("POST", "/api/watch", json!({"acctRepo": "acme/widgets"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["callbackUrl"], "https://ci.example.com/webhook/github");
    assert_eq!(f.github.webhooks().len(), 1);
}

#[test]
fn infrastructure_errors_are_internal_and_vcs_errors_are_upstream() {
    for err in [
        Error::Storage("pool exhausted".into()),
        Error::Queue("nsqd down".into()),
        Error::SecretStoreUnavailable("sealed".into()),
        Error::Internal("join".into()),
    ] {
        assert_eq!(status_for(&err), StatusCode::INTERNAL_SERVER_ERROR, "{err}");
    }
    assert_eq!(
        status_for(&Error::Vcs("rate limited".into())),
        StatusCode::BAD_GATEWAY
    );
    assert_eq!(
        status_for(&Error::NotViable("no build stage".into())),
        StatusCode::BAD_REQUEST
    );
}
