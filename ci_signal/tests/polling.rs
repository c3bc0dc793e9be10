//! Poll cycles and poll registration.

mod common;

use ci_signal::cron::CronWriter;
use ci_signal::models::poll::PollRequest;
use ci_signal::models::summary::SignaledBy;
use ci_signal::poll::{change_check, BranchOutcome};
use ci_signal::repos::RepoService;
use ci_signal::store::{PollStore, Topic};
use ci_signal::trigger::Dispatch;
use ci_signal::Error;
use common::Harness;

const ALL_BRANCHES: &str = r#"
image: alpine:3.19
buildTool: make
branches: [ALL]
stages:
  - name: build
    script: [make]
"#;

fn poll_request(branches: &[&str]) -> PollRequest {
    PollRequest {
        account: "acme".into(),
        repo: "widgets".into(),
        cron: "*/5 * * * *".into(),
        branches: branches.iter().map(|b| b.to_string()).collect(),
    }
}

fn repos(h: &Harness) -> RepoService {
    RepoService::new(
        h.triggers.clone(),
        h.store.clone(),
        h.queue.clone(),
        "https://ci.example.com/",
    )
}

async fn registered(branches: &[&str]) -> Harness {
    let h = Harness::new();
    h.add_github("acme", "gh-token").await;
    repos(&h).poll_repo(poll_request(branches)).await.unwrap();
    h
}

fn branches(list: &[&str]) -> Vec<String> {
    list.iter().map(|b| b.to_string()).collect()
}

#[tokio::test]
async fn first_poll_always_builds() {
    let h = registered(&["main"]).await;
    h.github.push_commit("acme/widgets", "main", "m1", "init");
    h.github.add_file("acme/widgets", "m1", "ocelot.yml", ALL_BRANCHES);

    let report = change_check(&h.triggers, h.store.as_ref(), "acme/widgets", &branches(&["main"]))
        .await
        .unwrap();
    assert!(matches!(
        report.outcome("main"),
        Some(BranchOutcome::Dispatched(Dispatch::Queued { .. }))
    ));
    assert_eq!(h.queue.build_tasks()[0].signaled_by, SignaledBy::Poll);

    let state = h.store.get_last_data("acme", "widgets").await.unwrap();
    assert_eq!(state.last_hashes.get("main").map(String::as_str), Some("m1"));
    assert!(state.last_cron_time.is_some());
}

#[tokio::test]
async fn unchanged_branch_does_not_build() {
    let h = registered(&["main"]).await;
    h.github.push_commit("acme/widgets", "main", "m1", "init");
    h.github.add_file("acme/widgets", "m1", "ocelot.yml", ALL_BRANCHES);
    let list = branches(&["main"]);

    change_check(&h.triggers, h.store.as_ref(), "acme/widgets", &list).await.unwrap();
    let second = change_check(&h.triggers, h.store.as_ref(), "acme/widgets", &list)
        .await
        .unwrap();
    assert_eq!(second.outcome("main"), Some(&BranchOutcome::UpToDate));
    assert_eq!(h.store.summaries().len(), 1);
}

#[tokio::test]
async fn new_commits_build_with_their_messages() {
    let h = registered(&["main"]).await;
    h.github.push_commit("acme/widgets", "main", "m1", "init");
    h.github.add_file("acme/widgets", "m1", "ocelot.yml", ALL_BRANCHES);
    let list = branches(&["main"]);
    change_check(&h.triggers, h.store.as_ref(), "acme/widgets", &list).await.unwrap();

    h.github.push_commit("acme/widgets", "main", "m2", "second");
    h.github.push_commit("acme/widgets", "main", "m3", "third");
    h.github.add_file("acme/widgets", "m3", "ocelot.yml", ALL_BRANCHES);
    change_check(&h.triggers, h.store.as_ref(), "acme/widgets", &list).await.unwrap();

    let tasks = h.queue.build_tasks();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[1].checkout_hash, "m3");
    assert_eq!(tasks[1].changeset_data.commit_texts, ["third", "second"]);
}

#[tokio::test]
async fn skip_marker_in_new_commits_is_not_built_but_remembered() {
    let h = registered(&["main"]).await;
    h.github.push_commit("acme/widgets", "main", "m1", "init");
    h.github.add_file("acme/widgets", "m1", "ocelot.yml", ALL_BRANCHES);
    let list = branches(&["main"]);
    change_check(&h.triggers, h.store.as_ref(), "acme/widgets", &list).await.unwrap();

    h.github.push_commit("acme/widgets", "main", "m2", "docs [skip ci]");
    h.github.add_file("acme/widgets", "m2", "ocelot.yml", ALL_BRANCHES);
    let report = change_check(&h.triggers, h.store.as_ref(), "acme/widgets", &list)
        .await
        .unwrap();
    assert!(matches!(report.outcome("main"), Some(BranchOutcome::NotBuilt(_))));
    assert_eq!(report.last_hashes.get("main").map(String::as_str), Some("m2"));
    assert_eq!(h.store.summaries().len(), 1);
}

#[tokio::test]
async fn branch_errors_do_not_stop_the_cycle_or_the_write_back() {
    let h = registered(&["main", "broken", "nobuildfile"]).await;
    h.github.push_commit("acme/widgets", "main", "m1", "init");
    h.github.add_file("acme/widgets", "m1", "ocelot.yml", ALL_BRANCHES);
    h.github.push_commit("acme/widgets", "broken", "b1", "init");
    h.github.break_branch("acme/widgets", "broken");
    h.github.push_commit("acme/widgets", "nobuildfile", "n1", "init");

    let report = change_check(
        &h.triggers,
        h.store.as_ref(),
        "acme/widgets",
        &branches(&["main", "broken", "nobuildfile"]),
    )
    .await
    .unwrap();

    assert!(matches!(report.outcome("broken"), Some(BranchOutcome::Failed(_))));
    assert!(matches!(
        report.outcome("nobuildfile"),
        Some(BranchOutcome::Dispatched(Dispatch::NoBuildFile { .. }))
    ));
    assert!(matches!(
        report.outcome("main"),
        Some(BranchOutcome::Dispatched(Dispatch::Queued { .. }))
    ));

    let state = h.store.get_last_data("acme", "widgets").await.unwrap();
    assert_eq!(state.last_hashes.get("main").map(String::as_str), Some("m1"));
    assert_eq!(state.last_hashes.get("nobuildfile").map(String::as_str), Some("n1"));
    assert!(!state.last_hashes.contains_key("broken"));
}

#[tokio::test]
async fn poll_registration_publishes_and_writes_cron() {
    let h = Harness::new();
    h.add_github("acme", "gh-token").await;
    let dir = tempfile::tempdir().unwrap();
    let service = repos(&h).with_cron(CronWriter::new(dir.path(), "/bin/run_changecheck.sh"));

    service.poll_repo(poll_request(&["main", "dev"])).await.unwrap();
    assert!(h.store.poll_exists("acme", "widgets").await.unwrap());
    assert_eq!(h.store.poll_credentials_id("acme", "widgets"), Some(1));
    assert_eq!(h.queue.published(Topic::PollPlease).len(), 1);
    let line = std::fs::read_to_string(dir.path().join("acme_widgets")).unwrap();
    assert_eq!(
        line,
        "*/5 * * * * root /bin/run_changecheck.sh acme/widgets main,dev\n"
    );

    // Re-registering reschedules instead of failing.
    let mut again = poll_request(&["main"]);
    again.cron = "0 * * * *".into();
    service.poll_repo(again).await.unwrap();
    assert_eq!(service.list_polls().await.unwrap()[0].cron, "0 * * * *");

    service.delete_poll("acme", "widgets").await.unwrap();
    assert!(!h.store.poll_exists("acme", "widgets").await.unwrap());
    assert_eq!(h.queue.published(Topic::NoPollPlease).len(), 1);
    assert!(!dir.path().join("acme_widgets").exists());
}

#[tokio::test]
async fn poll_registration_needs_vcs_credentials() {
    let h = Harness::new();
    let err = repos(&h).poll_repo(poll_request(&["main"])).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert!(h.queue.published(Topic::PollPlease).is_empty());
}

#[tokio::test]
async fn watch_registers_callback_for_the_vcs() {
    let h = Harness::new();
    h.add_bitbucket("acme", "bb-secret").await;
    let callback = repos(&h).watch_repo("acme/widgets", None).await.unwrap();
    assert_eq!(callback, "https://ci.example.com/webhook/bitbucket");
    assert_eq!(
        h.bitbucket.webhooks(),
        [(
            "memory://acme/widgets/hooks".to_string(),
            callback.clone()
        )]
    );
}
