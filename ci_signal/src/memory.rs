//! In-process implementations of the storage, secret and queue traits.
//!
//! Used by the test suites and by `relay-ci serve --in-memory` for local
//! runs without Postgres, Vault or nsqd. Each store can be told to fail
//! so dispatch failure paths can be exercised. [`MemoryVcs`] stands in
//! for a repository host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::models::credential::{CredType, Credential, SubCredType};
use crate::models::poll::{PollRequest, PollState};
use crate::models::summary::{BuildStatus, BuildSummary, StageResult, SummaryStart};
use crate::models::task::WerkerTask;
use crate::models::trigger::Commit;
use crate::store::{
    BuildStageStore, BuildSummaryStore, CredentialStore, PollStore, SecretStore, TaskQueue, Topic,
};
use crate::vcs::{BranchHead, Connected, HandlerFactory, RepoLinks, VcsHandler};

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PollRow {
    request: PollRequest,
    credentials_id: i64,
    last_cron_time: Option<DateTime<Utc>>,
    last_hashes: HashMap<String, String>,
}

#[derive(Default)]
struct State {
    next_cred_id: i64,
    creds: Vec<Credential>,
    next_build_id: i64,
    sums: Vec<BuildSummary>,
    stages: Vec<StageResult>,
    polls: Vec<PollRow>,
}

/// Relational store held in memory.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<State>,
    fail_sum_start: AtomicBool,
    sum_start_delay: Mutex<Option<Duration>>,
    fail_stage_detail: AtomicBool,
    fail_cred_delete: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sum_start(&self, fail: bool) {
        self.fail_sum_start.store(fail, Ordering::SeqCst);
    }

    /// Hold each summary insert for `delay` after the row is written.
    pub fn set_sum_start_delay(&self, delay: Option<Duration>) {
        *guard(&self.sum_start_delay) = delay;
    }

    pub fn fail_stage_detail(&self, fail: bool) {
        self.fail_stage_detail.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cred_delete(&self, fail: bool) {
        self.fail_cred_delete.store(fail, Ordering::SeqCst);
    }

    /// Every summary row, oldest first.
    pub fn summaries(&self) -> Vec<BuildSummary> {
        guard(&self.state).sums.clone()
    }

    pub fn stage_details(&self) -> Vec<StageResult> {
        guard(&self.state).stages.clone()
    }

    /// Credential rows as persisted (secret half never present).
    pub fn raw_creds(&self) -> Vec<Credential> {
        guard(&self.state).creds.clone()
    }

    fn with_sum<F>(&self, id: i64, f: F) -> Result<()>
    where
        F: FnOnce(&mut BuildSummary) -> Result<()>,
    {
        let mut state = guard(&self.state);
        let sum = state
            .sums
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::not_found_sum(id))?;
        f(sum)
    }
}

fn same_cred(a: &Credential, sub_type: SubCredType, identifier: &str, account: &str) -> bool {
    a.sub_type == sub_type && a.identifier == identifier && a.account == account
}

#[async_trait]
impl CredentialStore for MemoryStorage {
    async fn insert_cred(&self, cred: &Credential, overwrite_ok: bool) -> Result<i64> {
        let mut state = guard(&self.state);
        let mut row = cred.clone();
        row.secret.clear();

        if let Some(existing) = state
            .creds
            .iter_mut()
            .find(|c| same_cred(c, cred.sub_type, &cred.identifier, &cred.account))
        {
            if !overwrite_ok {
                return Err(Error::Validation(format!(
                    "credential {} {} already exists for {}",
                    cred.sub_type, cred.identifier, cred.account
                )));
            }
            row.id = existing.id;
            *existing = row;
            return existing
                .id
                .ok_or_else(|| Error::Storage("stored credential has no id".to_string()));
        }

        state.next_cred_id += 1;
        let id = state.next_cred_id;
        row.id = Some(id);
        state.creds.push(row);
        Ok(id)
    }

    async fn update_cred(&self, cred: &Credential) -> Result<()> {
        let mut state = guard(&self.state);
        let existing = state
            .creds
            .iter_mut()
            .find(|c| same_cred(c, cred.sub_type, &cred.identifier, &cred.account))
            .ok_or_else(|| Error::not_found_cred(cred.sub_type, &cred.account))?;
        existing.fields = cred.fields.clone();
        Ok(())
    }

    async fn delete_cred(&self, cred: &Credential) -> Result<()> {
        if self.fail_cred_delete.load(Ordering::SeqCst) {
            return Err(Error::Storage("credential delete refused".to_string()));
        }
        let mut state = guard(&self.state);
        let before = state.creds.len();
        state
            .creds
            .retain(|c| !same_cred(c, cred.sub_type, &cred.identifier, &cred.account));
        if state.creds.len() == before {
            return Err(Error::not_found_cred(cred.sub_type, &cred.account));
        }
        Ok(())
    }

    async fn retrieve_cred(
        &self,
        sub_type: SubCredType,
        identifier: &str,
        account: &str,
    ) -> Result<Credential> {
        guard(&self.state)
            .creds
            .iter()
            .find(|c| same_cred(c, sub_type, identifier, account))
            .cloned()
            .ok_or_else(|| Error::not_found_cred(sub_type, account))
    }

    async fn retrieve_cred_by_id(&self, id: i64) -> Result<Credential> {
        guard(&self.state)
            .creds
            .iter()
            .find(|c| c.id == Some(id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no credential found with id {id}")))
    }

    async fn retrieve_creds_by_type(&self, cred_type: CredType) -> Result<Vec<Credential>> {
        Ok(guard(&self.state)
            .creds
            .iter()
            .filter(|c| c.cred_type() == cred_type)
            .cloned()
            .collect())
    }

    async fn retrieve_cred_by_subtype_and_account(
        &self,
        sub_type: SubCredType,
        account: &str,
    ) -> Result<Vec<Credential>> {
        Ok(guard(&self.state)
            .creds
            .iter()
            .filter(|c| c.sub_type == sub_type && c.account == account)
            .cloned()
            .collect())
    }

    async fn get_vcs_types_from_account(&self, account: &str) -> Result<Vec<SubCredType>> {
        let mut types: Vec<SubCredType> = guard(&self.state)
            .creds
            .iter()
            .filter(|c| c.account == account && c.cred_type() == CredType::Vcs)
            .map(|c| c.sub_type)
            .collect();
        types.sort();
        types.dedup();
        Ok(types)
    }
}

#[async_trait]
impl BuildSummaryStore for MemoryStorage {
    async fn add_sum_start(&self, start: &SummaryStart) -> Result<i64> {
        if self.fail_sum_start.load(Ordering::SeqCst) {
            return Err(Error::Storage("build_summary insert refused".to_string()));
        }
        let id = {
            let mut state = guard(&self.state);
            state.next_build_id += 1;
            let id = state.next_build_id;
            state.sums.push(BuildSummary {
                id,
                hash: start.hash.clone(),
                account: start.account.clone(),
                repo: start.repo.clone(),
                branch: start.branch.clone(),
                status: BuildStatus::Nil,
                signaled_by: start.signaled_by,
                credentials_id: start.credentials_id,
                queue_time: None,
                start_time: None,
                build_duration: 0.0,
            });
            id
        };
        let delay = *guard(&self.sum_start_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn set_queue_time(&self, id: i64) -> Result<()> {
        self.with_sum(id, |sum| {
            sum.status.ensure_transition(BuildStatus::Queued, id)?;
            sum.status = BuildStatus::Queued;
            sum.queue_time = Some(Utc::now());
            Ok(())
        })
    }

    async fn start_build(&self, id: i64) -> Result<()> {
        self.with_sum(id, |sum| {
            sum.status.ensure_transition(BuildStatus::Running, id)?;
            sum.status = BuildStatus::Running;
            sum.start_time = Some(Utc::now());
            Ok(())
        })
    }

    async fn update_sum(&self, failed: bool, duration: f64, id: i64) -> Result<()> {
        self.with_sum(id, |sum| {
            let next = sum.status.completion(failed);
            sum.status.ensure_transition(next, id)?;
            sum.status = next;
            sum.build_duration = duration;
            Ok(())
        })
    }

    async fn retrieve_latest_sum(&self, partial_hash: &str) -> Result<BuildSummary> {
        guard(&self.state)
            .sums
            .iter()
            .rev()
            .find(|s| s.hash.starts_with(partial_hash))
            .cloned()
            .ok_or_else(|| Error::not_found_sum(partial_hash))
    }

    async fn retrieve_last_few_sums(
        &self,
        repo: &str,
        account: &str,
        limit: i64,
    ) -> Result<Vec<BuildSummary>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(guard(&self.state)
            .sums
            .iter()
            .rev()
            .filter(|s| s.repo == repo && s.account == account)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn retrieve_sum_by_build_id(&self, id: i64) -> Result<BuildSummary> {
        guard(&self.state)
            .sums
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found_sum(id))
    }
}

#[async_trait]
impl BuildStageStore for MemoryStorage {
    async fn add_stage_detail(&self, stage: &StageResult) -> Result<()> {
        if self.fail_stage_detail.load(Ordering::SeqCst) {
            return Err(Error::Storage("build_stage_details insert refused".to_string()));
        }
        guard(&self.state).stages.push(stage.clone());
        Ok(())
    }

    async fn retrieve_stage_detail(&self, build_id: i64) -> Result<Vec<StageResult>> {
        Ok(guard(&self.state)
            .stages
            .iter()
            .filter(|s| s.build_id == build_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PollStore for MemoryStorage {
    async fn insert_poll(&self, poll: &PollRequest, credentials_id: i64) -> Result<()> {
        let mut state = guard(&self.state);
        if state
            .polls
            .iter()
            .any(|p| p.request.account == poll.account && p.request.repo == poll.repo)
        {
            return Err(Error::Validation(format!(
                "{} is already being polled",
                poll.acct_repo()
            )));
        }
        state.polls.push(PollRow {
            request: poll.clone(),
            credentials_id,
            last_cron_time: None,
            last_hashes: HashMap::new(),
        });
        Ok(())
    }

    async fn update_poll(&self, poll: &PollRequest) -> Result<()> {
        let mut state = guard(&self.state);
        let row = state
            .polls
            .iter_mut()
            .find(|p| p.request.account == poll.account && p.request.repo == poll.repo)
            .ok_or_else(|| Error::NotFound(format!("no poll found for {}", poll.acct_repo())))?;
        row.request.cron = poll.cron.clone();
        row.request.branches = poll.branches.clone();
        Ok(())
    }

    async fn poll_exists(&self, account: &str, repo: &str) -> Result<bool> {
        Ok(guard(&self.state)
            .polls
            .iter()
            .any(|p| p.request.account == account && p.request.repo == repo))
    }

    async fn delete_poll(&self, account: &str, repo: &str) -> Result<()> {
        guard(&self.state)
            .polls
            .retain(|p| !(p.request.account == account && p.request.repo == repo));
        Ok(())
    }

    async fn get_all_polls(&self) -> Result<Vec<PollRequest>> {
        Ok(guard(&self.state)
            .polls
            .iter()
            .map(|p| p.request.clone())
            .collect())
    }

    async fn get_last_data(&self, account: &str, repo: &str) -> Result<PollState> {
        guard(&self.state)
            .polls
            .iter()
            .find(|p| p.request.account == account && p.request.repo == repo)
            .map(|p| PollState {
                last_cron_time: p.last_cron_time,
                last_hashes: p.last_hashes.clone(),
            })
            .ok_or_else(|| Error::NotFound(format!("no poll found for {account}/{repo}")))
    }

    async fn set_last_data(
        &self,
        account: &str,
        repo: &str,
        hashes: &HashMap<String, String>,
    ) -> Result<()> {
        let mut state = guard(&self.state);
        let row = state
            .polls
            .iter_mut()
            .find(|p| p.request.account == account && p.request.repo == repo)
            .ok_or_else(|| Error::NotFound(format!("no poll found for {account}/{repo}")))?;
        row.last_cron_time = Some(Utc::now());
        row.last_hashes = hashes.clone();
        Ok(())
    }
}

impl MemoryStorage {
    /// Credential id recorded for a poll registration.
    pub fn poll_credentials_id(&self, account: &str, repo: &str) -> Option<i64> {
        guard(&self.state)
            .polls
            .iter()
            .find(|p| p.request.account == account && p.request.repo == repo)
            .map(|p| p.credentials_id)
    }
}

/// Secret store held in memory. Tokens are random UUIDs.
#[derive(Default)]
pub struct MemorySecretStore {
    paths: Mutex<HashMap<String, serde_json::Map<String, serde_json::Value>>>,
    tokens: Mutex<Vec<String>>,
    unavailable: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `SecretStoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn issued_tokens(&self) -> Vec<String> {
        guard(&self.tokens).clone()
    }

    pub fn contains(&self, path: &str) -> bool {
        guard(&self.paths).contains_key(path)
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::SecretStoreUnavailable("vault is sealed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_user_auth_data(
        &self,
        path: &str,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        self.check()?;
        guard(&self.paths)
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no secret at {path}")))
    }

    async fn add_user_auth_data(
        &self,
        path: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        self.check()?;
        guard(&self.paths).insert(path.to_string(), data);
        Ok(())
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        self.check()?;
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(Error::SecretStoreUnavailable(format!(
                "unable to delete {path}"
            )));
        }
        guard(&self.paths).remove(path);
        Ok(())
    }

    async fn create_throwaway_token(&self) -> Result<String> {
        self.check()?;
        let token = uuid::Uuid::new_v4().to_string();
        guard(&self.tokens).push(token.clone());
        Ok(token)
    }
}

/// Queue that records every published message.
#[derive(Default)]
pub struct MemoryQueue {
    messages: Mutex<Vec<(Topic, Vec<u8>)>>,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Hold every publish for `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *guard(&self.delay) = delay;
    }

    pub fn published(&self, topic: Topic) -> Vec<serde_json::Value> {
        guard(&self.messages)
            .iter()
            .filter(|(t, _)| *t == topic)
            .filter_map(|(_, body)| serde_json::from_slice(body).ok())
            .collect()
    }

    pub fn build_tasks(&self) -> Vec<WerkerTask> {
        guard(&self.messages)
            .iter()
            .filter(|(t, _)| *t == Topic::Build)
            .filter_map(|(_, body)| serde_json::from_slice(body).ok())
            .collect()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn publish(&self, topic: Topic, body: Vec<u8>) -> Result<()> {
        let delay = *guard(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Queue(format!("nsqd refused message on {topic}")));
        }
        guard(&self.messages).push((topic, body));
        Ok(())
    }
}

/// A posted PR comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrComment {
    pub repo: String,
    pub pr_id: i64,
    pub hash: String,
    pub failed: bool,
    pub build_id: i64,
}

#[derive(Default)]
struct Repos {
    files: HashMap<(String, String, String), Vec<u8>>,
    heads: HashMap<(String, String), BranchHead>,
    logs: HashMap<(String, String), Vec<Commit>>,
    changed: HashMap<String, Vec<String>>,
    broken_branches: Vec<(String, String)>,
    comments: Vec<PrComment>,
    webhooks: Vec<(String, String)>,
}

/// Repository host held in memory.
pub struct MemoryVcs {
    vcs_type: SubCredType,
    repos: Mutex<Repos>,
    fail_changed_files: AtomicBool,
}

impl MemoryVcs {
    pub fn new(vcs_type: SubCredType) -> Self {
        Self {
            vcs_type,
            repos: Mutex::new(Repos::default()),
            fail_changed_files: AtomicBool::new(false),
        }
    }

    pub fn with_file(self, repo: &str, commit: &str, contents: &str) -> Self {
        self.add_file(repo, commit, crate::models::build_config::BUILD_FILE, contents);
        self
    }

    pub fn add_file(&self, repo: &str, commit: &str, path: &str, contents: &str) {
        guard(&self.repos).files.insert(
            (repo.to_string(), commit.to_string(), path.to_string()),
            contents.as_bytes().to_vec(),
        );
    }

    /// Push a commit onto a branch; it becomes the branch head.
    pub fn push_commit(&self, repo: &str, branch: &str, hash: &str, message: &str) {
        let mut repos = guard(&self.repos);
        let key = (repo.to_string(), branch.to_string());
        repos.heads.insert(
            key.clone(),
            BranchHead {
                hash: hash.to_string(),
                last_commit_time: Some(Utc::now()),
            },
        );
        repos.logs.entry(key).or_default().insert(
            0,
            Commit {
                hash: hash.to_string(),
                message: message.to_string(),
                author: "memory".to_string(),
                date: Some(Utc::now()),
            },
        );
    }

    pub fn set_changed_files(&self, latest: &str, files: &[&str]) {
        guard(&self.repos).changed.insert(
            latest.to_string(),
            files.iter().map(|f| f.to_string()).collect(),
        );
    }

    pub fn fail_changed_files(&self, fail: bool) {
        self.fail_changed_files.store(fail, Ordering::SeqCst);
    }

    /// Make head lookups for one branch fail with a transport error.
    pub fn break_branch(&self, repo: &str, branch: &str) {
        guard(&self.repos)
            .broken_branches
            .push((repo.to_string(), branch.to_string()));
    }

    pub fn comments(&self) -> Vec<PrComment> {
        guard(&self.repos).comments.clone()
    }

    pub fn webhooks(&self) -> Vec<(String, String)> {
        guard(&self.repos).webhooks.clone()
    }
}

#[async_trait]
impl VcsHandler for MemoryVcs {
    fn vcs_type(&self) -> SubCredType {
        self.vcs_type
    }

    async fn get_file(&self, path: &str, repo: &str, commit: &str) -> Result<Vec<u8>> {
        guard(&self.repos)
            .files
            .get(&(repo.to_string(), commit.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| Error::FileNotFound {
                path: path.to_string(),
                repo: repo.to_string(),
                commit: commit.to_string(),
            })
    }

    async fn get_branch_last_commit_data(&self, repo: &str, branch: &str) -> Result<BranchHead> {
        let repos = guard(&self.repos);
        let key = (repo.to_string(), branch.to_string());
        if repos.broken_branches.contains(&key) {
            return Err(Error::Vcs(format!("connection reset fetching {repo} {branch}")));
        }
        repos
            .heads
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::BranchNotFound {
                repo: repo.to_string(),
                branch: branch.to_string(),
            })
    }

    async fn get_changed_files(
        &self,
        _repo: &str,
        latest: &str,
        _earliest: Option<&str>,
    ) -> Result<Vec<String>> {
        if self.fail_changed_files.load(Ordering::SeqCst) {
            return Err(Error::Vcs("diff endpoint unavailable".to_string()));
        }
        Ok(guard(&self.repos)
            .changed
            .get(latest)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_commit_log(&self, repo: &str, branch: &str, since_hash: &str) -> Result<Vec<Commit>> {
        Ok(guard(&self.repos)
            .logs
            .get(&(repo.to_string(), branch.to_string()))
            .map(|log| {
                log.iter()
                    .take_while(|c| c.hash != since_hash)
                    .cloned()
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
        guard(&self.repos).comments.push(PrComment {
            repo: repo.to_string(),
            pr_id,
            hash: hash.to_string(),
            failed,
            build_id,
        });
        Ok(())
    }

    async fn create_webhook(&self, hooks_url: &str, callback_url: &str) -> Result<()> {
        guard(&self.repos)
            .webhooks
            .push((hooks_url.to_string(), callback_url.to_string()));
        Ok(())
    }

    async fn get_repo_links(&self, repo: &str) -> Result<RepoLinks> {
        Ok(RepoLinks {
            hooks: format!("memory://{repo}/hooks"),
            commits: format!("memory://{repo}/commits"),
            branches: format!("memory://{repo}/branches"),
            pull_requests: format!("memory://{repo}/pullrequests"),
        })
    }
}

/// Hands out registered [`MemoryVcs`] handlers by subtype.
#[derive(Default)]
pub struct MemoryHandlerFactory {
    handlers: HashMap<SubCredType, Arc<MemoryVcs>>,
    connects: AtomicUsize,
}

impl MemoryHandlerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, vcs: Arc<MemoryVcs>) -> Self {
        self.handlers.insert(vcs.vcs_type, vcs);
        self
    }

    /// How many handlers have been handed out.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HandlerFactory for MemoryHandlerFactory {
    async fn connect(&self, cred: &Credential) -> Result<Connected> {
        let vcs = self.handlers.get(&cred.sub_type).ok_or_else(|| {
            Error::Validation(format!("no handler available for {}", cred.sub_type))
        })?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Connected {
            handler: vcs.clone(),
            token: cred.secret.clone(),
        })
    }
}
