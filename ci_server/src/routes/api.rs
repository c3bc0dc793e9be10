//! REST API for builds, credentials and repo registration.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};

use ci_signal::models::credential::{vcs_identifier, CredType, Credential, SubCredType};
use ci_signal::models::poll::PollRequest;
use ci_signal::models::summary::{BuildSummary, StageResult};
use ci_signal::models::trigger::Trigger;
use ci_signal::Error;

use super::{run_trigger, ApiError, AppState, DispatchResponse};

// ── Builds ──

/// Request body for manually triggering a build.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub acct_repo: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub force: bool,
}

pub async fn request_build(
    State(state): State<AppState>,
    Json(req): Json<BuildRequest>,
) -> Result<(StatusCode, Json<DispatchResponse>), ApiError> {
    let trigger = Trigger::ManualRequest {
        repo: req.acct_repo,
        hash: req.hash,
        branch: req.branch,
        force: req.force,
    };
    let dispatch = run_trigger(&state, trigger).await?;
    Ok(DispatchResponse::reply(dispatch))
}

pub async fn get_build(
    State(state): State<AppState>,
    Path(build_id): Path<i64>,
) -> Result<Json<BuildSummary>, ApiError> {
    Ok(Json(state.reporter.summary(build_id).await?))
}

pub async fn get_stages(
    State(state): State<AppState>,
    Path(build_id): Path<i64>,
) -> Result<Json<Vec<StageResult>>, ApiError> {
    Ok(Json(state.reporter.stages(build_id).await?))
}

pub async fn start_build(
    State(state): State<AppState>,
    Path(build_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.reporter.start_build(build_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Worker report for a finished build.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub failed: bool,
    /// Seconds.
    pub duration: f64,
    #[serde(default)]
    pub pr_id: Option<i64>,
}

pub async fn complete_build(
    State(state): State<AppState>,
    Path(build_id): Path<i64>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<BuildSummary>, ApiError> {
    let sum = state
        .reporter
        .complete_build(build_id, req.failed, req.duration, req.pr_id)
        .await?;
    crate::metrics::build_finished(sum.status.as_str());
    Ok(Json(sum))
}

pub async fn latest_for_hash(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<BuildSummary>, ApiError> {
    Ok(Json(state.reporter.latest_for_hash(&hash).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListBuildsQuery {
    pub limit: Option<i64>,
}

pub async fn repo_builds(
    State(state): State<AppState>,
    Path((account, repo)): Path<(String, String)>,
    Query(query): Query<ListBuildsQuery>,
) -> Result<Json<Vec<BuildSummary>>, ApiError> {
    let limit = query.limit.unwrap_or(20);
    Ok(Json(state.reporter.last_few(&account, &repo, limit).await?))
}

// ── Credentials ──

#[derive(Debug, Deserialize)]
pub struct AddCredQuery {
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Serialize)]
pub struct CredCreated {
    pub id: i64,
}

pub async fn add_cred(
    State(state): State<AppState>,
    Query(query): Query<AddCredQuery>,
    Json(cred): Json<Credential>,
) -> Result<(StatusCode, Json<CredCreated>), ApiError> {
    let id = state
        .triggers
        .credentials()
        .add(cred, query.overwrite)
        .await?;
    Ok((StatusCode::CREATED, Json(CredCreated { id })))
}

pub async fn update_cred(
    State(state): State<AppState>,
    Json(cred): Json<Credential>,
) -> Result<StatusCode, ApiError> {
    state.triggers.credentials().update(cred).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_cred(
    State(state): State<AppState>,
    Json(cred): Json<Credential>,
) -> Result<StatusCode, ApiError> {
    state.triggers.credentials().delete(cred).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ListCredsQuery {
    #[serde(rename = "type")]
    pub cred_type: String,
    pub hide: Option<bool>,
}

pub async fn list_creds(
    State(state): State<AppState>,
    Query(query): Query<ListCredsQuery>,
) -> Result<Json<Vec<Credential>>, ApiError> {
    let cred_type: CredType = query.cred_type.parse()?;
    let creds = state
        .triggers
        .credentials()
        .list(cred_type, query.hide.unwrap_or(true))
        .await?;
    Ok(Json(creds))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredExistsQuery {
    pub sub_type: String,
    pub account: String,
    /// Derived from subtype and account for VCS credentials.
    #[serde(default)]
    pub identifier: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CredExists {
    pub exists: bool,
}

pub async fn cred_exists(
    State(state): State<AppState>,
    Query(query): Query<CredExistsQuery>,
) -> Result<Json<CredExists>, ApiError> {
    let sub_type: SubCredType = query.sub_type.parse()?;
    let identifier = match query.identifier.filter(|i| !i.is_empty()) {
        Some(identifier) => identifier,
        None if sub_type.parent() == CredType::Vcs => vcs_identifier(sub_type, &query.account),
        None => {
            return Err(Error::Validation(format!(
                "identifier is required for {sub_type} credentials"
            ))
            .into())
        }
    };
    let exists = state
        .triggers
        .credentials()
        .exists(sub_type, &identifier, &query.account)
        .await?;
    Ok(Json(CredExists { exists }))
}

// ── Repo registration ──

pub async fn add_poll(
    State(state): State<AppState>,
    Json(poll): Json<PollRequest>,
) -> Result<StatusCode, ApiError> {
    state.repos.poll_repo(poll).await?;
    Ok(StatusCode::CREATED)
}

pub async fn delete_poll(
    State(state): State<AppState>,
    Path((account, repo)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.repos.delete_poll(&account, &repo).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_polls(
    State(state): State<AppState>,
) -> Result<Json<Vec<PollRequest>>, ApiError> {
    Ok(Json(state.repos.list_polls().await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRequest {
    pub acct_repo: String,
    #[serde(default)]
    pub vcs_type: Option<SubCredType>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResponse {
    pub callback_url: String,
}

pub async fn watch_repo(
    State(state): State<AppState>,
    Json(req): Json<WatchRequest>,
) -> Result<Json<WatchResponse>, ApiError> {
    let callback_url = state.repos.watch_repo(&req.acct_repo, req.vcs_type).await?;
    Ok(Json(WatchResponse { callback_url }))
}
