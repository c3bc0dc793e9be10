//! HTTP routes — webhooks, build/credential/poll API, health and metrics.

pub mod api;
pub mod webhook;

use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use ci_signal::builds::BuildReporter;
use ci_signal::models::trigger::Trigger;
use ci_signal::repos::RepoService;
use ci_signal::trigger::{Dispatch, TriggerService};
use ci_signal::{Error, Result};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub triggers: TriggerService,
    pub repos: RepoService,
    pub reporter: BuildReporter,
    /// GitHub HMAC secret; empty disables validation.
    pub webhook_secret: String,
    pub metrics: Option<PrometheusHandle>,
}

/// Build the server's Axum router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Webhooks
        .route("/webhook/bitbucket", post(webhook::bitbucket))
        .route("/webhook/github", post(webhook::github))
        // Build API
        .route("/api/builds", post(api::request_build))
        .route("/api/builds/{build_id}", get(api::get_build))
        .route("/api/builds/{build_id}/stages", get(api::get_stages))
        .route("/api/builds/{build_id}/start", post(api::start_build))
        .route("/api/builds/{build_id}/complete", post(api::complete_build))
        .route("/api/builds/hash/{hash}", get(api::latest_for_hash))
        .route("/api/repos/{account}/{repo}/builds", get(api::repo_builds))
        // Credential API
        .route(
            "/api/creds",
            get(api::list_creds)
                .post(api::add_cred)
                .put(api::update_cred)
                .delete(api::delete_cred),
        )
        .route("/api/creds/exists", get(api::cred_exists))
        // Repo registration
        .route("/api/polls", get(api::list_polls).post(api::add_poll))
        .route("/api/polls/{account}/{repo}", delete(api::delete_poll))
        .route("/api/watch", post(api::watch_repo))
        // Ops
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn render_metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

// ── Errors ──

/// Core error carried to an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

pub fn status_for(e: &Error) -> StatusCode {
    if e.is_transient() {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    match e {
        Error::NotFound(_) | Error::FileNotFound { .. } => StatusCode::NOT_FOUND,
        Error::MultipleVcsTypes { .. }
        | Error::Validation(_)
        | Error::NotViable(_)
        | Error::BranchNotFound { .. }
        | Error::ConfigParse(_)
        | Error::NoBuildEvent(_) => StatusCode::BAD_REQUEST,
        Error::UnsupportedEvent(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::InvalidTransition { .. } => StatusCode::CONFLICT,
        Error::Vcs(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "request failed: {}", self.0);
        } else {
            tracing::debug!(status = status.as_u16(), "request rejected: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ── Dispatch ──

/// Body returned for a handled trigger.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DispatchResponse {
    pub fn not_built(reason: String) -> Self {
        Self {
            status: "not_built",
            build_id: None,
            hash: None,
            reason: Some(reason),
        }
    }

    /// Status code and body for a dispatch that did not error.
    pub fn reply(dispatch: Dispatch) -> (StatusCode, Json<Self>) {
        match dispatch {
            Dispatch::Queued { build_id, hash } => (
                StatusCode::CREATED,
                Json(Self {
                    status: "queued",
                    build_id: Some(build_id),
                    hash: Some(hash),
                    reason: None,
                }),
            ),
            Dispatch::NoBuildFile { hash } => (
                StatusCode::OK,
                Json(Self {
                    status: "no_build_file",
                    build_id: None,
                    hash: Some(hash),
                    reason: None,
                }),
            ),
        }
    }
}

/// Run a trigger through the service, recording its outcome.
pub async fn run_trigger(state: &AppState, trigger: Trigger) -> Result<Dispatch> {
    let signaled_by = trigger.signaled_by();
    let started = Instant::now();
    let result = state.triggers.handle(trigger).await;

    let outcome = match &result {
        Ok(Dispatch::Queued { .. }) => "queued",
        Ok(Dispatch::NoBuildFile { .. }) => "no_build_file",
        Err(e) if e.is_silent() => "not_built",
        Err(_) => "error",
    };
    crate::metrics::trigger_outcome(signaled_by.as_str(), outcome);
    crate::metrics::dispatch_duration(started.elapsed().as_millis() as u64);
    result
}

#[cfg(test)]
mod tests;
