//! Bitbucket and GitHub webhook receivers.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use ci_signal::models::credential::SubCredType;
use ci_signal::webhook::{translate, BITBUCKET_EVENT_HEADER, GITHUB_EVENT_HEADER};
use ci_signal::Error;

use super::{run_trigger, ApiError, AppState, DispatchResponse};
use crate::vcs::github::validate_signature;

const GITHUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

pub async fn bitbucket(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let event = header(&headers, BITBUCKET_EVENT_HEADER);
    crate::metrics::webhook_received("bitbucket", event);
    handle_event(&state, SubCredType::Bitbucket, event, &body).await
}

pub async fn github(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let event = header(&headers, GITHUB_EVENT_HEADER);
    crate::metrics::webhook_received("github", event);

    let signature = header(&headers, GITHUB_SIGNATURE_HEADER);
    if !validate_signature(&state.webhook_secret, &body, signature) {
        tracing::warn!("Webhook signature validation failed");
        return Ok(StatusCode::UNAUTHORIZED.into_response());
    }
    handle_event(&state, SubCredType::Github, event, &body).await
}

/// Translate and dispatch one event.
///
/// Events with nothing to build are answered 200 so the VCS does not retry.
async fn handle_event(
    state: &AppState,
    vcs: SubCredType,
    event: &str,
    body: &[u8],
) -> Result<Response, ApiError> {
    let trigger = match translate(vcs, event, body) {
        Ok(trigger) => trigger,
        Err(Error::NoBuildEvent(reason)) => {
            tracing::info!(vcs = %vcs, event = %event, "nothing to build: {reason}");
            return Ok(Json(DispatchResponse::not_built(reason)).into_response());
        }
        Err(e @ Error::UnsupportedEvent(_)) => {
            tracing::warn!(vcs = %vcs, event = %event, "unsupported webhook event");
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    let acct_repo = trigger.repo().to_string();
    match run_trigger(state, trigger).await {
        Ok(dispatch) => Ok(DispatchResponse::reply(dispatch).into_response()),
        Err(e) if e.is_silent() => {
            tracing::info!(vcs = %vcs, acct_repo = %acct_repo, "not building: {e}");
            Ok(Json(DispatchResponse::not_built(e.to_string())).into_response())
        }
        Err(e) => {
            tracing::error!(vcs = %vcs, acct_repo = %acct_repo, "webhook dispatch failed: {e}");
            Err(e.into())
        }
    }
}
