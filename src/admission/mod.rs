//! Admission & Launch Pipeline (component G): HTTP entry point.
//!
//! Grounded in `original_source/src/server.py`'s `HookResource.on_post` for
//! the exact validation order (spec.md §4.G steps 1-8), and in the
//! teacher's `webhook/server.rs` for the axum `Router`/`State` shape.

pub mod launch;

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::error::Error;
use crate::forge;

use launch::{Components, LaunchJob};

const REQUIRED_REF: &str = "refs/heads/main";
const DOCKERFILE_PATH: &str = "Dockerfile";

#[derive(Clone)]
pub struct AppState {
    pub components: Arc<Components>,
    pub launch_tx: mpsc::Sender<LaunchJob>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/hook", post(hook_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Maps admission-path failures onto the status codes spec.md §6 names.
struct AdmissionError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<Error> for AdmissionError {
    fn from(e: Error) -> Self {
        match e {
            Error::InputRejected(msg) => AdmissionError { status: StatusCode::BAD_REQUEST, message: msg },
            Error::VerificationFailed(msg) => AdmissionError { status: StatusCode::BAD_REQUEST, message: msg },
            other => AdmissionError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: other.to_string(),
            },
        }
    }
}

fn bad_request(message: impl Into<String>) -> AdmissionError {
    AdmissionError { status: StatusCode::BAD_REQUEST, message: message.into() }
}

fn unauthorized(message: impl Into<String>) -> AdmissionError {
    AdmissionError { status: StatusCode::UNAUTHORIZED, message: message.into() }
}

/// Step 1: `X-Gitlab-Event` must be a push or system hook.
fn check_event_header(headers: &HeaderMap) -> Result<(), AdmissionError> {
    let event_header = headers
        .get("X-Gitlab-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if event_header != "Push Hook" && event_header != "System Hook" {
        return Err(bad_request(format!("invalid X-Gitlab-Event header: {event_header}")));
    }
    Ok(())
}

/// Step 2: `X-Gitlab-Token` must match the configured webhook secret.
fn check_token(headers: &HeaderMap, expected_secret: &str) -> Result<(), AdmissionError> {
    let token_header = headers
        .get("X-Gitlab-Token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if token_header != expected_secret {
        return Err(unauthorized("invalid token"));
    }
    Ok(())
}

#[instrument(skip(state, headers, body))]
async fn hook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<StatusCode, AdmissionError> {
    check_event_header(&headers)?;
    check_token(&headers, &state.components.settings.gitlab.secret)?;

    // 3. Body parses to the expected shape.
    let push_event = forge::parse_push_event(&body)?;

    // 4. event_name == "push".
    if push_event.event_name != "push" {
        return Err(bad_request(format!("invalid event_name: {}", push_event.event_name)));
    }

    // 5. ref == refs/heads/main.
    if push_event.r#ref != REQUIRED_REF {
        return Err(bad_request(format!("commit is not from main branch: {}", push_event.r#ref)));
    }

    info!(
        commits = push_event.commits.len(),
        project = %push_event.project.path_with_namespace,
        "admitting push"
    );

    // 6. Per-commit signature check.
    for commit in &push_event.commits {
        let signature = state
            .components
            .forge
            .get_signature(push_event.project_id, &commit.id)
            .await?
            .ok_or_else(|| bad_request(format!("no signature found for commit {}", commit.id)))?;
        if !signature.is_verified() {
            warn!(commit = %commit.id, status = %signature.verification_status, "found signature, but it is not verified");
        }
    }

    // 7. Dockerfile must exist at ref.
    let has_dockerfile = state
        .components
        .forge
        .has_file_in_repo(push_event.project_id, DOCKERFILE_PATH, &push_event.r#ref)
        .await?;
    if !has_dockerfile {
        return Err(bad_request(format!(
            "no Dockerfile found in project {}",
            push_event.project_id
        )));
    }

    // 8. Enqueue the launch and respond 200 immediately.
    let job = LaunchJob {
        gitlab_user_id: push_event.user_id,
        source_url: push_event.project.http_url.clone(),
    };
    let queue_depth = state.launch_tx.max_capacity() - state.launch_tx.capacity();
    if state.launch_tx.send(job).await.is_err() {
        return Err(AdmissionError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "launch worker pool is not accepting jobs".to_string(),
        });
    }
    info!(queue_depth, "enqueued launch");

    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(event: Option<&str>, token: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(event) = event {
            headers.insert("X-Gitlab-Event", event.parse().unwrap());
        }
        if let Some(token) = token {
            headers.insert("X-Gitlab-Token", token.parse().unwrap());
        }
        headers
    }

    #[test]
    fn accepts_push_hook_and_system_hook_events() {
        assert!(check_event_header(&headers(Some("Push Hook"), None)).is_ok());
        assert!(check_event_header(&headers(Some("System Hook"), None)).is_ok());
    }

    #[test]
    fn rejects_unknown_or_missing_event_header() {
        assert!(check_event_header(&headers(Some("Merge Request Hook"), None)).is_err());
        assert!(check_event_header(&headers(None, None)).is_err());
    }

    #[test]
    fn accepts_matching_token() {
        assert!(check_token(&headers(None, Some("hook-secret")), "hook-secret").is_ok());
    }

    #[test]
    fn rejects_mismatched_or_missing_token() {
        let err = check_token(&headers(None, Some("wrong")), "hook-secret").unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert!(check_token(&headers(None, None), "hook-secret").is_err());
    }

    #[test]
    fn admission_error_from_input_rejected_is_bad_request() {
        let err: AdmissionError = Error::InputRejected("bad body".to_string()).into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn admission_error_from_provision_failed_is_internal_error() {
        let err: AdmissionError = Error::ProvisionFailed("db unreachable".to_string()).into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
