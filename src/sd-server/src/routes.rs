// SPDX-License-Identifier: Apache-2.0

//! HTTP handlers for `/api/v1/*`, per spec §6.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use sd_types::{
    AutoApproveRuleId, Error, GpgSignInfo, HistoryEntry, PendingRequest, RequestId, RequestType,
    SenderInfo,
};
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub clients: Vec<String>,
    pub pending_count: usize,
    pub client: Option<String>,
    pub remote_socket: Option<String>,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        running: true,
        clients: state.ws.connected_clients(),
        pending_count: state.manager.list().len(),
        client: None,
        remote_socket: Some(state.socket_path.clone()),
    })
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub requests: Vec<PendingRequest>,
}

pub async fn pending(State(state): State<Arc<AppState>>) -> Json<PendingResponse> {
    Json(PendingResponse {
        requests: state.manager.list(),
    })
}

#[derive(Debug, Serialize)]
pub struct LogResponse {
    pub entries: Vec<HistoryEntry>,
}

pub async fn log(State(state): State<Arc<AppState>>) -> Json<LogResponse> {
    Json(LogResponse {
        entries: state.manager.history(),
    })
}

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error_response(err: Error) -> Response {
    let status = match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::Unauthorized => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody { error: err.to_string() })).into_response()
}

/// `POST /api/v1/pending/{id}/approve`.
///
/// For ordinary requests this is a direct `ApprovalManager::approve`. For a
/// pending `gpg_sign` request, the signer runs first (see
/// `sd-gpgsign::sign`) and only then does the manager transition the
/// request — per spec §4.5 / §5, the signer invocation blocks this
/// resolving call, not any other manager operation.
pub async fn approve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RequestId>,
) -> Response {
    let is_gpg_sign = state
        .manager
        .get_pending(id)
        .map(|r| r.request_type == RequestType::GpgSign)
        .unwrap_or(false);

    let result = if is_gpg_sign {
        approve_gpg_sign(&state, id).await
    } else {
        state.manager.approve(id)
    };

    match result {
        Ok(()) => (StatusCode::OK, Json(ActionResponse { status: "approved" })).into_response(),
        Err(err) => error_response(err),
    }
}

async fn approve_gpg_sign(state: &AppState, id: RequestId) -> Result<(), Error> {
    let Some(request) = state.manager.get_pending(id) else {
        return Err(Error::NotFound(id.to_string()));
    };
    let info = request
        .gpg_sign_info
        .as_ref()
        .ok_or_else(|| Error::InvalidInput("gpg_sign request missing gpg_sign_info".into()))?;

    match crate::gpgsign::sign_now(state, info).await {
        Ok(outcome) if outcome.succeeded() => {
            state
                .manager
                .approve_with_signature(id, outcome.signature, outcome.gpg_status)
        }
        Ok(outcome) => state
            .manager
            .approve_gpg_failed(id, outcome.gpg_status, outcome.exit_code),
        Err(err) => {
            tracing::error!(error = %err, "signer invocation failed");
            state.manager.approve_gpg_failed(id, err.to_string().into_bytes(), -1)
        }
    }
}

pub async fn deny(State(state): State<Arc<AppState>>, Path(id): Path<RequestId>) -> Response {
    match state.manager.deny(id) {
        Ok(()) => (StatusCode::OK, Json(ActionResponse { status: "denied" })).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn cancel(State(state): State<Arc<AppState>>, Path(id): Path<RequestId>) -> Response {
    match state.manager.cancel(id) {
        Ok(()) => (StatusCode::OK, Json(ActionResponse { status: "cancelled" })).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct GpgSignRequestBody {
    pub client: String,
    pub gpg_sign_info: GpgSignInfo,
}

#[derive(Debug, Serialize)]
pub struct GpgSignRequestResponse {
    pub request_id: RequestId,
}

/// `POST /api/v1/gpg-sign/request`: inserts a non-blocking pending
/// `gpg_sign` request, or — if a trusted-signer policy matches the caller
/// — signs synchronously and records it already-approved, per spec §4.4's
/// trusted-signer bypass.
pub async fn gpg_sign_request(
    State(state): State<Arc<AppState>>,
    Extension(sender): Extension<SenderInfo>,
    Json(body): Json<GpgSignRequestBody>,
) -> Response {
    if state.manager.check_trusted_signer(
        &sender,
        &body.gpg_sign_info.repo_name,
        &body.gpg_sign_info.changed_files,
    ) {
        match crate::gpgsign::sign_now(&state, &body.gpg_sign_info).await {
            Ok(outcome) if outcome.succeeded() => {
                let id = state.manager.record_auto_approved_gpg_sign(
                    body.client,
                    body.gpg_sign_info,
                    sender,
                    outcome.signature,
                    outcome.gpg_status,
                );
                return (StatusCode::OK, Json(GpgSignRequestResponse { request_id: id }))
                    .into_response();
            }
            Ok(outcome) => {
                tracing::error!(exit_code = outcome.exit_code, "trusted signer exited nonzero");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
            Err(err) => {
                tracing::error!(error = %err, "trusted-signer invocation failed");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        }
    }

    let id = state
        .manager
        .create_gpg_sign_request(body.client, body.gpg_sign_info, sender);
    (StatusCode::OK, Json(GpgSignRequestResponse { request_id: id })).into_response()
}

#[derive(Debug, Serialize)]
pub struct AutoApproveRuleResponse {
    pub rules: Vec<sd_types::AutoApproveRule>,
}

pub async fn list_auto_approve_rules(
    State(state): State<Arc<AppState>>,
) -> Json<AutoApproveRuleResponse> {
    Json(AutoApproveRuleResponse {
        rules: state.manager.list_auto_approve_rules(),
    })
}

#[derive(Debug, Deserialize)]
pub struct AddAutoApproveRuleBody {
    /// A pending or already-resolved request to generalize into a rule —
    /// spec §8 scenario 6: "a subsequent AddAutoApproveRule against that
    /// history entry installs a matching rule."
    pub request_id: RequestId,
}

pub async fn add_auto_approve_rule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddAutoApproveRuleBody>,
) -> Response {
    let request = state
        .manager
        .get_pending(body.request_id)
        .or_else(|| state.manager.get_history_entry(body.request_id).map(|e| e.request));

    let Some(request) = request else {
        return error_response(Error::NotFound(body.request_id.to_string()));
    };
    let Some(input) = sd_core::AutoApproveRuleInput::from_request(&request) else {
        return error_response(Error::InvalidInput(
            "request has no usable invoker name".into(),
        ));
    };
    let rule = state.manager.add_auto_approve_rule(input);
    (StatusCode::OK, Json(rule)).into_response()
}

pub async fn remove_auto_approve_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<AutoApproveRuleId>,
) -> Response {
    match state.manager.remove_auto_approve_rule(id) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}
