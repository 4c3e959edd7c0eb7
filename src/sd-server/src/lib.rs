// SPDX-License-Identifier: Apache-2.0

//! Local HTTP + WebSocket boundary adapter, per spec §4.7 / §6.
//!
//! Thin by design: every handler here does one thing — extract a typed
//! body/path, call into `sd-core::ApprovalManager`, and map the result to a
//! JSON response. No approval logic lives in this crate.

mod auth;
mod gpgsign;
mod routes;
mod ws;

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::Request;
use axum::middleware;
use axum::routing::{get, post};
use axum::{Extension, Router};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use sd_core::ApprovalManager;
use sd_types::ws::BuildFingerprint;
use sd_types::SenderInfo;
use tokio::net::UnixListener;
use tower::Service;

pub use ws::WsBroadcaster;

/// Shared state every handler reaches into. Cheap to clone (everything
/// behind an `Arc`), but handlers take `State<Arc<AppState>>` directly
/// rather than cloning it themselves.
pub struct AppState {
    pub manager: Arc<ApprovalManager>,
    pub ws: Arc<WsBroadcaster>,
    pub credential: Vec<u8>,
    pub signer_path: PathBuf,
    pub socket_path: String,
}

fn build_fingerprint() -> BuildFingerprint {
    BuildFingerprint {
        version: sd_build_info::BUILD_INFO.version.to_string(),
        sha: sd_build_info::BUILD_INFO.sha.to_string(),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/status", get(routes::status))
        .route("/api/v1/pending", get(routes::pending))
        .route("/api/v1/log", get(routes::log))
        .route("/api/v1/pending/:id/approve", post(routes::approve))
        .route("/api/v1/pending/:id/deny", post(routes::deny))
        .route("/api/v1/pending/:id/cancel", post(routes::cancel))
        .route("/api/v1/gpg-sign/request", post(routes::gpg_sign_request))
        .route(
            "/api/v1/auto-approve",
            get(routes::list_auto_approve_rules).post(routes::add_auto_approve_rule),
        )
        .route(
            "/api/v1/auto-approve/:id",
            axum::routing::delete(routes::remove_auto_approve_rule),
        )
        .route("/api/v1/ws", get(ws::upgrade))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_auth,
        ))
        .route("/api/v1/auth", post(auth::login))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds `socket_path` (0700 parent directory, 0600 socket file, per spec
/// §5/§6) and serves the router until the process is killed.
///
/// Uses a manual accept loop rather than `axum::serve` so that every
/// connection's peer credentials (spec §4.6) can be resolved once, at
/// accept time, and attached to every request on that connection as an
/// `Extension<SenderInfo>` — this is what lets `POST
/// /api/v1/gpg-sign/request` evaluate `CheckTrustedSigner` against the
/// caller's real identity instead of an empty sender.
pub async fn serve(
    socket_path: &Path,
    manager: Arc<ApprovalManager>,
    credential: Vec<u8>,
    signer_path: PathBuf,
) -> std::io::Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
        std::fs::set_permissions(parent, Permissions::from_mode(0o700))?;
    }
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, Permissions::from_mode(0o600))?;

    let ws = Arc::new(WsBroadcaster::new(Arc::clone(&manager), 256));
    manager.subscribe(ws.clone());

    let state = Arc::new(AppState {
        manager,
        ws,
        credential,
        signer_path,
        socket_path: socket_path.to_string_lossy().into_owned(),
    });
    let app = router(state);

    loop {
        let (stream, _addr) = listener.accept().await?;
        let sender = match sd_peercred::peer_pid_uid(&stream) {
            Some((pid, uid)) => sd_peercred::resolve_from_pid_uid(pid, uid).await,
            None => SenderInfo::empty(),
        };
        let mut connection_app = app.clone().layer(Extension(sender));
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            let hyper_service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                let (parts, body) = request.into_parts();
                let request = Request::from_parts(parts, axum::body::Body::new(body));
                connection_app.call(request)
            });
            if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, hyper_service)
                .await
            {
                tracing::debug!(error = %err, "connection closed with error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_fingerprint_reports_crate_version() {
        let fp = build_fingerprint();
        assert!(!fp.version.is_empty());
        assert!(!fp.sha.is_empty());
    }
}
