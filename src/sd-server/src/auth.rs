// SPDX-License-Identifier: Apache-2.0

//! Authentication gate for the local HTTP/WS boundary: session cookie OR
//! bearer token on every request, including the WebSocket upgrade, per
//! spec §4.7 / §6.
//!
//! Two credentials are accepted:
//! - the raw 64-hex-char credential itself, read straight from
//!   `$XDG_STATE_HOME/secrets-dispatcher/.cookie` by a trusted local client
//!   such as `gpg-sign`, presented as a bearer token;
//! - a short-lived HS256 JWT minted by `POST /api/v1/auth` from that same
//!   credential, carried in a session cookie for the web UI.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::AppState;

pub const SESSION_COOKIE: &str = "sd_session";
const SESSION_TTL_SECS: i64 = 15 * 60;

/// Claims of the short-lived session token: exactly `iat`/`exp`, per
/// spec §6's locked wire contract — no extra claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iat: i64,
    pub exp: i64,
}

pub fn mint_session_token(credential: &[u8]) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        iat: now,
        exp: now + SESSION_TTL_SECS,
    };
    encode(
        &Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(credential),
    )
}

fn verify_session_token(token: &str, credential: &[u8]) -> bool {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(credential),
        &Validation::new(jsonwebtoken::Algorithm::HS256),
    )
    .is_ok()
}

/// A request is authorized if its bearer token is the raw credential
/// itself, or its session cookie holds a still-valid HS256 token signed
/// with that credential.
fn is_authorized(state: &AppState, jar: &CookieJar, bearer: Option<&str>) -> bool {
    if let Some(token) = bearer {
        if constant_time_eq(token.as_bytes(), &state.credential) {
            return true;
        }
        if verify_session_token(token, &state.credential) {
            return true;
        }
    }
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        if verify_session_token(cookie.value(), &state.credential) {
            return true;
        }
    }
    false
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Serialize)]
struct UnauthorizedBody {
    error: &'static str,
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    req: Request,
    next: Next,
) -> Response {
    let bearer = req
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if is_authorized(&state, &jar, bearer) {
        return next.run(req).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(UnauthorizedBody {
            error: "unauthorized",
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub credential: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub ok: bool,
}

/// `POST /api/v1/auth`: trades the raw credential for a session cookie.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginRequest>,
) -> Response {
    if !constant_time_eq(body.credential.as_bytes(), &state.credential) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(UnauthorizedBody {
                error: "unauthorized",
            }),
        )
            .into_response();
    }
    let token = match mint_session_token(&state.credential) {
        Ok(token) => token,
        Err(err) => {
            tracing::error!(error = %err, "failed to mint session token");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let cookie = Cookie::build(SESSION_COOKIE, token)
        .http_only(true)
        .path("/")
        .finish();
    (CookieJar::new().add(cookie), Json(LoginResponse { ok: true })).into_response()
}
