// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use crate::request::RequestId;

/// The error taxonomy from `spec.md` §7.
///
/// One variant per kind; no blanket `From<anyhow::Error>` impl, so callers
/// are forced to decide how to present each case (adapters map this to an
/// HTTP status or a client exit code; the manager itself never produces
/// either).
#[derive(Debug, Error)]
pub enum Error {
    #[error("no such request or rule: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The user gave a negative decision for `request_id`.
    #[error("request {request_id} was denied")]
    Denied { request_id: RequestId },

    /// The request's expiry timer elapsed before resolution.
    #[error("request {request_id} expired")]
    Expired { request_id: RequestId },

    /// The caller's context was revoked, or a boundary adapter cancelled
    /// the request on the caller's behalf.
    #[error("request {request_id} was cancelled")]
    Cancelled { request_id: RequestId },

    #[error("unauthorized")]
    Unauthorized,

    /// A bus or socket failure; retryable by the adapter that observed it.
    #[error("transport error: {0}")]
    Transport(String),

    /// The signer ran but exited nonzero. Carries its status bytes and
    /// exit code, surfaced as "approved with nonzero exit" rather than a
    /// plain failure (see `spec.md` §4.5 step 3 and open question (i)).
    #[error("signer exited with status {exit_code}")]
    SignerFailure {
        gpg_status: Vec<u8>,
        exit_code: i32,
    },
}
