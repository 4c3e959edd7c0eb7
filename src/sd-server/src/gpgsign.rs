// SPDX-License-Identifier: Apache-2.0

//! Thin glue between the HTTP boundary and `sd-gpgsign`: resolves the
//! configured signer binary once at startup and invokes it on demand.

use sd_gpgsign::{SignError, SignOutcome};
use sd_types::GpgSignInfo;

use crate::AppState;

pub async fn sign_now(state: &AppState, info: &GpgSignInfo) -> Result<SignOutcome, SignError> {
    sd_gpgsign::sign(&state.signer_path, info).await
}
