// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Resolution;
use crate::request::Request;

/// One entry in the manager's bounded history ring.
///
/// Capacity is enforced by `sd-core::manager::History`, not here: this
/// type is the serializable snapshot returned by `GET /api/v1/log` and
/// carried in the WebSocket `history_entry` message, newest-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub request: Request,
    pub resolution: Resolution,
    pub resolved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpg_exit_code: Option<i32>,
}
