// SPDX-License-Identifier: Apache-2.0

//! The single WebSocket envelope type `sd-server` speaks over
//! `GET /api/v1/ws`, shared with the `gpg-sign` client (which opens the
//! same socket to subscribe to its own request's resolution) so both sides
//! agree on the wire shape without either depending on `sd-server` itself.

use serde::{Deserialize, Serialize};

use crate::autoapprove::{AutoApproveRule, AutoApproveRuleId};
use crate::event::Resolution;
use crate::history::HistoryEntry;
use crate::request::{PendingRequest, RequestId};

/// Build fingerprint carried in the `snapshot` message, so a UI can tell a
/// stale tab apart from a freshly-restarted daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildFingerprint {
    pub version: String,
    pub sha: String,
}

/// One envelope type with a `type` discriminator, per spec §6. Every
/// variant an observer or an HTTP handler needs to emit lives here so
/// `sd-server`, `sd-notify`, and the `gpg-sign` client parse the exact same
/// shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Sent once, immediately after a successful upgrade: everything a
    /// freshly-connected UI needs to render without waiting for events.
    Snapshot {
        pending: Vec<PendingRequest>,
        clients: Vec<String>,
        history: Vec<HistoryEntry>,
        auto_approve_rules: Vec<AutoApproveRule>,
        build: BuildFingerprint,
    },
    RequestCreated {
        request: PendingRequest,
    },
    /// Covers `approved` and `auto_approved` alike; `resolution` tells them
    /// apart. `signature`/`gpg_status`/`exit_code` are only ever populated
    /// for `gpg_sign` requests.
    RequestResolved {
        id: RequestId,
        resolution: Resolution,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gpg_status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    RequestExpired {
        id: RequestId,
    },
    RequestCancelled {
        id: RequestId,
    },
    ClientConnected {
        client: String,
    },
    ClientDisconnected {
        client: String,
    },
    HistoryEntry {
        entry: HistoryEntry,
    },
    AutoApproveRuleAdded {
        rule: AutoApproveRule,
    },
    AutoApproveRuleRemoved {
        id: AutoApproveRuleId,
    },
}
