// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::autoapprove::{AutoApproveRule, AutoApproveRuleId};
use crate::request::Request;

/// The terminal outcome of a request.
///
/// `Cancelled` is surfaced to downstream consumers the same way `Denied`
/// is (the caller gets a negative result either way) but is recorded
/// distinctly in history, per spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Approved,
    Denied,
    Expired,
    Cancelled,
    AutoApproved,
}

/// Everything the observer fan-out (`sd-core::observer`) delivers to a
/// subscriber.
///
/// Delivery is fire-and-forget and per-observer serialized; see
/// `sd-core::observer` for the dispatch discipline. `RequestApproved`
/// carries the GPG side-channel fields unconditionally (`None`/empty for
/// non-signing requests) so a single event type covers both the ordinary
/// approval path and the signing pipeline — open question (i) in
/// `SPEC_FULL.md` requires a nonzero GPG exit code to still be reported as
/// an approval, and callers must inspect `exit_code` to tell the two apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RequestCreated(Request),
    RequestApproved(ApprovedPayload),
    RequestDenied(Request),
    RequestExpired(Request),
    RequestCancelled(Request),
    RequestAutoApproved(Request),
    AutoApproveRuleAdded(AutoApproveRule),
    AutoApproveRuleRemoved(AutoApproveRuleId),
}

/// Payload of a `RequestApproved` event: the resolved request plus the
/// optional GPG signing side channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedPayload {
    pub request: Request,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpg_status: Option<Vec<u8>>,
    /// Present only when nonzero, per spec's wire contract for the
    /// WebSocket envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl Event {
    /// The request this event concerns, for events that carry one. Rule
    /// add/remove events return `None`.
    pub fn request(&self) -> Option<&Request> {
        match self {
            Event::RequestCreated(r)
            | Event::RequestDenied(r)
            | Event::RequestExpired(r)
            | Event::RequestCancelled(r)
            | Event::RequestAutoApproved(r) => Some(r),
            Event::RequestApproved(p) => Some(&p.request),
            Event::AutoApproveRuleAdded(_) | Event::AutoApproveRuleRemoved(_) => None,
        }
    }
}
