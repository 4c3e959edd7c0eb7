// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Identity of the process that opened the connection a request arrived on,
/// as resolved by `sd-peercred`.
///
/// Every field is best-effort: if credential resolution fails at any step,
/// an empty `SenderInfo` (all fields absent, `process_chain` empty) is used
/// instead of failing the request — the request still proceeds, just
/// without invoker context, which in turn makes it ineligible for
/// auto-approve matching (see `sd-core::autoapprove`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderInfo {
    /// Bus unique name, for bus-fronted callers (e.g. `:1.42`). Empty for
    /// callers that did not arrive over a bus connection.
    #[serde(default)]
    pub unique_name: String,

    /// Peer process id, if resolved.
    #[serde(default)]
    pub pid: Option<u32>,

    /// Peer user id, if resolved.
    #[serde(default)]
    pub uid: Option<u32>,

    /// Best-effort display name for the resolved invoker (see
    /// `sd-peercred`'s invoker heuristic). This is what auto-approve rules
    /// key on.
    #[serde(default)]
    pub unit_name: String,

    /// Ordered, parent-first `(comm, pid)` chain from the peer up to (but
    /// not including) pid 1. Reported for UI display only; matching never
    /// consults anything but `unit_name`.
    #[serde(default)]
    pub process_chain: Vec<(String, u32)>,

    /// Resolved real path of the peer's executable (`/proc/<pid>/exe`),
    /// if readable. Used only by `TrustedSignerPolicy`, which needs a
    /// stronger identity than the best-effort `unit_name` heuristic before
    /// it will bypass approval for `gpg_sign`.
    #[serde(default)]
    pub exe_path: Option<String>,
}

impl SenderInfo {
    /// A `SenderInfo` with every field empty/absent, used when peer
    /// credential resolution fails or the caller is not bus-fronted.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether this sender has any usable identity at all. An empty sender
    /// never matches an auto-approve rule and is never inserted into the
    /// approval cache (spec: "empty sender = never cached").
    pub fn is_empty(&self) -> bool {
        self.unique_name.is_empty() && self.unit_name.is_empty() && self.pid.is_none()
    }
}
