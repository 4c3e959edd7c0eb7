// SPDX-License-Identifier: Apache-2.0

//! Wire and domain types shared between the approval manager, its boundary
//! adapters, and the `gpg-sign` client.
//!
//! Nothing in this crate talks to sockets, the D-Bus session bus, or a
//! subprocess — it only defines the shapes that cross those boundaries, so
//! that `sd-core`, `sd-server`, `sd-gpgsign`, and the `gpg-sign` binary can
//! agree on them without depending on each other.

pub mod autoapprove;
pub mod error;
pub mod event;
pub mod history;
pub mod request;
pub mod sender;
pub mod ws;

pub use autoapprove::{AutoApproveRule, AutoApproveRuleId};
pub use error::Error;
pub use event::{Event, Resolution};
pub use history::HistoryEntry;
pub use request::{GpgSignInfo, ItemDescriptor, PendingRequest, Request, RequestId, RequestType};
pub use sender::SenderInfo;
pub use ws::WsMessage;
