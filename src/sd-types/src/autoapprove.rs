// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::request::RequestType;

/// Unique identifier for an installed auto-approve rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AutoApproveRuleId(Uuid);

impl AutoApproveRuleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AutoApproveRuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AutoApproveRuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Dedup key for an auto-approve rule: `(invoker_name, request_type,
/// collection, canonical_attribute_set)`. Adding a rule whose key already
/// exists refreshes the existing rule's expiry and returns its id,
/// rather than inserting a duplicate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AutoApproveRuleKey {
    pub invoker_name: String,
    pub request_type: RequestType,
    pub collection: String,
    pub attributes: Vec<(String, String)>,
}

/// A remembered "auto-approve this shape of request" rule.
///
/// Matching semantics (all must hold, see `spec.md` §4.4):
/// - `invoker_name` equals the sender's resolved unit name (both non-empty).
/// - `request_type` equals the incoming request's type.
/// - `collection` equals the collection segment of the request's first
///   item's path.
/// - `attributes` is a subset of every item's attribute map in the
///   incoming request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoApproveRule {
    pub id: AutoApproveRuleId,
    pub invoker_name: String,
    pub request_type: RequestType,
    pub collection: String,
    pub attributes: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AutoApproveRule {
    pub fn dedup_key(&self) -> AutoApproveRuleKey {
        AutoApproveRuleKey {
            invoker_name: self.invoker_name.clone(),
            request_type: self.request_type,
            collection: self.collection.clone(),
            attributes: self.attributes.clone().into_iter().collect(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
