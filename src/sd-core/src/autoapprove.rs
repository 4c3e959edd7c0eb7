// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sd_types::{
    AutoApproveRule, AutoApproveRuleId, AutoApproveRuleKey, ItemDescriptor, Request, RequestType,
    SenderInfo,
};

/// Input to [`crate::ApprovalManager::add_auto_approve_rule`]: either an
/// explicit "remember this shape" call, or a template derived from a
/// request the caller wants to generalize (spec §8 scenario 3 and 6 both
/// add a rule from a previously-seen `Request`).
#[derive(Debug, Clone)]
pub struct AutoApproveRuleInput {
    pub invoker_name: String,
    pub request_type: RequestType,
    pub collection: String,
    pub attributes: BTreeMap<String, String>,
}

impl AutoApproveRuleInput {
    /// Builds a rule template from a concrete request.
    ///
    /// The attribute set is the intersection of every item's attribute map
    /// (key present with the same value on every item), so the resulting
    /// rule is guaranteed to be a subset of any single item's attributes —
    /// the spec leaves the exact reduction unspecified; intersection is the
    /// only choice that can't immediately over-match a future request with
    /// fewer attributes than any one item in this one.
    ///
    /// Returns `None` if the request has no usable invoker name — such a
    /// request can never be auto-approve eligible (spec §4.4: both sides of
    /// `invoker_name` must be non-empty).
    pub fn from_request(request: &Request) -> Option<Self> {
        if request.sender.unit_name.is_empty() {
            return None;
        }
        let collection = request
            .items
            .first()
            .map(ItemDescriptor::collection)
            .unwrap_or_default();
        let attributes = if request.items.is_empty() {
            request.search_attributes.clone()
        } else {
            intersect_attributes(&request.items)
        };
        Some(Self {
            invoker_name: request.sender.unit_name.clone(),
            request_type: request.request_type,
            collection,
            attributes,
        })
    }
}

fn intersect_attributes(items: &[ItemDescriptor]) -> BTreeMap<String, String> {
    let mut iter = items.iter();
    let Some(first) = iter.next() else {
        return BTreeMap::new();
    };
    let mut acc = first.attributes.clone();
    for item in iter {
        acc.retain(|k, v| item.attributes.get(k) == Some(v));
    }
    acc
}

/// A configured, static bypass for `gpg_sign` requests. Independent of
/// auto-approve rules: evaluated directly against the incoming request's
/// resolved sender, never expires, never installed at runtime.
#[derive(Debug, Clone, Default)]
pub struct TrustedSignerPolicy {
    /// Real path of the peer's executable, resolved from its pid. `None`
    /// means "don't check" (a wildcard), matching spec's "empty optional
    /// fields are wildcards".
    pub exe_path: Option<String>,
    pub repo_path: Option<String>,
    pub file_prefix: Option<String>,
}

impl TrustedSignerPolicy {
    pub fn matches(&self, sender: &SenderInfo, repo_name: &str, changed_files: &[String]) -> bool {
        if let Some(want) = &self.exe_path {
            if sender.exe_path.as_deref() != Some(want.as_str()) {
                return false;
            }
        }
        if let Some(want) = &self.repo_path {
            if want != repo_name {
                return false;
            }
        }
        if let Some(prefix) = &self.file_prefix {
            if !changed_files.iter().all(|f| f.starts_with(prefix.as_str())) {
                return false;
            }
        }
        true
    }
}

fn key_of_input(input: &AutoApproveRuleInput) -> AutoApproveRuleKey {
    AutoApproveRuleKey {
        invoker_name: input.invoker_name.clone(),
        request_type: input.request_type,
        collection: input.collection.clone(),
        attributes: input.attributes.clone().into_iter().collect(),
    }
}

struct State {
    rules: HashMap<AutoApproveRuleId, AutoApproveRule>,
    by_key: HashMap<AutoApproveRuleKey, AutoApproveRuleId>,
}

/// Remembers auto-approve rules and matches incoming requests against
/// them. Holds its own lock, independent of the manager's pending/history
/// locks — matching is read-mostly and must stay cheap on the hot path.
pub struct AutoApproveEngine {
    ttl: Duration,
    state: Mutex<State>,
}

impl AutoApproveEngine {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(State {
                rules: HashMap::new(),
                by_key: HashMap::new(),
            }),
        }
    }

    /// Adds a rule, or refreshes and returns the id of an existing rule
    /// with the same dedup key.
    pub fn add(&self, input: AutoApproveRuleInput, now: DateTime<Utc>) -> AutoApproveRule {
        let key = key_of_input(&input);
        let expires_at = now
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.by_key.get(&key).copied() {
            let rule = state.rules.get_mut(&id).expect("by_key index out of sync");
            rule.expires_at = expires_at;
            return rule.clone();
        }
        let rule = AutoApproveRule {
            id: AutoApproveRuleId::new(),
            invoker_name: input.invoker_name,
            request_type: input.request_type,
            collection: input.collection,
            attributes: input.attributes,
            created_at: now,
            expires_at,
        };
        state.rules.insert(rule.id, rule.clone());
        state.by_key.insert(key, rule.id);
        rule
    }

    pub fn remove(&self, id: AutoApproveRuleId) -> Option<AutoApproveRule> {
        let mut state = self.state.lock().unwrap();
        let rule = state.rules.remove(&id)?;
        state.by_key.remove(&rule.dedup_key());
        Some(rule)
    }

    /// Evicts expired rules and returns them, so the caller (the manager)
    /// can emit one `AutoApproveRuleRemoved` event per eviction.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> Vec<AutoApproveRule> {
        let mut state = self.state.lock().unwrap();
        let expired_ids: Vec<_> = state
            .rules
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id)
            .collect();
        let mut removed = Vec::with_capacity(expired_ids.len());
        for id in expired_ids {
            if let Some(rule) = state.rules.remove(&id) {
                state.by_key.remove(&rule.dedup_key());
                removed.push(rule);
            }
        }
        removed
    }

    /// Read-only snapshot of all non-expired rules. Callers should first
    /// call [`Self::evict_expired`] (the manager does this on every list
    /// and match operation) so this never returns a stale rule.
    pub fn list(&self) -> Vec<AutoApproveRule> {
        self.state.lock().unwrap().rules.values().cloned().collect()
    }

    /// Finds a rule matching an incoming request's shape, if any.
    pub fn find_match(
        &self,
        request_type: RequestType,
        items: &[ItemDescriptor],
        search_attributes: &BTreeMap<String, String>,
        sender: &SenderInfo,
    ) -> Option<AutoApproveRule> {
        if sender.unit_name.is_empty() {
            return None;
        }
        let collection = items.first().map(ItemDescriptor::collection).unwrap_or_default();
        let state = self.state.lock().unwrap();
        state
            .rules
            .values()
            .find(|rule| {
                rule.invoker_name == sender.unit_name
                    && rule.request_type == request_type
                    && rule.collection == collection
                    && rule.attributes.iter().all(|(k, v)| {
                        if items.is_empty() {
                            search_attributes.get(k) == Some(v)
                        } else {
                            items.iter().all(|item| item.attributes.get(k) == Some(v))
                        }
                    })
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(unit: &str) -> SenderInfo {
        SenderInfo {
            unit_name: unit.to_string(),
            ..Default::default()
        }
    }

    fn item(path: &str) -> ItemDescriptor {
        ItemDescriptor {
            path: path.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn find_match_requires_rule_attributes_to_be_a_subset() {
        let engine = AutoApproveEngine::new(Duration::from_secs(60));
        let now = Utc::now();
        let mut attrs = BTreeMap::new();
        attrs.insert("service".to_string(), "gh".to_string());
        engine.add(
            AutoApproveRuleInput {
                invoker_name: "app".into(),
                request_type: RequestType::GetSecret,
                collection: "login".into(),
                attributes: attrs,
            },
            now,
        );

        let mut item_attrs = BTreeMap::new();
        item_attrs.insert("service".to_string(), "gh".to_string());
        item_attrs.insert("extra".to_string(), "ignored".to_string());
        let matching_item = ItemDescriptor {
            path: "/org/freedesktop/secrets/collection/login/2".into(),
            attributes: item_attrs,
            ..Default::default()
        };
        assert!(engine
            .find_match(
                RequestType::GetSecret,
                &[matching_item],
                &BTreeMap::new(),
                &sender("app"),
            )
            .is_some());

        assert!(engine
            .find_match(
                RequestType::GetSecret,
                &[item("/org/freedesktop/secrets/collection/login/2")],
                &BTreeMap::new(),
                &sender("app"),
            )
            .is_none());
    }

    #[test]
    fn find_match_requires_non_empty_invoker_name() {
        let engine = AutoApproveEngine::new(Duration::from_secs(60));
        engine.add(
            AutoApproveRuleInput {
                invoker_name: "app".into(),
                request_type: RequestType::GetSecret,
                collection: "login".into(),
                attributes: BTreeMap::new(),
            },
            Utc::now(),
        );
        assert!(engine
            .find_match(
                RequestType::GetSecret,
                &[item("/org/freedesktop/secrets/collection/login/2")],
                &BTreeMap::new(),
                &SenderInfo::default(),
            )
            .is_none());
    }

    #[test]
    fn evict_expired_removes_past_ttl_rules_only() {
        let engine = AutoApproveEngine::new(Duration::from_secs(60));
        let now = Utc::now();
        let rule = engine.add(
            AutoApproveRuleInput {
                invoker_name: "app".into(),
                request_type: RequestType::GetSecret,
                collection: "login".into(),
                attributes: BTreeMap::new(),
            },
            now,
        );
        assert!(engine.evict_expired(now).is_empty());
        let evicted = engine.evict_expired(now + chrono::Duration::seconds(61));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, rule.id);
        assert!(engine.list().is_empty());
    }

    #[test]
    fn trusted_signer_policy_treats_empty_fields_as_wildcards() {
        let policy = TrustedSignerPolicy {
            exe_path: Some("/usr/bin/git".into()),
            repo_path: None,
            file_prefix: None,
        };
        let sender = SenderInfo {
            exe_path: Some("/usr/bin/git".into()),
            ..Default::default()
        };
        assert!(policy.matches(&sender, "any-repo", &["any/file".into()]));

        let other_sender = SenderInfo {
            exe_path: Some("/usr/bin/evil".into()),
            ..Default::default()
        };
        assert!(!policy.matches(&other_sender, "any-repo", &[]));
    }

    #[test]
    fn trusted_signer_policy_file_prefix_must_match_every_changed_file() {
        let policy = TrustedSignerPolicy {
            exe_path: None,
            repo_path: None,
            file_prefix: Some("docs/".into()),
        };
        let sender = SenderInfo::default();
        assert!(policy.matches(&sender, "repo", &["docs/a.md".into(), "docs/b.md".into()]));
        assert!(!policy.matches(&sender, "repo", &["docs/a.md".into(), "src/main.rs".into()]));
    }
}
