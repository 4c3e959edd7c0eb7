// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sd_types::{ItemDescriptor, SenderInfo};

/// Short-window memoization of a recently-approved `(sender, item)` pair.
///
/// Keyed on the sender's bus *unique name* (cheap, short-lived identity),
/// distinct from the auto-approve engine's longer-lived invoker-name keying
/// — see `spec.md`'s "two levels of approval memory" design note. A hit
/// suppresses the prompt entirely: no `RequestCreated`, no history entry.
pub struct ApprovalCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl ApprovalCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` iff every item in `items` has a live cache entry for
    /// `sender`. An empty sender or an empty item list never hits (an empty
    /// item list would otherwise match vacuously, which would wrongly
    /// suppress every `search`/`gpg_sign` prompt after any single entry
    /// existed for that sender).
    pub fn check(&self, sender: &SenderInfo, items: &[ItemDescriptor], now: DateTime<Utc>) -> bool {
        if sender.unique_name.is_empty() || items.is_empty() {
            return false;
        }
        let mut entries = self.entries.lock().unwrap();
        items.iter().all(|item| {
            let key = (sender.unique_name.clone(), item.path.clone());
            match entries.get(&key) {
                Some(expires_at) if *expires_at > now => {
                    entries.insert(key, now + self.ttl_chrono());
                    true
                }
                _ => false,
            }
        })
    }

    /// Records a successful human approval, extending the TTL for every
    /// item the request touched. No-op for an empty sender.
    pub fn record_approval(&self, sender: &SenderInfo, items: &[ItemDescriptor], now: DateTime<Utc>) {
        if sender.unique_name.is_empty() {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        for item in items {
            entries.insert(
                (sender.unique_name.clone(), item.path.clone()),
                now + self.ttl_chrono(),
            );
        }
    }

    fn ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(unique_name: &str) -> SenderInfo {
        SenderInfo {
            unique_name: unique_name.to_string(),
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
    fn empty_sender_is_never_cached() {
        let cache = ApprovalCache::new(Duration::from_secs(30));
        let now = Utc::now();
        cache.record_approval(&SenderInfo::empty(), &[item("/a")], now);
        assert!(!cache.check(&SenderInfo::empty(), &[item("/a")], now));
    }

    #[test]
    fn hit_requires_every_item_to_have_a_live_entry() {
        let cache = ApprovalCache::new(Duration::from_secs(30));
        let now = Utc::now();
        cache.record_approval(&sender(":1.1"), &[item("/a")], now);
        assert!(!cache.check(&sender(":1.1"), &[item("/a"), item("/b")], now));
        cache.record_approval(&sender(":1.1"), &[item("/a"), item("/b")], now);
        assert!(cache.check(&sender(":1.1"), &[item("/a"), item("/b")], now));
    }

    #[test]
    fn entry_expires_after_ttl() {
        let cache = ApprovalCache::new(Duration::from_secs(10));
        let now = Utc::now();
        cache.record_approval(&sender(":1.1"), &[item("/a")], now);
        let later = now + chrono::Duration::seconds(11);
        assert!(!cache.check(&sender(":1.1"), &[item("/a")], later));
    }
}
