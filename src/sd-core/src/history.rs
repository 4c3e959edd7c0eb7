// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;

use sd_types::{HistoryEntry, RequestId};

/// Bounded, newest-first ring of resolved requests.
///
/// Capacity is strictly enforced: pushing past `capacity` evicts the
/// oldest entry. `capacity == 0` keeps no history at all.
pub struct HistoryRing {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.capacity == 0 {
            return;
        }
        self.entries.push_front(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    /// Newest-first snapshot of the whole ring.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn get(&self, id: RequestId) -> Option<HistoryEntry> {
        self.entries.iter().find(|e| e.request.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sd_types::{Request, RequestType, Resolution, SenderInfo};
    use std::collections::BTreeMap;

    fn entry() -> HistoryEntry {
        let now = chrono::Utc::now();
        HistoryEntry {
            request: Request {
                id: RequestId::new(),
                request_type: RequestType::GetSecret,
                client: "client".into(),
                items: Vec::new(),
                search_attributes: BTreeMap::new(),
                gpg_sign_info: None,
                session: "session".into(),
                sender: SenderInfo::empty(),
                created_at: now,
                expires_at: now,
            },
            resolution: Resolution::Approved,
            resolved_at: now,
            gpg_exit_code: None,
        }
    }

    #[test]
    fn capacity_is_strictly_enforced_oldest_evicted_first() {
        let mut ring = HistoryRing::new(2);
        let first = entry();
        let first_id = first.request.id;
        ring.push(first);
        ring.push(entry());
        ring.push(entry());
        assert_eq!(ring.snapshot().len(), 2);
        assert!(ring.get(first_id).is_none());
    }

    #[test]
    fn snapshot_is_newest_first() {
        let mut ring = HistoryRing::new(10);
        let first = entry();
        let second = entry();
        let second_id = second.request.id;
        ring.push(first);
        ring.push(second);
        assert_eq!(ring.snapshot()[0].request.id, second_id);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut ring = HistoryRing::new(0);
        ring.push(entry());
        assert!(ring.snapshot().is_empty());
    }
}
