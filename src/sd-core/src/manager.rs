// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sd_types::{
    AutoApproveRule, AutoApproveRuleId, Error, Event, GpgSignInfo, HistoryEntry, ItemDescriptor,
    Request, RequestId, RequestType, Resolution, SenderInfo,
};
use sd_types::event::ApprovedPayload;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::autoapprove::{AutoApproveEngine, AutoApproveRuleInput, TrustedSignerPolicy};
use crate::cache::ApprovalCache;
use crate::history::HistoryRing;
use crate::observer::{Observer, ObserverHandle, ObserverRegistry};

/// Tunables for one [`ApprovalManager`]. There is no persistence: every
/// field here only shapes in-memory behavior for the life of the process.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a human approval is remembered per `(sender, item)` pair.
    /// Spec default is small (seconds), not minutes.
    pub approval_cache_ttl: Duration,
    /// How long an installed auto-approve rule lives before it must be
    /// re-added. Spec default is minutes.
    pub auto_approve_ttl: Duration,
    /// How many resolved requests the history ring keeps.
    pub history_capacity: usize,
    /// Per-observer bounded queue depth in the event fan-out.
    pub observer_queue_capacity: usize,
    /// Timeout for an interactive `RequireApproval` call.
    pub request_timeout: Duration,
    /// Independent timeout for a `gpg_sign` request, detached from any
    /// caller's lifetime so a web UI review can outlive the originating
    /// HTTP POST.
    pub gpg_sign_timeout: Duration,
    /// Statically configured bypasses for `gpg_sign` that skip the
    /// pending flow entirely.
    pub trusted_signers: Vec<TrustedSignerPolicy>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            approval_cache_ttl: Duration::from_secs(30),
            auto_approve_ttl: Duration::from_secs(15 * 60),
            history_capacity: 200,
            observer_queue_capacity: 64,
            request_timeout: Duration::from_secs(120),
            gpg_sign_timeout: Duration::from_secs(300),
            trusted_signers: Vec::new(),
        }
    }
}

/// Outcome delivered to a blocked `require_approval` caller through its
/// completion channel. Distinct from [`Resolution`]: it never carries
/// signature/status bytes, because only non-blocking `gpg_sign` requests
/// ever resolve with those attached, and those requests have no waiter.
#[derive(Debug, Clone, Copy)]
enum Outcome {
    Approved,
    Denied,
    Expired,
    Cancelled,
}

struct PendingEntry {
    request: Request,
    completion: Option<oneshot::Sender<Outcome>>,
}

/// Owner of the pending table, history ring, approval cache, and
/// auto-approve engine. Every public method here is a single atomic state
/// transition; boundary adapters and the GPG signing pipeline never touch
/// these structures directly.
pub struct ApprovalManager {
    config: ManagerConfig,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    history: Mutex<HistoryRing>,
    cache: ApprovalCache,
    autoapprove: AutoApproveEngine,
    observers: ObserverRegistry,
}

impl ApprovalManager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(HistoryRing::new(config.history_capacity)),
            cache: ApprovalCache::new(config.approval_cache_ttl),
            autoapprove: AutoApproveEngine::new(config.auto_approve_ttl),
            observers: ObserverRegistry::new(config.observer_queue_capacity),
            config,
        })
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> ObserverHandle {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, handle: ObserverHandle) {
        self.observers.unsubscribe(handle)
    }

    /// Blocks until `cancel` fires, the manager's own timeout elapses, or
    /// someone resolves the request by id. Consults the approval cache
    /// and the auto-approve engine first; only falls through to a pending
    /// prompt on a double miss.
    #[allow(clippy::too_many_arguments)]
    pub async fn require_approval(
        &self,
        cancel: CancellationToken,
        client: String,
        items: Vec<ItemDescriptor>,
        session: String,
        request_type: RequestType,
        search_attributes: BTreeMap<String, String>,
        sender: SenderInfo,
    ) -> Result<(), Error> {
        let now = Utc::now();

        if self.cache.check(&sender, &items, now) {
            return Ok(());
        }

        self.evict_expired_rules(now);
        if self
            .autoapprove
            .find_match(request_type, &items, &search_attributes, &sender)
            .is_some()
        {
            let request = self.build_request(
                request_type,
                client,
                items,
                search_attributes,
                None,
                session,
                sender,
                now,
                self.config.request_timeout,
            );
            self.push_history(request.clone(), Resolution::AutoApproved, now, None);
            self.observers.dispatch(Event::RequestAutoApproved(request));
            return Ok(());
        }

        let (tx, mut rx) = oneshot::channel();
        let request = self.build_request(
            request_type,
            client,
            items,
            search_attributes,
            None,
            session,
            sender,
            now,
            self.config.request_timeout,
        );
        let id = request.id;
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(
                id,
                PendingEntry {
                    request: request.clone(),
                    completion: Some(tx),
                },
            );
        }
        self.observers.dispatch(Event::RequestCreated(request));

        let sleep = tokio::time::sleep(self.config.request_timeout);
        tokio::pin!(sleep);

        let outcome = tokio::select! {
            biased;
            recv = &mut rx => recv.unwrap_or(Outcome::Cancelled),
            _ = &mut sleep => match self.expire(id) {
                Ok(()) => Outcome::Expired,
                Err(_) => rx.await.unwrap_or(Outcome::Cancelled),
            },
            _ = cancel.cancelled() => match self.cancel(id) {
                Ok(()) => Outcome::Cancelled,
                Err(_) => rx.await.unwrap_or(Outcome::Cancelled),
            },
        };

        match outcome {
            Outcome::Approved => Ok(()),
            Outcome::Denied => Err(Error::Denied { request_id: id }),
            Outcome::Expired => Err(Error::Expired { request_id: id }),
            Outcome::Cancelled => Err(Error::Cancelled { request_id: id }),
        }
    }

    /// Non-blocking: inserts a pending `gpg_sign` request and returns
    /// immediately, starting an independent timer detached from this
    /// call's own lifetime.
    pub fn create_gpg_sign_request(
        self: &Arc<Self>,
        client: String,
        info: GpgSignInfo,
        sender: SenderInfo,
    ) -> RequestId {
        let now = Utc::now();
        let request = self.build_request(
            RequestType::GpgSign,
            client,
            Vec::new(),
            BTreeMap::new(),
            Some(info),
            String::new(),
            sender,
            now,
            self.config.gpg_sign_timeout,
        );
        let id = request.id;
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(
                id,
                PendingEntry {
                    request: request.clone(),
                    completion: None,
                },
            );
        }
        self.observers.dispatch(Event::RequestCreated(request));

        let manager = Arc::clone(self);
        let timeout = self.config.gpg_sign_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = manager.expire(id);
        });

        id
    }

    /// Records a trusted-signer bypass: the signer already ran, so this
    /// skips the pending table entirely and goes straight to history +
    /// `RequestApproved`.
    pub fn record_auto_approved_gpg_sign(
        &self,
        client: String,
        info: GpgSignInfo,
        sender: SenderInfo,
        signature: Vec<u8>,
        gpg_status: Vec<u8>,
    ) -> RequestId {
        let now = Utc::now();
        let request = self.build_request(
            RequestType::GpgSign,
            client,
            Vec::new(),
            BTreeMap::new(),
            Some(info),
            String::new(),
            sender,
            now,
            self.config.gpg_sign_timeout,
        );
        let id = request.id;
        self.push_history(request.clone(), Resolution::Approved, now, Some(0));
        self.observers.dispatch(Event::RequestApproved(ApprovedPayload {
            request,
            signature: Some(signature),
            gpg_status: Some(gpg_status),
            exit_code: None,
        }));
        id
    }

    pub fn approve(&self, id: RequestId) -> Result<(), Error> {
        let request = self.finalize(id, Resolution::Approved)?;
        let now = Utc::now();
        self.cache.record_approval(&request.sender, &request.items, now);
        self.push_history(request.clone(), Resolution::Approved, now, None);
        self.observers.dispatch(Event::RequestApproved(ApprovedPayload {
            request,
            signature: None,
            gpg_status: None,
            exit_code: None,
        }));
        Ok(())
    }

    pub fn deny(&self, id: RequestId) -> Result<(), Error> {
        let request = self.finalize(id, Resolution::Denied)?;
        self.push_history(request.clone(), Resolution::Denied, Utc::now(), None);
        self.observers.dispatch(Event::RequestDenied(request));
        Ok(())
    }

    pub fn cancel(&self, id: RequestId) -> Result<(), Error> {
        let request = self.finalize(id, Resolution::Cancelled)?;
        self.push_history(request.clone(), Resolution::Cancelled, Utc::now(), None);
        self.observers.dispatch(Event::RequestCancelled(request));
        Ok(())
    }

    fn expire(&self, id: RequestId) -> Result<(), Error> {
        let request = self.finalize(id, Resolution::Expired)?;
        self.push_history(request.clone(), Resolution::Expired, Utc::now(), None);
        self.observers.dispatch(Event::RequestExpired(request));
        Ok(())
    }

    /// Attaches a signature delivered by the signing pipeline to a pending
    /// `gpg_sign` request and resolves it as approved.
    pub fn approve_with_signature(
        &self,
        id: RequestId,
        signature: Vec<u8>,
        gpg_status: Vec<u8>,
    ) -> Result<(), Error> {
        let request = self.finalize(id, Resolution::Approved)?;
        self.push_history(request.clone(), Resolution::Approved, Utc::now(), Some(0));
        self.observers.dispatch(Event::RequestApproved(ApprovedPayload {
            request,
            signature: Some(signature),
            gpg_status: Some(gpg_status),
            exit_code: None,
        }));
        Ok(())
    }

    /// The signer ran but failed or exited nonzero. Per the locked
    /// open-question contract, this is still resolved as "approved" with
    /// an empty signature — callers must inspect `exit_code`.
    pub fn approve_gpg_failed(
        &self,
        id: RequestId,
        gpg_status: Vec<u8>,
        exit_code: i32,
    ) -> Result<(), Error> {
        let request = self.finalize(id, Resolution::Approved)?;
        self.push_history(
            request.clone(),
            Resolution::Approved,
            Utc::now(),
            Some(exit_code),
        );
        self.observers.dispatch(Event::RequestApproved(ApprovedPayload {
            request,
            signature: None,
            gpg_status: Some(gpg_status),
            exit_code: Some(exit_code),
        }));
        Ok(())
    }

    /// Snapshot of currently pending, non-expired requests.
    pub fn list(&self) -> Vec<Request> {
        let now = Utc::now();
        self.pending
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.request.clone())
            .filter(|request| request.expires_at > now)
            .collect()
    }

    pub fn get_pending(&self, id: RequestId) -> Option<Request> {
        self.pending.lock().unwrap().get(&id).map(|e| e.request.clone())
    }

    /// Newest-first snapshot of resolved requests.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().unwrap().snapshot()
    }

    pub fn get_history_entry(&self, id: RequestId) -> Option<HistoryEntry> {
        self.history.lock().unwrap().get(id)
    }

    pub fn add_auto_approve_rule(&self, input: AutoApproveRuleInput) -> AutoApproveRule {
        let rule = self.autoapprove.add(input, Utc::now());
        self.observers.dispatch(Event::AutoApproveRuleAdded(rule.clone()));
        rule
    }

    pub fn remove_auto_approve_rule(&self, id: AutoApproveRuleId) -> Result<(), Error> {
        match self.autoapprove.remove(id) {
            Some(rule) => {
                self.observers.dispatch(Event::AutoApproveRuleRemoved(rule.id));
                Ok(())
            }
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    pub fn list_auto_approve_rules(&self) -> Vec<AutoApproveRule> {
        self.evict_expired_rules(Utc::now());
        self.autoapprove.list()
    }

    pub fn check_trusted_signer(
        &self,
        sender: &SenderInfo,
        repo_name: &str,
        changed_files: &[String],
    ) -> bool {
        self.config
            .trusted_signers
            .iter()
            .any(|policy| policy.matches(sender, repo_name, changed_files))
    }

    /// Removes `id` from the pending table and, if a blocked waiter is
    /// attached, signals it — removal and signal happen while the same
    /// lock guard is held, so a concurrent expiry and a concurrent
    /// approval can never both believe they won.
    fn finalize(&self, id: RequestId, resolution: Resolution) -> Result<Request, Error> {
        let mut pending = self.pending.lock().unwrap();
        let Some(entry) = pending.remove(&id) else {
            return Err(Error::NotFound(id.to_string()));
        };
        if let Some(tx) = entry.completion {
            let outcome = match resolution {
                Resolution::Approved => Outcome::Approved,
                Resolution::Denied => Outcome::Denied,
                Resolution::Expired => Outcome::Expired,
                Resolution::Cancelled => Outcome::Cancelled,
                Resolution::AutoApproved => {
                    unreachable!("auto-approved requests never enter the pending table")
                }
            };
            let _ = tx.send(outcome);
        }
        drop(pending);
        Ok(entry.request)
    }

    fn evict_expired_rules(&self, now: DateTime<Utc>) {
        for rule in self.autoapprove.evict_expired(now) {
            self.observers.dispatch(Event::AutoApproveRuleRemoved(rule.id));
        }
    }

    fn push_history(
        &self,
        request: Request,
        resolution: Resolution,
        resolved_at: DateTime<Utc>,
        gpg_exit_code: Option<i32>,
    ) {
        self.history.lock().unwrap().push(HistoryEntry {
            request,
            resolution,
            resolved_at,
            gpg_exit_code,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn build_request(
        &self,
        request_type: RequestType,
        client: String,
        items: Vec<ItemDescriptor>,
        search_attributes: BTreeMap<String, String>,
        gpg_sign_info: Option<GpgSignInfo>,
        session: String,
        sender: SenderInfo,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Request {
        Request {
            id: RequestId::new(),
            request_type,
            client,
            items,
            search_attributes,
            gpg_sign_info,
            session,
            sender,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sd_types::RequestType;
    use std::collections::BTreeMap;

    fn sender(unit: &str) -> SenderInfo {
        SenderInfo {
            unit_name: unit.to_string(),
            unique_name: format!(":1.{unit}"),
            pid: Some(42),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn prompt_then_approve_resolves_ok_and_records_history() {
        let manager = ApprovalManager::new(ManagerConfig::default());
        let manager2 = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            manager2
                .require_approval(
                    CancellationToken::new(),
                    "client".into(),
                    vec![ItemDescriptor {
                        path: "/a/b".into(),
                        ..Default::default()
                    }],
                    "session".into(),
                    RequestType::GetSecret,
                    BTreeMap::new(),
                    sender("app"),
                )
                .await
        });

        tokio::task::yield_now().await;
        let pending = manager.list();
        assert_eq!(pending.len(), 1);
        manager.approve(pending[0].id).unwrap();

        let result = handle.await.unwrap();
        assert!(result.is_ok());
        let history = manager.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].resolution, Resolution::Approved);
    }

    #[tokio::test]
    async fn timeout_resolves_expired() {
        let mut config = ManagerConfig::default();
        config.request_timeout = Duration::from_millis(20);
        let manager = ApprovalManager::new(config);

        let result = manager
            .require_approval(
                CancellationToken::new(),
                "client".into(),
                vec![ItemDescriptor {
                    path: "/a/b".into(),
                    ..Default::default()
                }],
                "session".into(),
                RequestType::GetSecret,
                BTreeMap::new(),
                sender("app"),
            )
            .await;

        assert!(matches!(result, Err(Error::Expired { .. })));
        let history = manager.history();
        assert_eq!(history[0].resolution, Resolution::Expired);
    }

    #[tokio::test]
    async fn cancel_token_resolves_cancelled_and_enables_auto_approve() {
        let manager = ApprovalManager::new(ManagerConfig::default());
        let token = CancellationToken::new();
        let manager2 = Arc::clone(&manager);
        let token2 = token.clone();
        let handle = tokio::spawn(async move {
            manager2
                .require_approval(
                    token2,
                    "client".into(),
                    vec![ItemDescriptor {
                        path: "/a/b".into(),
                        ..Default::default()
                    }],
                    "session".into(),
                    RequestType::GetSecret,
                    BTreeMap::new(),
                    sender("app"),
                )
                .await
        });

        tokio::task::yield_now().await;
        token.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled { .. })));

        let entry = manager.history().into_iter().next().unwrap();
        assert_eq!(entry.resolution, Resolution::Cancelled);
        let input = AutoApproveRuleInput::from_request(&entry.request).unwrap();
        manager.add_auto_approve_rule(input);
        assert_eq!(manager.list_auto_approve_rules().len(), 1);
    }

    #[tokio::test]
    async fn double_approve_returns_not_found() {
        let manager = ApprovalManager::new(ManagerConfig::default());
        let manager2 = Arc::clone(&manager);
        let handle = tokio::spawn(async move {
            manager2
                .require_approval(
                    CancellationToken::new(),
                    "client".into(),
                    vec![ItemDescriptor {
                        path: "/a/b".into(),
                        ..Default::default()
                    }],
                    "session".into(),
                    RequestType::GetSecret,
                    BTreeMap::new(),
                    sender("app"),
                )
                .await
        });

        tokio::task::yield_now().await;
        let id = manager.list()[0].id;
        manager.approve(id).unwrap();
        assert!(matches!(manager.deny(id), Err(Error::NotFound(_))));
        handle.await.unwrap().unwrap();
    }

    struct RecordingObserver {
        events: Arc<Mutex<Vec<Event>>>,
    }

    #[async_trait::async_trait]
    impl Observer for RecordingObserver {
        async fn on_event(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn approval_cache_hit_emits_no_events_and_no_history() {
        let manager = ApprovalManager::new(ManagerConfig::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        manager.subscribe(Arc::new(RecordingObserver {
            events: Arc::clone(&events),
        }));

        let item = ItemDescriptor {
            path: "/a/b".into(),
            ..Default::default()
        };

        let manager2 = Arc::clone(&manager);
        let item2 = item.clone();
        let handle = tokio::spawn(async move {
            manager2
                .require_approval(
                    CancellationToken::new(),
                    "client".into(),
                    vec![item2],
                    "session".into(),
                    RequestType::GetSecret,
                    BTreeMap::new(),
                    sender("app"),
                )
                .await
        });
        tokio::task::yield_now().await;
        manager.approve(manager.list()[0].id).unwrap();
        handle.await.unwrap().unwrap();

        tokio::task::yield_now().await;
        events.lock().unwrap().clear();

        let result = manager
            .require_approval(
                CancellationToken::new(),
                "client".into(),
                vec![item],
                "session".into(),
                RequestType::GetSecret,
                BTreeMap::new(),
                sender("app"),
            )
            .await;

        assert!(result.is_ok());
        tokio::task::yield_now().await;
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(manager.history().len(), 1, "cache hit must not add history");
    }

    #[tokio::test]
    async fn trusted_signer_bypass_records_approved_with_signature_and_no_pending() {
        let sender = SenderInfo {
            exe_path: Some("/usr/bin/git".into()),
            ..Default::default()
        };
        let mut config = ManagerConfig::default();
        config.trusted_signers.push(TrustedSignerPolicy {
            exe_path: Some("/usr/bin/git".into()),
            repo_path: None,
            file_prefix: None,
        });
        let manager = ApprovalManager::new(config);
        assert!(manager.check_trusted_signer(&sender, "repo", &[]));

        let id = manager.record_auto_approved_gpg_sign(
            "git".into(),
            sample_gpg_info(),
            sender,
            b"sig-bytes".to_vec(),
            b"[GNUPG:] GOOD".to_vec(),
        );

        assert!(manager.get_pending(id).is_none());
        let entry = manager.get_history_entry(id).unwrap();
        assert_eq!(entry.resolution, Resolution::Approved);
        assert_eq!(entry.gpg_exit_code, Some(0));
    }

    #[tokio::test]
    async fn approve_gpg_failed_resolves_approved_with_nonzero_exit_and_empty_signature() {
        let manager = ApprovalManager::new(ManagerConfig::default());
        let id = manager.create_gpg_sign_request("git".into(), sample_gpg_info(), sender("app"));

        manager
            .approve_gpg_failed(id, b"[GNUPG:] ERROR".to_vec(), 2)
            .unwrap();

        let entry = manager.get_history_entry(id).unwrap();
        assert_eq!(entry.resolution, Resolution::Approved);
        assert_eq!(entry.gpg_exit_code, Some(2));
    }

    fn sample_gpg_info() -> GpgSignInfo {
        GpgSignInfo {
            repo_name: "repo".into(),
            commit_msg: "msg".into(),
            author: "a".into(),
            committer: "c".into(),
            key_id: "ABCDEF".into(),
            fingerprint: None,
            changed_files: Vec::new(),
            parent_hash: None,
            commit_object: b"tree deadbeef\n".to_vec(),
        }
    }

    #[test]
    fn auto_approve_rule_dedup_returns_same_id() {
        let manager = ApprovalManager::new(ManagerConfig::default());
        let input = AutoApproveRuleInput {
            invoker_name: "app".into(),
            request_type: RequestType::GetSecret,
            collection: "login".into(),
            attributes: BTreeMap::new(),
        };
        let first = manager.add_auto_approve_rule(input.clone());
        let second = manager.add_auto_approve_rule(input);
        assert_eq!(first.id, second.id);
    }
}
