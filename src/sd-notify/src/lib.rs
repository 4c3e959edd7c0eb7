// SPDX-License-Identifier: Apache-2.0

//! Desktop notification boundary adapter, per spec §4.7.
//!
//! Talks to `org.freedesktop.Notifications` directly over the session bus
//! rather than wrapping a notification crate, because the reconnect
//! behavior below needs direct access to the underlying `zbus::Connection`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use sd_core::{ApprovalManager, AutoApproveRuleInput, Observer};
use sd_types::{Event, Request, RequestId, RequestType};
use tokio::sync::Mutex;
use zbus::zvariant::Value;
use zbus::{proxy, Connection};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to connect to the session bus: {0}")]
    Connect(#[source] zbus::Error),
    #[error("notification call failed: {0}")]
    Call(#[source] zbus::Error),
    #[error("no active session bus connection")]
    NotConnected,
}

#[proxy(
    interface = "org.freedesktop.Notifications",
    default_service = "org.freedesktop.Notifications",
    default_path = "/org/freedesktop/Notifications"
)]
trait Notifications {
    #[zbus(name = "Notify")]
    fn notify(
        &self,
        app_name: &str,
        replaces_id: u32,
        app_icon: &str,
        summary: &str,
        body: &str,
        actions: &[&str],
        hints: HashMap<&str, Value<'_>>,
        expire_timeout: i32,
    ) -> zbus::Result<u32>;

    #[zbus(name = "CloseNotification")]
    fn close_notification(&self, id: u32) -> zbus::Result<()>;

    #[zbus(signal, name = "ActionInvoked")]
    fn action_invoked(&self, id: u32, action_key: String) -> zbus::Result<()>;

    #[zbus(signal, name = "NotificationClosed")]
    fn notification_closed(&self, id: u32, reason: u32) -> zbus::Result<()>;
}

const APP_NAME: &str = "secrets-dispatcher";
const NO_EXPIRE: i32 = 0;

/// Tracks which live notification id (if any) currently represents each
/// request, so approval/denial/expiry can close the matching popup.
struct State {
    connection: Option<Connection>,
    by_request: HashMap<RequestId, u32>,
    /// The "offer to auto-approve" follow-up shown after a cancellation,
    /// keyed by the notification id the bus assigns it so the action
    /// listener can map an `ActionInvoked` back to the originating request.
    auto_approve_offers: HashMap<u32, Request>,
}

/// Observer that renders one desktop notification per pending request and
/// reconnects transparently if the session bus connection drops.
pub struct Notifier {
    manager: Arc<ApprovalManager>,
    state: Mutex<State>,
}

impl Notifier {
    pub async fn connect(manager: Arc<ApprovalManager>) -> Result<Arc<Self>, NotifyError> {
        let connection = Connection::session().await.map_err(NotifyError::Connect)?;
        let notifier = Arc::new(Self {
            manager,
            state: Mutex::new(State {
                connection: Some(connection),
                by_request: HashMap::new(),
                auto_approve_offers: HashMap::new(),
            }),
        });
        notifier.clone().spawn_action_listener();
        Ok(notifier)
    }

    /// Spawns a task draining `ActionInvoked` signals for the lifetime of
    /// the connection. If the connection drops the task exits; a fresh one
    /// is spawned the next time [`Self::reconnect`] succeeds.
    fn spawn_action_listener(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                let connection = {
                    let state = self.state.lock().await;
                    state.connection.clone()
                };
                let Some(connection) = connection else {
                    return;
                };
                let Ok(proxy) = NotificationsProxy::new(&connection).await else {
                    return;
                };
                let Ok(mut stream) = proxy.receive_action_invoked().await else {
                    return;
                };
                while let Some(signal) = stream.next().await {
                    let args = match signal.args() {
                        Ok(args) => args,
                        Err(_) => continue,
                    };
                    self.handle_action(args.id, &args.action_key).await;
                }
                // Stream ended: connection likely dropped. Try once to
                // re-establish it before giving up on action handling.
                if self.reconnect().await.is_err() {
                    return;
                }
            }
        });
    }

    async fn handle_action(&self, id: u32, action: &str) {
        let target = {
            let mut state = self.state.lock().await;
            if let Some(request) = state.auto_approve_offers.remove(&id) {
                Some((ActionTarget::AutoApproveOffer(request), action.to_string()))
            } else if let Some(request_id) = state
                .by_request
                .iter()
                .find(|(_, nid)| **nid == id)
                .map(|(rid, _)| *rid)
            {
                Some((ActionTarget::Pending(request_id), action.to_string()))
            } else {
                None
            }
        };

        let Some((target, action)) = target else {
            return;
        };

        match target {
            ActionTarget::Pending(request_id) => match action.as_str() {
                "approve" | "default" => {
                    if let Err(err) = self.manager.approve(request_id) {
                        tracing::warn!(%request_id, error = %err, "approve via notification failed");
                    }
                }
                "deny" => {
                    if let Err(err) = self.manager.deny(request_id) {
                        tracing::warn!(%request_id, error = %err, "deny via notification failed");
                    }
                }
                _ => {}
            },
            ActionTarget::AutoApproveOffer(request) => {
                if action == "approve" {
                    if let Some(input) = AutoApproveRuleInput::from_request(&request) {
                        self.manager.add_auto_approve_rule(input);
                    }
                }
            }
        }
    }

    async fn connection(&self) -> Result<Connection, NotifyError> {
        let state = self.state.lock().await;
        state.connection.clone().ok_or(NotifyError::NotConnected)
    }

    /// Drops the stale connection and opens a fresh one. Spec §4.7: "a send
    /// that fails with a connection closed signal triggers a single
    /// reconnect attempt and one retry" — this is the reconnect half; each
    /// `try_*` caller below supplies the one retry.
    async fn reconnect(&self) -> Result<(), NotifyError> {
        let connection = Connection::session().await.map_err(NotifyError::Connect)?;
        let mut state = self.state.lock().await;
        state.connection = Some(connection);
        Ok(())
    }

    async fn try_notify(
        &self,
        summary: &str,
        body: &str,
        actions: &[&str],
    ) -> Result<u32, NotifyError> {
        let connection = self.connection().await?;
        let proxy = NotificationsProxy::new(&connection)
            .await
            .map_err(NotifyError::Call)?;
        proxy
            .notify(APP_NAME, 0, "", summary, body, actions, HashMap::new(), NO_EXPIRE)
            .await
            .map_err(NotifyError::Call)
    }

    async fn try_close(&self, id: u32) -> Result<(), NotifyError> {
        let connection = self.connection().await?;
        let proxy = NotificationsProxy::new(&connection)
            .await
            .map_err(NotifyError::Call)?;
        proxy.close_notification(id).await.map_err(NotifyError::Call)
    }

    async fn notify_pending(&self, request: &Request) {
        let (summary, body) = describe(request);
        let actions: &[&str] = &["default", "Default", "approve", "Approve", "deny", "Deny"];
        let request_id = request.id;

        let result = match self.try_notify(&summary, &body, actions).await {
            Ok(id) => Ok(id),
            Err(_) => {
                if let Err(err) = self.reconnect().await {
                    Err(err)
                } else {
                    self.try_notify(&summary, &body, actions).await
                }
            }
        };

        match result {
            Ok(id) => {
                self.state.lock().await.by_request.insert(request_id, id);
            }
            Err(err) => tracing::error!(%request_id, error = %err, "failed to show notification"),
        }
    }

    async fn close_for(&self, request_id: RequestId) {
        let id = self.state.lock().await.by_request.remove(&request_id);
        let Some(id) = id else {
            return;
        };

        let result = match self.try_close(id).await {
            Ok(()) => Ok(()),
            Err(_) => {
                if let Err(err) = self.reconnect().await {
                    Err(err)
                } else {
                    self.try_close(id).await
                }
            }
        };
        if let Err(err) = result {
            tracing::warn!(%request_id, error = %err, "failed to close notification");
        }
    }

    async fn offer_auto_approve(&self, request: Request) {
        let summary = format!("Remember this for {}?", invoker_label(&request));
        let body = format!(
            "Auto-approve future {:?} requests like this one",
            request.request_type
        );
        let actions: &[&str] = &["approve", "Remember", "deny", "No thanks"];

        let result = match self.try_notify(&summary, &body, actions).await {
            Ok(id) => Ok(id),
            Err(_) => {
                if let Err(err) = self.reconnect().await {
                    Err(err)
                } else {
                    self.try_notify(&summary, &body, actions).await
                }
            }
        };
        match result {
            Ok(id) => {
                self.state.lock().await.auto_approve_offers.insert(id, request);
            }
            Err(err) => tracing::error!(error = %err, "failed to show auto-approve offer"),
        }
    }
}

enum ActionTarget {
    Pending(RequestId),
    AutoApproveOffer(Request),
}

fn invoker_label(request: &Request) -> String {
    if request.sender.unit_name.is_empty() {
        request.client.clone()
    } else {
        request.sender.unit_name.clone()
    }
}

fn describe(request: &Request) -> (String, String) {
    let summary = match request.request_type {
        RequestType::GetSecret => format!("{} wants to read a secret", invoker_label(request)),
        RequestType::Search => format!("{} is searching the keyring", invoker_label(request)),
        RequestType::Write => format!("{} wants to write a secret", invoker_label(request)),
        RequestType::Delete => format!("{} wants to delete a secret", invoker_label(request)),
        RequestType::GpgSign => format!("{} wants to sign a commit", invoker_label(request)),
    };
    let body = request
        .items
        .first()
        .map(|item| item.path.clone())
        .unwrap_or_else(|| request.client.clone());
    (summary, body)
}

#[async_trait::async_trait]
impl Observer for Notifier {
    async fn on_event(&self, event: Event) {
        match event {
            Event::RequestCreated(request) => self.notify_pending(&request).await,
            Event::RequestApproved(payload) => self.close_for(payload.request.id).await,
            Event::RequestDenied(request) | Event::RequestExpired(request) => {
                self.close_for(request.id).await
            }
            Event::RequestAutoApproved(_) => {}
            Event::RequestCancelled(request) => {
                self.close_for(request.id).await;
                self.offer_auto_approve(request).await;
            }
            Event::AutoApproveRuleAdded(_) | Event::AutoApproveRuleRemoved(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use sd_types::{ItemDescriptor, SenderInfo};

    use super::*;

    fn sample_request(request_type: RequestType) -> Request {
        let now = chrono::Utc::now();
        Request {
            id: RequestId::new(),
            request_type,
            client: "test-client".into(),
            items: vec![ItemDescriptor {
                path: "/org/freedesktop/secrets/collection/login/1".into(),
                label: "".into(),
                attributes: Default::default(),
            }],
            search_attributes: Default::default(),
            gpg_sign_info: None,
            session: "session-1".into(),
            sender: SenderInfo::empty(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(30),
        }
    }

    #[test]
    fn describe_includes_item_path() {
        let request = sample_request(RequestType::GetSecret);
        let (summary, body) = describe(&request);
        assert!(summary.contains("wants to read a secret"));
        assert_eq!(body, "/org/freedesktop/secrets/collection/login/1");
    }

    #[test]
    fn invoker_label_falls_back_to_client() {
        let request = sample_request(RequestType::Search);
        assert_eq!(invoker_label(&request), "test-client");
    }
}
