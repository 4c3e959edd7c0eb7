// SPDX-License-Identifier: Apache-2.0

//! The WebSocket broadcaster: a `sd_core::Observer` that turns every
//! manager event into the typed [`WsMessage`] envelope and fans it out to
//! every connected UI, plus the `GET /api/v1/ws` upgrade handler itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use base64::Engine;
use sd_core::{ApprovalManager, Observer};
use sd_types::{Event, Resolution, WsMessage};
use tokio::sync::broadcast;

use crate::AppState;

/// Fans out manager events to every connected WebSocket session via a
/// broadcast channel; a lagging subscriber drops the messages it missed
/// rather than stalling the others, matching the drop-on-full discipline
/// the manager's own observer fan-out uses (spec §4.1).
pub struct WsBroadcaster {
    manager: Arc<ApprovalManager>,
    tx: broadcast::Sender<WsMessage>,
    clients: Mutex<std::collections::HashSet<String>>,
    next_client_id: AtomicU64,
}

impl WsBroadcaster {
    pub fn new(manager: Arc<ApprovalManager>, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            manager,
            tx,
            clients: Mutex::new(std::collections::HashSet::new()),
            next_client_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WsMessage> {
        self.tx.subscribe()
    }

    pub fn connected_clients(&self) -> Vec<String> {
        self.clients.lock().unwrap().iter().cloned().collect()
    }

    fn send(&self, msg: WsMessage) {
        // No subscribers is not an error: the daemon runs fine with no UI
        // attached.
        let _ = self.tx.send(msg);
    }

    fn register_client(&self) -> String {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let label = format!("ui-{id}");
        self.clients.lock().unwrap().insert(label.clone());
        self.send(WsMessage::ClientConnected {
            client: label.clone(),
        });
        label
    }

    fn unregister_client(&self, label: &str) {
        self.clients.lock().unwrap().remove(label);
        self.send(WsMessage::ClientDisconnected {
            client: label.to_string(),
        });
    }
}

#[async_trait::async_trait]
impl Observer for WsBroadcaster {
    async fn on_event(&self, event: Event) {
        match event {
            Event::RequestCreated(request) => {
                self.send(WsMessage::RequestCreated { request });
            }
            Event::RequestApproved(payload) => {
                let id = payload.request.id;
                self.send(WsMessage::RequestResolved {
                    id,
                    resolution: Resolution::Approved,
                    signature: payload
                        .signature
                        .as_deref()
                        .map(|b| base64::engine::general_purpose::STANDARD.encode(b)),
                    gpg_status: payload
                        .gpg_status
                        .as_deref()
                        .map(|b| String::from_utf8_lossy(b).into_owned()),
                    exit_code: payload.exit_code.filter(|code| *code != 0),
                });
                self.send_history_entry(id);
            }
            Event::RequestDenied(request) => {
                self.send(WsMessage::RequestResolved {
                    id: request.id,
                    resolution: Resolution::Denied,
                    signature: None,
                    gpg_status: None,
                    exit_code: None,
                });
                self.send_history_entry(request.id);
            }
            Event::RequestAutoApproved(request) => {
                self.send(WsMessage::RequestResolved {
                    id: request.id,
                    resolution: Resolution::AutoApproved,
                    signature: None,
                    gpg_status: None,
                    exit_code: None,
                });
                self.send_history_entry(request.id);
            }
            Event::RequestExpired(request) => {
                self.send(WsMessage::RequestExpired { id: request.id });
                self.send_history_entry(request.id);
            }
            Event::RequestCancelled(request) => {
                self.send(WsMessage::RequestCancelled { id: request.id });
                self.send_history_entry(request.id);
            }
            Event::AutoApproveRuleAdded(rule) => {
                self.send(WsMessage::AutoApproveRuleAdded { rule });
            }
            Event::AutoApproveRuleRemoved(id) => {
                self.send(WsMessage::AutoApproveRuleRemoved { id });
            }
        }
    }
}

impl WsBroadcaster {
    /// Per spec §4.7, the HTTP/WS boundary emits a `history_entry` message
    /// on resolution, independently of the `request_resolved`/
    /// `request_expired`/`request_cancelled` message — open question (ii)
    /// leaves the ordering between the two unsynchronized from a
    /// subscriber's point of view, so this is a second, separate send.
    fn send_history_entry(&self, id: sd_types::RequestId) {
        if let Some(entry) = self.manager.get_history_entry(id) {
            self.send(WsMessage::HistoryEntry { entry });
        }
    }
}

pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<AppState>, mut socket: WebSocket) {
    let snapshot = WsMessage::Snapshot {
        pending: state.manager.list(),
        clients: state.ws.connected_clients(),
        history: state.manager.history(),
        auto_approve_rules: state.manager.list_auto_approve_rules(),
        build: crate::build_fingerprint(),
    };
    if send_json(&mut socket, &snapshot).await.is_err() {
        return;
    }

    let client_label = state.ws.register_client();
    let mut events = state.ws.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(msg) => {
                    if send_json(&mut socket, &msg).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "ws subscriber lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // clients don't send anything we act on
                Some(Err(_)) => break,
            },
        }
    }

    state.ws.unregister_client(&client_label);
}

async fn send_json(socket: &mut WebSocket, msg: &WsMessage) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).expect("WsMessage always serializes");
    socket.send(Message::Text(text)).await
}
