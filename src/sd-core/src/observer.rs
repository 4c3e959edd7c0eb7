// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use sd_types::Event;
use tokio::sync::mpsc;

/// A sink for manager events.
///
/// Implementations must not assume they are called from any particular
/// task or thread, and must tolerate being dropped mid-delivery (the
/// registry simply stops polling their queue).
#[async_trait::async_trait]
pub trait Observer: Send + Sync {
    async fn on_event(&self, event: Event);
}

/// Handle returned by [`ObserverRegistry::subscribe`]. Dropping it does
/// *not* unsubscribe — call [`ObserverRegistry::unsubscribe`] explicitly,
/// mirroring the manager's own `Subscribe`/`Unsubscribe` pair in spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverHandle(u64);

/// Fan-out of manager events to registered observers.
///
/// Delivery is fire-and-forget: [`ObserverRegistry::dispatch`] never
/// blocks on a slow observer. Each observer gets its own bounded queue and
/// a dedicated task draining it, so one observer never sees two events
/// concurrently (serialized per-observer) and a full queue drops the
/// newest event rather than applying back-pressure to the manager.
pub struct ObserverRegistry {
    next_id: AtomicU64,
    queue_capacity: usize,
    senders: Mutex<HashMap<u64, mpsc::Sender<Event>>>,
}

impl ObserverRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            queue_capacity,
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn Observer>) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Event>(self.queue_capacity);
        self.senders.lock().unwrap().insert(id, tx);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let delivery = AssertUnwindSafe(observer.on_event(event)).catch_unwind();
                if delivery.await.is_err() {
                    tracing::error!("observer panicked while handling event; continuing");
                }
            }
        });

        ObserverHandle(id)
    }

    pub fn unsubscribe(&self, handle: ObserverHandle) {
        self.senders.lock().unwrap().remove(&handle.0);
    }

    /// Deliver `event` to every currently-registered observer, dropping it
    /// for any observer whose queue is full.
    pub fn dispatch(&self, event: Event) {
        let senders = self.senders.lock().unwrap();
        for tx in senders.values() {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                tracing::warn!("observer queue full, dropping event");
            }
        }
    }
}
