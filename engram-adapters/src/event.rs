//! Event bus adapter
//!
//! Repositories publish mutation events; the query cache and the
//! permission service subscribe. Publication back-pressures on a bounded
//! channel; subscriptions are removable guards so no handler outlives a
//! reconnect.

use async_trait::async_trait;
use dashmap::DashMap;
use engram_core::{EngramResult, EntryKind, ScopeRef, SystemError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Channel carrying entry mutation events.
pub const ENTRY_CHANGED_CHANNEL: &str = "entry:changed";

// ============================================================================
// EVENT PAYLOAD
// ============================================================================

/// Mutation kinds carried on `entry:changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
    Deactivate,
    Reactivate,
    Grant,
    Revoke,
    Resolve,
}

/// One mutation event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub entry_kind: Option<EntryKind>,
    pub entry_id: Option<Uuid>,
    pub scope: ScopeRef,
}

impl ChangeEvent {
    pub fn entry(action: ChangeAction, kind: EntryKind, id: Uuid, scope: ScopeRef) -> Self {
        Self {
            action,
            entry_kind: Some(kind),
            entry_id: Some(id),
            scope,
        }
    }

    pub fn scope_only(action: ChangeAction, scope: ScopeRef) -> Self {
        Self {
            action,
            entry_kind: None,
            entry_id: None,
            scope,
        }
    }
}

// ============================================================================
// ADAPTER TRAIT
// ============================================================================

/// Subscriber callback. Handlers must be cheap; heavy work belongs on the
/// subscriber's own tasks.
pub type EventHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Narrow interface over a publish/subscribe bus.
#[async_trait]
pub trait EventAdapter: Send + Sync {
    /// Publish onto a channel. Blocks only when the bus is saturated.
    async fn publish(&self, channel: &str, event: serde_json::Value) -> EngramResult<()>;

    /// Register a handler. Dropping the guard unsubscribes; registering
    /// the same guard twice is impossible by construction.
    fn subscribe(&self, channel: &str, handler: EventHandler) -> SubscriptionGuard;
}

/// RAII unsubscription. Holds only a weak reference so a dropped bus does
/// not keep handler state alive.
pub struct SubscriptionGuard {
    id: u64,
    registry: Weak<DashMap<u64, (String, EventHandler)>>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}

// ============================================================================
// IN-PROCESS BUS
// ============================================================================

/// Bounded in-process bus: one dispatcher task fans published events out
/// to matching handlers in registration order.
pub struct InProcessEventBus {
    tx: mpsc::Sender<(String, serde_json::Value)>,
    handlers: Arc<DashMap<u64, (String, EventHandler)>>,
    next_id: AtomicU64,
    dispatcher: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl InProcessEventBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<(String, serde_json::Value)>(capacity.max(1));
        let handlers: Arc<DashMap<u64, (String, EventHandler)>> = Arc::new(DashMap::new());

        let dispatch_handlers = Arc::clone(&handlers);
        let dispatcher = tokio::spawn(async move {
            while let Some((channel, event)) = rx.recv().await {
                // Snapshot ids first so a handler that subscribes or
                // unsubscribes mid-dispatch cannot deadlock the map.
                let mut ids: Vec<u64> = dispatch_handlers
                    .iter()
                    .filter(|e| e.value().0 == channel)
                    .map(|e| *e.key())
                    .collect();
                ids.sort_unstable();
                for id in ids {
                    let handler = dispatch_handlers
                        .get(&id)
                        .map(|e| Arc::clone(&e.value().1));
                    if let Some(handler) = handler {
                        handler(&event);
                    }
                }
            }
        });

        Arc::new(Self {
            tx,
            handlers,
            next_id: AtomicU64::new(1),
            dispatcher: std::sync::Mutex::new(Some(dispatcher)),
        })
    }

    /// Stop the dispatcher. Pending events are dropped; used by shutdown.
    pub fn shutdown(&self) {
        if let Some(handle) = self.dispatcher.lock().expect("dispatcher mutex").take() {
            handle.abort();
        }
    }

    /// Number of live subscriptions, for leak assertions in tests.
    pub fn subscription_count(&self) -> usize {
        self.handlers.len()
    }
}

#[async_trait]
impl EventAdapter for InProcessEventBus {
    async fn publish(&self, channel: &str, event: serde_json::Value) -> EngramResult<()> {
        self.tx
            .send((channel.to_string(), event))
            .await
            .map_err(|_| SystemError::ShuttingDown.into())
    }

    fn subscribe(&self, channel: &str, handler: EventHandler) -> SubscriptionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.insert(id, (channel.to_string(), handler));
        SubscriptionGuard {
            id,
            registry: Arc::downgrade(&self.handlers),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn drain(bus: &InProcessEventBus) {
        // One queue hop is enough for the dispatcher to observe events.
        for _ in 0..20 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            if bus.tx.capacity() == bus.tx.max_capacity() {
                break;
            }
        }
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn test_publish_reaches_matching_channel_only() {
        let bus = InProcessEventBus::new(16);
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let _guard = bus.subscribe(
            ENTRY_CHANGED_CHANNEL,
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.publish(ENTRY_CHANGED_CHANNEL, serde_json::json!({"n": 1}))
            .await
            .unwrap();
        bus.publish("other:channel", serde_json::json!({"n": 2}))
            .await
            .unwrap();
        drain(&bus).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_drop_unsubscribes() {
        let bus = InProcessEventBus::new(16);
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let guard = bus.subscribe(
            ENTRY_CHANGED_CHANNEL,
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(bus.subscription_count(), 1);
        drop(guard);
        assert_eq!(bus.subscription_count(), 0);

        bus.publish(ENTRY_CHANGED_CHANNEL, serde_json::json!({}))
            .await
            .unwrap();
        drain(&bus).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_change_event_serde() {
        let event = ChangeEvent::entry(
            ChangeAction::Create,
            EntryKind::Guideline,
            Uuid::now_v7(),
            ScopeRef::global(),
        );
        let value = serde_json::to_value(&event).unwrap();
        let back: ChangeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(event, back);
    }
}
