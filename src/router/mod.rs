// # Event Router (§4.E)
//
// The correctness centre: given a committed mutation's (before, after)
// row pairs, diffs each subscription's stored `relevantIds` against the
// combined filter's verdict on `after`, and emits exactly one of
// `added`/`changed`/`removed`/no-event per pair. Delivery tries a local
// handler first, falling back to the pub/sub substrate — the same
// local-then-broadcast shape as the teacher's `SubscriptionManager`
// fan-out, generalized from a single outgoing broadcast channel to
// per-subscription bounded mpsc queues plus a shared publish fallback.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::kv::KvStore;
use crate::subscription::SubscriptionRegistry;
use crate::value::Record;

/// One mutated row as the router sees it; either side may be absent for a
/// pure create/delete (§4.E). `changelog_seq` is the originating
/// changelog entry's `seq`, threaded through so the SSE layer can set it
/// as the event's wire id — the value a client's `Last-Event-ID` reconnect
/// header should echo back as `resumeFrom` (§6 "resumeFrom/Last-Event-ID").
#[derive(Debug, Clone)]
pub struct ChangePair {
    pub object_id: String,
    pub before: Option<Record>,
    pub after: Option<Record>,
    pub changelog_seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RoutedEvent {
    /// Connection-establishment event carrying the changelog `seq` a
    /// reconnect should resume from (§4.H step 1, §6 SSE event taxonomy).
    Connected { seq: u64 },
    /// One row from the initial snapshot query (§4.D, §4.H step 4).
    Existing { object_id: String, data: Record },
    Added { object_id: String, data: Record },
    Changed { object_id: String, data: Record },
    Removed { object_id: String },
    Invalidate { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub subscription_id: Uuid,
    /// Per-subscription monotonic sequence, independent of changelog `seq` (§4.E.4).
    pub seq: u64,
    pub event_id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event: RoutedEvent,
    /// The originating changelog entry's `seq`, present only for events
    /// derived from a mutation diff. The SSE layer uses this (falling back
    /// to `event_id`) as the wire event id so `Last-Event-ID` round-trips
    /// into a usable `resumeFrom` (§6).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changelog_seq: Option<u64>,
}

/// Bounded delivery queue for one subscription's local handler (§4.H
/// backpressure surface lives downstream of this channel).
pub struct Handler {
    pub sender: mpsc::Sender<Envelope>,
}

pub struct EventRouter {
    registry: Arc<SubscriptionRegistry>,
    kv: Arc<dyn KvStore>,
    handlers: DashMap<Uuid, Handler>,
    per_subscription_seq: DashMap<Uuid, AtomicU64>,
    /// Outstanding serialized bytes queued in each subscription's local
    /// delivery channel but not yet drained by its SSE loop — the "queued
    /// bytes" the §4.H backpressure check compares against `maxQueueBytes`.
    outstanding_bytes: DashMap<Uuid, AtomicUsize>,
}

impl EventRouter {
    pub fn new(registry: Arc<SubscriptionRegistry>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            registry,
            kv,
            handlers: DashMap::new(),
            per_subscription_seq: DashMap::new(),
            outstanding_bytes: DashMap::new(),
        }
    }

    pub fn register_handler(&self, subscription_id: Uuid, sender: mpsc::Sender<Envelope>) {
        self.handlers.insert(subscription_id, Handler { sender });
    }

    pub fn unregister_handler(&self, subscription_id: &Uuid) {
        self.handlers.remove(subscription_id);
        self.outstanding_bytes.remove(subscription_id);
    }

    /// Current outstanding queue depth in bytes for `subscription_id` (§4.H
    /// backpressure).
    pub fn outstanding_bytes(&self, subscription_id: &Uuid) -> usize {
        self.outstanding_bytes
            .get(subscription_id)
            .map(|counter| counter.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Called by the SSE loop once it has drained and processed an envelope,
    /// releasing its share of the queue-depth counter.
    pub fn note_drained(&self, subscription_id: Uuid, bytes: usize) {
        if let Some(counter) = self.outstanding_bytes.get(&subscription_id) {
            let mut current = counter.load(Ordering::SeqCst);
            loop {
                let updated = current.saturating_sub(bytes);
                match counter.compare_exchange(current, updated, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }
        }
    }

    fn next_seq(&self, subscription_id: Uuid) -> u64 {
        self.per_subscription_seq
            .entry(subscription_id)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// Routes one mutation's changed rows to every subscription on
    /// `resource` (§4.E steps 1-5).
    pub async fn route(&self, resource: &str, pairs: &[ChangePair]) {
        let subscription_ids = self.registry.for_resource(resource);
        for subscription_id in subscription_ids {
            self.route_to_subscription(subscription_id, pairs).await;
        }
    }

    /// Emits `invalidate` to every subscription on `resource`, used for the
    /// raw-SQL sentinel fallback and sequence-gap recovery (§4.B, §4.F).
    pub async fn invalidate_resource(&self, resource: &str, reason: &str) {
        for subscription_id in self.registry.for_resource(resource) {
            self.deliver(subscription_id, RoutedEvent::Invalidate { reason: reason.to_string() })
                .await;
        }
    }

    async fn route_to_subscription(&self, subscription_id: Uuid, pairs: &[ChangePair]) {
        let Some(record) = self.registry.get(&subscription_id) else {
            return;
        };
        if record.is_expired(chrono::Utc::now()) {
            drop(record);
            self.deliver(subscription_id, RoutedEvent::Invalidate { reason: "auth expired".to_string() })
                .await;
            return;
        }
        let combined = crate::filter::combine(record.filter.clone(), record.scope_filter.clone());
        drop(record);

        for pair in pairs {
            let was_relevant = self.registry.is_member(&subscription_id, &pair.object_id);
            let is_relevant = pair
                .after
                .as_ref()
                .map(|after| combined.evaluate(after))
                .unwrap_or(false);

            let event = match (was_relevant, is_relevant) {
                (false, true) => {
                    self.registry.add_member(&subscription_id, pair.object_id.clone());
                    Some(RoutedEvent::Added {
                        object_id: pair.object_id.clone(),
                        data: pair.after.clone().unwrap_or_default(),
                    })
                }
                (true, true) => Some(RoutedEvent::Changed {
                    object_id: pair.object_id.clone(),
                    data: pair.after.clone().unwrap_or_default(),
                }),
                (true, false) => {
                    self.registry.remove_member(&subscription_id, &pair.object_id);
                    Some(RoutedEvent::Removed { object_id: pair.object_id.clone() })
                }
                (false, false) => None,
            };

            if let Some(event) = event {
                self.deliver_with_seq(subscription_id, event, pair.changelog_seq).await;
            }
        }
    }

    /// Replays already-committed changelog entries to one reconnecting
    /// subscription (§4.H step 2), going through the same added/changed/
    /// removed diffing as a live mutation so `relevantIds` stays correct.
    /// A raw-SQL sentinel entry (`objectId == "*"`) short-circuits to a
    /// single `invalidate` for this subscription (§4.F "Raw-SQL catch").
    pub async fn replay_to_subscription(&self, subscription_id: Uuid, entries: &[crate::changelog::ChangelogEntry]) {
        for entry in entries {
            if entry.object_id == crate::changelog::SENTINEL_OBJECT_ID {
                self.deliver(subscription_id, RoutedEvent::Invalidate { reason: "raw SQL mutation".to_string() })
                    .await;
                continue;
            }
            let pair = ChangePair {
                object_id: entry.object_id.clone(),
                before: entry.before.clone(),
                after: entry.after.clone(),
                changelog_seq: Some(entry.seq),
            };
            self.route_to_subscription(subscription_id, std::slice::from_ref(&pair)).await;
        }
    }

    /// Emits a connection-lifecycle event (`connected`/`existing`) that
    /// isn't derived from a mutation diff, reusing the same envelope/
    /// delivery machinery (§4.H steps 1 and 4).
    pub async fn emit(&self, subscription_id: Uuid, event: RoutedEvent) {
        self.deliver(subscription_id, event).await;
    }

    /// Local-first, pub/sub-fallback delivery (§4.E.5).
    async fn deliver(&self, subscription_id: Uuid, event: RoutedEvent) {
        self.deliver_with_seq(subscription_id, event, None).await;
    }

    async fn deliver_with_seq(&self, subscription_id: Uuid, event: RoutedEvent, changelog_seq: Option<u64>) {
        let envelope = Envelope {
            subscription_id,
            seq: self.next_seq(subscription_id),
            event_id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event,
            changelog_seq,
        };

        let bytes = serde_json::to_vec(&envelope).map(|v| v.len()).unwrap_or(0);
        let delivered_locally = if let Some(handler) = self.handlers.get(&subscription_id) {
            handler.sender.try_send(envelope.clone()).is_ok()
        } else {
            false
        };

        if delivered_locally {
            self.outstanding_bytes
                .entry(subscription_id)
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(bytes, Ordering::SeqCst);
        } else {
            let channel = format!("livequery.subscription.{subscription_id}");
            if let Ok(payload) = serde_json::to_vec(&envelope) {
                let _ = self.kv.publish(&channel, &payload).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterNode;
    use crate::kv::InMemoryKvStore;
    use crate::subscription::{HandlerLocation, SubscriptionRecord};
    use std::collections::HashSet;

    fn setup() -> (Arc<SubscriptionRegistry>, Arc<dyn KvStore>, Uuid) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let id = registry.insert(SubscriptionRecord {
            id: Uuid::new_v4(),
            resource: "widgets".to_string(),
            filter: Arc::new(FilterNode::True),
            scope_filter: None,
            handler_location: HandlerLocation::Local,
            created_at: chrono::Utc::now(),
            last_seq: 0,
            relevant_ids: HashSet::new(),
            expires_at: None,
        });
        (registry, kv, id)
    }

    fn pair(id: &str, after: Option<Record>) -> ChangePair {
        ChangePair { object_id: id.to_string(), before: None, after, changelog_seq: None }
    }

    #[tokio::test]
    async fn emits_added_for_newly_relevant_row() {
        let (registry, kv, sub_id) = setup();
        let router = EventRouter::new(registry.clone(), kv);
        let (tx, mut rx) = mpsc::channel(16);
        router.register_handler(sub_id, tx);

        router.route("widgets", &[pair("row-1", Some(Record::new()))]).await;

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope.event, RoutedEvent::Added { .. }));
        assert!(registry.is_member(&sub_id, "row-1"));
    }

    #[tokio::test]
    async fn emits_changed_when_already_relevant() {
        let (registry, kv, sub_id) = setup();
        registry.add_member(&sub_id, "row-1".to_string());
        let router = EventRouter::new(registry.clone(), kv);
        let (tx, mut rx) = mpsc::channel(16);
        router.register_handler(sub_id, tx);

        router.route("widgets", &[pair("row-1", Some(Record::new()))]).await;

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope.event, RoutedEvent::Changed { .. }));
    }

    #[tokio::test]
    async fn emits_removed_when_no_longer_relevant() {
        let (registry, kv, sub_id) = setup();
        registry.add_member(&sub_id, "row-1".to_string());
        let router = EventRouter::new(registry.clone(), kv);
        let (tx, mut rx) = mpsc::channel(16);
        router.register_handler(sub_id, tx);

        router.route("widgets", &[pair("row-1", None)]).await;

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(envelope.event, RoutedEvent::Removed { .. }));
        assert!(!registry.is_member(&sub_id, "row-1"));
    }

    #[tokio::test]
    async fn no_event_when_never_relevant() {
        let (registry, kv, sub_id) = setup();
        let router = EventRouter::new(registry.clone(), kv);
        let (tx, mut rx) = mpsc::channel(16);
        router.register_handler(sub_id, tx);

        router.route("widgets", &[pair("row-1", None)]).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_subscription_sequence_is_strictly_increasing() {
        let (registry, kv, sub_id) = setup();
        let router = EventRouter::new(registry.clone(), kv);
        let (tx, mut rx) = mpsc::channel(16);
        router.register_handler(sub_id, tx);

        router
            .route(
                "widgets",
                &[pair("row-1", Some(Record::new())), pair("row-2", Some(Record::new()))],
            )
            .await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn outstanding_bytes_tracks_enqueue_and_drain() {
        let (registry, kv, sub_id) = setup();
        let router = EventRouter::new(registry.clone(), kv);
        let (tx, mut rx) = mpsc::channel(16);
        router.register_handler(sub_id, tx);

        assert_eq!(router.outstanding_bytes(&sub_id), 0);
        router.route("widgets", &[pair("row-1", Some(Record::new()))]).await;
        assert!(router.outstanding_bytes(&sub_id) > 0);

        let envelope = rx.recv().await.unwrap();
        let bytes = serde_json::to_vec(&envelope).unwrap().len();
        router.note_drained(sub_id, bytes);
        assert_eq!(router.outstanding_bytes(&sub_id), 0);
    }

    #[tokio::test]
    async fn unregister_handler_clears_outstanding_bytes() {
        let (registry, kv, sub_id) = setup();
        let router = EventRouter::new(registry.clone(), kv);
        let (tx, _rx) = mpsc::channel(16);
        router.register_handler(sub_id, tx);

        router.route("widgets", &[pair("row-1", Some(Record::new()))]).await;
        assert!(router.outstanding_bytes(&sub_id) > 0);
        router.unregister_handler(&sub_id);
        assert_eq!(router.outstanding_bytes(&sub_id), 0);
    }
}
