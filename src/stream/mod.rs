// # Resumable Stream Manager (§4.H)
//
// Accepts SSE connections with optional resume state (`resumeFrom`),
// `skipExisting`, and `knownIds`, seeds or replays `relevantIds` through
// the Event Router, and owns the per-connection caps the spec assigns it
// (heartbeat cadence, backpressure threshold, per-user/per-IP concurrent
// subscription limits). Connection I/O itself (the actual SSE response
// stream, heartbeat timer loop) lives in `src/api` — this module is the
// connect/resume/disconnect state machine the API layer drives.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::changelog::Changelog;
use crate::config::EngineConfig;
use crate::db::{Database, SelectOptions};
use crate::error::{EngineError, Result};
use crate::filter::FilterNode;
use crate::router::{Envelope, EventRouter, RoutedEvent};
use crate::subscription::{HandlerLocation, SubscriptionRecord, SubscriptionRegistry};

/// Caller-supplied connection parameters (§6 `GET /{resource}/subscribe`).
pub struct ConnectRequest {
    pub resource: String,
    pub pk_field: String,
    pub filter: Arc<FilterNode>,
    pub scope_filter: Option<Arc<FilterNode>>,
    pub resume_from: Option<u64>,
    pub skip_existing: bool,
    pub known_ids: Option<HashSet<String>>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Identity keys for the per-user/per-IP concurrency caps (§4.H
    /// "Caps per-user and per-IP limit concurrent subscriptions").
    pub user_key: Option<String>,
    pub ip_key: Option<String>,
}

pub struct Connection {
    pub subscription_id: Uuid,
    pub receiver: mpsc::Receiver<Envelope>,
}

pub struct ResumableStreamManager {
    registry: Arc<SubscriptionRegistry>,
    router: Arc<EventRouter>,
    changelog: Arc<Changelog>,
    db: Arc<dyn Database>,
    config: Arc<EngineConfig>,
    user_counts: DashMap<String, usize>,
    ip_counts: DashMap<String, usize>,
    /// `subscription_id -> (user_key, ip_key)` so `disconnect` can release
    /// the caps claimed at connect time without the caller re-supplying them.
    claims: DashMap<Uuid, (Option<String>, Option<String>)>,
}

impl ResumableStreamManager {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        router: Arc<EventRouter>,
        changelog: Arc<Changelog>,
        db: Arc<dyn Database>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            registry,
            router,
            changelog,
            db,
            config,
            user_counts: DashMap::new(),
            ip_counts: DashMap::new(),
            claims: DashMap::new(),
        }
    }

    fn reserve_caps(&self, user_key: &Option<String>, ip_key: &Option<String>) -> Result<()> {
        if let Some(key) = user_key {
            let count = *self.user_counts.get(key).as_deref().unwrap_or(&0);
            if count >= self.config.max_subscriptions_per_user {
                return Err(EngineError::RateLimited(format!(
                    "user '{key}' has reached the concurrent subscription limit"
                )));
            }
        }
        if let Some(key) = ip_key {
            let count = *self.ip_counts.get(key).as_deref().unwrap_or(&0);
            if count >= self.config.max_subscriptions_per_ip {
                return Err(EngineError::RateLimited(format!(
                    "ip '{key}' has reached the concurrent subscription limit"
                )));
            }
        }
        if let Some(key) = user_key {
            *self.user_counts.entry(key.clone()).or_insert(0) += 1;
        }
        if let Some(key) = ip_key {
            *self.ip_counts.entry(key.clone()).or_insert(0) += 1;
        }
        Ok(())
    }

    fn release_caps(&self, user_key: &Option<String>, ip_key: &Option<String>) {
        if let Some(key) = user_key {
            if let Some(mut count) = self.user_counts.get_mut(key) {
                *count = count.saturating_sub(1);
            }
        }
        if let Some(key) = ip_key {
            if let Some(mut count) = self.ip_counts.get_mut(key) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Runs the connect algorithm of §4.H and returns the new subscription's
    /// id plus the receiver end of its local delivery channel.
    pub async fn connect(&self, req: ConnectRequest) -> Result<Connection> {
        self.reserve_caps(&req.user_key, &req.ip_key)?;

        let subscription_id = Uuid::new_v4();
        let current_seq = self.changelog.current_seq();

        let record = SubscriptionRecord {
            id: subscription_id,
            resource: req.resource.clone(),
            filter: req.filter.clone(),
            scope_filter: req.scope_filter.clone(),
            handler_location: HandlerLocation::Local,
            created_at: chrono::Utc::now(),
            last_seq: current_seq,
            relevant_ids: HashSet::new(),
            expires_at: req.expires_at,
        };
        self.registry.insert(record);
        self.claims.insert(subscription_id, (req.user_key.clone(), req.ip_key.clone()));

        let (tx, rx) = mpsc::channel(1024);
        self.router.register_handler(subscription_id, tx);

        // Step 1: connected.
        self.router.emit(subscription_id, RoutedEvent::Connected { seq: current_seq }).await;

        let combined = crate::filter::combine(req.filter.clone(), req.scope_filter.clone());

        if let Some(since) = req.resume_from {
            // Step 2: resume.
            if self.changelog.needs_invalidation(since) {
                self.router
                    .emit(subscription_id, RoutedEvent::Invalidate { reason: "sequence gap".to_string() })
                    .await;
            } else {
                self.seed_relevant_ids(subscription_id, &req, &combined).await?;
                let entries = self.changelog.range_for_resource(&req.resource, since);
                self.router.replay_to_subscription(subscription_id, &entries).await;
            }
        } else if req.skip_existing {
            // Step 3: skip-existing — populate silently.
            self.seed_relevant_ids(subscription_id, &req, &combined).await?;
        } else {
            // Step 4: full snapshot, emitting `existing` per row.
            let rows = self.db.select(&req.resource, &combined, &SelectOptions::default()).await?;
            for row in rows {
                let id = row.get(&req.pk_field).map(|v| v.as_normalized_string()).unwrap_or_default();
                self.registry.add_member(&subscription_id, id.clone());
                self.router.emit(subscription_id, RoutedEvent::Existing { object_id: id, data: row }).await;
            }
        }

        Ok(Connection { subscription_id, receiver: rx })
    }

    /// Populates `relevantIds` from `knownIds` if the client supplied them,
    /// else falls back to a DB query for the matching set (§4.D, §4.H
    /// steps 2-3).
    async fn seed_relevant_ids(&self, subscription_id: Uuid, req: &ConnectRequest, combined: &FilterNode) -> Result<()> {
        if let Some(known) = &req.known_ids {
            for id in known {
                self.registry.add_member(&subscription_id, id.clone());
            }
            return Ok(());
        }
        let rows = self.db.select(&req.resource, combined, &SelectOptions::default()).await?;
        for row in rows {
            let id = row.get(&req.pk_field).map(|v| v.as_normalized_string()).unwrap_or_default();
            self.registry.add_member(&subscription_id, id);
        }
        Ok(())
    }

    /// Heartbeat cadence (§4.H "A heartbeat comment is written every
    /// `heartbeatMs`"); the API layer's SSE loop reads this once at connect.
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.heartbeat_ms)
    }

    /// Releases `bytes` from the router's per-subscription outstanding-queue
    /// counter once the SSE loop has drained and processed an envelope.
    pub fn note_drained(&self, subscription_id: Uuid, bytes: usize) {
        self.router.note_drained(subscription_id, bytes);
    }

    /// Backpressure check (§4.H): if this connection's outstanding queued
    /// byte count — tracked by the router across every envelope enqueued to
    /// its local handler minus what's since been drained — exceeds the
    /// configured threshold, the subscription is invalidated and torn down.
    pub async fn check_backpressure(&self, subscription_id: Uuid) {
        let queued_bytes = self.router.outstanding_bytes(&subscription_id);
        if queued_bytes > self.config.max_queue_bytes {
            self.router
                .emit(subscription_id, RoutedEvent::Invalidate { reason: "backpressure".to_string() })
                .await;
            self.disconnect(&subscription_id);
        }
    }

    /// Tears down a subscription on client disconnect, expiry, or
    /// backpressure (§5 Cancellation): unregisters the handler, deletes the
    /// subscription record and its `relevantIds`, releases the per-user/IP
    /// claim.
    pub fn disconnect(&self, subscription_id: &Uuid) {
        self.router.unregister_handler(subscription_id);
        self.registry.remove(subscription_id);
        if let Some((_, claim)) = self.claims.remove(subscription_id) {
            self.release_caps(&claim.0, &claim.1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::{ChangeKind, PendingEntry};
    use crate::db::InMemoryDb;
    use crate::kv::InMemoryKvStore;
    use crate::value::{Record, Value};

    fn row(id: &str, value: f64) -> Record {
        let mut r = Record::new();
        r.insert("id".to_string(), Value::String(id.to_string()));
        r.insert("value".to_string(), Value::Number(value));
        r
    }

    fn manager() -> (ResumableStreamManager, Arc<SubscriptionRegistry>, Arc<Changelog>, Arc<InMemoryDb>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let changelog = Arc::new(Changelog::new(100));
        let kv: Arc<dyn crate::kv::KvStore> = Arc::new(InMemoryKvStore::new());
        let router = Arc::new(EventRouter::new(registry.clone(), kv));
        let db = Arc::new(InMemoryDb::new());
        let config = Arc::new(EngineConfig::default());
        let manager = ResumableStreamManager::new(registry.clone(), router, changelog.clone(), db.clone(), config);
        (manager, registry, changelog, db)
    }

    fn req(resume_from: Option<u64>, skip_existing: bool) -> ConnectRequest {
        ConnectRequest {
            resource: "widgets".to_string(),
            pk_field: "id".to_string(),
            filter: Arc::new(FilterNode::True),
            scope_filter: None,
            resume_from,
            skip_existing,
            known_ids: None,
            expires_at: None,
            user_key: None,
            ip_key: None,
        }
    }

    #[tokio::test]
    async fn full_snapshot_emits_existing_and_connected() {
        let (manager, registry, _changelog, db) = manager();
        db.seed("widgets", "id", row("a", 1.0));
        let mut conn = manager.connect(req(None, false)).await.unwrap();

        let connected = conn.receiver.recv().await.unwrap();
        assert!(matches!(connected.event, RoutedEvent::Connected { .. }));
        let existing = conn.receiver.recv().await.unwrap();
        assert!(matches!(existing.event, RoutedEvent::Existing { .. }));
        assert!(registry.is_member(&conn.subscription_id, "a"));
    }

    #[tokio::test]
    async fn skip_existing_seeds_silently() {
        let (manager, registry, _changelog, db) = manager();
        db.seed("widgets", "id", row("a", 1.0));
        let mut conn = manager.connect(req(None, true)).await.unwrap();

        let connected = conn.receiver.recv().await.unwrap();
        assert!(matches!(connected.event, RoutedEvent::Connected { .. }));
        assert!(conn.receiver.try_recv().is_err());
        assert!(registry.is_member(&conn.subscription_id, "a"));
    }

    #[tokio::test]
    async fn scenario_4_resume_with_gap_emits_single_invalidate() {
        let (manager, _registry, changelog, _db) = manager();
        for i in 0..10 {
            changelog.append(PendingEntry {
                resource: "widgets".to_string(),
                kind: ChangeKind::Create,
                object_id: i.to_string(),
                after: Some(row(&i.to_string(), i as f64)),
                before: None,
            });
        }
        // retention=100 here so nothing trims; force min_retained_seq check
        // by asking the manager to honor a tiny effective retention: since
        // this reference changelog has retention=100, emulate the gap by
        // resuming from before seq 1 after trimming externally instead.
        let small = Arc::new(Changelog::new(5));
        for i in 0..10 {
            small.append(PendingEntry {
                resource: "widgets".to_string(),
                kind: ChangeKind::Create,
                object_id: i.to_string(),
                after: Some(row(&i.to_string(), i as f64)),
                before: None,
            });
        }
        let registry = Arc::new(SubscriptionRegistry::new());
        let kv: Arc<dyn crate::kv::KvStore> = Arc::new(InMemoryKvStore::new());
        let router = Arc::new(EventRouter::new(registry.clone(), kv));
        let db = Arc::new(InMemoryDb::new());
        let config = Arc::new(EngineConfig::default());
        let manager = ResumableStreamManager::new(registry, router, small, db, config);

        let mut conn = manager.connect(req(Some(2), false)).await.unwrap();
        let connected = conn.receiver.recv().await.unwrap();
        assert!(matches!(connected.event, RoutedEvent::Connected { .. }));
        let gap = conn.receiver.recv().await.unwrap();
        match gap.event {
            RoutedEvent::Invalidate { reason } => assert_eq!(reason, "sequence gap"),
            other => panic!("expected Invalidate, got {other:?}"),
        }
        assert!(conn.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_user_cap_rejects_beyond_limit() {
        let (manager, _registry, _changelog, _db) = manager();
        let mut r = req(None, true);
        r.user_key = Some("user-1".to_string());
        // Drain the default cap down to zero by reserving directly.
        for _ in 0..manager.config.max_subscriptions_per_user {
            manager.reserve_caps(&Some("user-1".to_string()), &None).unwrap();
        }
        let err = manager.connect(r).await.unwrap_err();
        assert!(matches!(err, EngineError::RateLimited(_)));
    }

    #[tokio::test]
    async fn disconnect_removes_subscription_and_releases_caps() {
        let (manager, registry, _changelog, _db) = manager();
        let mut r = req(None, true);
        r.user_key = Some("user-1".to_string());
        let conn = manager.connect(r).await.unwrap();
        assert!(registry.contains(&conn.subscription_id));
        manager.disconnect(&conn.subscription_id);
        assert!(!registry.contains(&conn.subscription_id));

        let mut r2 = req(None, true);
        r2.user_key = Some("user-1".to_string());
        assert!(manager.connect(r2).await.is_ok());
    }

    #[tokio::test]
    async fn check_backpressure_invalidates_when_queue_exceeds_threshold() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let changelog = Arc::new(Changelog::new(100));
        let kv: Arc<dyn crate::kv::KvStore> = Arc::new(InMemoryKvStore::new());
        let router = Arc::new(EventRouter::new(registry.clone(), kv));
        let db = Arc::new(InMemoryDb::new());
        let mut tight_config = EngineConfig::default();
        tight_config.max_queue_bytes = 1;
        let manager = ResumableStreamManager::new(registry.clone(), router.clone(), changelog, db, Arc::new(tight_config));

        let mut conn = manager.connect(req(None, true)).await.unwrap();
        // A single queued `connected` envelope already exceeds the 1-byte cap.
        manager.check_backpressure(conn.subscription_id).await;

        let invalidate = conn.receiver.recv().await.unwrap();
        assert!(matches!(invalidate.event, RoutedEvent::Invalidate { .. }));
        assert!(!registry.contains(&conn.subscription_id));
    }

    #[tokio::test]
    async fn check_backpressure_stays_quiet_once_drained() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let changelog = Arc::new(Changelog::new(100));
        let kv: Arc<dyn crate::kv::KvStore> = Arc::new(InMemoryKvStore::new());
        let router = Arc::new(EventRouter::new(registry.clone(), kv));
        let db = Arc::new(InMemoryDb::new());
        let mut tight_config = EngineConfig::default();
        tight_config.max_queue_bytes = 1;
        let manager = ResumableStreamManager::new(registry.clone(), router, changelog, db, Arc::new(tight_config));

        let mut conn = manager.connect(req(None, true)).await.unwrap();
        let connected = conn.receiver.recv().await.unwrap();
        let bytes = serde_json::to_vec(&connected).unwrap().len();
        manager.note_drained(conn.subscription_id, bytes);
        manager.check_backpressure(conn.subscription_id).await;

        assert!(registry.contains(&conn.subscription_id));
        assert!(conn.receiver.try_recv().is_err());
    }
}
