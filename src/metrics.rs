// # Metrics counters (SPEC_FULL.md §2 supplemented feature)
//
// Process-local counters for the handful of numbers an operator would
// want on a dashboard: active subscriptions, events emitted by kind,
// changelog depth, batch operations run. No exporter is wired — that
// stays out of scope — this is just the counter state, updated with
// `AtomicU64`s the way the teacher's `websocket::metrics`/
// `cache::cache_statistics` counters are kept.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub subscriptions_active: AtomicI64,
    pub events_added: AtomicU64,
    pub events_changed: AtomicU64,
    pub events_removed: AtomicU64,
    pub events_invalidated: AtomicU64,
    pub changelog_depth: AtomicU64,
    pub batch_operations: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscription_opened(&self) {
        self.subscriptions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_closed(&self) {
        self.subscriptions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_event(&self, event: &crate::router::RoutedEvent) {
        use crate::router::RoutedEvent;
        match event {
            RoutedEvent::Added { .. } => self.events_added.fetch_add(1, Ordering::Relaxed),
            RoutedEvent::Changed { .. } => self.events_changed.fetch_add(1, Ordering::Relaxed),
            RoutedEvent::Removed { .. } => self.events_removed.fetch_add(1, Ordering::Relaxed),
            RoutedEvent::Invalidate { .. } => self.events_invalidated.fetch_add(1, Ordering::Relaxed),
            RoutedEvent::Connected { .. } | RoutedEvent::Existing { .. } => 0,
        };
    }

    pub fn set_changelog_depth(&self, depth: u64) {
        self.changelog_depth.store(depth, Ordering::Relaxed);
    }

    pub fn record_batch_operation(&self) {
        self.batch_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            subscriptions_active: self.subscriptions_active.load(Ordering::Relaxed),
            events_added: self.events_added.load(Ordering::Relaxed),
            events_changed: self.events_changed.load(Ordering::Relaxed),
            events_removed: self.events_removed.load(Ordering::Relaxed),
            events_invalidated: self.events_invalidated.load(Ordering::Relaxed),
            changelog_depth: self.changelog_depth.load(Ordering::Relaxed),
            batch_operations: self.batch_operations.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub subscriptions_active: i64,
    pub events_added: u64,
    pub events_changed: u64,
    pub events_removed: u64,
    pub events_invalidated: u64,
    pub changelog_depth: u64,
    pub batch_operations: u64,
}
