// # Subscription Registry (§4.D)
//
// Tracks, per live subscription, the exact set of record ids currently
// matching its filter (`relevantIds`) — the ground truth the event router
// diffs mutations against. Generalizes the collection-index pattern from
// a resource-to-(client,subscription) secondary index into the
// subscription store itself, for O(1) add/remove and O(S) fan-out per
// mutated resource where S = subscriptions on that resource.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::filter::FilterNode;

/// Where a subscription's events are delivered (§4.D "handlerLocation").
#[derive(Debug, Clone)]
pub enum HandlerLocation {
    /// Delivered to a local in-process SSE stream.
    Local,
    /// Delivered via the pub/sub substrate to another process (§4.D,
    /// §6 "cross-node fan-out").
    Remote { node_id: String },
}

pub struct SubscriptionRecord {
    pub id: Uuid,
    pub resource: String,
    pub filter: Arc<FilterNode>,
    pub scope_filter: Option<Arc<FilterNode>>,
    pub handler_location: HandlerLocation,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Last changelog `seq` this subscription has been advanced past (§4.D).
    pub last_seq: u64,
    /// Ground-truth membership: ids currently matching `filter ∧ scopeFilter`.
    pub relevant_ids: HashSet<String>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl SubscriptionRecord {
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }
}

/// Subscription store with a secondary resource index, the same shape as
/// the teacher's `collection_index`: `resource -> Vec<subscription id>`
/// for O(S) lookup instead of scanning every subscription on every
/// mutation.
pub struct SubscriptionRegistry {
    subscriptions: DashMap<Uuid, SubscriptionRecord>,
    resource_index: DashMap<String, Vec<Uuid>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            resource_index: DashMap::new(),
        }
    }

    pub fn insert(&self, record: SubscriptionRecord) -> Uuid {
        let id = record.id;
        let resource = record.resource.clone();
        self.subscriptions.insert(id, record);
        self.resource_index.entry(resource).or_default().push(id);
        id
    }

    pub fn remove(&self, id: &Uuid) -> Option<SubscriptionRecord> {
        let removed = self.subscriptions.remove(id).map(|(_, v)| v)?;
        if let Some(mut entries) = self.resource_index.get_mut(&removed.resource) {
            entries.retain(|existing| existing != id);
        }
        Some(removed)
    }

    /// Every subscription id registered against `resource` (§4.D fan-out lookup).
    pub fn for_resource(&self, resource: &str) -> Vec<Uuid> {
        self.resource_index
            .get(resource)
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.subscriptions.contains_key(id)
    }

    pub fn advance_seq(&self, id: &Uuid, seq: u64) {
        if let Some(mut record) = self.subscriptions.get_mut(id) {
            record.last_seq = seq;
        }
    }

    pub fn is_member(&self, id: &Uuid, object_id: &str) -> bool {
        self.subscriptions
            .get(id)
            .map(|record| record.relevant_ids.contains(object_id))
            .unwrap_or(false)
    }

    pub fn add_member(&self, id: &Uuid, object_id: String) {
        if let Some(mut record) = self.subscriptions.get_mut(id) {
            record.relevant_ids.insert(object_id);
        }
    }

    pub fn remove_member(&self, id: &Uuid, object_id: &str) {
        if let Some(mut record) = self.subscriptions.get_mut(id) {
            record.relevant_ids.remove(object_id);
        }
    }

    pub fn members(&self, id: &Uuid) -> HashSet<String> {
        self.subscriptions
            .get(id)
            .map(|record| record.relevant_ids.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &Uuid) -> Option<dashmap::mapref::one::Ref<'_, Uuid, SubscriptionRecord>> {
        self.subscriptions.get(id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Evicts all subscriptions whose `expiresAt` has passed (§4.D eviction sweep).
    pub fn evict_expired(&self, now: chrono::DateTime<chrono::Utc>) -> Vec<Uuid> {
        let expired: Vec<Uuid> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| *entry.key())
            .collect();
        for id in &expired {
            self.remove(id);
        }
        expired
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterNode;

    fn record(resource: &str) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            resource: resource.to_string(),
            filter: Arc::new(FilterNode::True),
            scope_filter: None,
            handler_location: HandlerLocation::Local,
            created_at: chrono::Utc::now(),
            last_seq: 0,
            relevant_ids: HashSet::new(),
            expires_at: None,
        }
    }

    #[test]
    fn resource_index_tracks_membership() {
        let registry = SubscriptionRegistry::new();
        let id = registry.insert(record("widgets"));
        assert_eq!(registry.for_resource("widgets"), vec![id]);
        registry.remove(&id);
        assert!(registry.for_resource("widgets").is_empty());
    }

    #[test]
    fn relevant_ids_add_and_remove() {
        let registry = SubscriptionRegistry::new();
        let id = registry.insert(record("widgets"));
        registry.add_member(&id, "row-1".to_string());
        assert!(registry.is_member(&id, "row-1"));
        registry.remove_member(&id, "row-1");
        assert!(!registry.is_member(&id, "row-1"));
    }

    #[test]
    fn for_resource_only_returns_matching_resource() {
        let registry = SubscriptionRegistry::new();
        let widgets_id = registry.insert(record("widgets"));
        registry.insert(record("gadgets"));
        let hits = registry.for_resource("widgets");
        assert_eq!(hits, vec![widgets_id]);
    }

    #[test]
    fn evict_expired_removes_past_deadline_subscriptions() {
        let registry = SubscriptionRegistry::new();
        let mut rec = record("widgets");
        rec.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
        let id = registry.insert(rec);
        let evicted = registry.evict_expired(chrono::Utc::now());
        assert_eq!(evicted, vec![id]);
        assert!(!registry.contains(&id));
    }
}
