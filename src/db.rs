// # DB substrate (§6 "DB substrate (consumed)")
//
// Trait boundary for the relational store the engine is specified
// against: parameterised predicates built from compiled filter trees,
// `SELECT`/`INSERT ... RETURNING`/`UPDATE ... RETURNING`/`DELETE`, and
// `BEGIN/COMMIT/ROLLBACK` transactions. `InMemoryDb` is the reference
// implementation the mutation pipeline and tests run against, grounded
// on the teacher's `storage` module's table-of-rows shape, generalized
// from its fixed column layout to schema-free `Record` rows addressed by
// a configurable primary key.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::filter::{FilterNode, SqlPredicate};
use crate::value::{Record, Value};

#[derive(Debug, Clone, Default)]
pub struct OrderBySpec {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub order_by: Vec<OrderBySpec>,
    pub limit: Option<usize>,
}

/// A DB transaction handle. Reference implementation buffers writes and
/// applies them atomically on `commit`, rolling back entirely on drop
/// without commit (§4.F "A failed write rolls back").
#[async_trait]
pub trait Transaction: Send {
    async fn select(
        &self,
        table: &str,
        predicate: &FilterNode,
        options: &SelectOptions,
    ) -> Result<Vec<Record>>;

    async fn insert(&mut self, table: &str, row: Record, pk_field: &str) -> Result<Record>;

    async fn update(
        &mut self,
        table: &str,
        predicate: &FilterNode,
        patch: &Record,
        pk_field: &str,
    ) -> Result<Vec<Record>>;

    /// Overwrites the whole matching row with `full` (§4.F `replace`, as
    /// opposed to `update`'s field-by-field merge). Fields present in the
    /// stored row but absent from `full` are dropped.
    async fn replace(&mut self, table: &str, predicate: &FilterNode, full: Record, pk_field: &str) -> Result<Vec<Record>>;

    async fn delete(&mut self, table: &str, predicate: &FilterNode, pk_field: &str) -> Result<Vec<Record>>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Non-transactional read path for list/count/aggregate/fetch endpoints.
    async fn select(
        &self,
        table: &str,
        predicate: &FilterNode,
        options: &SelectOptions,
    ) -> Result<Vec<Record>>;

    /// Compiles `predicate` to the `SqlPredicate` a real backend would bind
    /// into a prepared statement (§4.A `toSql`); exposed so callers can
    /// inspect the generated SQL without a live connection.
    fn compile_predicate(&self, predicate: &FilterNode) -> SqlPredicate {
        predicate.to_sql()
    }
}

#[derive(Default, Clone)]
struct Table {
    rows: BTreeMap<String, Record>,
}

pub struct InMemoryDb {
    tables: Arc<Mutex<BTreeMap<String, Table>>>,
}

impl InMemoryDb {
    pub fn new() -> Self {
        Self { tables: Arc::new(Mutex::new(BTreeMap::new())) }
    }

    pub fn seed(&self, table: &str, pk_field: &str, row: Record) {
        let id = row
            .get(pk_field)
            .map(|v| v.as_normalized_string())
            .unwrap_or_default();
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .rows
            .insert(id, row);
    }
}

impl Default for InMemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

fn select_rows(tables: &BTreeMap<String, Table>, table: &str, predicate: &FilterNode, options: &SelectOptions) -> Vec<Record> {
    let mut matched: Vec<Record> = tables
        .get(table)
        .map(|t| t.rows.values().filter(|row| predicate.evaluate(row)).cloned().collect())
        .unwrap_or_default();

    for order in options.order_by.iter().rev() {
        matched.sort_by(|a, b| {
            let av = a.get(&order.field).cloned().unwrap_or(Value::Null);
            let bv = b.get(&order.field).cloned().unwrap_or(Value::Null);
            let ordering = av.partial_cmp(&bv).unwrap_or(std::cmp::Ordering::Equal);
            if order.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }
    if let Some(limit) = options.limit {
        matched.truncate(limit);
    }
    matched
}

#[async_trait]
impl Database for InMemoryDb {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let undo_log = self.tables.lock().clone();
        Ok(Box::new(InMemoryTransaction {
            tables: self.tables.clone(),
            undo_log: Some(undo_log),
        }))
    }

    async fn select(&self, table: &str, predicate: &FilterNode, options: &SelectOptions) -> Result<Vec<Record>> {
        let tables = self.tables.lock();
        Ok(select_rows(&tables, table, predicate, options))
    }
}

/// Writes apply directly to the shared tables as they happen; `rollback`
/// restores the pre-transaction snapshot captured at `begin`, `commit`
/// simply discards it. This gives the pipeline correct all-or-nothing
/// semantics without a second copy-on-write layer for the reference store.
struct InMemoryTransaction {
    tables: Arc<Mutex<BTreeMap<String, Table>>>,
    undo_log: Option<BTreeMap<String, Table>>,
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn select(&self, table: &str, predicate: &FilterNode, options: &SelectOptions) -> Result<Vec<Record>> {
        let tables = self.tables.lock();
        Ok(select_rows(&tables, table, predicate, options))
    }

    async fn insert(&mut self, table: &str, row: Record, pk_field: &str) -> Result<Record> {
        let id = row
            .get(pk_field)
            .map(|v| v.as_normalized_string())
            .ok_or_else(|| EngineError::Validation(format!("missing primary key field '{pk_field}'")))?;
        let mut tables = self.tables.lock();
        let entry = tables.entry(table.to_string()).or_default();
        if entry.rows.contains_key(&id) {
            return Err(EngineError::Conflict(format!("row '{id}' already exists")));
        }
        entry.rows.insert(id, row.clone());
        Ok(row)
    }

    async fn update(&mut self, table: &str, predicate: &FilterNode, patch: &Record, _pk_field: &str) -> Result<Vec<Record>> {
        let mut tables = self.tables.lock();
        let Some(entry) = tables.get_mut(table) else {
            return Ok(Vec::new());
        };
        let matching_ids: Vec<String> = entry
            .rows
            .iter()
            .filter(|(_, row)| predicate.evaluate(row))
            .map(|(id, _)| id.clone())
            .collect();
        let mut updated = Vec::new();
        for id in matching_ids {
            if let Some(row) = entry.rows.get_mut(&id) {
                for (k, v) in patch {
                    row.insert(k.clone(), v.clone());
                }
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }

    async fn replace(&mut self, table: &str, predicate: &FilterNode, full: Record, _pk_field: &str) -> Result<Vec<Record>> {
        let mut tables = self.tables.lock();
        let Some(entry) = tables.get_mut(table) else {
            return Ok(Vec::new());
        };
        let matching_ids: Vec<String> = entry
            .rows
            .iter()
            .filter(|(_, row)| predicate.evaluate(row))
            .map(|(id, _)| id.clone())
            .collect();
        let mut replaced = Vec::new();
        for id in matching_ids {
            if let Some(row) = entry.rows.get_mut(&id) {
                *row = full.clone();
                replaced.push(row.clone());
            }
        }
        Ok(replaced)
    }

    async fn delete(&mut self, table: &str, predicate: &FilterNode, _pk_field: &str) -> Result<Vec<Record>> {
        let mut tables = self.tables.lock();
        let Some(entry) = tables.get_mut(table) else {
            return Ok(Vec::new());
        };
        let matching_ids: Vec<String> = entry
            .rows
            .iter()
            .filter(|(_, row)| predicate.evaluate(row))
            .map(|(id, _)| id.clone())
            .collect();
        let mut removed = Vec::new();
        for id in matching_ids {
            if let Some(row) = entry.rows.remove(&id) {
                removed.push(row);
            }
        }
        Ok(removed)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.undo_log = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        if let Some(undo_log) = self.undo_log {
            *self.tables.lock() = undo_log;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterNode;

    fn row(id: &str, value: f64) -> Record {
        let mut r = Record::new();
        r.insert("id".to_string(), Value::String(id.to_string()));
        r.insert("value".to_string(), Value::Number(value));
        r
    }

    #[tokio::test]
    async fn select_filters_by_predicate() {
        let db = InMemoryDb::new();
        db.seed("widgets", "id", row("a", 10.0));
        db.seed("widgets", "id", row("b", 100.0));
        let results = db
            .select("widgets", &FilterNode::True, &SelectOptions::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn transaction_insert_is_visible_after_commit() {
        let db = InMemoryDb::new();
        let mut txn = db.begin().await.unwrap();
        txn.insert("widgets", row("a", 1.0), "id").await.unwrap();
        txn.commit().await.unwrap();
        let rows = db.select("widgets", &FilterNode::True, &SelectOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn transaction_replace_drops_omitted_fields() {
        let db = InMemoryDb::new();
        db.seed("widgets", "id", row("a", 1.0));
        let mut full = Record::new();
        full.insert("id".to_string(), Value::String("a".to_string()));
        let id_filter = FilterNode::Op {
            field: "id".to_string(),
            operator: crate::filter::Operator::Eq,
            operand: crate::filter::Operand::Scalar(Value::String("a".to_string())),
        };
        let mut txn = db.begin().await.unwrap();
        let replaced = txn.replace("widgets", &id_filter, full, "id").await.unwrap();
        txn.commit().await.unwrap();
        assert_eq!(replaced.len(), 1);
        assert!(replaced[0].get("value").is_none());
    }

    #[tokio::test]
    async fn transaction_rollback_discards_writes() {
        let db = InMemoryDb::new();
        let mut txn = db.begin().await.unwrap();
        txn.insert("widgets", row("a", 1.0), "id").await.unwrap();
        txn.rollback().await.unwrap();
        let rows = db.select("widgets", &FilterNode::True, &SelectOptions::default()).await.unwrap();
        assert!(rows.is_empty());
    }
}
