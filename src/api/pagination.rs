// In-memory counterpart to `cursor::keyset_predicate` (§4.C): the SQL
// fragment that module builds is meant for a real backend's `WHERE`
// clause; the reference `InMemoryDb` has no SQL layer to hand it to, so
// list/fetch filter already-sorted rows against the same "greater-than
// tuple" semantics directly in Rust.

use std::cmp::Ordering;

use crate::cursor::{Cursor, OrderByField, SortDirection};
use crate::value::{Record, Value};

/// True if `row` sorts strictly after `cursor` under `order_by` with
/// `pk_field` as the final tie-breaker — the same ordering
/// `keyset_predicate` encodes as SQL.
pub fn is_after_cursor(row: &Record, cursor: &Cursor, order_by: &[OrderByField], pk_field: &str) -> bool {
    for field in order_by {
        let row_val = row.get(&field.field).cloned().unwrap_or(Value::Null);
        let cursor_val = cursor
            .sort_key
            .iter()
            .find(|(k, _)| k == &field.field)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Null);
        let mut cmp = row_val.partial_cmp(&cursor_val).unwrap_or(Ordering::Equal);
        if field.direction == SortDirection::Desc {
            cmp = cmp.reverse();
        }
        match cmp {
            Ordering::Less => return false,
            Ordering::Greater => return true,
            Ordering::Equal => continue,
        }
    }
    let row_pk = row.get(pk_field).map(|v| v.as_normalized_string()).unwrap_or_default();
    row_pk.as_str() > cursor.tie_breaker_id.as_str()
}

/// Extracts the `(field, value)` sort key a cursor would need to resume
/// immediately after `row`.
pub fn sort_key_for(row: &Record, order_by: &[OrderByField]) -> Vec<(String, Value)> {
    order_by
        .iter()
        .map(|field| (field.field.clone(), row.get(&field.field).cloned().unwrap_or(Value::Null)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_by() -> Vec<OrderByField> {
        vec![OrderByField { field: "score".to_string(), direction: SortDirection::Asc, nulls_last: true }]
    }

    fn row(id: &str, score: f64) -> Record {
        let mut r = Record::new();
        r.insert("id".to_string(), Value::String(id.to_string()));
        r.insert("score".to_string(), Value::Number(score));
        r
    }

    #[test]
    fn rows_strictly_after_cursor_pass() {
        let cursor = Cursor {
            sort_key: vec![("score".to_string(), Value::Number(5.0))],
            tie_breaker_id: "b".to_string(),
            version: 1,
            order_hash: String::new(),
            issued_at: chrono::Utc::now(),
        };
        assert!(is_after_cursor(&row("c", 6.0), &cursor, &order_by(), "id"));
        assert!(!is_after_cursor(&row("a", 4.0), &cursor, &order_by(), "id"));
    }

    #[test]
    fn ties_break_on_primary_key() {
        let cursor = Cursor {
            sort_key: vec![("score".to_string(), Value::Number(5.0))],
            tie_breaker_id: "b".to_string(),
            version: 1,
            order_hash: String::new(),
            issued_at: chrono::Utc::now(),
        };
        assert!(is_after_cursor(&row("c", 5.0), &cursor, &order_by(), "id"));
        assert!(!is_after_cursor(&row("a", 5.0), &cursor, &order_by(), "id"));
    }
}
