// # Pagination Cursors (§4.C)
//
// Signed, versioned keyset-pagination position tied to a specific sort
// order. Encoding per §6: `Base64url(JSON({v, id, _ver, _orderByHash,
// _ts}))`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::signing;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// One field in the `orderBy` list.
#[derive(Debug, Clone)]
pub struct OrderByField {
    pub field: String,
    pub direction: SortDirection,
    /// Whether nulls sort last for this field (§4.C, configurable).
    pub nulls_last: bool,
}

/// The wire representation (§6 Cursor encoding), field names matching the
/// spec's literal JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorPayload {
    v: serde_json::Map<String, serde_json::Value>,
    id: String,
    #[serde(rename = "_ver")]
    version: u32,
    #[serde(rename = "_orderByHash")]
    order_by_hash: String,
    #[serde(rename = "_ts")]
    issued_at: i64,
}

/// A decoded, validated cursor position.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub sort_key: Vec<(String, Value)>,
    pub tie_breaker_id: String,
    pub version: u32,
    pub order_hash: String,
    pub issued_at: chrono::DateTime<chrono::Utc>,
}

/// `hash(current orderBy)` (§4.C step 2).
pub fn hash_order_by(order_by: &[OrderByField]) -> String {
    let mut hasher = Sha256::new();
    for field in order_by {
        hasher.update(field.field.as_bytes());
        hasher.update(match field.direction {
            SortDirection::Asc => b"+",
            SortDirection::Desc => b"-",
        });
    }
    hex::encode(&hasher.finalize()[..8])
}

pub fn encode(
    sort_key: &[(String, Value)],
    tie_breaker_id: &str,
    order_by: &[OrderByField],
    config: &EngineConfig,
) -> String {
    let mut v = serde_json::Map::new();
    for (k, val) in sort_key {
        v.insert(k.clone(), val.to_json());
    }
    let payload = CursorPayload {
        v,
        id: tie_breaker_id.to_string(),
        version: config.cursor_version,
        order_by_hash: hash_order_by(order_by),
        issued_at: chrono::Utc::now().timestamp(),
    };
    let body = serde_json::to_vec(&payload).expect("cursor payload always serializes");
    let signature = signing::sign(&config.server_secret, &body);
    let envelope = serde_json::json!({ "p": URL_SAFE_NO_PAD.encode(&body), "sig": signature });
    URL_SAFE_NO_PAD.encode(serde_json::to_vec(&envelope).expect("envelope serializes"))
}

/// Decode and validate, in the order specified by §4.C:
/// 1. version, 2. orderHash, 3. signature, 4. age.
pub fn decode(
    encoded: &str,
    order_by: &[OrderByField],
    config: &EngineConfig,
) -> Result<Cursor> {
    let envelope_bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| EngineError::CursorInvalid(format!("bad base64: {e}")))?;
    let envelope: serde_json::Value = serde_json::from_slice(&envelope_bytes)
        .map_err(|e| EngineError::CursorInvalid(format!("bad envelope json: {e}")))?;
    let body_b64 = envelope
        .get("p")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::CursorInvalid("missing payload".to_string()))?;
    let signature = envelope
        .get("sig")
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::CursorInvalid("missing signature".to_string()))?;
    let body = URL_SAFE_NO_PAD
        .decode(body_b64)
        .map_err(|e| EngineError::CursorInvalid(format!("bad payload base64: {e}")))?;
    let payload: CursorPayload = serde_json::from_slice(&body)
        .map_err(|e| EngineError::CursorInvalid(format!("bad payload shape: {e}")))?;

    if payload.version != config.cursor_version {
        return Err(EngineError::CursorInvalid("version_mismatch".to_string()));
    }
    let expected_hash = hash_order_by(order_by);
    if payload.order_by_hash != expected_hash {
        return Err(EngineError::CursorInvalid("orderby_mismatch".to_string()));
    }
    if !signing::verify(&config.server_secret, &body, signature) {
        return Err(EngineError::CursorInvalid("tampered".to_string()));
    }
    let issued_at = chrono::DateTime::from_timestamp(payload.issued_at, 0)
        .ok_or_else(|| EngineError::CursorInvalid("bad timestamp".to_string()))?;
    let age = chrono::Utc::now().signed_duration_since(issued_at);
    if age.num_seconds() > config.cursor_max_age_secs {
        return Err(EngineError::CursorExpired);
    }

    let sort_key = payload
        .v
        .into_iter()
        .map(|(k, v)| (k, Value::from_json(&v)))
        .collect();

    Ok(Cursor {
        sort_key,
        tie_breaker_id: payload.id,
        version: payload.version,
        order_hash: payload.order_by_hash,
        issued_at,
    })
}

/// Builds the keyset "greater-than tuple" predicate for a cursor position
/// against an `orderBy` list with a final primary-key tie-breaker (§4.C).
/// Returns a parameterised SQL fragment in the same shape as
/// `filter::SqlPredicate` so callers can AND it into a query's WHERE clause.
pub fn keyset_predicate(
    cursor: &Cursor,
    order_by: &[OrderByField],
    pk_field: &str,
) -> crate::filter::SqlPredicate {
    let mut params = Vec::new();
    let mut or_terms = Vec::new();

    for prefix_len in 0..=order_by.len() {
        let mut and_terms = Vec::new();
        let mut valid = true;
        for field in &order_by[..prefix_len] {
            let Some(val) = cursor.sort_key.iter().find(|(k, _)| k == &field.field).map(|(_, v)| v.clone()) else {
                valid = false;
                break;
            };
            params.push(val.clone());
            and_terms.push(format!("\"{}\" = ${}", field.field, params.len()));
        }
        if !valid {
            continue;
        }
        if prefix_len < order_by.len() {
            let field = &order_by[prefix_len];
            let Some(val) = cursor.sort_key.iter().find(|(k, _)| k == &field.field).map(|(_, v)| v.clone()) else {
                continue;
            };
            let cmp = match field.direction {
                SortDirection::Asc => ">",
                SortDirection::Desc => "<",
            };
            if val.is_null() {
                // nulls-last: a stored NULL cursor value means every row with
                // a non-null value in ascending order, or nothing further in
                // descending order (§4.C explicit per-field null branch).
                and_terms.push(match field.direction {
                    SortDirection::Asc => format!("\"{}\" IS NOT NULL", field.field),
                    SortDirection::Desc => "FALSE".to_string(),
                });
            } else {
                params.push(val);
                and_terms.push(format!("\"{}\" {cmp} ${}", field.field, params.len()));
            }
        } else {
            params.push(Value::String(cursor.tie_breaker_id.clone()));
            and_terms.push(format!("\"{pk_field}\" > ${}", params.len()));
        }
        or_terms.push(format!("({})", and_terms.join(" AND ")));
    }

    crate::filter::SqlPredicate {
        sql: if or_terms.is_empty() {
            "FALSE".to_string()
        } else {
            or_terms.join(" OR ")
        },
        params,
    }
}
