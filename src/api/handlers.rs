// REST handlers for list/count/aggregate/fetch/create/update/delete (§6 HTTP
// surface), wired the way the teacher's `api/rest/handlers.rs` wires its
// `State(state): State<Arc<ApiState>>` + `Query`/`Path` extractors, with
// `AppState` generalized to this engine's resource-agnostic surface.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde_json::{json, Value as Json_};

use crate::cursor::{self, OrderByField, SortDirection};
use crate::db::{OrderBySpec, SelectOptions};
use crate::error::EngineError;
use crate::filter::{FilterNode, Operand, Operator};
use crate::value::{record_from_json, record_to_json, Record};

use super::error_response::ApiError;
use super::include::{load_includes, parse_include};
use super::pagination::{is_after_cursor, sort_key_for};
use super::projection::{parse_select, project};
use super::AppState;

/// Parses `orderBy=field,-other` into both representations the engine's
/// modules separately need (`db::OrderBySpec` for the in-memory scan,
/// `cursor::OrderByField` for cursor encode/decode), always appending the
/// resource's primary key as the final tie-breaker (§4.C).
fn parse_order_by(raw: Option<&str>, pk_field: &str) -> (Vec<OrderBySpec>, Vec<OrderByField>) {
    let mut db_spec = Vec::new();
    let mut cursor_spec = Vec::new();
    if let Some(raw) = raw {
        for token in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (field, descending) = match token.strip_prefix('-') {
                Some(rest) => (rest.to_string(), true),
                None => (token.to_string(), false),
            };
            db_spec.push(OrderBySpec { field: field.clone(), descending });
            cursor_spec.push(OrderByField {
                field,
                direction: if descending { SortDirection::Desc } else { SortDirection::Asc },
                nulls_last: true,
            });
        }
    }
    if !db_spec.iter().any(|o| o.field == pk_field) {
        db_spec.push(OrderBySpec { field: pk_field.to_string(), descending: false });
        cursor_spec.push(OrderByField { field: pk_field.to_string(), direction: SortDirection::Asc, nulls_last: true });
    }
    (db_spec, cursor_spec)
}

fn not_found(resource: &str) -> ApiError {
    ApiError::new(EngineError::NotFound(format!("unknown resource '{resource}'")), None, false)
}

fn resource_error(state: &AppState, err: EngineError, instance: String) -> ApiError {
    ApiError::new(err, Some(instance), state.config.debug_mode)
}

fn id_filter(pk_field: &str, id: &str) -> FilterNode {
    FilterNode::Op {
        field: pk_field.to_string(),
        operator: Operator::Eq,
        operand: Operand::Scalar(crate::value::Value::String(id.to_string())),
    }
}

pub async fn healthz() -> Json<Json_> {
    Json(json!({ "status": "ok", "version": crate::VERSION }))
}

pub async fn metrics_snapshot(State(state): State<AppState>) -> Json<Json_> {
    Json(serde_json::to_value(state.metrics.snapshot()).unwrap_or(Json_::Null))
}

/// `GET /{resource}` (§6): `filter`, `cursor`, `limit`, `orderBy`,
/// `totalCount`, `include`, `select`.
pub async fn list(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Json_>, ApiError> {
    let schema = state.schemas.get(&resource).ok_or_else(|| not_found(&resource))?;
    let instance = format!("/{resource}");

    let filter_node = match params.get("filter") {
        Some(expr) => crate::filter::compile(expr, schema, &state.config, &state.filter_cache)
            .map_err(|e| resource_error(&state, e, instance.clone()))?,
        None => std::sync::Arc::new(FilterNode::True),
    };

    let (order_db, order_cursor) = parse_order_by(params.get("orderBy").map(String::as_str), &schema.primary_key);
    let limit: usize = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(50);

    let mut rows = state
        .db
        .select(&resource, filter_node.as_ref(), &SelectOptions { order_by: order_db, limit: None })
        .await
        .map_err(|e| resource_error(&state, e, instance.clone()))?;

    // Captured before the cursor retain below so it reflects the full
    // filtered-set size, not just the remainder after this page's position.
    let total_count = if params.get("totalCount").map(|v| v == "true").unwrap_or(false) {
        Some(rows.len())
    } else {
        None
    };

    if let Some(cursor_str) = params.get("cursor") {
        let cursor = cursor::decode(cursor_str, &order_cursor, &state.config)
            .map_err(|e| resource_error(&state, e, instance.clone()))?;
        rows.retain(|row| is_after_cursor(row, &cursor, &order_cursor, &schema.primary_key));
    }

    let has_more = rows.len() > limit;
    let mut page: Vec<Record> = rows.into_iter().take(limit + 1).collect();
    page.truncate(limit);

    let next_cursor = if has_more {
        page.last()
            .map(|row| cursor::encode(&sort_key_for(row, &order_cursor), &row_pk(row, &schema.primary_key), &order_cursor, &state.config))
    } else {
        None
    };

    let select_fields = parse_select(params.get("select").map(String::as_str));
    if !select_fields.is_empty() {
        page = page.into_iter().map(|row| project(row, &select_fields)).collect();
    }

    let include_fields = parse_include(params.get("include").map(String::as_str));
    let (json_rows, truncated) = load_includes(
        state.db.as_ref(),
        &state.schemas,
        &resource,
        page,
        &include_fields,
        state.config.max_include_depth,
    )
    .await
    .map_err(|e| resource_error(&state, e, instance))?;

    let mut body = json!({ "data": json_rows, "nextCursor": next_cursor, "truncatedIncludes": truncated });
    if let Some(count) = total_count {
        body["totalCount"] = json!(count);
    }
    Ok(Json(body))
}

fn row_pk(row: &Record, pk_field: &str) -> String {
    row.get(pk_field).map(|v| v.as_normalized_string()).unwrap_or_default()
}

/// `GET /{resource}/count`.
pub async fn count(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Json_>, ApiError> {
    let schema = state.schemas.get(&resource).ok_or_else(|| not_found(&resource))?;
    let instance = format!("/{resource}/count");
    let filter_node = match params.get("filter") {
        Some(expr) => crate::filter::compile(expr, schema, &state.config, &state.filter_cache)
            .map_err(|e| resource_error(&state, e, instance.clone()))?,
        None => std::sync::Arc::new(FilterNode::True),
    };
    let rows = state
        .db
        .select(&resource, filter_node.as_ref(), &SelectOptions::default())
        .await
        .map_err(|e| resource_error(&state, e, instance))?;
    Ok(Json(json!({ "count": rows.len() })))
}

enum AggReducer {
    Sum,
    Avg,
    Min,
    Max,
}

impl AggReducer {
    fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            AggReducer::Sum => values.iter().sum(),
            AggReducer::Avg => values.iter().sum::<f64>() / values.len() as f64,
            AggReducer::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            AggReducer::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

/// `GET /{resource}/aggregate`: `groupBy`, `sum`, `avg`, `min`, `max`,
/// `count`, `filter`.
pub async fn aggregate(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Json_>, ApiError> {
    let schema = state.schemas.get(&resource).ok_or_else(|| not_found(&resource))?;
    let instance = format!("/{resource}/aggregate");
    let filter_node = match params.get("filter") {
        Some(expr) => crate::filter::compile(expr, schema, &state.config, &state.filter_cache)
            .map_err(|e| resource_error(&state, e, instance.clone()))?,
        None => std::sync::Arc::new(FilterNode::True),
    };
    let rows = state
        .db
        .select(&resource, filter_node.as_ref(), &SelectOptions::default())
        .await
        .map_err(|e| resource_error(&state, e, instance))?;

    let group_by = params.get("groupBy").map(String::as_str);
    let mut groups: HashMap<String, Vec<&Record>> = HashMap::new();
    for row in &rows {
        let key = group_by
            .map(|field| row.get(field).map(|v| v.as_normalized_string()).unwrap_or_default())
            .unwrap_or_default();
        groups.entry(key).or_default().push(row);
    }

    let mut results = Vec::new();
    for (key, members) in groups {
        let mut entry = json!({});
        if let Some(field) = group_by {
            entry[field] = json!(key);
        }
        if params.contains_key("count") {
            entry["count"] = json!(members.len());
        }
        for (agg_name, reducer) in [
            ("sum", AggReducer::Sum),
            ("avg", AggReducer::Avg),
            ("min", AggReducer::Min),
            ("max", AggReducer::Max),
        ] {
            if let Some(field) = params.get(agg_name) {
                let values: Vec<f64> = members.iter().filter_map(|r| r.get(field).and_then(|v| v.as_f64())).collect();
                entry[format!("{agg_name}_{field}")] = json!(reducer.apply(&values));
            }
        }
        results.push(entry);
    }
    Ok(Json(json!({ "groups": results })))
}

/// `GET /{resource}/{id}`: `include`, `select`.
pub async fn fetch(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Json_>, ApiError> {
    let schema = state.schemas.get(&resource).ok_or_else(|| not_found(&resource))?;
    let instance = format!("/{resource}/{id}");
    let rows = state
        .db
        .select(&resource, &id_filter(&schema.primary_key, &id), &SelectOptions::default())
        .await
        .map_err(|e| resource_error(&state, e, instance.clone()))?;
    let Some(row) = rows.into_iter().next() else {
        return Err(resource_error(&state, EngineError::NotFound(instance.clone()), instance));
    };

    let select_fields = parse_select(params.get("select").map(String::as_str));
    let row = if select_fields.is_empty() { row } else { project(row, &select_fields) };

    let include_fields = parse_include(params.get("include").map(String::as_str));
    let (json_rows, _truncated) = load_includes(
        state.db.as_ref(),
        &state.schemas,
        &resource,
        vec![row],
        &include_fields,
        state.config.max_include_depth,
    )
    .await
    .map_err(|e| resource_error(&state, e, instance))?;

    Ok(Json(json_rows.into_iter().next().unwrap_or(Json_::Null)))
}

/// `POST /{resource}`: body is the record; honours an optional
/// `Idempotency-Key` header (SPEC_FULL.md §2 supplemented feature).
pub async fn create(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Json_>,
) -> Result<Json<Json_>, ApiError> {
    let schema = state.schemas.get(&resource).ok_or_else(|| not_found(&resource))?;
    let instance = format!("/{resource}");
    let payload = record_from_json(&body)
        .ok_or_else(|| resource_error(&state, EngineError::Validation("body must be a JSON object".to_string()), instance.clone()))?;

    let Some(key) = headers.get("idempotency-key").and_then(|v| v.to_str().ok()) else {
        let created = state
            .pipeline
            .create(&resource, &schema.primary_key, payload)
            .await
            .map_err(|e| resource_error(&state, e, instance))?;
        return Ok(Json(record_to_json(&created)));
    };

    if let Some(existing_id) = state
        .idempotency
        .claim(key)
        .await
        .map_err(|e| resource_error(&state, e, instance.clone()))?
    {
        let rows = state
            .db
            .select(&resource, &id_filter(&schema.primary_key, &existing_id), &SelectOptions::default())
            .await
            .map_err(|e| resource_error(&state, e, instance))?;
        return Ok(Json(rows.into_iter().next().map(|r| record_to_json(&r)).unwrap_or(Json_::Null)));
    }

    let created = state
        .pipeline
        .create(&resource, &schema.primary_key, payload)
        .await
        .map_err(|e| resource_error(&state, e, instance.clone()))?;
    let id = created.get(&schema.primary_key).map(|v| v.as_normalized_string()).unwrap_or_default();
    state.idempotency.record(key, &id).await.map_err(|e| resource_error(&state, e, instance))?;
    Ok(Json(record_to_json(&created)))
}

/// `PATCH /{resource}/{id}`: body is a partial patch.
pub async fn update(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, String)>,
    Json(body): Json<Json_>,
) -> Result<Json<Json_>, ApiError> {
    let schema = state.schemas.get(&resource).ok_or_else(|| not_found(&resource))?;
    let instance = format!("/{resource}/{id}");
    let payload = record_from_json(&body)
        .ok_or_else(|| resource_error(&state, EngineError::Validation("body must be a JSON object".to_string()), instance.clone()))?;
    let updated = state
        .pipeline
        .update(&resource, &schema.primary_key, &id, payload)
        .await
        .map_err(|e| resource_error(&state, e, instance))?;
    Ok(Json(record_to_json(&updated)))
}

/// `PUT /{resource}/{id}` (§6): body is the full replacement record.
pub async fn replace(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, String)>,
    Json(body): Json<Json_>,
) -> Result<Json<Json_>, ApiError> {
    let schema = state.schemas.get(&resource).ok_or_else(|| not_found(&resource))?;
    let instance = format!("/{resource}/{id}");
    let payload = record_from_json(&body)
        .ok_or_else(|| resource_error(&state, EngineError::Validation("body must be a JSON object".to_string()), instance.clone()))?;
    let replaced = state
        .pipeline
        .replace(&resource, &schema.primary_key, &id, payload)
        .await
        .map_err(|e| resource_error(&state, e, instance))?;
    Ok(Json(record_to_json(&replaced)))
}

/// `DELETE /{resource}/{id}`.
pub async fn delete(
    State(state): State<AppState>,
    Path((resource, id)): Path<(String, String)>,
) -> Result<Json<Json_>, ApiError> {
    let schema = state.schemas.get(&resource).ok_or_else(|| not_found(&resource))?;
    let instance = format!("/{resource}/{id}");
    state
        .pipeline
        .delete(&resource, &schema.primary_key, &id)
        .await
        .map_err(|e| resource_error(&state, e, instance))?;
    Ok(Json(json!({ "deleted": true, "id": id })))
}
