// `POST /{resource}/batch` (dry run) and `POST /{resource}/batch/apply`
// (apply), wiring the Batch Confirm Protocol (§4.G) to the mutation
// pipeline's `batch_update`/`batch_delete`.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use serde_json::Value as Json_;

use crate::batch::{self, BatchOperation};
use crate::db::SelectOptions;
use crate::error::EngineError;
use crate::value::{record_from_json, record_to_json};

use super::error_response::ApiError;
use super::AppState;

fn resource_error(state: &AppState, err: EngineError, instance: String) -> ApiError {
    ApiError::new(err, Some(instance), state.config.debug_mode)
}

#[derive(Debug, Deserialize)]
pub struct DryRunRequest {
    pub operation: BatchOperation,
    pub filter: String,
}

/// Computes the affected set for `filter` and returns a signed confirm
/// token the caller must echo back to `apply` (§4.G step 1).
pub async fn dry_run(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Json(request): Json<DryRunRequest>,
) -> Result<Json<Json_>, ApiError> {
    let schema = state.schemas.get(&resource).ok_or_else(|| {
        ApiError::new(EngineError::NotFound(format!("unknown resource '{resource}'")), None, state.config.debug_mode)
    })?;
    let instance = format!("/{resource}/batch");

    let filter_node = crate::filter::compile(&request.filter, schema, &state.config, &state.filter_cache)
        .map_err(|e| resource_error(&state, e, instance.clone()))?;
    let matched = state
        .db
        .select(&resource, filter_node.as_ref(), &SelectOptions::default())
        .await
        .map_err(|e| resource_error(&state, e, instance))?;

    let result = batch::dry_run(
        request.operation,
        &resource,
        &request.filter,
        &matched,
        &schema.primary_key,
        &state.config,
    );

    Ok(Json(json!({
        "count": result.count,
        "sampleIds": result.sample_ids,
        "sampleItems": result.sample_items.iter().map(record_to_json).collect::<Vec<_>>(),
        "confirmToken": result.token.encode(),
        "expiresAt": result.expires_at.to_rfc3339(),
        "truncated": result.truncated,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ApplyRequest {
    pub operation: BatchOperation,
    pub filter: String,
    #[serde(rename = "confirmToken", default)]
    pub confirm_token: Option<String>,
    /// Patch body for `BatchOperation::Update`; ignored for `Delete`.
    #[serde(default)]
    pub patch: Json_,
}

/// Re-validates the confirm token against this request and, if it passes
/// and hasn't already been applied, runs the write through the mutation
/// pipeline (§4.G step 2). A caller that sets `X-Batch-Bypass: true`
/// skips the dry-run/confirm-token round trip entirely; the request is
/// audit-logged instead.
pub async fn apply(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ApplyRequest>,
) -> Result<Json<Json_>, ApiError> {
    let schema = state.schemas.get(&resource).ok_or_else(|| {
        ApiError::new(EngineError::NotFound(format!("unknown resource '{resource}'")), None, state.config.debug_mode)
    })?;
    let instance = format!("/{resource}/batch/apply");

    let bypass = headers.get(batch::BYPASS_HEADER).and_then(|v| v.to_str().ok()).map(|v| v == "true").unwrap_or(false);

    if bypass {
        let caller = headers.get("x-user-id").and_then(|v| v.to_str().ok());
        batch::audit_bypass(request.operation, &resource, &request.filter, caller);
    } else {
        let confirm_token = request
            .confirm_token
            .as_deref()
            .ok_or_else(|| resource_error(&state, EngineError::Validation("missing confirmToken".to_string()), instance.clone()))?;
        let token = batch::verify_and_apply(confirm_token, request.operation, &resource, &request.filter, &state.config)
            .map_err(|e| resource_error(&state, e, instance.clone()))?;

        let first_claim = state
            .apply_guard
            .claim(&token)
            .await
            .map_err(|e| resource_error(&state, e, instance.clone()))?;
        if !first_claim {
            return Ok(Json(json!({ "applied": false, "reason": "already_applied", "affectedCount": token.affected_ids().len() })));
        }
    }

    state.metrics.record_batch_operation();
    let filter_node = crate::filter::compile(&request.filter, schema, &state.config, &state.filter_cache)
        .map_err(|e| resource_error(&state, e, instance.clone()))?;

    let affected = match request.operation {
        BatchOperation::Update => {
            let patch = record_from_json(&request.patch).unwrap_or_default();
            state
                .pipeline
                .batch_update(&resource, &schema.primary_key, filter_node.as_ref(), patch)
                .await
                .map_err(|e| resource_error(&state, e, instance))?
        }
        BatchOperation::Delete => state
            .pipeline
            .batch_delete(&resource, &schema.primary_key, filter_node.as_ref())
            .await
            .map_err(|e| resource_error(&state, e, instance))?,
    };

    Ok(Json(json!({ "applied": true, "affectedCount": affected.len() })))
}
