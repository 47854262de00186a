// # Batch Confirm Protocol (§4.G)
//
// Two-phase commit for filter-scoped bulk updates/deletes: a dry-run
// computes the affected set and returns a signed token; apply requires
// that token and re-validates signature, expiry, operation identity, and
// filter-string equality before the pipeline actually writes anything.
// Signing reuses `crate::signing` so cursors and confirm tokens are the
// only two things in the engine that ever touch the process secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::signing;
use crate::value::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOperation {
    Update,
    Delete,
}

/// The unsigned content of a confirm token (§3 Data Model "Batch Confirm Token").
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenPayload {
    operation: BatchOperation,
    resource: String,
    /// Normalised filter expression text (§4.G step 2: "filter-string
    /// equality (normalised)").
    filter_expression: String,
    affected_ids: Vec<String>,
    issued_at: i64,
    expires_at: i64,
}

/// The signed, wire-encoded confirm token (§6 "Confirm token encoding").
#[derive(Debug, Clone)]
pub struct ConfirmToken {
    payload: TokenPayload,
    signature: String,
}

/// Result of a dry-run (§4.G step 1).
#[derive(Debug, Clone)]
pub struct DryRunResult {
    pub count: usize,
    pub sample_ids: Vec<String>,
    pub sample_items: Vec<Record>,
    pub token: ConfirmToken,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    /// Set when the affected count was capped by `maxAffectedRecords` and
    /// the sample/token only cover the truncated prefix.
    pub truncated: bool,
}

/// Normalises a filter expression for the token's equality check: trims
/// surrounding whitespace only. The grammar is whitespace-insensitive
/// outside identifiers (§6), so two expressions that parse to the same
/// tree but differ in incidental whitespace would otherwise spuriously
/// mismatch.
pub fn normalize_expression(expr: &str) -> String {
    expr.trim().to_string()
}

/// Builds the dry-run response and its confirm token from the already
/// filter-matched set of rows (§4.G step 1). `pk_field` extracts each row's
/// primary key for `affected_ids`/`sample_ids`.
pub fn dry_run(
    operation: BatchOperation,
    resource: &str,
    filter_expression: &str,
    matched: &[Record],
    pk_field: &str,
    config: &EngineConfig,
) -> DryRunResult {
    let truncated = matched.len() > config.max_affected_records;
    let capped = &matched[..matched.len().min(config.max_affected_records)];

    let affected_ids: Vec<String> = capped
        .iter()
        .map(|row| row.get(pk_field).map(|v| v.as_normalized_string()).unwrap_or_default())
        .collect();
    let sample_ids: Vec<String> = affected_ids.iter().take(20).cloned().collect();
    let sample_items: Vec<Record> = capped.iter().take(20).cloned().collect();

    let issued_at = chrono::Utc::now();
    let expires_at = issued_at + chrono::Duration::seconds(config.confirm_token_ttl_secs);

    let payload = TokenPayload {
        operation,
        resource: resource.to_string(),
        filter_expression: normalize_expression(filter_expression),
        affected_ids: affected_ids.clone(),
        issued_at: issued_at.timestamp(),
        expires_at: expires_at.timestamp(),
    };
    let body = serde_json::to_vec(&payload).expect("token payload always serializes");
    let signature = signing::sign(&config.server_secret, &body);

    DryRunResult {
        count: matched.len(),
        sample_ids,
        sample_items,
        token: ConfirmToken { payload, signature },
        expires_at,
        truncated,
    }
}

impl ConfirmToken {
    /// `Base64url(JSON(payload + signature))` (§6 "Confirm token encoding").
    pub fn encode(&self) -> String {
        let envelope = serde_json::json!({ "payload": self.payload, "sig": self.signature });
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&envelope).expect("envelope serializes"))
    }

    pub fn affected_ids(&self) -> &[String] {
        &self.payload.affected_ids
    }

    pub fn resource(&self) -> &str {
        &self.payload.resource
    }

    fn decode(encoded: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| EngineError::Validation(format!("bad confirm token base64: {e}")))?;
        let envelope: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Validation(format!("bad confirm token json: {e}")))?;
        let payload: TokenPayload = serde_json::from_value(
            envelope
                .get("payload")
                .cloned()
                .ok_or_else(|| EngineError::Validation("missing token payload".to_string()))?,
        )
        .map_err(|e| EngineError::Validation(format!("bad confirm token payload shape: {e}")))?;
        let signature = envelope
            .get("sig")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::Validation("missing token signature".to_string()))?
            .to_string();
        Ok(ConfirmToken { payload, signature })
    }
}

/// Verifies `token` against the apply-time request: signature, expiry,
/// operation identity, and filter-string equality. Each failure mode is
/// distinct (§4.G step 2: "Mismatch fails with
/// `FilterMismatch`/`OperationMismatch`/`Expired`/`InvalidSignature`").
pub fn verify_and_apply(
    encoded_token: &str,
    operation: BatchOperation,
    resource: &str,
    filter_expression: &str,
    config: &EngineConfig,
) -> Result<ConfirmToken> {
    let token = ConfirmToken::decode(encoded_token)?;

    let body = serde_json::to_vec(&token.payload).expect("token payload always serializes");
    if !signing::verify(&config.server_secret, &body, &token.signature) {
        return Err(EngineError::Validation("InvalidSignature".to_string()));
    }

    let now = chrono::Utc::now().timestamp();
    if now > token.payload.expires_at {
        return Err(EngineError::Validation("Expired".to_string()));
    }

    if token.payload.operation != operation || token.payload.resource != resource {
        return Err(EngineError::Validation("OperationMismatch".to_string()));
    }

    if token.payload.filter_expression != normalize_expression(filter_expression) {
        return Err(EngineError::Validation("FilterMismatch".to_string()));
    }

    Ok(token)
}

/// Header a caller sets to attest they accept the danger of applying a
/// filter-scoped batch without a prior dry-run/confirm-token round trip
/// (§4.G step 2 "bypass capability").
pub const BYPASS_HEADER: &str = "x-batch-bypass";

/// Records a bypassed apply the same way the pipeline's raw-SQL catch
/// records an invalidation: a structured event, not a stored audit trail
/// (audit-log storage is out of scope). `caller` is whatever
/// caller-identity header the surrounding handler already extracts.
pub fn audit_bypass(operation: BatchOperation, resource: &str, filter_expression: &str, caller: Option<&str>) {
    tracing::warn!(
        operation = ?operation,
        resource,
        filter = filter_expression,
        caller = caller.unwrap_or("unknown"),
        "batch confirm protocol bypassed"
    );
}

/// Tracks which confirm tokens have already been applied, so a retried
/// apply call either replays the original outcome or is rejected, but
/// never re-runs the write (§8 invariant 6).
pub struct BatchApplyGuard {
    kv: std::sync::Arc<dyn crate::kv::KvStore>,
}

impl BatchApplyGuard {
    pub fn new(kv: std::sync::Arc<dyn crate::kv::KvStore>) -> Self {
        Self { kv }
    }

    /// Returns `Ok(true)` if this signature claims apply for the first
    /// time, `Ok(false)` if it was already applied (the caller should
    /// treat the batch as already-done rather than re-executing it).
    pub async fn claim(&self, token: &ConfirmToken) -> Result<bool> {
        let key = format!("batch-applied:{}", token.signature);
        if self.kv.get(&key).await?.is_some() {
            return Ok(false);
        }
        self.kv.set(&key, "1").await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn row(id: &str) -> Record {
        let mut r = Record::new();
        r.insert("id".to_string(), Value::String(id.to_string()));
        r
    }

    #[test]
    fn scenario_5_dry_run_then_apply() {
        let config = EngineConfig::default();
        let matched = vec![row("a"), row("b")];
        let result = dry_run(
            BatchOperation::Delete,
            "widgets",
            r#"status=="inactive""#,
            &matched,
            "id",
            &config,
        );
        assert_eq!(result.count, 2);
        let encoded = result.token.encode();

        let applied = verify_and_apply(
            &encoded,
            BatchOperation::Delete,
            "widgets",
            r#"status=="inactive""#,
            &config,
        )
        .unwrap();
        assert_eq!(applied.affected_ids(), &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn rejects_wrong_operation() {
        let config = EngineConfig::default();
        let result = dry_run(BatchOperation::Delete, "widgets", "x==1", &[row("a")], "id", &config);
        let encoded = result.token.encode();
        let err = verify_and_apply(&encoded, BatchOperation::Update, "widgets", "x==1", &config).unwrap_err();
        assert!(matches!(err, EngineError::Validation(msg) if msg == "OperationMismatch"));
    }

    #[test]
    fn rejects_filter_mismatch() {
        let config = EngineConfig::default();
        let result = dry_run(BatchOperation::Update, "widgets", "x==1", &[row("a")], "id", &config);
        let encoded = result.token.encode();
        let err = verify_and_apply(&encoded, BatchOperation::Update, "widgets", "x==2", &config).unwrap_err();
        assert!(matches!(err, EngineError::Validation(msg) if msg == "FilterMismatch"));
    }

    #[test]
    fn rejects_expired_token() {
        let mut config = EngineConfig::default();
        config.confirm_token_ttl_secs = -1;
        let result = dry_run(BatchOperation::Update, "widgets", "x==1", &[row("a")], "id", &config);
        let encoded = result.token.encode();
        let err = verify_and_apply(&encoded, BatchOperation::Update, "widgets", "x==1", &config).unwrap_err();
        assert!(matches!(err, EngineError::Validation(msg) if msg == "Expired"));
    }

    #[test]
    fn rejects_tampered_token() {
        let config = EngineConfig::default();
        let result = dry_run(BatchOperation::Update, "widgets", "x==1", &[row("a")], "id", &config);
        let mut encoded = result.token.encode();
        encoded.push('x');
        assert!(ConfirmToken::decode(&encoded).is_err() || verify_and_apply(&encoded, BatchOperation::Update, "widgets", "x==1", &config).is_err());
    }

    #[tokio::test]
    async fn apply_guard_never_claims_twice() {
        let kv: std::sync::Arc<dyn crate::kv::KvStore> = std::sync::Arc::new(crate::kv::InMemoryKvStore::new());
        let guard = BatchApplyGuard::new(kv);
        let config = EngineConfig::default();
        let result = dry_run(BatchOperation::Delete, "widgets", "x==1", &[row("a")], "id", &config);
        assert!(guard.claim(&result.token).await.unwrap());
        assert!(!guard.claim(&result.token).await.unwrap());
    }

    #[test]
    fn truncates_when_exceeding_max_affected_records() {
        let mut config = EngineConfig::default();
        config.max_affected_records = 1;
        let matched = vec![row("a"), row("b"), row("c")];
        let result = dry_run(BatchOperation::Delete, "widgets", "x==1", &matched, "id", &config);
        assert_eq!(result.count, 3);
        assert!(result.truncated);
        assert_eq!(result.token.affected_ids().len(), 1);
    }
}
