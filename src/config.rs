// Process-wide configuration, passed by `Arc` through constructors rather
// than read from a global singleton (§9 Design Note: "Global mutable KV
// singleton").

use std::sync::Arc;

/// Engine-wide configuration. Cheap to clone; share via `Arc<EngineConfig>`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // --- Filter Engine (§4.A) ---
    pub max_expression_length: usize,
    pub max_filter_depth: usize,
    pub max_atomic_nodes: usize,
    pub filter_cache_capacity: usize,

    // --- Changelog (§4.B) ---
    pub changelog_retention: usize,

    // --- Pagination Cursors (§4.C) ---
    pub cursor_version: u32,
    pub cursor_max_age_secs: i64,

    // --- Batch Confirm Protocol (§4.G) ---
    pub max_affected_records: usize,
    pub confirm_token_ttl_secs: i64,

    // --- Resumable Stream Manager (§4.H) ---
    pub heartbeat_ms: u64,
    pub max_queue_bytes: usize,
    pub max_subscriptions_per_user: usize,
    pub max_subscriptions_per_ip: usize,

    // --- include relation loading (§9 Design Note, supplemented §2) ---
    pub max_include_depth: usize,

    // --- server secret (§6 cursor/confirm-token signing) ---
    pub server_secret: Arc<[u8]>,

    // --- ambient: whether internal-error detail is surfaced (§7) ---
    pub debug_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_expression_length: 4096,
            max_filter_depth: 10,
            max_atomic_nodes: 100,
            filter_cache_capacity: 1000,

            changelog_retention: 10_000,

            cursor_version: 1,
            cursor_max_age_secs: 24 * 3600,

            max_affected_records: 10_000,
            confirm_token_ttl_secs: 300,

            heartbeat_ms: 20_000,
            max_queue_bytes: 1024 * 1024,
            max_subscriptions_per_user: 100,
            max_subscriptions_per_ip: 200,

            max_include_depth: 3,

            server_secret: generate_process_secret(),

            debug_mode: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset. Mirrors the teacher's `Config`/
    /// `DatabaseConfig` env-driven construction in `main.rs`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("LQ_CHANGELOG_RETENTION") {
            if let Ok(n) = v.parse() {
                cfg.changelog_retention = n;
            }
        }
        if let Ok(v) = std::env::var("LQ_MAX_AFFECTED_RECORDS") {
            if let Ok(n) = v.parse() {
                cfg.max_affected_records = n;
            }
        }
        if let Ok(v) = std::env::var("LQ_HEARTBEAT_MS") {
            if let Ok(n) = v.parse() {
                cfg.heartbeat_ms = n;
            }
        }
        if let Ok(v) = std::env::var("LQ_DEBUG_MODE") {
            cfg.debug_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("LQ_SERVER_SECRET") {
            cfg.server_secret = v.into_bytes().into();
        } else {
            tracing::warn!(
                "LQ_SERVER_SECRET not set; generated a random secret for this process. \
                 Cursors and confirm tokens will not survive a restart (see SPEC_FULL.md Open Questions)."
            );
        }
        cfg
    }
}

/// 256-bit random secret generated at startup when none is configured.
/// Intentional per §9 Open Questions: treated as configurable but flagged —
/// this does not survive process restart.
fn generate_process_secret() -> Arc<[u8]> {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    Arc::from(bytes.to_vec())
}
