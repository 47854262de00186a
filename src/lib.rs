//! Declarative resource framework: relational tables exposed as
//! HTTP/SSE endpoints with live-query semantics — clients filter a
//! resource once and receive `existing`/`added`/`changed`/`removed`
//! events as the underlying rows enter, change within, or leave that
//! filter's result set.
//!
//! Module map mirrors the component breakdown this engine is designed
//! against: [`filter`] compiles and evaluates the predicate language,
//! [`changelog`] is the append-only mutation log subscriptions resume
//! against, [`cursor`] encodes keyset pagination positions,
//! [`subscription`] tracks each live query's matching-id ground truth,
//! [`router`] diffs mutations against that ground truth and emits
//! events, [`pipeline`] wraps every write with imaging and routing,
//! [`batch`] is the two-phase filter-scoped bulk update/delete
//! protocol, and [`stream`] drives SSE connect/resume/disconnect.

pub mod api;
pub mod batch;
pub mod changelog;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod filter;
pub mod kv;
pub mod metrics;
pub mod pipeline;
pub mod problem;
pub mod router;
pub mod schema;
pub mod signing;
pub mod stream;
pub mod subscription;
pub mod value;

pub use config::EngineConfig;
pub use error::{EngineError, Result};

/// Crate version, surfaced in the `/healthz` response and startup log line.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
