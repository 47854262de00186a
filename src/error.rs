use thiserror::Error;

/// Error kinds produced by the engine, one family per §7 error kind.
///
/// `code()` returns the stable machine-readable code clients switch on
/// without parsing `detail` (see `problem::Problem`).
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unauthorised: {0}")]
    Unauthorised(String),

    #[error("filter parse error at byte {position}: {message}")]
    FilterParse {
        position: usize,
        message: String,
        parsed_so_far: String,
        suggestion: Option<String>,
    },

    #[error("unknown field: {0}")]
    UnknownField(String),

    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("field not allowed: {0}")]
    DisallowedField(String),

    #[error("operator not allowed: {0}")]
    DisallowedOperator(String),

    #[error("filter too complex: {0}")]
    ComplexityExceeded(String),

    #[error("cursor invalid: {0}")]
    CursorInvalid(String),

    #[error("cursor expired")]
    CursorExpired,

    #[error("idempotency mismatch: {0}")]
    IdempotencyMismatch(String),

    #[error("batch limit exceeded: {0}")]
    BatchLimitExceeded(String),

    #[error("search unavailable: {0}")]
    SearchUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code, e.g. `FILTER_PARSE_ERROR`, `CURSOR_EXPIRED`.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::RateLimited(_) => "RATE_LIMITED",
            EngineError::Forbidden(_) => "FORBIDDEN",
            EngineError::Unauthorised(_) => "UNAUTHORISED",
            EngineError::FilterParse { .. } => "FILTER_PARSE_ERROR",
            EngineError::UnknownField(_) => "FILTER_UNKNOWN_FIELD",
            EngineError::UnknownOperator(_) => "FILTER_UNKNOWN_OPERATOR",
            EngineError::DisallowedField(_) => "FILTER_DISALLOWED_FIELD",
            EngineError::DisallowedOperator(_) => "FILTER_DISALLOWED_OPERATOR",
            EngineError::ComplexityExceeded(_) => "FILTER_COMPLEXITY_EXCEEDED",
            EngineError::CursorInvalid(_) => "CURSOR_INVALID",
            EngineError::CursorExpired => "CURSOR_EXPIRED",
            EngineError::IdempotencyMismatch(_) => "IDEMPOTENCY_MISMATCH",
            EngineError::BatchLimitExceeded(_) => "BATCH_LIMIT_EXCEEDED",
            EngineError::SearchUnavailable(_) => "SEARCH_UNAVAILABLE",
            EngineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// HTTP status that a caller should map this error to.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::Validation(_)
            | EngineError::FilterParse { .. }
            | EngineError::UnknownField(_)
            | EngineError::UnknownOperator(_)
            | EngineError::DisallowedField(_)
            | EngineError::DisallowedOperator(_)
            | EngineError::ComplexityExceeded(_)
            | EngineError::CursorInvalid(_) => 400,
            EngineError::Unauthorised(_) => 401,
            EngineError::Forbidden(_) => 403,
            EngineError::NotFound(_) => 404,
            EngineError::PreconditionFailed(_) | EngineError::CursorExpired => 412,
            EngineError::Conflict(_) | EngineError::IdempotencyMismatch(_) => 409,
            EngineError::BatchLimitExceeded(_) => 413,
            EngineError::RateLimited(_) => 429,
            EngineError::SearchUnavailable(_) => 503,
            EngineError::Internal(_) => 500,
        }
    }

    /// Whether this error is recoverable at the edge (§7 propagation policy):
    /// turned into an actionable structured response rather than an opaque 5xx.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Validation(format!("malformed JSON: {e}"))
    }
}
