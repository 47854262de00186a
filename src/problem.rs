// Structured problem documents (§6 Errors, §7 Error Handling Design).

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// RFC-7807-shaped problem document returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

impl Problem {
    /// Build a problem document from an engine error. `debug_mode` controls
    /// whether internal errors carry their detail (production: opaque).
    pub fn from_error(err: &EngineError, instance: Option<String>, debug_mode: bool) -> Self {
        let code = err.code();
        let status = err.status();
        let detail = if matches!(err, EngineError::Internal(_)) && !debug_mode {
            "an internal error occurred".to_string()
        } else {
            err.to_string()
        };
        let debug = if matches!(err, EngineError::Internal(_)) && debug_mode {
            Some(err.to_string())
        } else {
            None
        };
        Problem {
            kind: format!("https://errors.livequery.dev/{}", code.to_lowercase()),
            title: title_for(err),
            status,
            detail,
            code,
            instance,
            errors: None,
            debug,
        }
    }
}

fn title_for(err: &EngineError) -> String {
    match err {
        EngineError::FilterParse { suggestion, .. } => match suggestion {
            Some(s) => format!("Filter parse error: {s}"),
            None => "Filter parse error".to_string(),
        },
        _ => err.code().replace('_', " ").to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_are_opaque_outside_debug_mode() {
        let err = EngineError::Internal("leaked secret path /etc/shadow".to_string());
        let problem = Problem::from_error(&err, None, false);
        assert_eq!(problem.code, "INTERNAL_ERROR");
        assert!(!problem.detail.contains("secret"));
        assert!(problem.debug.is_none());
    }

    #[test]
    fn internal_errors_carry_debug_detail_in_debug_mode() {
        let err = EngineError::Internal("boom".to_string());
        let problem = Problem::from_error(&err, None, true);
        assert!(problem.debug.unwrap().contains("boom"));
    }

    #[test]
    fn recoverable_errors_carry_full_detail() {
        let err = EngineError::CursorExpired;
        let problem = Problem::from_error(&err, None, false);
        assert_eq!(problem.status, 412);
        assert_eq!(problem.code, "CURSOR_EXPIRED");
    }
}
