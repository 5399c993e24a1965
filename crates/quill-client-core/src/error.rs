use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

/// Error code the backend attaches to a 403 caused by a missing or stale
/// anti-forgery token. Only this code triggers the one-shot refresh-retry.
pub const CSRF_REJECTED_CODE: &str = "invalid_csrf_token";

/// Outcome taxonomy for every API call. Variants are clonable so a single
/// failed in-flight operation can fan out to every caller that joined it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The transport never reached the server (DNS, refused connection,
    /// mid-body disconnect). Never retried automatically by the executor.
    #[error("network error: {message}")]
    Network { message: String },
    /// Credential rejected after the single refresh attempt, or any other
    /// 401/403.
    #[error("request not authorized: {message}")]
    AuthRejected { message: String },
    /// 400/422 with optional per-field detail for UI display.
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        field_errors: HashMap<String, Vec<String>>,
    },
    #[error("not found: {message}")]
    NotFound { message: String },
    /// 5xx. Callers decide whether a manual retry makes sense.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    /// A 2xx response whose body could not be decoded.
    #[error("response decode failed: {message}")]
    Decode { message: String },
    #[error("invalid url: {message}")]
    InvalidUrl { message: String },
    /// Streaming reconnect budget exhausted. Terminal for the session.
    #[error("stream lost after {attempts} reconnect attempts")]
    StreamExhausted { attempts: u32 },
}

/// Error envelope the backend returns on non-2xx statuses:
/// `{"message", "error": {"code", "message"}, "errors": {field: [messages]}}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorEnvelope {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<ApiErrorDetail>,
    #[serde(default)]
    pub errors: Option<HashMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiErrorEnvelope {
    pub fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    pub fn code(&self) -> Option<&str> {
        self.error.as_ref().and_then(|detail| detail.code.as_deref())
    }

    pub fn display_message(&self, fallback: &str) -> String {
        self.error
            .as_ref()
            .and_then(|detail| detail.message.clone())
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| fallback.to_string())
    }
}

/// True when the response is the specific credential rejection that warrants
/// one transparent token refresh, as opposed to a genuine authorization
/// failure.
pub fn is_credential_rejection(status: u16, body: &[u8]) -> bool {
    status == 403 && ApiErrorEnvelope::parse(body).code() == Some(CSRF_REJECTED_CODE)
}

/// Map a non-2xx response to the error taxonomy.
pub fn classify_status(status: u16, body: &[u8]) -> ApiError {
    let envelope = ApiErrorEnvelope::parse(body);
    match status {
        400 | 422 => ApiError::Validation {
            message: envelope.display_message("request validation failed"),
            field_errors: envelope.errors.clone().unwrap_or_default(),
        },
        401 | 403 => ApiError::AuthRejected {
            message: envelope.display_message("request not authorized"),
        },
        404 => ApiError::NotFound {
            message: envelope.display_message("resource not found"),
        },
        status if status >= 500 => ApiError::Server {
            status,
            message: envelope.display_message("server error"),
        },
        status => ApiError::Server {
            status,
            message: envelope.display_message("unexpected response status"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_validation_with_field_detail() {
        let body = br#"{
            "message": "Validation failed.",
            "error": {"code": "invalid_request", "message": "Validation failed."},
            "errors": {"title": ["must not be blank"]}
        }"#;
        let error = classify_status(422, body);
        let ApiError::Validation {
            message,
            field_errors,
        } = error
        else {
            panic!("expected validation error, got {error:?}");
        };
        assert_eq!(message, "Validation failed.");
        assert_eq!(
            field_errors.get("title").map(Vec::as_slice),
            Some(["must not be blank".to_string()].as_slice())
        );
    }

    #[test]
    fn classifies_status_families() {
        assert!(matches!(
            classify_status(404, b"{}"),
            ApiError::NotFound { .. }
        ));
        assert!(matches!(
            classify_status(401, b"{}"),
            ApiError::AuthRejected { .. }
        ));
        assert!(matches!(
            classify_status(503, b"not json"),
            ApiError::Server { status: 503, .. }
        ));
    }

    #[test]
    fn credential_rejection_requires_matching_code() {
        let credential = br#"{"error": {"code": "invalid_csrf_token", "message": "stale token"}}"#;
        assert!(is_credential_rejection(403, credential));

        let plain_forbidden = br#"{"error": {"code": "forbidden", "message": "no access"}}"#;
        assert!(!is_credential_rejection(403, plain_forbidden));
        assert!(!is_credential_rejection(401, credential));
        assert!(!is_credential_rejection(403, b"<html>not json</html>"));
    }

    #[test]
    fn envelope_message_falls_back_in_order() {
        let detail_wins = ApiErrorEnvelope::parse(
            br#"{"message": "outer", "error": {"message": "inner"}}"#,
        );
        assert_eq!(detail_wins.display_message("fallback"), "inner");

        let outer_only = ApiErrorEnvelope::parse(br#"{"message": "outer"}"#);
        assert_eq!(outer_only.display_message("fallback"), "outer");

        let empty = ApiErrorEnvelope::parse(b"");
        assert_eq!(empty.display_message("fallback"), "fallback");
    }
}
