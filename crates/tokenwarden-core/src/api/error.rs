use serde::Deserialize;
use thiserror::Error;

use crate::auth::RefreshError;

/// Body of a non-success response from the identity provider or API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub status: u16,
    /// The provider's human-readable `detail` field, when present
    pub detail: Option<String>,
    /// Raw body, truncated
    pub body: String,
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.detail {
            Some(ref detail) => f.write_str(detail),
            None => f.write_str(&self.body),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProviderErrorPayload {
    detail: Option<String>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(ErrorBody),

    #[error("Unauthorized: {0}")]
    Unauthorized(ErrorBody),

    #[error("Access denied: {0}")]
    AccessDenied(ErrorBody),

    #[error("Resource not found: {0}")]
    NotFound(ErrorBody),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(ErrorBody),

    #[error("Unexpected response: {0}")]
    UnexpectedStatus(ErrorBody),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Failure of a request made through `ApiClient`.
#[derive(Error, Debug)]
pub enum RequestError {
    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RequestError {
    pub fn storage(err: anyhow::Error) -> Self {
        RequestError::Storage(format!("{:#}", err))
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Pull `detail` out of a `{ "detail": "...", ... }` payload.
    fn extract_detail(body: &str) -> Option<String> {
        serde_json::from_str::<ProviderErrorPayload>(body)
            .ok()
            .and_then(|p| p.detail)
            .filter(|d| !d.is_empty())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let error_body = ErrorBody {
            status: status.as_u16(),
            detail: Self::extract_detail(body),
            body: Self::truncate_body(body),
        };
        match status.as_u16() {
            400 => ApiError::BadRequest(error_body),
            401 => ApiError::Unauthorized(error_body),
            403 => ApiError::AccessDenied(error_body),
            404 => ApiError::NotFound(error_body),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(error_body),
            _ => ApiError::UnexpectedStatus(error_body),
        }
    }

    fn body(&self) -> Option<&ErrorBody> {
        match self {
            ApiError::BadRequest(b)
            | ApiError::Unauthorized(b)
            | ApiError::AccessDenied(b)
            | ApiError::NotFound(b)
            | ApiError::ServerError(b)
            | ApiError::UnexpectedStatus(b) => Some(b),
            ApiError::RateLimited | ApiError::NetworkError(_) | ApiError::InvalidResponse(_) => {
                None
            }
        }
    }

    /// HTTP status, if the server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::RateLimited => Some(429),
            ApiError::NetworkError(e) => e.status().map(|s| s.as_u16()),
            other => other.body().map(|b| b.status),
        }
    }

    /// The provider's `detail` message, if it sent one
    pub fn detail(&self) -> Option<&str> {
        self.body().and_then(|b| b.detail.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_mapping() {
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_REQUEST, "{}"),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::UNAUTHORIZED, ""),
            ApiError::Unauthorized(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ApiError::RateLimited
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY, "upstream"),
            ApiError::ServerError(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::IM_A_TEAPOT, ""),
            ApiError::UnexpectedStatus(_)
        ));
    }

    #[test]
    fn test_detail_extraction() {
        let err = ApiError::from_status(
            StatusCode::UNAUTHORIZED,
            r#"{"detail":"No active account found with the given credentials","code":"x"}"#,
        );
        assert_eq!(
            err.detail(),
            Some("No active account found with the given credentials")
        );
        assert_eq!(err.status(), Some(401));
        assert_eq!(
            err.to_string(),
            "Unauthorized: No active account found with the given credentials"
        );

        let err = ApiError::from_status(StatusCode::BAD_REQUEST, r#"{"email":["taken"]}"#);
        assert_eq!(err.detail(), None);

        let err = ApiError::from_status(StatusCode::BAD_REQUEST, "<html>oops</html>");
        assert_eq!(err.detail(), None);
        assert_eq!(err.to_string(), "Bad request: <html>oops</html>");
    }

    #[test]
    fn test_truncate_body() {
        let long = "é".repeat(400);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.contains("truncated, 800 total bytes"));
    }
}
