use thiserror::Error;

use crate::api::ApiError;

/// Message shown when the provider gives no `detail`.
pub const GENERIC_FAILURE_MESSAGE: &str = "Something went wrong";

/// A failed refresh exchange.
///
/// Clone because one refresh result is handed to every request waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Refresh token rejected (status {status}): {}", .detail.as_deref().unwrap_or("no detail"))]
    Rejected { status: u16, detail: Option<String> },

    #[error("Refresh endpoint unavailable (status {status})")]
    Unavailable { status: u16 },

    #[error("Network error during refresh: {0}")]
    Network(String),

    #[error("Invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("Failed to persist refreshed credentials: {0}")]
    Persist(String),

    #[error("Session changed while refresh was in flight")]
    SessionChanged,

    #[error("Refresh task did not complete: {0}")]
    Interrupted(String),
}

impl RefreshError {
    /// True when the issuer itself refused the refresh token
    pub fn is_rejection(&self) -> bool {
        matches!(self, RefreshError::Rejected { .. })
    }
}

impl From<ApiError> for RefreshError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::NetworkError(e) => RefreshError::Network(e.to_string()),
            ApiError::InvalidResponse(msg) => RefreshError::InvalidResponse(msg),
            ApiError::BadRequest(_) | ApiError::Unauthorized(_) | ApiError::AccessDenied(_) => {
                RefreshError::Rejected {
                    status: err.status().unwrap_or_default(),
                    detail: err.detail().map(str::to_string),
                }
            }
            // Throttling, outages and unexpected statuses say nothing about the token
            other => RefreshError::Unavailable {
                status: other.status().unwrap_or_default(),
            },
        }
    }
}

/// Login or registration refused. Carries a message fit for the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AuthRequestFailure {
    pub message: String,
}

impl AuthRequestFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn generic() -> Self {
        Self::new(GENERIC_FAILURE_MESSAGE)
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Provider-reported errors keep their `detail`; everything else is generic.
impl From<&ApiError> for AuthRequestFailure {
    fn from(err: &ApiError) -> Self {
        match err.detail() {
            Some(detail) => Self::new(detail),
            None => Self::generic(),
        }
    }
}
