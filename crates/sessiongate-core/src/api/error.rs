use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The refresh attempt failed; the session has been cleared.
    #[error("Session expired - please sign in again")]
    SessionExpired,

    /// Authenticated but not allowed. Refreshing cannot fix this.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A 401 outside the refresh path, such as a rejected login.
    #[error("Unauthorized - invalid credentials")]
    Unauthorized,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    /// The request never got a response.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Broad error categories for deciding what to show the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Auth,
    Permission,
    NotFound,
    Server,
    Network,
    Unknown,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            400 => ApiError::Validation(truncated),
            401 => ApiError::Unauthorized,
            403 => ApiError::PermissionDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Validation(_) => ErrorKind::Validation,
            ApiError::SessionExpired | ApiError::Unauthorized => ErrorKind::Auth,
            ApiError::PermissionDenied(_) => ErrorKind::Permission,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::ServerError(_) => ErrorKind::Server,
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::RateLimited | ApiError::InvalidResponse(_) => ErrorKind::Unknown,
        }
    }

    /// A sentence suitable for showing to the user.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "Please check your input data",
            ErrorKind::Auth => "Please log in again",
            ErrorKind::Permission => "You do not have permission to perform this action",
            ErrorKind::NotFound => "The requested resource was not found",
            ErrorKind::Server => "Server error. Please try again later",
            ErrorKind::Network => "Network error. Please check your connection",
            ErrorKind::Unknown => "An unexpected error occurred",
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}
