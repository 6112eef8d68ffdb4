use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Malformed input from calling code. Never recovered from silently.
    #[error("Invalid input: {0}")]
    Validation(String),
}
