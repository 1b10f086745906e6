use forge::prelude::*;

/// Internal error taxonomy for the window engine, rate limiter, flow engine,
/// dispatcher, inbound processor, and watchdog. Collapsed onto `ForgeError`'s
/// three variants at every `forge::query`/`mutation`/`daemon` boundary, the
/// same way the teacher's service traits collapse `anyhow::Error` there.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("authorization: {0}")]
    Authorization(String),
    #[error("window closed: {0}")]
    WindowClosed(String),
    #[error("conversation not dispatchable: {0}")]
    ConversationNotDispatchable(String),
    #[error("rate limited: retry after {retry_after_seconds}s ({reason})")]
    RateLimited {
        reason: String,
        retry_after_seconds: u64,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),
    #[error("upstream permanent error: {0}")]
    UpstreamPermanent(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}

impl From<CoreError> for ForgeError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Validation(msg) => ForgeError::Validation(msg),
            CoreError::NotFound(msg) => ForgeError::Validation(msg),
            CoreError::Authorization(msg) => ForgeError::Validation(msg),
            CoreError::WindowClosed(msg) => ForgeError::Validation(msg),
            CoreError::ConversationNotDispatchable(msg) => ForgeError::Validation(msg),
            CoreError::RateLimited {
                reason,
                retry_after_seconds,
            } => ForgeError::Validation(format!("rate limited ({reason}), retry after {retry_after_seconds}s")),
            CoreError::Conflict(msg) => ForgeError::Database(msg),
            CoreError::UpstreamTransient(msg) => ForgeError::Internal(msg),
            CoreError::UpstreamPermanent(msg) => ForgeError::Internal(msg),
            CoreError::Internal(msg) => ForgeError::Internal(msg),
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
