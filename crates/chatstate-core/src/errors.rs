use crate::domain::{ChatId, ChatKind};

/// Core error type for the dispatch engine.
///
/// Adapter crates map their transport errors into [`Error::Platform`] so the
/// engine can treat every outbound failure the same way (log, never crash the
/// dispatch loop).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    #[error("no handler class registered for {kind} chat {chat_id}")]
    Unroutable { chat_id: ChatId, kind: ChatKind },

    #[error("handler failed in chat {chat_id} while handling {step}: {reason}")]
    HandlerExecution {
        chat_id: ChatId,
        step: String,
        reason: String,
    },

    #[error("dispatcher is stopped")]
    DispatcherStopped,

    #[error("platform error: {0}")]
    Platform(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Result type returned by application handler code.
pub type HandlerResult<T = ()> = anyhow::Result<T>;
