//! Error types for fifo-gatherer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("scenario error: {0}")]
    Scenario(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why a single item's callback did not complete.
///
/// Only the failing item is affected; the worker moves on to the next one.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// A fallible callback returned `Err`.
    #[error("callback failed: {0:#}")]
    Failed(anyhow::Error),

    /// The callback panicked. Carries the panic message when it was a string.
    #[error("callback panicked: {0}")]
    Panicked(String),
}

impl CallbackError {
    /// Short stable label for logs and metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            CallbackError::Failed(_) => "failed",
            CallbackError::Panicked(_) => "panicked",
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(msg) = payload.downcast_ref::<&'static str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "unknown panic".to_string()
        };
        CallbackError::Panicked(msg)
    }
}
