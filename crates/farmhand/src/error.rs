use thiserror::Error;

use farmhand_proto::{ProtoError, WireError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{message}")]
    Config { message: String },

    #[error("Cannot add a worker call if worker farm is ending")]
    Ending,

    #[error("worker farm ended before the call completed")]
    FarmEnded,

    #[error("unknown handle `{id}`")]
    UnknownHandle { id: u64 },

    #[error("unknown location `{location}`")]
    UnknownLocation { location: String },

    #[error("unknown method `{method}`")]
    UnknownMethod { method: String },

    #[error("{operation} failed: {details}")]
    Operation {
        operation: &'static str,
        details: String,
    },

    #[error(transparent)]
    Call(#[from] WireError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn unknown_handle(id: u64) -> Self {
        Self::UnknownHandle { id }
    }

    pub fn unknown_location(location: impl Into<String>) -> Self {
        Self::UnknownLocation {
            location: location.into(),
        }
    }

    pub fn unknown_method(method: impl Into<String>) -> Self {
        Self::UnknownMethod {
            method: method.into(),
        }
    }

    pub fn operation(operation: &'static str, details: impl Into<String>) -> Self {
        Self::Operation {
            operation,
            details: details.into(),
        }
    }

    /// Collapse a user-code failure to the form it takes on the wire, so
    /// local and remote invocations reject identically.
    pub(crate) fn user(err: anyhow::Error) -> Self {
        Self::Call(WireError::new(format!("{err:#}")))
    }
}
