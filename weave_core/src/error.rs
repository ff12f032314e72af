//! Error taxonomy shared across the runtime.
//!
//! Every error carries an integer code (stable across the wire and the query
//! surface) and a human-readable message. Library code returns
//! `Result<_, WeaveError>`; state-transition preconditions are checked up
//! front and reported through the same type rather than panicking.

use serde::{Deserialize, Serialize};

/// The distinct failure kinds a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorKind {
    #[error("connection failure")]
    ConnectionFailure,
    #[error("registration failure")]
    RegistrationFailure,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid function call")]
    InvalidFunctionCall,
    #[error("invalid state transition")]
    InvalidStateTransition,
    #[error("invalid object")]
    InvalidObject,
    #[error("execution failure")]
    ExecutionFailure,
    #[error("value discarded")]
    Discarded,
    #[error("timeout")]
    Timeout,
    #[error("system failure")]
    SystemFailure,
    #[error("user abort")]
    UserAbort,
    #[error("external error")]
    ExternalType,
    #[error("error")]
    Other,
}

impl ErrorKind {
    /// Stable integer code, carried in error action messages and query replies.
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::RegistrationFailure => -1,
            ErrorKind::ConnectionFailure => -2,
            ErrorKind::InvalidObject => -3,
            ErrorKind::InvalidArgument => -4,
            ErrorKind::Discarded => -5,
            ErrorKind::SystemFailure => -6,
            ErrorKind::InvalidStateTransition => -9,
            ErrorKind::InvalidFunctionCall => -10,
            ErrorKind::ExecutionFailure => -14,
            ErrorKind::Timeout => -24,
            ErrorKind::UserAbort => -27,
            ErrorKind::ExternalType => -203,
            ErrorKind::Other => -101,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => ErrorKind::RegistrationFailure,
            -2 => ErrorKind::ConnectionFailure,
            -3 => ErrorKind::InvalidObject,
            -4 => ErrorKind::InvalidArgument,
            -5 => ErrorKind::Discarded,
            -6 => ErrorKind::SystemFailure,
            -9 => ErrorKind::InvalidStateTransition,
            -10 => ErrorKind::InvalidFunctionCall,
            -14 => ErrorKind::ExecutionFailure,
            -24 => ErrorKind::Timeout,
            -27 => ErrorKind::UserAbort,
            -203 => ErrorKind::ExternalType,
            _ => ErrorKind::Other,
        }
    }
}

/// An error kind plus context. The `Display` form is what lands in logs and
/// query replies.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct WeaveError {
    pub kind: ErrorKind,
    pub message: String,
}

impl WeaveError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        WeaveError {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailure, message)
    }

    pub fn registration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RegistrationFailure, message)
    }

    pub fn invalid_call(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidFunctionCall, message)
    }
}

impl From<ErrorKind> for WeaveError {
    fn from(kind: ErrorKind) -> Self {
        WeaveError {
            kind,
            message: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for kind in [
            ErrorKind::ConnectionFailure,
            ErrorKind::RegistrationFailure,
            ErrorKind::InvalidArgument,
            ErrorKind::InvalidFunctionCall,
            ErrorKind::InvalidStateTransition,
            ErrorKind::InvalidObject,
            ErrorKind::ExecutionFailure,
            ErrorKind::Discarded,
            ErrorKind::Timeout,
            ErrorKind::SystemFailure,
            ErrorKind::UserAbort,
            ErrorKind::ExternalType,
            ErrorKind::Other,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
    }
}
