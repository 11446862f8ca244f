use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::worker::WorkerId;

/// Message shown to clients in place of the detail of a fatal error.
pub const GENERIC_FATAL_MESSAGE: &str = "Internal error, please contact the administrator";

/// Closed taxonomy of error kinds surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    IllegalArgument,
    FileDoesNotExist,
    TransferError,
    SanityCheck,
    UnknownError,
    ShouldNotReachHere,
}

impl ErrorCode {
    /// Fatal kinds indicate a broken internal invariant and raise an alert.
    pub const fn is_fatal(self) -> bool {
        match self {
            ErrorCode::IllegalArgument | ErrorCode::FileDoesNotExist | ErrorCode::TransferError => {
                false
            }
            ErrorCode::SanityCheck | ErrorCode::UnknownError | ErrorCode::ShouldNotReachHere => {
                true
            }
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::IllegalArgument => "ILLEGAL_ARGUMENT",
            ErrorCode::FileDoesNotExist => "FILE_DOES_NOT_EXIST",
            ErrorCode::TransferError => "TRANSFER_ERROR",
            ErrorCode::SanityCheck => "SANITY_CHECK",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
            ErrorCode::ShouldNotReachHere => "SHOULD_NOT_REACH_HERE",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum PlaneError {
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("File does not exist: {0}")]
    FileDoesNotExist(Uuid),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Sanity check failed: {0}")]
    SanityCheck(String),

    #[error("Unexpected error: {0}")]
    Unknown(String),

    #[error("Should not reach here: {0}")]
    ShouldNotReachHere(String),
}

impl PlaneError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PlaneError::IllegalArgument(_)
            | PlaneError::JobNotFound(_)
            | PlaneError::WorkerNotFound(_) => ErrorCode::IllegalArgument,
            PlaneError::FileDoesNotExist(_) => ErrorCode::FileDoesNotExist,
            PlaneError::Transfer(_) => ErrorCode::TransferError,
            PlaneError::SanityCheck(_) => ErrorCode::SanityCheck,
            PlaneError::Unknown(_) => ErrorCode::UnknownError,
            PlaneError::ShouldNotReachHere(_) => ErrorCode::ShouldNotReachHere,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }

    /// Message suitable for a client. Fatal errors hide their detail, which is
    /// only logged and alerted internally.
    pub fn client_message(&self) -> String {
        if self.is_fatal() {
            GENERIC_FATAL_MESSAGE.to_string()
        } else {
            self.to_string()
        }
    }
}

pub type Result<T> = std::result::Result<T, PlaneError>;
