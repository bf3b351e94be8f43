//! Error handling logic.
//!

use crate::part::MAX_PARTS;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use std::fmt::{Display, Formatter};
use std::num::TryFromIntError;
use std::{error, io, result};
use thiserror::Error;
use tokio::task::JoinError;

/// The result type.
pub type Result<T> = result::Result<T, Error>;

/// Error types for resumable-transfer.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid parameter: {0}")]
    ParameterError(String),
    #[error("object requires {0} parts which exceeds the maximum of {max}", max = MAX_PARTS)]
    TooManyParts(u64),
    #[error("remote operation failed: {0}")]
    ApiError(ApiError),
    #[error("checksum mismatch: expected {expected:016x}, got {actual:016x}")]
    ChecksumMismatch { expected: u64, actual: u64 },
    #[error("checksum required for verification is missing: {0}")]
    MissingChecksum(String),
    #[error("performing IO: {0}")]
    IOError(String),
    #[error("writing checkpoint: {0}")]
    CheckpointError(String),
    #[error("{failed} of {total} parts failed, first error: {message}")]
    IncompleteTransfer {
        failed: usize,
        total: usize,
        message: String,
    },
    #[error("transfer was cancelled")]
    Cancelled,
    #[error("in concurrency logic: {0}")]
    ConcurrencyError(String),
    #[error("parsing: {0}")]
    ParseError(String),
    #[error("{source}, multipart session {session}")]
    TransferError {
        source: Box<Error>,
        session: SessionState,
    },
}

impl Error {
    /// Whether this error means the transfer can never succeed by retrying parts, e.g. access
    /// denied or a missing object.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ApiError(err) => err.is_fatal(),
            Self::TransferError { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// The state of the remote multipart session if this error came from an upload or copy.
    pub fn session(&self) -> Option<&SessionState> {
        match self {
            Self::TransferError { session, .. } => Some(session),
            _ => None,
        }
    }

    /// The underlying error, without any session information.
    pub fn inner(&self) -> &Error {
        match self {
            Self::TransferError { source, .. } => source.inner(),
            err => err,
        }
    }

    /// Attach the state of the multipart session to this error.
    pub fn with_session(self, session: SessionState) -> Self {
        match self {
            Self::TransferError { source, .. } => Self::TransferError { source, session },
            err => Self::TransferError {
                source: Box::new(err),
                session,
            },
        }
    }
}

/// What happened to a remote multipart session when a transfer failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// The session is still open and can be resumed using the same checkpoint.
    Open(String),
    /// The session was aborted and all uploaded parts were discarded.
    Aborted(String),
    /// The session was completed before the failure occurred.
    Completed(String),
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Open(id) => write!(f, "{id} left open for resuming"),
            SessionState::Aborted(id) => write!(f, "{id} aborted"),
            SessionState::Completed(id) => write!(f, "{id} completed"),
        }
    }
}

/// An error returned by the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    status: Option<u16>,
    code: Option<String>,
    message: String,
}

/// Error codes which mean that retrying will not help.
const FATAL_CODES: [&str; 7] = [
    "AccessDenied",
    "InvalidSecurity",
    "NoSuchKey",
    "NoSuchBucket",
    "NoSuchUpload",
    "NotFound",
    "MethodNotAllowed",
];

impl ApiError {
    /// Create a new API error.
    pub fn new(status: Option<u16>, code: Option<String>, message: String) -> Self {
        Self {
            status,
            code,
            message,
        }
    }

    /// Create an error from a status code and error code.
    pub fn from_status(status: u16, code: &str) -> Self {
        Self::new(Some(status), Some(code.to_string()), code.to_string())
    }

    /// Get the HTTP status.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Get the error code.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Access denied, not found and method not allowed errors cannot be fixed by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self.status, Some(403 | 404 | 405))
            || self
                .code
                .as_deref()
                .is_some_and(|code| FATAL_CODES.contains(&code))
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (self.status, &self.code) {
            (Some(status), Some(code)) => write!(f, "{status} {code}: {}", self.message),
            (Some(status), None) => write!(f, "{status}: {}", self.message),
            (None, Some(code)) => write!(f, "{code}: {}", self.message),
            (None, None) => f.write_str(&self.message),
        }
    }
}

impl<E> From<SdkError<E, HttpResponse>> for Error
where
    E: ProvideErrorMetadata + error::Error + Send + Sync + 'static,
{
    fn from(err: SdkError<E, HttpResponse>) -> Self {
        let status = err.raw_response().map(|response| response.status().as_u16());
        let code = err
            .as_service_error()
            .and_then(|err| err.code())
            .map(|code| code.to_string());

        Self::ApiError(ApiError::new(
            status,
            code,
            DisplayErrorContext(&err).to_string(),
        ))
    }
}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        Self::ConcurrencyError(err.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::IOError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::ParseError(err.to_string())
    }
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Self::ParseError(err.to_string())
    }
}
