//! # Error Handling
//!
//! Failure taxonomy shared by both emulators. Every failure surfaced by a
//! core operation maps to exactly one of these kinds; the transport adapters
//! translate them to gRPC status codes or HTTP responses.

use thiserror::Error;

/// Result type alias for emulator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for the Nimbus emulators
#[derive(Error, Debug)]
pub enum Error {
    #[error("{what} {name:?} not found")]
    NotFound { what: &'static str, name: String },

    #[error("{what} {name:?} already exists")]
    AlreadyExists { what: &'static str, name: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("precondition failed: {message}")]
    FailedPrecondition { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound { what, name: name.into() }
    }

    pub fn already_exists(what: &'static str, name: impl Into<String>) -> Self {
        Error::AlreadyExists { what, name: name.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument { message: message.into() }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Error::FailedPrecondition { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal { message: message.into() }
    }

    /// The gRPC-style status code name for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "NOT_FOUND",
            Error::AlreadyExists { .. } => "ALREADY_EXISTS",
            Error::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Error::FailedPrecondition { .. } => "FAILED_PRECONDITION",
            Error::Internal { .. } => "INTERNAL",
            Error::Cancelled => "CANCELLED",
            Error::Io { .. } => "INTERNAL",
        }
    }

    /// The numeric gRPC status code for this error.
    pub fn grpc_code(&self) -> i32 {
        match self {
            Error::NotFound { .. } => 5,
            Error::AlreadyExists { .. } => 6,
            Error::InvalidArgument { .. } => 3,
            Error::FailedPrecondition { .. } => 9,
            Error::Internal { .. } | Error::Io { .. } => 13,
            Error::Cancelled => 1,
        }
    }

    /// The HTTP status the JSON transport reports for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::AlreadyExists { .. } => 409,
            Error::InvalidArgument { .. } => 400,
            Error::FailedPrecondition { .. } => 412,
            Error::Internal { .. } | Error::Io { .. } => 500,
            Error::Cancelled => 499,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io { message: err.to_string(), source: err }
    }
}
