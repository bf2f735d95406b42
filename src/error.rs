//! Crate-wide error type.
//!
//! Mirrors the taxonomy described for the management and ingest surfaces:
//! every error carries a stable `ErrorKind` plus a human description, and
//! can be turned into the `{"error": {"code": ..., "description": ...}}`
//! envelope used by the management request/reply surface. `Error` also
//! composes with `std::io::Error` so storage failures propagate with `?`
//! the same way the rest of the crate's I/O does.

use std::fmt;
use std::io;

use serde::Serialize;

/// The stable error taxonomy. Names match the vocabulary used throughout
/// the management surface and the ingest/consumer-add rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SubjectInvalid,
    SubjectsOverlap,
    StreamNameInvalid,
    StreamConfigInvalid,
    StreamNotFound,
    StreamAlreadyExists,
    MessageTooLarge,
    MaxMessagesExceeded,
    MaxBytesExceeded,
    MaxConsumersExceeded,
    AccountResourceExhausted,
    ConsumerConfigInvalid,
    ConsumerNotFound,
    DeliverSubjectNotInterest,
    NotFound,
    DuplicatePublish,
    RestoreSubscriptionClosed,
    Storage,
}

impl ErrorKind {
    /// HTTP-style status code surfaced in management responses (§7).
    pub fn code(self) -> u16 {
        use ErrorKind::*;
        match self {
            StreamNotFound | ConsumerNotFound | NotFound => 404,
            RestoreSubscriptionClosed => 409,
            Storage => 500,
            SubjectInvalid
            | SubjectsOverlap
            | StreamNameInvalid
            | StreamConfigInvalid
            | StreamAlreadyExists
            | MessageTooLarge
            | MaxMessagesExceeded
            | MaxBytesExceeded
            | MaxConsumersExceeded
            | AccountResourceExhausted
            | ConsumerConfigInvalid
            | DeliverSubjectNotInterest
            | DuplicatePublish => 400,
        }
    }
}

/// The crate's error type: a stable kind plus a human-readable message.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    description: String,
}

impl Error {
    pub fn new<S: Into<String>>(kind: ErrorKind, description: S) -> Error {
        Error {
            kind,
            description: description.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Render as the `-ERR '<reason>'` ingest rejection body (§6).
    pub fn as_pub_reject(&self) -> String {
        format!("-ERR '{}'", self.description)
    }

    /// Render as the management JSON error envelope (§6).
    pub fn as_envelope(&self) -> ApiErrorEnvelope {
        ApiErrorEnvelope {
            error: ApiError {
                code: self.kind.code(),
                description: self.description.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: u16,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorEnvelope {
    pub error: ApiError,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.description)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::new(ErrorKind::Storage, e.to_string())
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::new(ErrorKind::Storage, format!("json: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

macro_rules! err {
    ($kind:ident, $($arg:tt)*) => {
        $crate::error::Error::new($crate::error::ErrorKind::$kind, format!($($arg)*))
    };
}

pub(crate) use err;
