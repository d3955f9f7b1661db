// error.rs — Two-tier error type shared by every module.
//
// Failures fall into two tiers that callers must be able to tell apart:
//
//   Fatal         the device is in an unknown state (allocation failure,
//                 kernel launch failure, validation error). The whole run
//                 must abort. No retry, no partial-result salvage.
//
//   Recoverable   this *problem* is unusable (missing map, bad format tag,
//                 malformed camera text). The caller may skip it and carry
//                 on with the rest of the batch.
//
// The library never terminates the process itself; it returns `Fatal` with
// the diagnostic and the call-site location and lets the binary decide.

use std::fmt;
use std::panic::Location;
use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MvsError>;

/// Top-level error: either the run must abort, or this problem is skipped.
#[derive(Debug, Error)]
pub enum MvsError {
    #[error("fatal: {0}")]
    Fatal(#[from] DeviceFailure),
    #[error("recoverable: {0}")]
    Recoverable(#[from] DataError),
}

impl MvsError {
    /// Build a fatal device error, recording the caller's source location.
    #[track_caller]
    pub fn device(operation: impl Into<String>, message: impl Into<String>) -> Self {
        MvsError::Fatal(DeviceFailure {
            operation: operation.into(),
            message: message.into(),
            location: Location::caller(),
        })
    }

    /// `true` if the whole run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MvsError::Fatal(_))
    }

    /// `true` if the caller can skip the affected problem and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MvsError::Recoverable(_))
    }

    /// The data-tier error, if this is one.
    pub fn as_data(&self) -> Option<&DataError> {
        match self {
            MvsError::Recoverable(e) => Some(e),
            MvsError::Fatal(_) => None,
        }
    }
}

/// A device-level failure. Device state is assumed corrupted afterwards.
#[derive(Debug)]
pub struct DeviceFailure {
    pub operation: String,
    pub message: String,
    pub location: &'static Location<'static>,
}

impl fmt::Display for DeviceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} in {} at {}:{}",
            self.message,
            self.operation,
            self.location.file(),
            self.location.line()
        )
    }
}

impl std::error::Error for DeviceFailure {}

/// A per-problem data failure.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: format tag {found} is not the float tag (1)")]
    BadFormatTag { path: PathBuf, found: i32 },

    #[error("{path}: expected {expected} channel(s), found {found}")]
    ChannelMismatch { path: PathBuf, expected: i32, found: i32 },

    #[error("{path}: {reason}")]
    Truncated { path: PathBuf, reason: String },

    #[error("malformed camera: {0}")]
    MalformedCamera(String),

    #[error("cannot decode image {path}: {message}")]
    ImageDecode { path: PathBuf, message: String },

    #[error("cannot encode image {path}: {message}")]
    ImageEncode { path: PathBuf, message: String },

    #[error("{what}: expected {expected:?}, found {found:?}")]
    DimensionMismatch {
        what: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("{what} has no pixels")]
    EmptyImage { what: String },

    #[error("{what}: capacity {capacity} exceeded (requested {requested})")]
    CapacityExceeded {
        what: &'static str,
        capacity: usize,
        requested: usize,
    },

    #[error("projected depth is zero")]
    DegenerateDepth,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl DataError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DataError::Io { path: path.into(), source }
    }
}
