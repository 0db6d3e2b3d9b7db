//! # Status Translation and Error Types
//!
//! Every native call made by this crate returns an integer status code. Zero
//! means success; anything else is turned into a [`LaunchError::Driver`] by
//! [`check`] before the caller sees it. The remaining variants cover failures
//! that are detected locally, without consulting the driver.

use std::path::PathBuf;

use thiserror::Error;

/// Raw status code returned by a native call.
pub type Status = i32;

/// Status code reported by the native layer on success.
pub const SUCCESS: Status = 0;

/// Well-known runtime status codes.
///
/// The numbering follows the CUDA runtime's `cudaError` values that the
/// launch protocol can produce.
pub mod status {
    use super::Status;

    pub const MISSING_CONFIGURATION: Status = 1;
    pub const MEMORY_ALLOCATION: Status = 2;
    pub const INITIALIZATION_ERROR: Status = 3;
    pub const LAUNCH_FAILURE: Status = 4;
    pub const PRIOR_LAUNCH_FAILURE: Status = 5;
    pub const LAUNCH_TIMEOUT: Status = 6;
    pub const LAUNCH_OUT_OF_RESOURCES: Status = 7;
    pub const INVALID_DEVICE_FUNCTION: Status = 8;
    pub const INVALID_CONFIGURATION: Status = 9;
    pub const INVALID_DEVICE: Status = 10;
    pub const INVALID_VALUE: Status = 11;
    pub const UNKNOWN: Status = 30;
}

/// Errors raised by the launch protocol.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LaunchError {
    #[error("driver error {code}: {description}")]
    Driver {
        code: Status,
        description: &'static str,
    },
    #[error("argument {index}: unsupported kernel argument type `{kind}`")]
    TypeMismatch { index: usize, kind: &'static str },
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("`{operation}` is not allowed while the launch sequence is {phase}")]
    OutOfSequence {
        operation: &'static str,
        phase: &'static str,
    },
    #[error("failed to open library {path:?}: {message}")]
    LibraryOpen { path: PathBuf, message: String },
    #[error("failed to close libraries: {}", format_failures(.failures))]
    LibraryClose { failures: Vec<(PathBuf, String)> },
    #[error("invalid cache configuration value {0}")]
    InvalidCacheConfig(i32),
}

impl LaunchError {
    /// Status code carried by a driver failure, if this is one.
    pub fn status(&self) -> Option<Status> {
        match self {
            LaunchError::Driver { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type used throughout the library.
pub type Result<T, E = LaunchError> = std::result::Result<T, E>;

/// Converts a native status code into a `Result`.
#[inline]
pub fn check(code: Status) -> Result<()> {
    if code == SUCCESS {
        Ok(())
    } else {
        Err(LaunchError::Driver {
            code,
            description: describe(code),
        })
    }
}

/// Human-readable description of a status code.
pub fn describe(code: Status) -> &'static str {
    match code {
        SUCCESS => "no error",
        status::MISSING_CONFIGURATION => "__global__ function call is not configured",
        status::MEMORY_ALLOCATION => "out of memory",
        status::INITIALIZATION_ERROR => "initialization error",
        status::LAUNCH_FAILURE => "unspecified launch failure",
        status::PRIOR_LAUNCH_FAILURE => "unspecified launch failure in prior launch",
        status::LAUNCH_TIMEOUT => "the launch timed out and was terminated",
        status::LAUNCH_OUT_OF_RESOURCES => "too many resources requested for launch",
        status::INVALID_DEVICE_FUNCTION => "invalid device function",
        status::INVALID_CONFIGURATION => "invalid configuration argument",
        status::INVALID_DEVICE => "invalid device ordinal",
        status::INVALID_VALUE => "invalid argument",
        _ => "unknown error",
    }
}

fn format_failures(failures: &[(PathBuf, String)]) -> String {
    failures
        .iter()
        .map(|(path, msg)| format!("{} ({})", path.display(), msg))
        .collect::<Vec<_>>()
        .join(", ")
}
