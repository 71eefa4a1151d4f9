// src/error.rs

//! Crate-wide error type and exit-code mapping.
//!
//! Component-specific failures (manifest parsing, lock-file validation,
//! fetch failures, resolution failures) each have their own error enum and
//! convert into [`Error`] at the boundary. The top-level command handler
//! maps an [`Error`] to a process exit code via [`Error::exit_code`].

use thiserror::Error;

use crate::fetch::FetchError;
use crate::lockfile::LockFileError;
use crate::manifest::ManifestError;
use crate::solver::SolveFailure;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit code for generic failures.
pub const EXIT_GENERIC: i32 = 1;
/// Process exit code for user-data problems (bad manifest, bad lock file).
pub const EXIT_DATA: i32 = 65;
/// Process exit code for unavailable network services.
pub const EXIT_UNAVAILABLE: i32 = 69;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed manifest document.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Malformed or inconsistent lock file.
    #[error(transparent)]
    LockFile(#[from] LockFileError),

    /// The solver could not satisfy the constraint set.
    #[error(transparent)]
    Resolution(#[from] SolveFailure),

    /// A network operation failed after exhausting its retry budget.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// High-level user-facing problem (missing manifest, invalid input).
    #[error("{0}")]
    Data(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Something that should be impossible happened.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to the process exit code the command handler uses.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Manifest(_) | Error::LockFile(_) | Error::Data(_) => EXIT_DATA,
            Error::Fetch(e) if e.is_network() => EXIT_UNAVAILABLE,
            _ => EXIT_GENERIC,
        }
    }

    /// Shorthand for a [`Error::Data`] with a formatted message.
    pub fn data(msg: impl Into<String>) -> Self {
        Error::Data(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_data() {
        let err = Error::data("no manifest found in the current directory");
        assert_eq!(err.exit_code(), EXIT_DATA);
    }

    #[test]
    fn test_exit_code_generic() {
        let err = Error::Internal("unreachable state".to_string());
        assert_eq!(err.exit_code(), EXIT_GENERIC);
    }
}
