//! Error types for shellspawn.

use std::fmt;
use std::io;

/// Stable, ordinal-identified outcome of a spawn call.
///
/// The numeric values are part of the public contract and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum SpawnStatus {
    /// The child ran and its exit code was collected.
    Ok = 0,
    /// More than one input source was selected for stdin.
    TooManyInputs = 1,
    /// More than one sink was selected for stdout.
    TooManyOutputs = 2,
    /// More than one sink was selected for stderr.
    TooManyErrors = 3,
    /// The command could not be parsed or no executable was found.
    CommandNotFound = 4,
    /// Any other failure; see the diagnostic text.
    Failure = 5,
}

impl SpawnStatus {
    /// Returns the stable numeric code.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for SpawnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::TooManyInputs => "too-many-inputs",
            Self::TooManyOutputs => "too-many-outputs",
            Self::TooManyErrors => "too-many-errors",
            Self::CommandNotFound => "command-not-found",
            Self::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// Errors returned by a spawn call.
///
/// Errors are organized by when they are detected:
/// - Request validation: before any resource exists
/// - Resolution: the command string names nothing executable
/// - Internal failures: OS resources, worker I/O, proxy or rendezvous faults
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum SpawnError {
    /// More than one of lines, text, callback or stream was chosen for stdin.
    #[error("more than one of lines, text, callback or stream specified for stdin")]
    TooManyInputs,

    /// More than one of lines, text, callback or stream was chosen for stdout.
    #[error("more than one of lines, text, callback or stream specified for stdout")]
    TooManyOutputs,

    /// More than one of lines, text, callback or stream was chosen for stderr.
    #[error("more than one of lines, text, callback or stream specified for stderr")]
    TooManyErrors,

    /// The command string was empty or named no executable file.
    #[error("command not found: {command:?}")]
    CommandNotFound { command: String },

    /// An internal step failed.
    ///
    /// `step` identifies where, `detail` carries the underlying OS message.
    #[error("{step}: {detail}")]
    Failure { step: &'static str, detail: String },
}

/// A specialized Result type for spawn operations.
pub type Result<T> = std::result::Result<T, SpawnError>;

impl SpawnError {
    /// Builds a failure from an I/O error, keeping the OS error code.
    pub fn os(step: &'static str, err: &io::Error) -> Self {
        let detail = match err.raw_os_error() {
            Some(code) => format!("{} (os error {code})", strip_os_suffix(&err.to_string())),
            None => err.to_string(),
        };
        Self::Failure { step, detail }
    }

    /// Builds a failure from a raw errno value.
    #[cfg(unix)]
    pub fn errno(step: &'static str, errno: nix::errno::Errno) -> Self {
        Self::os(step, &io::Error::from_raw_os_error(errno as i32))
    }

    /// Builds a failure that has no OS error behind it.
    pub fn internal(step: &'static str, detail: impl Into<String>) -> Self {
        Self::Failure {
            step,
            detail: detail.into(),
        }
    }

    /// Returns the stable classification of this error.
    pub fn status(&self) -> SpawnStatus {
        match self {
            Self::TooManyInputs => SpawnStatus::TooManyInputs,
            Self::TooManyOutputs => SpawnStatus::TooManyOutputs,
            Self::TooManyErrors => SpawnStatus::TooManyErrors,
            Self::CommandNotFound { .. } => SpawnStatus::CommandNotFound,
            Self::Failure { .. } => SpawnStatus::Failure,
        }
    }

    /// Check if this error was raised before any resource was created.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::TooManyInputs | Self::TooManyOutputs | Self::TooManyErrors
        )
    }
}

/// `io::Error` renders OS errors as "message (os error N)"; drop that suffix so
/// the code is not printed twice.
fn strip_os_suffix(message: &str) -> &str {
    match message.rfind(" (os error ") {
        Some(idx) => &message[..idx],
        None => message,
    }
}
