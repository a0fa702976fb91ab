//! Error types for discovery, session control and capture.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Outcome of a single failed `fill_buffer` call.
///
/// The capture loop keeps running after a [`CaptureError::Transient`] and
/// terminates after a [`CaptureError::Fatal`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// One capture attempt failed; the device is still usable.
    #[error("transient capture failure: {0}")]
    Transient(String),
    /// The device is gone (disconnected, powered off, revoked).
    #[error("fatal device failure: {0}")]
    Fatal(String),
}

impl CaptureError {
    /// Whether this failure ends the capture loop.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Error type for registry and session operations.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// A producer source could not be loaded.
    #[error("failed to load producer source {}: {reason}", path.display())]
    SourceLoad {
        /// Source path as given to `add_source`.
        path: PathBuf,
        /// Loader-provided reason.
        reason: String,
    },
    /// No source registered, or every source failed to enumerate.
    #[error("device discovery failed: {0}")]
    Discovery(String),
    /// `create` was given an index outside the current device list.
    #[error("device index {index} out of range ({len} devices listed)")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Length of the device list.
        len: usize,
    },
    /// The device is already held by another session or process.
    #[error("device {0} is busy")]
    DeviceBusy(String),
    /// The device could not be opened.
    #[error("device {device} is unreachable: {reason}")]
    DeviceUnreachable {
        /// Device id.
        device: String,
        /// Producer-provided reason.
        reason: String,
    },
    /// The operation is not valid in the session's current state.
    #[error("cannot {operation} while session is {state}")]
    SessionState {
        /// Operation that was rejected.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },
    /// `fetch` found nothing before its deadline.
    #[error("no frame available within {0:?}")]
    Timeout(Duration),
    /// A capture failure surfaced to the caller.
    #[error(transparent)]
    Capture(#[from] CaptureError),
    /// The background capture thread panicked.
    #[error("capture worker for {device} panicked")]
    WorkerPanicked {
        /// Device id.
        device: String,
    },
    /// The background capture thread did not finish within the join timeout
    /// and was detached.
    #[error("capture worker for {device} did not stop within {waited:?}")]
    WorkerUnresponsive {
        /// Device id.
        device: String,
        /// How long the session waited before detaching the worker.
        waited: Duration,
    },
    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// I/O error (thread spawn, log file, device nodes).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for AcquireError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for acquisition operations.
pub type Result<T> = std::result::Result<T, AcquireError>;
