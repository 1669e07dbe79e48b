use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::automation::variant::Variant;

/// Failure of a single adb invocation.
#[derive(Debug, Error)]
pub enum AdbError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("adb {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("adb {command} failed: {stderr}")]
    Failed { command: String, stderr: String },
    #[error("unexpected adb output: {0}")]
    Unexpected(String),
}

impl From<AdbError> for CaptureError {
    fn from(err: AdbError) -> Self {
        match err {
            AdbError::Timeout { timeout, .. } => CaptureError::Timeout(timeout),
            AdbError::Unexpected(output) => CaptureError::Decode(output),
            other => CaptureError::Unreachable(other.to_string()),
        }
    }
}

impl From<AdbError> for DispatchError {
    fn from(err: AdbError) -> Self {
        match err {
            AdbError::Timeout { timeout, .. } => DispatchError::Timeout(timeout),
            AdbError::Failed { stderr, .. } => DispatchError::Rejected(stderr),
            other => DispatchError::Unreachable(other.to_string()),
        }
    }
}

/// Failure of the screen capture collaborator.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("screen capture timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to decode screenshot: {0}")]
    Decode(String),
    #[error("unexpected screen resolution {actual_width}x{actual_height}, expected {expected_width}x{expected_height}")]
    Resolution {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },
}

impl CaptureError {
    /// Whether this failure means the device itself went away.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, CaptureError::Unreachable(_) | CaptureError::Timeout(_))
    }
}

/// Failure of the input collaborator.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("input command timed out after {0:?}")]
    Timeout(Duration),
    #[error("input command rejected: {0}")]
    Rejected(String),
}

/// Startup-time configuration problems. Never raised once the loop is running.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reference '{name}' required by variant {variant} is missing from the catalog")]
    MissingReference { name: String, variant: Variant },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("reference '{0}' has an empty image")]
    EmptyReference(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to load image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Collaborator failure surfaced by a single tick.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Reasons a tool refuses to start a session.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not reach device: {0}")]
    Connection(String),
    #[error("a session is already running")]
    AlreadyRunning,
}
