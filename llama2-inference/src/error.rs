//! Error types for the llama2 runtime.

use crate::device::DeviceType;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, InferenceError>;

/// Errors surfaced at the public boundary of the runtime.
///
/// Every fallible operation returns one of these; nothing panics across the
/// library boundary. I/O, mapping, and parse failures are terminal for the
/// call that produced them.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// Missing or unreadable file.
    #[error("path not valid: {0}")]
    PathNotValid(String),

    /// Malformed checkpoint or tokenizer content.
    #[error("model parse error: {0}")]
    ModelParse(String),

    /// Broken internal invariant: unbound tensor slot, missing layer,
    /// null pointer.
    #[error("internal error: {0}")]
    Internal(String),

    /// Duplicate buffer-registry insertion.
    #[error("key already exists: {0}")]
    KeyAlreadyExists(String),

    /// Registry or catalog lookup miss.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation issued against an object in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Device memory exhaustion.
    #[error("allocation of {requested} bytes failed on {device:?}")]
    Allocation {
        device: DeviceType,
        requested: usize,
    },

    /// Input exceeds a fixed pre-allocated capacity.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Index (e.g. a token id) outside its valid range.
    #[error("index {index} out of range, bound {bound}")]
    IndexOutOfRange { index: i64, bound: usize },
}

impl InferenceError {
    /// Prefixes message-carrying variants with added context.
    ///
    /// Structured variants (`Allocation`, `IndexOutOfRange`) pass through
    /// unchanged so callers can still match on them.
    pub fn context(self, prefix: &str) -> Self {
        use InferenceError::*;
        match self {
            PathNotValid(msg) => PathNotValid(format!("{prefix}: {msg}")),
            ModelParse(msg) => ModelParse(format!("{prefix}: {msg}")),
            Internal(msg) => Internal(format!("{prefix}: {msg}")),
            KeyAlreadyExists(msg) => KeyAlreadyExists(format!("{prefix}: {msg}")),
            NotFound(msg) => NotFound(format!("{prefix}: {msg}")),
            InvalidState(msg) => InvalidState(format!("{prefix}: {msg}")),
            CapacityExceeded(msg) => CapacityExceeded(format!("{prefix}: {msg}")),
            other => other,
        }
    }
}
