// this_file: src/error.rs
//! Error types for the threadstore library

use thiserror::Error;

/// Main error type for threadstore operations
#[derive(Debug, Error)]
pub enum Error {
    /// The allocator could not provide a block for the slot
    #[error("Allocation failed: {size} bytes for slot `{slot}`")]
    Allocation { slot: &'static str, size: usize },

    /// The slot's custom initializer rejected the freshly allocated buffer
    #[error("Initialization failed for slot `{slot}`: {source}")]
    Initialization {
        slot: &'static str,
        #[source]
        source: InitError,
    },

    /// The slot is already lent out on this thread
    #[error("Slot `{slot}` is already borrowed on this thread")]
    Reentrant { slot: &'static str },

    /// The thread's value table has been torn down
    #[error("Slot `{slot}` is unavailable while the thread exits")]
    ThreadExiting { slot: &'static str },

    /// Debug registry consistency violation
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// JSON parsing or validation error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO operation error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Failure reported by a slot's custom initializer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct InitError(pub String);

impl InitError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Internal-consistency violations detected by the debug registry.
///
/// These point at broken cleanup wiring in a consumer, never at a resource
/// condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// An entry with this identity is already live (missing removal)
    #[error("object {0:#x} is already registered")]
    Duplicate(usize),

    /// No live entry with this identity (double removal)
    #[error("object {0:#x} is not registered")]
    Missing(usize),
}

/// Result type alias for threadstore operations
pub type Result<T> = std::result::Result<T, Error>;
