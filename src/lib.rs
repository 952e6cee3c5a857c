// this_file: src/lib.rs
//! Threadstore - per-thread cached buffers
//!
//! This library provides:
//! - Named thread-local buffer slots declared as `static`s
//! - Lazy, race-free key creation and first-touch allocation per thread
//! - Custom per-thread initialization and thread-exit cleanup hooks
//! - A debug registry of every live thread-local allocation

pub mod alloc;
pub mod error;
pub mod logging;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod workload;

// Re-export commonly used types
pub use alloc::{Allocator, Block, SystemAllocator, TrackingAllocator};
pub use error::{Error, InitError, RegistryError, Result};
pub use registry::{tracker, DebugRegistry, Entry, ObjectTracker, Site, Summary};
pub use runtime::{Key, Teardown};
pub use storage::{
    CleanupFn, InitFn, KeyInit, NoInit, PlainRelease, SlotCleanup, SlotInit, ThreadStorage,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
