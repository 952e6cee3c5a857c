// this_file: src/storage.rs
//! Named thread-local buffer slots.
//!
//! A [`ThreadStorage`] is declared once as a `static`. The first time a thread
//! touches it, a zeroed block of the requested size is allocated, passed
//! through the slot's initializer and cached for that thread; later touches on
//! the same thread get the same block back. When the thread exits the slot's
//! cleanup hook runs and the block is released.
//!
//! ```
//! use threadstore::thread_storage;
//!
//! thread_storage! {
//!     static FORMAT_BUF;
//! }
//!
//! const FORMAT_BUF_SIZE: usize = 128;
//!
//! let len = FORMAT_BUF.with(FORMAT_BUF_SIZE, |buf| buf.len()).unwrap();
//! assert_eq!(len, FORMAT_BUF_SIZE);
//! ```
//!
//! The requested size only matters on a thread's first touch. Every call site
//! of a slot must agree on the size it assumes.

use crate::alloc::{Allocator, Block, SystemAllocator};
use crate::error::{Error, InitError, Result};
use crate::registry::{report_violation, tracker, Entry, Site};
use crate::runtime::{self, AccessError, Key, Teardown};
use std::fmt;
use std::sync::OnceLock;

/// Per-thread initializer run on each freshly allocated buffer.
pub trait SlotInit: Sync {
    fn init(&self, buf: &mut [u8]) -> std::result::Result<(), InitError>;
}

/// Hook run on a thread's buffer when the thread exits, before release.
pub trait SlotCleanup: Sync {
    fn cleanup(&self, buf: &mut [u8]);
}

/// Initializer function pointer.
pub type InitFn = fn(&mut [u8]) -> std::result::Result<(), InitError>;

/// Cleanup function pointer.
pub type CleanupFn = fn(&mut [u8]);

/// Creates a slot's key and registers its teardown with the runtime.
pub type KeyInit = fn(&'static dyn Teardown) -> Key;

/// Leaves freshly allocated buffers zeroed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInit;

impl SlotInit for NoInit {
    fn init(&self, _buf: &mut [u8]) -> std::result::Result<(), InitError> {
        Ok(())
    }
}

/// Releases the buffer without touching its contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainRelease;

impl SlotCleanup for PlainRelease {
    fn cleanup(&self, _buf: &mut [u8]) {}
}

impl SlotInit for InitFn {
    fn init(&self, buf: &mut [u8]) -> std::result::Result<(), InitError> {
        self(buf)
    }
}

impl SlotCleanup for CleanupFn {
    fn cleanup(&self, buf: &mut [u8]) {
        self(buf)
    }
}

/// Declaration of a thread-local buffer slot.
pub struct ThreadStorage<I = NoInit, C = PlainRelease> {
    name: &'static str,
    key: OnceLock<Key>,
    key_init: KeyInit,
    init: I,
    cleanup: C,
    allocator: &'static dyn Allocator,
}

impl ThreadStorage {
    /// A slot with zeroed buffers and a plain release.
    pub const fn new(name: &'static str) -> Self {
        Self::with_hooks(name, NoInit, PlainRelease)
    }
}

impl<I, C> ThreadStorage<I, C> {
    /// A slot with a custom initializer and cleanup hook.
    pub const fn with_hooks(name: &'static str, init: I, cleanup: C) -> Self {
        Self {
            name,
            key: OnceLock::new(),
            key_init: runtime::create_key,
            init,
            cleanup,
            allocator: &SystemAllocator,
        }
    }

    /// Draw this slot's buffers from `allocator` instead of the global one.
    pub const fn with_allocator(mut self, allocator: &'static dyn Allocator) -> Self {
        self.allocator = allocator;
        self
    }

    /// Replace the function that creates this slot's key.
    pub const fn with_key_init(mut self, key_init: KeyInit) -> Self {
        self.key_init = key_init;
        self
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the slot's key exists yet. Never creates it.
    pub fn key_created(&self) -> bool {
        self.key.get().is_some()
    }

    /// Whether the calling thread currently holds a buffer for this slot.
    pub fn is_populated(&self) -> bool {
        self.key.get().map_or(false, |&key| runtime::is_held(key))
    }

    fn access_error(&self, err: AccessError) -> Error {
        match err {
            AccessError::Reentrant => Error::Reentrant { slot: self.name },
            AccessError::ThreadExiting => Error::ThreadExiting { slot: self.name },
        }
    }
}

impl<I, C> ThreadStorage<I, C>
where
    I: SlotInit + 'static,
    C: SlotCleanup + 'static,
{
    /// Create the slot's key on first use; every caller observes the same key.
    pub fn ensure_key_created(&'static self) -> Key {
        *self.key.get_or_init(|| (self.key_init)(self))
    }

    /// Run `f` on this thread's buffer, creating a `size`-byte buffer on the
    /// thread's first touch.
    ///
    /// `size` is ignored once the thread has a buffer.
    #[track_caller]
    pub fn with<R>(&'static self, size: usize, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.with_at(size, Site::caller(), f)
    }

    /// Like [`ThreadStorage::with`], recording `site` as the allocation's origin.
    pub fn with_at<R>(
        &'static self,
        size: usize,
        site: Site,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let key = self.ensure_key_created();
        let mut lease = runtime::lease(key).map_err(|err| self.access_error(err))?;
        let (block, fresh) = lease.get_or_try_fill(|| self.create_block(size))?;

        if fresh {
            if let Err(err) = tracker().add(Entry::new(block.addr(), self.name, size, site)) {
                report_violation(self.name, "add", err);
            }
        } else if cfg!(debug_assertions) && block.len() != size {
            log::warn!(
                "thread storage `{}`: {}:{} requested {} bytes, cached buffer holds {}",
                self.name,
                site.file,
                site.line,
                size,
                block.len()
            );
        }

        Ok(f(block.as_mut_slice()))
    }

    fn create_block(&self, size: usize) -> Result<Block> {
        let mut block = Block::allocate(self.allocator, size, true).ok_or(Error::Allocation {
            slot: self.name,
            size,
        })?;

        if let Err(source) = self.init.init(block.as_mut_slice()) {
            log::warn!(
                "thread storage `{}`: initializer rejected {}-byte buffer: {}",
                self.name,
                size,
                source
            );
            return Err(Error::Initialization {
                slot: self.name,
                source,
            });
        }

        log::trace!("thread storage `{}`: allocated {} bytes", self.name, size);
        Ok(block)
    }

    /// Install `block` as this thread's buffer and return the previous one.
    ///
    /// The initializer is not run on `block`. On error `block` is released.
    #[track_caller]
    pub fn replace(&'static self, block: Block) -> Result<Option<Block>> {
        let site = Site::caller();
        let key = self.ensure_key_created();
        let (id, size) = (block.addr(), block.len());
        let previous = runtime::install(key, block).map_err(|err| self.access_error(err))?;

        let tracked = match &previous {
            Some(old) => tracker().replace(old.addr(), id, size).map_err(|e| ("replace", e)),
            None => tracker()
                .add(Entry::new(id, self.name, size, site))
                .map_err(|e| ("add", e)),
        };
        if let Err((operation, err)) = tracked {
            report_violation(self.name, operation, err);
        }
        Ok(previous)
    }

    /// Remove this thread's buffer from the slot and hand it to the caller.
    ///
    /// The next touch on this thread allocates a fresh buffer.
    pub fn take(&'static self) -> Result<Option<Block>> {
        let Some(&key) = self.key.get() else {
            return Ok(None);
        };
        let taken = runtime::take(key).map_err(|err| self.access_error(err))?;
        if let Some(block) = &taken {
            if let Err(err) = tracker().remove(block.addr()) {
                report_violation(self.name, "remove", err);
            }
        }
        Ok(taken)
    }
}

impl<I, C> Teardown for ThreadStorage<I, C>
where
    I: SlotInit,
    C: SlotCleanup,
{
    fn teardown(&self, mut block: Block) {
        if let Err(err) = tracker().remove(block.addr()) {
            report_violation(self.name, "remove", err);
        }
        self.cleanup.cleanup(block.as_mut_slice());
        log::trace!(
            "thread storage `{}`: released {} bytes at thread exit",
            self.name,
            block.len()
        );
    }
}

impl<I, C> fmt::Debug for ThreadStorage<I, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadStorage")
            .field("name", &self.name)
            .field("key", &self.key.get())
            .finish_non_exhaustive()
    }
}

/// Declare thread-local buffer slots.
///
/// ```
/// use threadstore::{thread_storage, InitError};
///
/// fn stamp(buf: &mut [u8]) -> Result<(), InitError> {
///     buf[0] = 0x7f;
///     Ok(())
/// }
///
/// fn scrub(buf: &mut [u8]) {
///     buf.fill(0);
/// }
///
/// thread_storage! {
///     static PLAIN;
///     static STAMPED: init = stamp;
///     static SCRUBBED: cleanup = scrub;
///     pub(crate) static BOTH: init = stamp, cleanup = scrub;
/// }
///
/// assert_eq!(STAMPED.with(16, |buf| buf[0]).unwrap(), 0x7f);
/// ```
#[macro_export]
macro_rules! thread_storage {
    () => {};

    ($(#[$attr:meta])* $vis:vis static $name:ident; $($rest:tt)*) => {
        $(#[$attr])*
        $vis static $name: $crate::ThreadStorage = $crate::ThreadStorage::new(stringify!($name));
        $crate::thread_storage!($($rest)*);
    };

    ($(#[$attr:meta])* $vis:vis static $name:ident: init = $init:expr, cleanup = $cleanup:expr; $($rest:tt)*) => {
        $(#[$attr])*
        $vis static $name: $crate::ThreadStorage<$crate::InitFn, $crate::CleanupFn> =
            $crate::ThreadStorage::with_hooks(
                stringify!($name),
                $init as $crate::InitFn,
                $cleanup as $crate::CleanupFn,
            );
        $crate::thread_storage!($($rest)*);
    };

    ($(#[$attr:meta])* $vis:vis static $name:ident: init = $init:expr; $($rest:tt)*) => {
        $(#[$attr])*
        $vis static $name: $crate::ThreadStorage<$crate::InitFn, $crate::PlainRelease> =
            $crate::ThreadStorage::with_hooks(
                stringify!($name),
                $init as $crate::InitFn,
                $crate::PlainRelease,
            );
        $crate::thread_storage!($($rest)*);
    };

    ($(#[$attr:meta])* $vis:vis static $name:ident: cleanup = $cleanup:expr; $($rest:tt)*) => {
        $(#[$attr])*
        $vis static $name: $crate::ThreadStorage<$crate::NoInit, $crate::CleanupFn> =
            $crate::ThreadStorage::with_hooks(
                stringify!($name),
                $crate::NoInit,
                $cleanup as $crate::CleanupFn,
            );
        $crate::thread_storage!($($rest)*);
    };
}

/// Run a closure on a slot's buffer, recording the enclosing function as the
/// allocation site.
#[macro_export]
macro_rules! thread_storage_get {
    ($storage:expr, $size:expr, $f:expr) => {
        $storage.with_at($size, $crate::call_site!(), $f)
    };
}
