// this_file: src/alloc.rs
//! Allocator seam and the owned `Block` type.
//!
//! Thread-local buffers are carved out of an [`Allocator`]. The default is the
//! process's global allocator; [`TrackingAllocator`] adds byte accounting and a
//! hard limit, which is how leak checks and allocation-failure paths are
//! exercised.

use std::alloc::Layout;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Alignment of every block handed out by the built-in allocators.
pub const BLOCK_ALIGN: usize = 16;

/// Source of raw memory for thread-local buffers.
pub trait Allocator: Sync {
    /// Allocate `size` bytes, zero-filled when `zeroed` is set.
    ///
    /// Returns `None` when the allocator is exhausted.
    fn allocate(&self, size: usize, zeroed: bool) -> Option<NonNull<u8>>;

    /// Return memory obtained from [`Allocator::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `self.allocate(size, _)` with the same `size` and
    /// must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);
}

fn block_layout(size: usize) -> Option<Layout> {
    // Zero-sized requests still get a real allocation so every live block has
    // a distinct address.
    Layout::from_size_align(size.max(1), BLOCK_ALIGN).ok()
}

/// The process's global allocator.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn allocate(&self, size: usize, zeroed: bool) -> Option<NonNull<u8>> {
        let layout = block_layout(size)?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe {
            if zeroed {
                std::alloc::alloc_zeroed(layout)
            } else {
                std::alloc::alloc(layout)
            }
        };
        NonNull::new(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        if let Some(layout) = block_layout(size) {
            // SAFETY: caller guarantees ptr came from allocate(size) which used
            // this same layout.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}

/// Global allocator with byte accounting and an adjustable limit.
pub struct TrackingAllocator {
    /// Bytes currently handed out
    current: AtomicUsize,
    /// High-water mark of `current`
    peak: AtomicUsize,
    /// Allocations that would push `current` above this fail
    limit: AtomicUsize,
    allocations: AtomicUsize,
}

impl TrackingAllocator {
    /// Create a tracker that refuses to hand out more than `limit` bytes.
    pub const fn new(limit: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
            allocations: AtomicUsize::new(0),
        }
    }

    /// Create a tracker without a practical limit.
    pub const fn unlimited() -> Self {
        Self::new(usize::MAX)
    }

    /// Bytes currently outstanding.
    pub fn current_usage(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Peak outstanding bytes.
    pub fn peak_usage(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Number of successful allocations since creation.
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Memory statistics as a one-line summary
    pub fn stats(&self) -> String {
        format!(
            "Thread storage: {} bytes outstanding (peak: {} bytes, {} allocations)",
            self.current_usage(),
            self.peak_usage(),
            self.allocation_count()
        )
    }

    fn reserve(&self, bytes: usize) -> bool {
        let limit = self.limit();
        let reserved = self
            .current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(bytes).filter(|&total| total <= limit)
            });
        let new = match reserved {
            // Refused requests never touch `current`.
            Ok(old) => old + bytes,
            Err(_) => return false,
        };

        let mut peak = self.peak.load(Ordering::Relaxed);
        while new > peak {
            match self
                .peak
                .compare_exchange_weak(peak, new, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
        true
    }
}

impl Default for TrackingAllocator {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl fmt::Debug for TrackingAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingAllocator")
            .field("current", &self.current_usage())
            .field("peak", &self.peak_usage())
            .field("limit", &self.limit())
            .finish()
    }
}

impl Allocator for TrackingAllocator {
    fn allocate(&self, size: usize, zeroed: bool) -> Option<NonNull<u8>> {
        if !self.reserve(size) {
            log::debug!("tracking allocator refused {} bytes: {}", size, self.stats());
            return None;
        }
        match SystemAllocator.allocate(size, zeroed) {
            Some(ptr) => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                Some(ptr)
            }
            None => {
                self.current.fetch_sub(size, Ordering::SeqCst);
                None
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract; allocate() delegated to the
        // system allocator with the same size.
        unsafe { SystemAllocator.deallocate(ptr, size) };
        self.current.fetch_sub(size, Ordering::SeqCst);
    }
}

/// An owned block of raw memory.
///
/// The block returns itself to the allocator that produced it when dropped.
pub struct Block {
    ptr: NonNull<u8>,
    len: usize,
    allocator: &'static dyn Allocator,
}

// SAFETY: Block uniquely owns its memory, like Box<[u8]>; the allocator is Sync.
unsafe impl Send for Block {}

impl Block {
    /// Allocate a block of `size` bytes from `allocator`.
    pub fn allocate(allocator: &'static dyn Allocator, size: usize, zeroed: bool) -> Option<Self> {
        allocator.allocate(size, zeroed).map(|ptr| Self {
            ptr,
            len: size,
            allocator,
        })
    }

    /// Allocate a zero-filled block from the global allocator.
    pub fn zeroed(size: usize) -> Option<Self> {
        Self::allocate(&SystemAllocator, size, true)
    }

    /// Size of the block in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Identity of the block, stable for its lifetime.
    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for as long as self lives.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and uniquely owned by self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Return the block to its allocator now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        // SAFETY: ptr/len are exactly what allocator.allocate returned.
        unsafe { self.allocator.deallocate(self.ptr, self.len) };
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_block_is_zero_filled() {
        let block = Block::zeroed(256).unwrap();
        assert_eq!(block.len(), 256);
        assert!(block.iter().all(|&b| b == 0));
        assert_eq!(block.addr() % BLOCK_ALIGN, 0);
    }

    #[test]
    fn test_zero_sized_blocks_have_distinct_identities() {
        let a = Block::zeroed(0).unwrap();
        let b = Block::zeroed(0).unwrap();
        assert!(a.is_empty());
        assert_ne!(a.addr(), b.addr());
    }

    #[test]
    fn test_tracking_allocator_accounts_for_blocks() {
        static TRACKER: TrackingAllocator = TrackingAllocator::unlimited();

        let block = Block::allocate(&TRACKER, 4096, true).unwrap();
        assert_eq!(TRACKER.current_usage(), 4096);

        let other = Block::allocate(&TRACKER, 1024, false).unwrap();
        assert_eq!(TRACKER.current_usage(), 5120);

        block.release();
        assert_eq!(TRACKER.current_usage(), 1024);
        drop(other);
        assert_eq!(TRACKER.current_usage(), 0);
        assert_eq!(TRACKER.peak_usage(), 5120);
        assert_eq!(TRACKER.allocation_count(), 2);
    }

    #[test]
    fn test_tracking_allocator_limit() {
        static TRACKER: TrackingAllocator = TrackingAllocator::new(1000);

        assert!(Block::allocate(&TRACKER, 1001, true).is_none());
        assert_eq!(TRACKER.current_usage(), 0);

        let block = Block::allocate(&TRACKER, 600, true).unwrap();
        assert!(Block::allocate(&TRACKER, 600, true).is_none());

        TRACKER.set_limit(2000);
        let more = Block::allocate(&TRACKER, 600, true).unwrap();
        assert_eq!(TRACKER.current_usage(), 1200);
        drop((block, more));
        assert_eq!(TRACKER.current_usage(), 0);
    }

    #[test]
    fn test_refused_requests_do_not_starve_small_ones() {
        use std::sync::atomic::AtomicBool;
        use std::thread;

        static TRACKER: TrackingAllocator = TrackingAllocator::new(1000);
        static DONE: AtomicBool = AtomicBool::new(false);

        let oversized = thread::spawn(|| {
            while !DONE.load(Ordering::SeqCst) {
                assert!(Block::allocate(&TRACKER, 1_000_000, false).is_none());
            }
        });

        let refused = (0..50_000)
            .filter(|_| Block::allocate(&TRACKER, 10, false).is_none())
            .count();
        DONE.store(true, Ordering::SeqCst);
        oversized.join().unwrap();

        assert_eq!(refused, 0);
        assert_eq!(TRACKER.current_usage(), 0);
        assert_eq!(TRACKER.peak_usage(), 10);
    }

    #[test]
    fn test_huge_request_does_not_wrap_usage() {
        static TRACKER: TrackingAllocator = TrackingAllocator::unlimited();

        let block = Block::allocate(&TRACKER, 64, false).unwrap();
        assert!(!TRACKER.reserve(usize::MAX));
        assert_eq!(TRACKER.current_usage(), 64);
        drop(block);
    }

    #[test]
    fn test_stats_mentions_usage() {
        let tracker = TrackingAllocator::default();
        assert!(tracker.stats().contains("0 bytes outstanding"));
    }
}
