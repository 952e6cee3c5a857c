// this_file: src/runtime.rs
//! Thread-local key runtime.
//!
//! A process-wide key table maps each [`Key`] to the [`Teardown`] that owns
//! it. Every thread has its own value table, indexed by key, living in a
//! `thread_local!`. When the thread exits the value table is dropped and each
//! held block is handed to its key's teardown exactly once.
//!
//! Keys are never deleted: one key exists per declared slot for the life of
//! the process.

use crate::alloc::Block;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::{PoisonError, RwLock};

/// Handle identifying a slot inside the per-thread value tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(usize);

impl Key {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Receives a thread's block for a key when that thread exits.
pub trait Teardown: Sync {
    fn teardown(&self, block: Block);
}

/// Why a thread's value for a key could not be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// The value is currently lent out on this thread
    Reentrant,
    /// The thread's value table is already destroyed
    ThreadExiting,
}

static KEYS: RwLock<Vec<&'static dyn Teardown>> = RwLock::new(Vec::new());

/// Create a new key whose values are handed to `teardown` at thread exit.
pub fn create_key(teardown: &'static dyn Teardown) -> Key {
    let mut keys = KEYS.write().unwrap_or_else(PoisonError::into_inner);
    let key = Key(keys.len());
    keys.push(teardown);
    log::debug!("created thread-local key {}", key.0);
    key
}

/// Number of keys created so far in this process.
pub fn key_count() -> usize {
    KEYS.read().unwrap_or_else(PoisonError::into_inner).len()
}

fn teardown_for(key: Key) -> Option<&'static dyn Teardown> {
    KEYS.read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(key.0)
        .copied()
}

fn run_teardown(key: Key, block: Block) {
    match teardown_for(key) {
        Some(teardown) => teardown.teardown(block),
        // Unreachable for keys minted by create_key; the block is still freed.
        None => log::error!("no teardown registered for key {}", key.0),
    }
}

enum Value {
    Vacant,
    Held(Block),
    Lent,
}

struct ThreadValues {
    values: Vec<Value>,
}

impl ThreadValues {
    const fn new() -> Self {
        Self { values: Vec::new() }
    }

    fn slot(&mut self, key: Key) -> &mut Value {
        if self.values.len() <= key.0 {
            self.values.resize_with(key.0 + 1, || Value::Vacant);
        }
        &mut self.values[key.0]
    }
}

impl Drop for ThreadValues {
    fn drop(&mut self) {
        let held: Vec<(Key, Block)> = std::mem::take(&mut self.values)
            .into_iter()
            .enumerate()
            .filter_map(|(idx, value)| match value {
                Value::Held(block) => Some((Key(idx), block)),
                _ => None,
            })
            .collect();

        if held.is_empty() {
            return;
        }
        log::trace!("thread exit: tearing down {} thread-local blocks", held.len());

        // Teardown runs without the key table lock held so hooks may touch
        // other slots' keys.
        for (key, block) in held {
            run_teardown(key, block);
        }
    }
}

thread_local! {
    static VALUES: RefCell<ThreadValues> = const { RefCell::new(ThreadValues::new()) };
}

fn with_values<R>(f: impl FnOnce(&mut ThreadValues) -> R) -> Result<R, AccessError> {
    VALUES
        .try_with(|values| f(&mut values.borrow_mut()))
        .map_err(|_| AccessError::ThreadExiting)
}

/// Exclusive use of this thread's value for a key.
///
/// While a lease is alive the slot is marked as lent; dropping the lease puts
/// the block back, or leaves the slot vacant if the lease holds none.
pub struct Lease {
    key: Key,
    block: Option<Block>,
    _thread_bound: PhantomData<*const ()>,
}

impl Lease {
    /// Return the leased block, producing it with `fill` if the slot was
    /// vacant. The flag reports whether `fill` ran.
    pub fn get_or_try_fill<E>(
        &mut self,
        fill: impl FnOnce() -> Result<Block, E>,
    ) -> Result<(&mut Block, bool), E> {
        let (block, fresh) = match self.block.take() {
            Some(block) => (block, false),
            None => (fill()?, true),
        };
        Ok((self.block.insert(block), fresh))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let key = self.key;
        let mut block = self.block.take();
        let restored = with_values(|values| {
            *values.slot(key) = match block.take() {
                Some(block) => Value::Held(block),
                None => Value::Vacant,
            };
        });
        if restored.is_err() {
            if let Some(block) = block {
                run_teardown(key, block);
            }
        }
    }
}

/// Lend this thread's value for `key`, which may be vacant.
pub fn lease(key: Key) -> Result<Lease, AccessError> {
    with_values(|values| {
        let slot = values.slot(key);
        match std::mem::replace(slot, Value::Lent) {
            Value::Held(block) => Ok(Some(block)),
            Value::Vacant => Ok(None),
            Value::Lent => Err(AccessError::Reentrant),
        }
    })?
    .map(|block| Lease {
        key,
        block,
        _thread_bound: PhantomData,
    })
}

/// Install `block` as this thread's value for `key`, returning the previous one.
///
/// On error the supplied block is released.
pub fn install(key: Key, block: Block) -> Result<Option<Block>, AccessError> {
    with_values(|values| {
        let slot = values.slot(key);
        if matches!(slot, Value::Lent) {
            return Err(AccessError::Reentrant);
        }
        match std::mem::replace(slot, Value::Held(block)) {
            Value::Held(previous) => Ok(Some(previous)),
            _ => Ok(None),
        }
    })?
}

/// Remove this thread's value for `key` without running its teardown.
pub fn take(key: Key) -> Result<Option<Block>, AccessError> {
    with_values(|values| {
        let slot = values.slot(key);
        match std::mem::replace(slot, Value::Vacant) {
            Value::Held(block) => Ok(Some(block)),
            Value::Vacant => Ok(None),
            Value::Lent => {
                *slot = Value::Lent;
                Err(AccessError::Reentrant)
            }
        }
    })?
}

/// Whether this thread currently holds a value for `key`.
pub fn is_held(key: Key) -> bool {
    with_values(|values| matches!(values.values.get(key.0), Some(Value::Held(_)))).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct CountingTeardown {
        calls: AtomicUsize,
        bytes: AtomicUsize,
    }

    impl Teardown for CountingTeardown {
        fn teardown(&self, block: Block) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.bytes.fetch_add(block.len(), Ordering::SeqCst);
        }
    }

    impl CountingTeardown {
        const fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                bytes: AtomicUsize::new(0),
            }
        }
    }

    fn fill(lease: &mut Lease, size: usize) -> bool {
        let (_, fresh) = lease
            .get_or_try_fill(|| Block::zeroed(size).ok_or(()))
            .unwrap();
        fresh
    }

    #[test]
    fn held_values_are_torn_down_at_thread_exit() {
        static TEARDOWN: CountingTeardown = CountingTeardown::new();
        let key = create_key(&TEARDOWN);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                thread::spawn(move || {
                    let mut lease = lease(key).unwrap();
                    assert!(fill(&mut lease, 32));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(TEARDOWN.calls.load(Ordering::SeqCst), 4);
        assert_eq!(TEARDOWN.bytes.load(Ordering::SeqCst), 128);
    }

    #[test]
    fn lease_returns_block_to_slot() {
        static TEARDOWN: CountingTeardown = CountingTeardown::new();
        let key = create_key(&TEARDOWN);

        thread::spawn(move || {
            assert!(!is_held(key));
            {
                let mut lease = lease(key).unwrap();
                assert!(fill(&mut lease, 8));
            }
            assert!(is_held(key));
            let mut lease = lease(key).unwrap();
            assert!(!fill(&mut lease, 8), "second lease should reuse the block");
        })
        .join()
        .unwrap();

        assert_eq!(TEARDOWN.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_lease_is_rejected() {
        static TEARDOWN: CountingTeardown = CountingTeardown::new();
        let key = create_key(&TEARDOWN);

        let outer = lease(key).unwrap();
        assert_eq!(lease(key).err(), Some(AccessError::Reentrant));
        assert_eq!(take(key).err(), Some(AccessError::Reentrant));
        drop(outer);
        assert!(lease(key).is_ok());
    }

    #[test]
    fn empty_lease_leaves_slot_vacant() {
        static TEARDOWN: CountingTeardown = CountingTeardown::new();
        let key = create_key(&TEARDOWN);

        thread::spawn(move || {
            let mut lease = lease(key).unwrap();
            let failed: Result<_, &str> = lease.get_or_try_fill(|| Err("no memory"));
            assert!(failed.is_err());
            drop(lease);
            assert!(!is_held(key));
        })
        .join()
        .unwrap();

        assert_eq!(TEARDOWN.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn install_and_take_bypass_teardown() {
        static TEARDOWN: CountingTeardown = CountingTeardown::new();
        let key = create_key(&TEARDOWN);

        thread::spawn(move || {
            let first = Block::zeroed(16).unwrap();
            let first_addr = first.addr();
            assert!(install(key, first).unwrap().is_none());

            let previous = install(key, Block::zeroed(64).unwrap()).unwrap();
            assert_eq!(previous.map(|b| b.addr()), Some(first_addr));

            let taken = take(key).unwrap().unwrap();
            assert_eq!(taken.len(), 64);
            assert!(take(key).unwrap().is_none());
        })
        .join()
        .unwrap();

        assert_eq!(TEARDOWN.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn keys_are_distinct() {
        static TEARDOWN: CountingTeardown = CountingTeardown::new();
        let a = create_key(&TEARDOWN);
        let b = create_key(&TEARDOWN);
        assert_ne!(a, b);
        assert!(key_count() > b.index());
    }
}
