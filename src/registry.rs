// this_file: src/registry.rs
//! Debug registry of live thread-local allocations.
//!
//! Every buffer a slot hands out is recorded with its owning thread, size and
//! the call site that first touched it, so leaked or unexpectedly large
//! thread-local buffers can be traced back to code. The registry is a plain
//! `HashMap` behind one mutex: adds and removes happen once per (slot, thread)
//! pair, never on the cache-hit path.
//!
//! Slots talk to the registry through [`ObjectTracker`]. With the
//! `debug-registry` feature disabled, [`tracker`] returns a no-op tracker with
//! the same interface.

use crate::error::RegistryError;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::Location;
use std::sync::{Mutex, PoisonError};

/// Identity of a live thread-local object (the block's address).
pub type ObjectId = usize;

/// Source location that first touched a slot on a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Site {
    pub file: &'static str,
    pub function: &'static str,
    pub line: u32,
    pub column: u32,
}

impl Site {
    pub const UNKNOWN_FUNCTION: &'static str = "<unknown>";

    pub fn new(file: &'static str, function: &'static str, line: u32, column: u32) -> Self {
        Self {
            file,
            function,
            line,
            column,
        }
    }

    /// The location of the caller, without a function name.
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self::new(
            location.file(),
            Self::UNKNOWN_FUNCTION,
            location.line(),
            location.column(),
        )
    }
}

/// Capture the current file, enclosing function, line and column as a [`Site`].
#[macro_export]
macro_rules! call_site {
    () => {{
        fn __here() {}
        fn __name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        let name = __name_of(__here);
        $crate::Site::new(
            file!(),
            name.strip_suffix("::__here").unwrap_or(name),
            line!(),
            column!(),
        )
    }};
}

/// One live thread-local allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    pub id: ObjectId,
    pub slot: &'static str,
    /// Name (or id) of the thread owning the buffer
    pub owner: String,
    pub size: usize,
    pub site: Site,
}

impl Entry {
    /// Describe an allocation owned by the calling thread.
    pub fn new(id: ObjectId, slot: &'static str, size: usize, site: Site) -> Self {
        let thread = std::thread::current();
        let owner = match thread.name() {
            Some(name) => name.to_string(),
            None => format!("{:?}", thread.id()),
        };
        Self {
            id,
            slot,
            owner,
            size,
            site,
        }
    }
}

/// Process-wide view of live thread-local allocations.
pub trait ObjectTracker: Sync {
    /// Whether entries are actually recorded.
    fn is_enabled(&self) -> bool;

    /// Record a new live allocation.
    fn add(&self, entry: Entry) -> Result<(), RegistryError>;

    /// Forget a live allocation.
    fn remove(&self, id: ObjectId) -> Result<(), RegistryError>;

    /// Move the entry for `old` to `new` with an updated size, in one step.
    fn replace(&self, old: ObjectId, new: ObjectId, size: usize) -> Result<(), RegistryError>;

    /// Point-in-time copy of every live entry, ordered by id.
    fn snapshot(&self) -> Vec<Entry>;

    /// Per call-site totals over the current snapshot.
    fn summary(&self) -> Summary {
        Summary::from_entries(&self.snapshot())
    }
}

/// Registry of live allocations keyed by object identity.
#[derive(Debug, Default)]
pub struct DebugRegistry {
    entries: Mutex<HashMap<ObjectId, Entry>>,
}

impl DebugRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: ObjectId) -> Option<Entry> {
        self.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl ObjectTracker for DebugRegistry {
    fn is_enabled(&self) -> bool {
        true
    }

    fn add(&self, entry: Entry) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        if entries.contains_key(&entry.id) {
            return Err(RegistryError::Duplicate(entry.id));
        }
        entries.insert(entry.id, entry);
        Ok(())
    }

    fn remove(&self, id: ObjectId) -> Result<(), RegistryError> {
        self.lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::Missing(id))
    }

    fn replace(&self, old: ObjectId, new: ObjectId, size: usize) -> Result<(), RegistryError> {
        let mut entries = self.lock();
        if old != new && entries.contains_key(&new) {
            return Err(RegistryError::Duplicate(new));
        }
        let mut entry = entries.remove(&old).ok_or(RegistryError::Missing(old))?;
        entry.id = new;
        entry.size = size;
        entries.insert(new, entry);
        Ok(())
    }

    fn snapshot(&self) -> Vec<Entry> {
        let mut snapshot: Vec<Entry> = self.lock().values().cloned().collect();
        snapshot.sort_by_key(|entry| entry.id);
        snapshot
    }
}

/// Tracker used when the debug registry is compiled out.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledTracker;

impl ObjectTracker for DisabledTracker {
    fn is_enabled(&self) -> bool {
        false
    }

    fn add(&self, _entry: Entry) -> Result<(), RegistryError> {
        Ok(())
    }

    fn remove(&self, _id: ObjectId) -> Result<(), RegistryError> {
        Ok(())
    }

    fn replace(&self, _old: ObjectId, _new: ObjectId, _size: usize) -> Result<(), RegistryError> {
        Ok(())
    }

    fn snapshot(&self) -> Vec<Entry> {
        Vec::new()
    }
}

/// The process-wide tracker used by every slot.
#[cfg(feature = "debug-registry")]
pub fn tracker() -> &'static dyn ObjectTracker {
    static REGISTRY: std::sync::OnceLock<DebugRegistry> = std::sync::OnceLock::new();
    REGISTRY.get_or_init(DebugRegistry::new)
}

/// The process-wide tracker used by every slot.
#[cfg(not(feature = "debug-registry"))]
pub fn tracker() -> &'static dyn ObjectTracker {
    &DisabledTracker
}

/// Report a registry violation found on an accessor or teardown path.
///
/// Fatal in debug builds, logged in release builds.
pub(crate) fn report_violation(slot: &'static str, operation: &str, err: RegistryError) {
    log::error!("thread storage `{}`: registry {} failed: {}", slot, operation, err);
    debug_assert!(
        false,
        "thread storage `{}`: registry {} failed: {}",
        slot, operation, err
    );
}

/// Allocation totals for one (file, function) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryRow {
    pub file: &'static str,
    pub function: &'static str,
    pub count: usize,
    pub bytes: usize,
}

/// Live allocations grouped by call site.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub rows: Vec<SummaryRow>,
    pub total_count: usize,
    pub total_bytes: usize,
}

impl Summary {
    pub fn from_entries(entries: &[Entry]) -> Self {
        let mut grouped: BTreeMap<(&'static str, &'static str), (usize, usize)> = BTreeMap::new();
        for entry in entries {
            let totals = grouped
                .entry((entry.site.file, entry.site.function))
                .or_insert((0, 0));
            totals.0 += 1;
            totals.1 += entry.size;
        }

        let rows: Vec<SummaryRow> = grouped
            .into_iter()
            .map(|((file, function), (count, bytes))| SummaryRow {
                file,
                function,
                count,
                bytes,
            })
            .collect();

        Self {
            total_count: rows.iter().map(|row| row.count).sum(),
            total_bytes: rows.iter().map(|row| row.bytes).sum(),
            rows,
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>10} {:>6}  {:<32} {}", "Size", "Count", "Function", "File")?;
        for row in &self.rows {
            writeln!(
                f,
                "{:>10} {:>6}  {:<32} {}",
                row.bytes, row.count, row.function, row.file
            )?;
        }
        write!(
            f,
            "{} bytes in {} allocation{}",
            self.total_bytes,
            self.total_count,
            if self.total_count == 1 { "" } else { "s" }
        )
    }
}

/// Text table of individual allocations.
pub struct AllocationTable<'a>(pub &'a [Entry]);

impl fmt::Display for AllocationTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>10}  {:<12} {:<16} {:<32} {:>5}  {}",
            "Size", "Slot", "Thread", "Function", "Line", "File"
        )?;
        let mut total = 0;
        for entry in self.0 {
            total += entry.size;
            writeln!(
                f,
                "{:>10}  {:<12} {:<16} {:<32} {:>5}  {}",
                entry.size,
                entry.slot,
                entry.owner,
                entry.site.function,
                entry.site.line,
                entry.site.file
            )?;
        }
        write!(
            f,
            "{} bytes in {} allocation{}",
            total,
            self.0.len(),
            if self.0.len() == 1 { "" } else { "s" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn entry(id: ObjectId, size: usize, function: &'static str) -> Entry {
        Entry::new(id, "test", size, Site::new("src/lib.rs", function, 10, 5))
    }

    #[test]
    fn add_and_remove() {
        let registry = DebugRegistry::new();
        registry.add(entry(0x10, 64, "a")).unwrap();
        registry.add(entry(0x20, 32, "b")).unwrap();
        assert_eq!(registry.len(), 2);

        registry.remove(0x10).unwrap();
        assert!(registry.get(0x10).is_none());
        assert_eq!(registry.get(0x20).map(|e| e.size), Some(32));
    }

    #[test]
    fn duplicate_add_is_reported() {
        let registry = DebugRegistry::new();
        registry.add(entry(0x10, 64, "a")).unwrap();
        assert_eq!(
            registry.add(entry(0x10, 8, "b")),
            Err(RegistryError::Duplicate(0x10))
        );
        assert_eq!(registry.get(0x10).map(|e| e.size), Some(64));
    }

    #[test]
    fn missing_remove_is_reported() {
        let registry = DebugRegistry::new();
        assert_eq!(registry.remove(0x99), Err(RegistryError::Missing(0x99)));
        registry.add(entry(0x99, 1, "a")).unwrap();
        registry.remove(0x99).unwrap();
        assert_eq!(registry.remove(0x99), Err(RegistryError::Missing(0x99)));
    }

    #[test]
    fn replace_moves_entry_and_keeps_provenance() {
        let registry = DebugRegistry::new();
        registry.add(entry(0x10, 64, "origin")).unwrap();

        registry.replace(0x10, 0x40, 256).unwrap();
        assert!(registry.get(0x10).is_none());
        let moved = registry.get(0x40).unwrap();
        assert_eq!(moved.size, 256);
        assert_eq!(moved.site.function, "origin");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn replace_in_place_updates_size() {
        let registry = DebugRegistry::new();
        registry.add(entry(0x10, 64, "a")).unwrap();
        registry.replace(0x10, 0x10, 128).unwrap();
        assert_eq!(registry.get(0x10).map(|e| e.size), Some(128));
    }

    #[test]
    fn failed_replace_leaves_registry_untouched() {
        let registry = DebugRegistry::new();
        registry.add(entry(0x10, 64, "a")).unwrap();
        registry.add(entry(0x20, 64, "b")).unwrap();

        assert_eq!(
            registry.replace(0x10, 0x20, 1),
            Err(RegistryError::Duplicate(0x20))
        );
        assert_eq!(
            registry.replace(0x30, 0x40, 1),
            Err(RegistryError::Missing(0x30))
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(0x10).map(|e| e.size), Some(64));
    }

    #[test]
    fn snapshot_is_ordered_copy() {
        let registry = DebugRegistry::new();
        for id in [0x30, 0x10, 0x20] {
            registry.add(entry(id, 1, "a")).unwrap();
        }
        let snapshot = registry.snapshot();
        registry.remove(0x10).unwrap();

        let ids: Vec<_> = snapshot.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0x10, 0x20, 0x30]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn summary_groups_by_site() {
        let registry = DebugRegistry::new();
        registry.add(entry(1, 64, "format")).unwrap();
        registry.add(entry(2, 64, "format")).unwrap();
        registry.add(entry(3, 512, "frames")).unwrap();

        let summary = registry.summary();
        assert_eq!(summary.total_count, 3);
        assert_eq!(summary.total_bytes, 640);
        assert_eq!(summary.rows.len(), 2);
        assert_eq!(summary.rows[0].function, "format");
        assert_eq!(summary.rows[0].count, 2);
        assert_eq!(summary.rows[0].bytes, 128);

        let text = summary.to_string();
        assert!(text.contains("frames"));
        assert!(text.ends_with("640 bytes in 3 allocations"));
    }

    #[test]
    fn allocation_table_lists_entries() {
        let entries = vec![entry(1, 64, "format")];
        let text = AllocationTable(&entries).to_string();
        assert!(text.contains("format"));
        assert!(text.ends_with("64 bytes in 1 allocation"));
    }

    #[test]
    fn concurrent_adds_and_removes() {
        let registry = Arc::new(DebugRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..100 {
                        let id = t * 1000 + i;
                        registry.add(entry(id, 8, "worker")).unwrap();
                        if i % 2 == 0 {
                            registry.remove(id).unwrap();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 16 * 50);
    }

    #[test]
    fn entry_records_owning_thread() {
        let owner = thread::Builder::new()
            .name("frame-worker".into())
            .spawn(|| entry(1, 1, "a").owner)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(owner, "frame-worker");
    }

    #[test]
    fn call_site_names_enclosing_function() {
        let site = crate::call_site!();
        assert!(site.function.ends_with("call_site_names_enclosing_function"));
        assert!(site.file.ends_with("registry.rs"));
    }

    #[test]
    fn disabled_tracker_is_inert() {
        let tracker = DisabledTracker;
        assert!(!tracker.is_enabled());
        tracker.add(entry(1, 1, "a")).unwrap();
        tracker.remove(42).unwrap();
        assert!(tracker.snapshot().is_empty());
        assert_eq!(tracker.summary(), Summary::default());
    }
}
