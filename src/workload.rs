// this_file: src/workload.rs
//! Synthetic workloads over the built-in slots.
//!
//! A workload spawns worker threads that repeatedly touch thread-local slots,
//! takes a registry snapshot while every worker still holds its buffers, then
//! lets the workers exit and checks that nothing was left behind. The CLI uses
//! this to exercise and report on the registry.

use crate::alloc::TrackingAllocator;
use crate::error::{Error, InitError, Result};
use crate::logging::Timer;
use crate::registry::{tracker, Entry, Summary};
use crate::storage::{CleanupFn, InitFn, NoInit, PlainRelease, ThreadStorage};
use crate::thread_storage_get;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

/// Maximum allowed JSON input size (1MB)
pub const MAX_JSON_SIZE: usize = 1024 * 1024;

/// Maximum number of worker threads per workload
pub const MAX_THREADS: usize = 256;

/// Maximum touches per slot per worker
pub const MAX_TOUCHES: usize = 10_000;

/// Maximum buffer size a workload may request (16MB)
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Header written at the start of every frame buffer.
pub const FRAME_HEADER: &[u8; 4] = b"FRM1";

/// Names of the built-in slots, as recorded in the registry.
pub const SLOT_NAMES: [&str; 3] = ["format", "frames", "scratch"];

static WORKLOAD_ALLOC: TrackingAllocator = TrackingAllocator::unlimited();

static FORMAT_BUF: ThreadStorage = ThreadStorage::new("format").with_allocator(&WORKLOAD_ALLOC);

static FRAME_CACHE: ThreadStorage<InitFn, PlainRelease> =
    ThreadStorage::with_hooks("frames", stamp_frame_header as InitFn, PlainRelease)
        .with_allocator(&WORKLOAD_ALLOC);

static SCRATCH: ThreadStorage<NoInit, CleanupFn> =
    ThreadStorage::with_hooks("scratch", NoInit, scrub as CleanupFn)
        .with_allocator(&WORKLOAD_ALLOC);

fn stamp_frame_header(buf: &mut [u8]) -> std::result::Result<(), InitError> {
    match buf.get_mut(..FRAME_HEADER.len()) {
        Some(header) => {
            header.copy_from_slice(FRAME_HEADER);
            Ok(())
        }
        None => Err(InitError::new(format!(
            "frame buffer of {} bytes cannot hold the {}-byte header",
            buf.len(),
            FRAME_HEADER.len()
        ))),
    }
}

fn scrub(buf: &mut [u8]) {
    buf.fill(0);
}

/// Workload description
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkloadSpec {
    /// Number of worker threads
    pub threads: usize,
    /// Touches per slot per worker
    #[serde(default = "default_touches")]
    pub touches: usize,
    /// Byte budget for all workload buffers, in kilobytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_kb: Option<usize>,
    /// Slots each worker touches, in order
    pub slots: Vec<SlotTouch>,
}

/// One slot touched by every worker
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlotTouch {
    /// Built-in slot name ("format", "frames" or "scratch")
    pub slot: String,
    /// Buffer size requested on each touch
    pub size: usize,
}

fn default_touches() -> usize {
    3
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            threads: 4,
            touches: default_touches(),
            memory_limit_kb: None,
            slots: vec![
                SlotTouch {
                    slot: "format".into(),
                    size: 256,
                },
                SlotTouch {
                    slot: "frames".into(),
                    size: 4096,
                },
                SlotTouch {
                    slot: "scratch".into(),
                    size: 1024,
                },
            ],
        }
    }
}

impl WorkloadSpec {
    /// The default workload with a different thread count and buffer size.
    pub fn uniform(threads: usize, size: usize) -> Self {
        let mut spec = Self {
            threads,
            ..Self::default()
        };
        for touch in &mut spec.slots {
            touch.size = size;
        }
        spec
    }
}

/// Outcome of a workload run
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadReport {
    pub threads: usize,
    pub touches: usize,
    /// Whether the debug registry was compiled in
    pub registry_enabled: bool,
    /// Registry entries while every worker held its buffers
    pub live: Vec<Entry>,
    /// `live` grouped by call site
    pub summary: Summary,
    /// Registry entries still present after every worker exited
    pub leaked: Vec<Entry>,
    /// Workload bytes still allocated after every worker exited
    pub bytes_outstanding: usize,
    /// Errors reported by workers
    pub failures: Vec<String>,
    pub elapsed_ms: f64,
}

/// Parse a workload specification from JSON
pub fn parse_workload(json: &str) -> Result<WorkloadSpec> {
    if json.len() > MAX_JSON_SIZE {
        return Err(Error::InvalidParameter(format!(
            "JSON input too large: {} bytes (max: {} bytes)",
            json.len(),
            MAX_JSON_SIZE
        )));
    }
    let spec: WorkloadSpec = serde_json::from_str(json)?;
    validate_workload(&spec)?;
    Ok(spec)
}

/// Check a workload against the configured limits
pub fn validate_workload(spec: &WorkloadSpec) -> Result<()> {
    if spec.threads == 0 || spec.threads > MAX_THREADS {
        return Err(Error::InvalidParameter(format!(
            "threads must be between 1 and {}, got {}",
            MAX_THREADS, spec.threads
        )));
    }
    if spec.touches == 0 || spec.touches > MAX_TOUCHES {
        return Err(Error::InvalidParameter(format!(
            "touches must be between 1 and {}, got {}",
            MAX_TOUCHES, spec.touches
        )));
    }
    if spec.slots.is_empty() {
        return Err(Error::InvalidParameter("workload touches no slots".into()));
    }
    for touch in &spec.slots {
        if !SLOT_NAMES.iter().any(|name| *name == touch.slot) {
            return Err(Error::InvalidParameter(format!(
                "unknown slot '{}' (expected one of: {})",
                touch.slot,
                SLOT_NAMES.join(", ")
            )));
        }
        if touch.size > MAX_BUFFER_SIZE {
            return Err(Error::InvalidParameter(format!(
                "buffer too large for slot '{}': {} bytes (max: {} bytes)",
                touch.slot, touch.size, MAX_BUFFER_SIZE
            )));
        }
    }
    Ok(())
}

fn touch(slot: &str, size: usize, worker: usize) -> Result<()> {
    let marker = worker as u8;
    match slot {
        "format" => thread_storage_get!(FORMAT_BUF, size, |buf: &mut [u8]| {
            if let Some(first) = buf.first_mut() {
                *first = marker;
            }
        }),
        "frames" => thread_storage_get!(FRAME_CACHE, size, |buf: &mut [u8]| {
            if let Some(body) = buf.get_mut(FRAME_HEADER.len()) {
                *body = body.wrapping_add(1);
            }
        }),
        "scratch" => thread_storage_get!(SCRATCH, size, |buf: &mut [u8]| {
            if let Some(last) = buf.last_mut() {
                *last = marker;
            }
        }),
        other => Err(Error::InvalidParameter(format!("unknown slot '{}'", other))),
    }
}

fn is_workload_entry(entry: &Entry) -> bool {
    SLOT_NAMES.contains(&entry.slot)
}

fn workload_entries() -> Vec<Entry> {
    tracker()
        .snapshot()
        .into_iter()
        .filter(is_workload_entry)
        .collect()
}

/// Gate holding workers alive until the snapshot has been taken.
#[derive(Default)]
struct ReleaseGate {
    released: Mutex<bool>,
    cond: Condvar,
}

impl ReleaseGate {
    fn wait(&self) {
        let mut released = self.released.lock().unwrap_or_else(PoisonError::into_inner);
        while !*released {
            released = self
                .cond
                .wait(released)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn open(&self) {
        *self.released.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }
}

/// Run a workload to completion and report what the registry saw
pub fn run_workload(spec: &WorkloadSpec) -> Result<WorkloadReport> {
    validate_workload(spec)?;
    let timer = Timer::new(format!("workload with {} threads", spec.threads));

    WORKLOAD_ALLOC.set_limit(
        spec.memory_limit_kb.map_or(usize::MAX, |kb| kb.saturating_mul(1024)),
    );

    let gate = Arc::new(ReleaseGate::default());
    let failures = Arc::new(Mutex::new(Vec::new()));
    let (ready_tx, ready_rx) = mpsc::channel();
    let mut handles = Vec::with_capacity(spec.threads);

    for worker in 0..spec.threads {
        let worker_gate = Arc::clone(&gate);
        let failures = Arc::clone(&failures);
        let ready = ready_tx.clone();
        let slots = spec.slots.clone();
        let touches = spec.touches;

        let spawned = thread::Builder::new()
            .name(format!("worker-{}", worker))
            .spawn(move || {
                for _ in 0..touches {
                    for slot in &slots {
                        if let Err(err) = touch(&slot.slot, slot.size, worker) {
                            failures
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .push(format!("worker-{}: {}", worker, err));
                        }
                    }
                }
                let _ = ready.send(worker);
                drop(ready);
                worker_gate.wait();
            });

        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                warn!("failed to spawn worker {}: {}", worker, err);
                gate.open();
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(err.into());
            }
        }
    }
    drop(ready_tx);

    for _ in 0..handles.len() {
        if ready_rx.recv().is_err() {
            break;
        }
    }

    let live = workload_entries();
    let summary = Summary::from_entries(&live);
    debug!("{} live thread-local buffers before release", live.len());

    gate.open();
    for handle in handles {
        if handle.join().is_err() {
            failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push("worker panicked".to_string());
        }
    }

    let leaked = workload_entries();
    if !leaked.is_empty() {
        warn!("{} thread-local buffers outlived their threads", leaked.len());
    }
    let failures = std::mem::take(&mut *failures.lock().unwrap_or_else(PoisonError::into_inner));

    let report = WorkloadReport {
        threads: spec.threads,
        touches: spec.touches,
        registry_enabled: tracker().is_enabled(),
        live,
        summary,
        leaked,
        bytes_outstanding: WORKLOAD_ALLOC.current_usage(),
        failures,
        elapsed_ms: timer.elapsed_ms(),
    };
    info!(
        "workload finished: {} live entries, {} leaked, {} failures; {}",
        report.live.len(),
        report.leaked.len(),
        report.failures.len(),
        WORKLOAD_ALLOC.stats()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workload_defaults_touches() {
        let spec = parse_workload(r#"{"threads": 2, "slots": [{"slot": "format", "size": 64}]}"#)
            .unwrap();
        assert_eq!(spec.threads, 2);
        assert_eq!(spec.touches, 3);
        assert!(spec.memory_limit_kb.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_workloads() {
        let mut spec = WorkloadSpec::default();
        spec.threads = 0;
        assert!(validate_workload(&spec).is_err());

        let mut spec = WorkloadSpec::default();
        spec.slots[0].slot = "nope".into();
        let err = validate_workload(&spec).unwrap_err();
        assert!(err.to_string().contains("unknown slot"));

        let mut spec = WorkloadSpec::default();
        spec.slots[1].size = MAX_BUFFER_SIZE + 1;
        assert!(validate_workload(&spec).is_err());

        let spec = WorkloadSpec {
            slots: Vec::new(),
            ..WorkloadSpec::default()
        };
        assert!(validate_workload(&spec).is_err());
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(matches!(parse_workload("{"), Err(Error::Json(_))));
    }

    #[test]
    fn test_frame_header_init() {
        let mut small = [0u8; 2];
        assert!(stamp_frame_header(&mut small).is_err());

        let mut frame = [0u8; 16];
        stamp_frame_header(&mut frame).unwrap();
        assert_eq!(&frame[..4], FRAME_HEADER);
    }

    #[test]
    fn test_uniform_sets_every_slot_size() {
        let spec = WorkloadSpec::uniform(8, 512);
        assert_eq!(spec.threads, 8);
        assert!(spec.slots.iter().all(|touch| touch.size == 512));
    }

    #[test]
    fn test_run_workload_releases_everything() {
        let spec = WorkloadSpec {
            threads: 3,
            touches: 2,
            memory_limit_kb: None,
            slots: vec![
                SlotTouch {
                    slot: "format".into(),
                    size: 128,
                },
                SlotTouch {
                    slot: "frames".into(),
                    size: 2,
                },
            ],
        };
        let report = run_workload(&spec).unwrap();

        // frames fails its header check on every touch
        assert_eq!(report.failures.len(), 3 * 2);
        assert!(report.failures[0].contains("frames"));
        assert!(report.leaked.is_empty());
        assert_eq!(report.bytes_outstanding, 0);

        if report.registry_enabled {
            assert_eq!(report.live.len(), 3);
            assert!(report.live.iter().all(|entry| entry.slot == "format"));
            assert_eq!(report.summary.total_bytes, 3 * 128);
        } else {
            assert!(report.live.is_empty());
        }
    }
}
