//! Execute-path allocation instrumentation.
//!
//! Debug builds route heap traffic through [TrackingAllocator]; the graph
//! arms the counter when the execute walk starts and checks it at the end.
//! Any non-zero count is a broken pre-allocation contract and is fatal.
//! Release builds compile the tracker down to nothing.
//!
//! The counting state is necessarily process-global (the allocator hook has
//! no other channel), but it is inert until a host installs the allocator:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: vixen_core::alloc::TrackingAllocator = vixen_core::alloc::TrackingAllocator;
//! ```

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::error::{GraphError, Result};

static ARMED: AtomicBool = AtomicBool::new(false);
static ALLOC_COUNT: AtomicU64 = AtomicU64::new(0);
static ALLOC_BYTES: AtomicU64 = AtomicU64::new(0);
static LARGEST_SITE: AtomicUsize = AtomicUsize::new(0);

/// Drop-in `System` wrapper that counts allocations while armed.
pub struct TrackingAllocator;

unsafe impl GlobalAlloc for TrackingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if ARMED.load(Ordering::Relaxed) {
            ALLOC_COUNT.fetch_add(1, Ordering::Relaxed);
            ALLOC_BYTES.fetch_add(layout.size() as u64, Ordering::Relaxed);
            LARGEST_SITE.fetch_max(layout.size(), Ordering::Relaxed);
        }
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ARMED.load(Ordering::Relaxed) {
            ALLOC_COUNT.fetch_add(1, Ordering::Relaxed);
            ALLOC_BYTES.fetch_add(new_size as u64, Ordering::Relaxed);
            LARGEST_SITE.fetch_max(new_size, Ordering::Relaxed);
        }
        System.realloc(ptr, layout, new_size)
    }
}

/// Snapshot of the counters at check time.
#[derive(Copy, Clone, Debug, Default)]
pub struct AllocationReport {
    pub count: u64,
    pub bytes: u64,
    pub largest: usize,
}

/// Arms and checks the global counters. Held by the graph; does nothing
/// unless tracking was enabled (debug build + `ENABLE_ALLOCATION_TRACKING`).
pub struct AllocationTracker {
    enabled: bool,
}

impl AllocationTracker {
    pub fn new(enabled: bool) -> AllocationTracker {
        AllocationTracker {
            enabled: enabled && cfg!(debug_assertions),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Zeroes the counters and starts counting.
    pub fn arm(&self) {
        if !self.enabled {
            return;
        }
        ALLOC_COUNT.store(0, Ordering::Relaxed);
        ALLOC_BYTES.store(0, Ordering::Relaxed);
        LARGEST_SITE.store(0, Ordering::Relaxed);
        ARMED.store(true, Ordering::SeqCst);
    }

    /// Stops counting and returns the snapshot.
    pub fn disarm(&self) -> AllocationReport {
        if !self.enabled {
            return AllocationReport::default();
        }
        ARMED.store(false, Ordering::SeqCst);
        AllocationReport {
            count: ALLOC_COUNT.load(Ordering::Relaxed),
            bytes: ALLOC_BYTES.load(Ordering::Relaxed),
            largest: LARGEST_SITE.load(Ordering::Relaxed),
        }
    }

    /// Disarms and fails if anything was counted.
    pub fn check_zero(&self) -> Result<AllocationReport> {
        let report = self.disarm();
        if report.count != 0 {
            return Err(GraphError::AllocationViolated {
                count: report.count,
                bytes: report.bytes,
            });
        }
        Ok(report)
    }
}
