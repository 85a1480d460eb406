//! Memory budget accounting.
//!
//! Budgets are advisory soft limits with a hard ceiling per memory kind.
//! Crossing the soft limit succeeds within a configured overdraft margin and
//! logs; crossing the hard limit fails.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};

use crate::error::{Component, GraphError, Result};

/// The memory kinds tracked by the budget manager.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    DeviceLocal,
    HostVisible,
    Staging,
}

impl MemoryKind {
    fn index(self) -> usize {
        match self {
            MemoryKind::DeviceLocal => 0,
            MemoryKind::HostVisible => 1,
            MemoryKind::Staging => 2,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct BudgetLimits {
    pub soft: u64,
    pub hard: u64,
}

impl Default for BudgetLimits {
    fn default() -> BudgetLimits {
        BudgetLimits {
            soft: 256 << 20,
            hard: 512 << 20,
        }
    }
}

/// Proof of a granted reservation. Released explicitly through
/// [BudgetManager::release]; dropping one without releasing leaks budget and
/// is reported at teardown in debug builds.
#[derive(Debug)]
#[must_use = "reservations must be released back to the budget manager"]
pub struct Reservation {
    kind: MemoryKind,
    bytes: u64,
}

impl Reservation {
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

pub struct BudgetManager {
    limits: [BudgetLimits; 3],
    used: [AtomicU64; 3],
    /// Fraction of the soft limit usable as overdraft, in percent.
    overdraft_pct: u64,
}

impl BudgetManager {
    pub fn new(
        device_local: BudgetLimits,
        host_visible: BudgetLimits,
        staging: BudgetLimits,
        overdraft_pct: u64,
    ) -> BudgetManager {
        BudgetManager {
            limits: [device_local, host_visible, staging],
            used: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            overdraft_pct,
        }
    }

    pub fn limits(&self, kind: MemoryKind) -> BudgetLimits {
        self.limits[kind.index()]
    }

    pub fn used(&self, kind: MemoryKind) -> u64 {
        self.used[kind.index()].load(Ordering::Acquire)
    }

    /// Attempts to reserve `bytes` of `kind` memory.
    ///
    /// Grants within the soft limit silently, within soft + overdraft with a
    /// warning, and fails against the hard ceiling or exhausted overdraft.
    pub fn reserve(&self, kind: MemoryKind, bytes: u64) -> Result<Reservation> {
        let limits = self.limits[kind.index()];
        let overdraft = limits.soft * self.overdraft_pct / 100;
        let ceiling = limits.hard.min(limits.soft + overdraft);

        let used = &self.used[kind.index()];
        let mut current = used.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if next > ceiling {
                return Err(GraphError::BudgetExhausted {
                    component: Component::Budget,
                    requested: bytes,
                    available: ceiling.saturating_sub(current),
                });
            }
            match used.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if next > limits.soft {
                        warn!(
                            "{:?} budget overdraft: {} of {} soft bytes in use",
                            kind, next, limits.soft
                        );
                    } else {
                        debug!("{:?} budget: reserved {} bytes ({} in use)", kind, bytes, next);
                    }
                    return Ok(Reservation { kind, bytes });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, reservation: Reservation) {
        let used = &self.used[reservation.kind.index()];
        let prev = used.fetch_sub(reservation.bytes, Ordering::AcqRel);
        debug_assert!(
            prev >= reservation.bytes,
            "budget release exceeds reserved amount"
        );
    }

    /// Utilization per kind, for stats reporting: (used, soft, hard).
    pub fn utilization(&self, kind: MemoryKind) -> (u64, u64, u64) {
        let limits = self.limits[kind.index()];
        (self.used(kind), limits.soft, limits.hard)
    }
}
