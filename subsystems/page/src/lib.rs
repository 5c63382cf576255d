//! # Strata Page Subsystem
//!
//! The physical-page lifecycle manager. Every frame of RAM gets one
//! fixed descriptor at boot; this crate multiplexes concurrent
//! allocation, freeing, busy/wire/object-reference tracking, and
//! reclamation-queue placement over those descriptors, across NUMA
//! domains and CPUs.
//!
//! ## Key Pieces
//!
//! - [`frame`]: the descriptor table, one [`frame::PageFrame`] per frame
//! - [`busy`] / [`refstate`]: per-page mutual exclusion and the packed
//!   wire/object-reference word
//! - [`astate`] / [`queue`]: the deferred queue state machine with
//!   per-CPU batching
//! - [`domain`]: per-domain free accounting and backpressure
//! - [`grab`]: lookup-or-allocate-and-acquire, with pager integration
//! - [`reclaim`]: contiguous-region reclamation by page relocation
//!
//! External collaborators (buddy allocator, reservations, pmap, pager,
//! per-CPU cache) are consumed through the traits in [`provider`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod astate;
pub mod busy;
pub mod domain;
pub mod frame;
pub mod grab;
pub mod object;
pub mod provider;
pub mod queue;
pub mod reclaim;
pub mod refstate;
pub mod system;
pub mod wait;

#[cfg(test)]
pub(crate) mod testutil;

#[cfg(test)]
mod tests;

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

pub use frame::PageId;
pub use provider::PagerError;
pub use system::{CpuCtx, PageConfig, PageSystem};

/// Result type for fallible page operations
pub type PageResult<T> = Result<T, PageError>;

/// Errors surfaced by page operations.
///
/// Transient contention (busy conflicts, stale identities, CAS races)
/// never reaches callers; those retry internally from lookup. What is
/// left is resource exhaustion, refusal to block, and backing-store
/// failure. Invariant violations do not get an error variant: they
/// panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageError {
    /// No page could be allocated at the caller's allocation class
    NoPage,
    /// A non-blocking acquire found the page busied by someone else
    WouldBlock,
    /// The target object index is already populated
    Exists,
    /// The backing store failed to provide data
    Pager(PagerError),
}

/// Allocation classes, in increasing order of permitted depth into the
/// per-domain free reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocClass {
    /// Normal request: may not dig below the full free reserve
    Normal,
    /// System request: may dig down to the interrupt reserve
    System,
    /// Interrupt-time request: may drain the free count to zero
    Interrupt,
}

bitflags! {
    /// Request flags for allocation and grab operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Wire the page before returning it
        const WIRED = 1 << 0;
        /// Return the page zero-filled
        const ZERO = 1 << 1;
        /// Return the page without holding its busy lock
        const NOBUSY = 1 << 2;
        /// Return the page shared-busied instead of exclusively busied
        const SBUSY = 1 << 3;
        /// Exclude the page from kernel dumps
        const NODUMP = 1 << 4;
        /// Block on the per-domain free condition instead of failing
        /// when no page is available
        const WAITOK = 1 << 5;
        /// Grab only: report a miss instead of allocating
        const NOCREAT = 1 << 6;
        /// Grab only: fail with `WouldBlock` instead of sleeping on a
        /// busy conflict
        const NOWAIT = 1 << 7;
        /// The caller is the domain's reclamation daemon and may be
        /// promoted from `Normal` to `System` admission
        const RECLAIMER = 1 << 8;
    }
}

/// Subsystem-wide event counters.
///
/// All counters are updated relaxed; they are diagnostics, not
/// synchronization.
#[derive(Debug, Default)]
pub struct PageStats {
    /// CAS retries while publishing activity-state transitions
    pub astate_retries: AtomicU64,
    /// Per-CPU batches drained because they filled up
    pub batch_flushes: AtomicU64,
    /// Batched queue entries discarded as stale at drain time
    pub batch_stale: AtomicU64,
    /// Allocation attempts refused by class admission
    pub alloc_fails: AtomicU64,
    /// Grab attempts restarted after a stale-identity acquire
    pub grab_restarts: AtomicU64,
    /// Contiguous-reclamation run attempts
    pub reclaim_runs: AtomicU64,
    /// Pages successfully relocated out of contiguous runs
    pub reclaim_relocated: AtomicU64,
    /// Reclamation-daemon wakeups requested
    pub daemon_wakeups: AtomicU64,
    /// Free-count threshold crossings that woke allocation waiters
    pub free_wakeups: AtomicU64,
}

/// Point-in-time copy of [`PageStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageStatsSnapshot {
    /// CAS retries while publishing activity-state transitions
    pub astate_retries: u64,
    /// Per-CPU batches drained because they filled up
    pub batch_flushes: u64,
    /// Batched queue entries discarded as stale at drain time
    pub batch_stale: u64,
    /// Allocation attempts refused by class admission
    pub alloc_fails: u64,
    /// Grab attempts restarted after a stale-identity acquire
    pub grab_restarts: u64,
    /// Contiguous-reclamation run attempts
    pub reclaim_runs: u64,
    /// Pages successfully relocated out of contiguous runs
    pub reclaim_relocated: u64,
    /// Reclamation-daemon wakeups requested
    pub daemon_wakeups: u64,
    /// Free-count threshold crossings that woke allocation waiters
    pub free_wakeups: u64,
}

impl PageStats {
    /// Capture a consistent-enough snapshot for reporting.
    pub fn snapshot(&self) -> PageStatsSnapshot {
        PageStatsSnapshot {
            astate_retries: self.astate_retries.load(Ordering::Relaxed),
            batch_flushes: self.batch_flushes.load(Ordering::Relaxed),
            batch_stale: self.batch_stale.load(Ordering::Relaxed),
            alloc_fails: self.alloc_fails.load(Ordering::Relaxed),
            grab_restarts: self.grab_restarts.load(Ordering::Relaxed),
            reclaim_runs: self.reclaim_runs.load(Ordering::Relaxed),
            reclaim_relocated: self.reclaim_relocated.load(Ordering::Relaxed),
            daemon_wakeups: self.daemon_wakeups.load(Ordering::Relaxed),
            free_wakeups: self.free_wakeups.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
