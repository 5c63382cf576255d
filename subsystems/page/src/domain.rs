//! # Domain Free Accounting & Backpressure
//!
//! Per-NUMA-domain free counters, the allocation-class admission
//! control over them, and the waiter machinery that blocks callers
//! until a threshold is crossed. The free counter is a single atomic,
//! CAS-retried; the counter is the only admission authority, while the
//! pages themselves come from the physical layers.
//!
//! A separate channel signals the domain's reclamation daemon under
//! its own watermark, decoupled from allocation waiters.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::astate::{QueueId, ALL_QUEUES, QUEUE_COUNT};
use crate::frame::FrameTable;
use crate::queue::PageQueue;
use crate::system::PageSystem;
use crate::{AllocClass, PageStats};

/// Free-count watermarks of one domain, fixed at boot.
#[derive(Debug, Clone, Copy)]
pub struct DomainThresholds {
    /// Floor for `Normal` allocations
    pub free_reserved: u64,
    /// Floor for `System` allocations
    pub interrupt_reserve: u64,
    /// Below this the domain is severely short; critical waiters queue
    /// here
    pub free_severe: u64,
    /// Below this ordinary waiters queue and the domain counts as short
    pub free_min: u64,
    /// Below this the reclamation daemon has work
    pub free_target: u64,
}

impl DomainThresholds {
    /// Derive watermarks from the domain's page count.
    pub fn derive(npages: u64) -> Self {
        let free_reserved = (npages / 64).max(8);
        let interrupt_reserve = (free_reserved / 2).max(4);
        let free_severe = free_reserved + (npages / 256).max(4);
        let free_min = free_reserved + (npages / 64).max(8);
        let free_target = free_min * 2;
        Self { free_reserved, interrupt_reserve, free_severe, free_min, free_target }
    }
}

/// Free-page accounting and queues of one NUMA domain.
pub struct DomainFreeState {
    id: u32,
    free_count: AtomicU64,
    thresholds: DomainThresholds,
    queues: [PageQueue; QUEUE_COUNT],
    min_waiters: AtomicU32,
    severe_waiters: AtomicU32,
    min_chan: crate::wait::WaitChannel,
    severe_chan: crate::wait::WaitChannel,
    daemon_chan: crate::wait::WaitChannel,
}

impl DomainFreeState {
    /// Domain id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current free-page count.
    #[inline]
    pub fn free_count(&self) -> u64 {
        self.free_count.load(Ordering::Acquire)
    }

    /// The domain's watermarks.
    #[inline]
    pub fn thresholds(&self) -> &DomainThresholds {
        &self.thresholds
    }

    /// This domain's list for `q`.
    #[inline]
    pub fn queue(&self, q: QueueId) -> &PageQueue {
        &self.queues[q.raw() as usize]
    }

    /// Whether the free count sits below the ordinary-shortage line.
    #[inline]
    pub fn is_free_min(&self) -> bool {
        self.free_count() < self.thresholds.free_min
    }

    /// Whether the free count sits below the severe-shortage line.
    #[inline]
    pub fn is_free_severe(&self) -> bool {
        self.free_count() < self.thresholds.free_severe
    }

    /// Whether the reclamation daemon has work to do.
    #[inline]
    pub fn needs_reclaim(&self) -> bool {
        self.free_count() < self.thresholds.free_target
    }

    fn class_floor(&self, class: AllocClass, reclaimer: bool) -> u64 {
        match class {
            AllocClass::Interrupt => 0,
            AllocClass::System => self.thresholds.interrupt_reserve,
            // The domain's reclamation daemon digs to the System
            // floor so it can make progress under shortage.
            AllocClass::Normal if reclaimer => self.thresholds.interrupt_reserve,
            AllocClass::Normal => self.thresholds.free_reserved,
        }
    }

    /// Atomically subtract `n` from the free counter unless that would
    /// cross the class floor. Never blocks.
    pub(crate) fn try_reserve(&self, class: AllocClass, n: u64, reclaimer: bool) -> bool {
        let floor = self.class_floor(class, reclaimer);
        let mut cur = self.free_count.load(Ordering::Acquire);
        loop {
            if cur < n || cur - n < floor {
                return false;
            }
            match self.free_count.compare_exchange_weak(
                cur,
                cur - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Return `n` pages to the counter and wake whichever waiter class
    /// the new level satisfies.
    pub(crate) fn release(&self, n: u64, stats: &PageStats) {
        let old = self.free_count.fetch_add(n, Ordering::AcqRel);
        let new = old + n;
        if self.severe_waiters.load(Ordering::Acquire) > 0
            && old < self.thresholds.free_severe
            && new >= self.thresholds.free_severe
        {
            self.severe_chan.wake_all();
            PageStats::bump(&stats.free_wakeups);
        }
        if self.min_waiters.load(Ordering::Acquire) > 0
            && old < self.thresholds.free_min
            && new >= self.thresholds.free_min
        {
            self.min_chan.wake_all();
            PageStats::bump(&stats.free_wakeups);
        }
    }

    pub(crate) fn wake_daemon(&self, stats: &PageStats) {
        self.daemon_chan.wake_all();
        PageStats::bump(&stats.daemon_wakeups);
    }
}

impl core::fmt::Debug for DomainFreeState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DomainFreeState")
            .field("id", &self.id)
            .field("free", &self.free_count())
            .finish()
    }
}

/// All domains, created at boot and never resized.
#[derive(Debug)]
pub struct DomainTable {
    domains: Box<[DomainFreeState]>,
}

impl DomainTable {
    /// Build domain state from the frame table's segment geometry.
    /// Each domain's free count starts at its frame count; markers are
    /// taken from the table's sentinel descriptors, four per domain.
    pub(crate) fn new(
        frames: &FrameTable,
        domains: usize,
        overrides: Option<DomainThresholds>,
    ) -> Self {
        let counts = frames.frames_per_domain(domains);
        let mut markers = frames.marker_ids();
        let mut table = Vec::with_capacity(domains);
        for (id, &npages) in counts.iter().enumerate() {
            let thresholds = overrides.unwrap_or_else(|| DomainThresholds::derive(npages));
            let queues = ALL_QUEUES.map(|q| {
                let marker = markers.next().unwrap_or_else(|| {
                    panic!("domain {id}: frame table is short of queue markers")
                });
                PageQueue::new(frames, q, marker)
            });
            table.push(DomainFreeState {
                id: id as u32,
                free_count: AtomicU64::new(npages),
                thresholds,
                queues,
                min_waiters: AtomicU32::new(0),
                severe_waiters: AtomicU32::new(0),
                min_chan: crate::wait::WaitChannel::new(),
                severe_chan: crate::wait::WaitChannel::new(),
                daemon_chan: crate::wait::WaitChannel::new(),
            });
            log::info!(
                "domain {id}: {npages} pages, reserve {}/{}",
                thresholds.free_reserved,
                thresholds.interrupt_reserve
            );
        }
        Self { domains: table.into_boxed_slice() }
    }

    /// Number of domains.
    #[inline]
    pub fn count(&self) -> usize {
        self.domains.len()
    }

    /// One domain's state.
    #[inline]
    pub fn get(&self, domain: u32) -> &DomainFreeState {
        &self.domains[domain as usize]
    }

    /// One domain's list for `q`.
    #[inline]
    pub fn queue(&self, domain: u32, q: QueueId) -> &PageQueue {
        self.get(domain).queue(q)
    }

    /// Iterate over all domains.
    pub fn iter(&self) -> impl Iterator<Item = &DomainFreeState> {
        self.domains.iter()
    }
}

impl PageSystem {
    /// Block until `domain` can plausibly admit a request of `class`.
    /// Callers retry their allocation afterwards; admission is never
    /// guaranteed, only re-attempted.
    pub fn wait_for_free(&self, domain: u32, class: AllocClass) {
        let d = self.domains().get(domain);
        let (waiters, chan, threshold) = match class {
            AllocClass::Normal => (&d.min_waiters, &d.min_chan, d.thresholds.free_min),
            _ => (&d.severe_waiters, &d.severe_chan, d.thresholds.free_severe),
        };
        loop {
            if d.free_count() >= threshold {
                return;
            }
            waiters.fetch_add(1, Ordering::AcqRel);
            let gen = chan.generation();
            if d.free_count() >= threshold {
                waiters.fetch_sub(1, Ordering::AcqRel);
                return;
            }
            d.wake_daemon(self.stats());
            chan.sleep_until(gen, || d.free_count() >= threshold);
            waiters.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Block until any domain of the set can plausibly admit `class`.
    pub fn wait_for_free_any(&self, domains: &[u32], class: AllocClass) {
        if let [single] = domains {
            self.wait_for_free(*single, class);
            return;
        }
        loop {
            for &d in domains {
                let dom = self.domains().get(d);
                let threshold = match class {
                    AllocClass::Normal => dom.thresholds.free_min,
                    _ => dom.thresholds.free_severe,
                };
                if dom.free_count() >= threshold {
                    return;
                }
                dom.wake_daemon(self.stats());
            }
            strata_hal::cpu::relax();
        }
    }

    /// Daemon side: sleep until the domain drops below its reclaim
    /// watermark.
    pub fn wait_for_reclaim_work(&self, domain: u32) {
        let d = self.domains().get(domain);
        loop {
            if d.needs_reclaim() {
                return;
            }
            let gen = d.daemon_chan.generation();
            if d.needs_reclaim() {
                return;
            }
            d.daemon_chan.sleep_until(gen, || d.needs_reclaim());
        }
    }

    /// Nudge the reclamation daemon when the domain has fallen under
    /// its watermark.
    pub(crate) fn wake_daemon_if_needed(&self, domain: u32) {
        let d = self.domains().get(domain);
        if d.needs_reclaim() {
            d.wake_daemon(self.stats());
        }
    }
}
