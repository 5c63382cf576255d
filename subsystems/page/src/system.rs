//! # Page System
//!
//! Boot-time assembly of the page layer: the descriptor table, domain
//! state, per-CPU batches, and the provider handles, plus the
//! allocation, freeing, and wiring entry points. Built once at boot;
//! nothing here is ever torn down.
//!
//! Operations that stage per-CPU work (allocation, freeing, queue
//! placement) go through the [`CpuCtx`] view obtained from
//! [`PageSystem::on_cpu`]; a kernel would pin it to the executing CPU.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::RwLock;
use strata_hal::cpu::{CpuId, CpuTopology};
use strata_hal::PhysAddr;

use crate::astate::{QueueId, QUEUE_COUNT};
use crate::busy::{ALLOC_EXCLUSIVE, ALLOC_SHARED, ALLOC_UNBUSIED};
use crate::domain::{DomainTable, DomainThresholds};
use crate::frame::{FrameTable, PageFlags, PageId, NO_ORDER};
use crate::object::{ObjectGuard, VmObject};
use crate::provider::{CpuPageCache, PagePool, Pmap, PhysProvider, ReservProvider};
use crate::queue::PerCpuTable;
use crate::wait::WaitTable;
use crate::{AllocClass, AllocFlags, PageError, PageResult, PageStats};

/// Boot-time configuration of the page layer.
#[derive(Debug, Clone, Copy)]
pub struct PageConfig {
    /// Processor topology; sizes the per-CPU batch tables
    pub topology: CpuTopology,
    /// Number of NUMA domains
    pub domains: usize,
    /// Watermark override; derived from domain size when `None`
    pub thresholds: Option<DomainThresholds>,
    /// Cap on the pager read-ahead window, requested page included
    pub readahead_max: usize,
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            topology: CpuTopology::new(1),
            domains: 1,
            thresholds: None,
            readahead_max: 16,
        }
    }
}

/// The page lifecycle manager. One per system, built at boot.
pub struct PageSystem {
    frames: Arc<FrameTable>,
    domains: DomainTable,
    percpu: PerCpuTable,
    busy_waiters: WaitTable,
    objects: RwLock<HashMap<u64, Weak<VmObject>>>,
    next_token: AtomicU64,
    phys: Arc<dyn PhysProvider>,
    reserv: Arc<dyn ReservProvider>,
    pmap: Arc<dyn Pmap>,
    cache: Arc<dyn CpuPageCache>,
    config: PageConfig,
    stats: PageStats,
}

impl PageSystem {
    /// Sentinel descriptors the frame table must be created with for a
    /// given domain count.
    pub const fn required_markers(domains: usize) -> usize {
        domains * QUEUE_COUNT
    }

    /// Assemble the page layer. `frames` must carry
    /// [`Self::required_markers`] sentinel descriptors; the providers
    /// are expected to have seeded their free metadata from the same
    /// table.
    pub fn new(
        config: PageConfig,
        frames: Arc<FrameTable>,
        phys: Arc<dyn PhysProvider>,
        reserv: Arc<dyn ReservProvider>,
        pmap: Arc<dyn Pmap>,
        cache: Arc<dyn CpuPageCache>,
    ) -> Self {
        let domains = DomainTable::new(&frames, config.domains, config.thresholds);
        let percpu = PerCpuTable::new(config.topology.cpu_count(), config.domains);
        log::info!(
            "page system up: {} frames, {} domains, {} cpus",
            frames.len(),
            config.domains,
            config.topology.cpu_count()
        );
        Self {
            frames,
            domains,
            percpu,
            busy_waiters: WaitTable::new(128),
            objects: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            phys,
            reserv,
            pmap,
            cache,
            config,
            stats: PageStats::default(),
        }
    }

    /// The descriptor table.
    #[inline]
    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    /// Per-domain state.
    #[inline]
    pub fn domains(&self) -> &DomainTable {
        &self.domains
    }

    /// Event counters.
    #[inline]
    pub fn stats(&self) -> &PageStats {
        &self.stats
    }

    /// Boot configuration.
    #[inline]
    pub fn config(&self) -> &PageConfig {
        &self.config
    }

    /// Per-CPU view used by operations that stage batched work.
    #[inline]
    pub fn on_cpu(&self, cpu: CpuId) -> CpuCtx<'_> {
        CpuCtx { sys: self, cpu }
    }

    pub(crate) fn percpu(&self) -> &PerCpuTable {
        &self.percpu
    }

    pub(crate) fn busy_waiters(&self) -> &WaitTable {
        &self.busy_waiters
    }

    pub(crate) fn object_registry(&self) -> &RwLock<HashMap<u64, Weak<VmObject>>> {
        &self.objects
    }

    pub(crate) fn next_object_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn pmap(&self) -> &dyn Pmap {
        &*self.pmap
    }

    pub(crate) fn phys(&self) -> &dyn PhysProvider {
        &*self.phys
    }

    pub(crate) fn reserv(&self) -> &dyn ReservProvider {
        &*self.reserv
    }

    // ------------------------------------------------------------------
    // Valid/dirty surface
    // ------------------------------------------------------------------

    fn assert_busied(&self, pid: PageId) {
        let s = self.frames.get(pid).busy_snapshot();
        assert!(
            s.is_exclusive() || s.is_shared(),
            "page {:#x}: valid/dirty access without busy hold",
            self.frames.get(pid).phys().as_u64()
        );
    }

    /// Mark `[base, base + len)` of the page valid.
    pub fn set_valid_range(&self, pid: PageId, base: usize, len: usize) {
        self.assert_busied(pid);
        self.frames.get(pid).set_valid_range(base, len);
    }

    /// Mark the whole page dirty.
    pub fn set_dirty(&self, pid: PageId) {
        self.assert_busied(pid);
        self.frames.get(pid).set_dirty_all();
    }

    /// Whether the whole page holds meaningful data.
    pub fn is_valid(&self, pid: PageId) -> bool {
        self.frames.get(pid).is_all_valid()
    }

    /// Whether `[base, base + len)` holds meaningful data.
    pub fn is_valid_range(&self, pid: PageId, base: usize, len: usize) -> bool {
        let mask = crate::frame::PageFrame::bits_for_range(base, len);
        self.frames.get(pid).valid_bits() & mask == mask
    }

    /// Fold the hardware modification record into the dirty mask.
    pub fn test_dirty(&self, pid: PageId) {
        self.assert_busied(pid);
        if self.pmap.is_modified(pid) {
            self.pmap.clear_modified(pid);
            self.frames.get(pid).set_dirty_all();
        }
    }
}

impl core::fmt::Debug for PageSystem {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageSystem")
            .field("frames", &self.frames.len())
            .field("domains", &self.domains.count())
            .finish()
    }
}

/// Per-CPU view of the page system. Operations that stage batched
/// queue work or touch the per-CPU page cache live here.
#[derive(Clone, Copy)]
pub struct CpuCtx<'a> {
    pub(crate) sys: &'a PageSystem,
    pub(crate) cpu: CpuId,
}

impl<'a> CpuCtx<'a> {
    /// The shared system.
    #[inline]
    pub fn system(&self) -> &'a PageSystem {
        self.sys
    }

    /// The CPU this view stages work for.
    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate one page, optionally inserting it into an object at
    /// the given index. Domains are tried in the caller's preference
    /// order; with [`AllocFlags::WAITOK`] the call blocks on the
    /// per-domain free condition instead of failing.
    ///
    /// The page comes back exclusively busied unless the flags say
    /// otherwise, wired if requested, never queued.
    pub fn alloc_page(
        &self,
        object: Option<(&VmObject, u64)>,
        domains: &[u32],
        class: AllocClass,
        flags: AllocFlags,
    ) -> PageResult<PageId> {
        assert!(
            !flags.contains(AllocFlags::NOBUSY | AllocFlags::SBUSY),
            "NOBUSY and SBUSY are mutually exclusive"
        );
        loop {
            let attempt = match object {
                Some((obj, pindex)) => {
                    let guard = obj.lock();
                    self.alloc_attempt(Some((obj, &guard, pindex)), domains, class, flags)
                }
                None => self.alloc_attempt(None, domains, class, flags),
            };
            match attempt {
                Err(PageError::NoPage) if flags.contains(AllocFlags::WAITOK) => {
                    self.sys.wait_for_free_any(domains, class);
                }
                other => return other,
            }
        }
    }

    /// One non-blocking sweep over the domain set. The object lock, if
    /// any, is held by the caller for the whole sweep.
    pub(crate) fn alloc_attempt(
        &self,
        target: Option<(&VmObject, &ObjectGuard<'_>, u64)>,
        domains: &[u32],
        class: AllocClass,
        flags: AllocFlags,
    ) -> PageResult<PageId> {
        let reclaimer = flags.contains(AllocFlags::RECLAIMER);
        let pool = if target.is_some() { PagePool::Default } else { PagePool::Direct };
        for &d in domains {
            let dom = self.sys.domains.get(d);
            if !dom.try_reserve(class, 1, reclaimer) {
                PageStats::bump(&self.sys.stats.alloc_fails);
                self.sys.wake_daemon_if_needed(d);
                continue;
            }
            // Draw order: reservation, per-CPU cache, buddy.
            let drawn = target
                .and_then(|(obj, _, pindex)| self.sys.reserv.alloc_page(obj.token(), pindex, d))
                .or_else(|| self.sys.cache.cache_alloc(self.cpu, d, pool))
                .or_else(|| self.sys.phys.alloc_pages(d, pool, 0));
            let Some(pid) = drawn else {
                dom.release(1, &self.sys.stats);
                continue;
            };
            self.init_allocated(pid, flags);
            if let Some((obj, guard, pindex)) = target {
                if let Err(e) = self.sys.insert_locked(obj, guard, pid, pindex) {
                    self.unwind_fresh_page(pid, flags);
                    return Err(e);
                }
            }
            self.sys.wake_daemon_if_needed(d);
            return Ok(pid);
        }
        Err(PageError::NoPage)
    }

    /// Allocate `npages` physically contiguous pages, optionally
    /// inserting them into an object at consecutive indices starting
    /// at `pindex`. Returns the first page.
    #[allow(clippy::too_many_arguments)]
    pub fn alloc_contig(
        &self,
        object: Option<(&VmObject, u64)>,
        domains: &[u32],
        class: AllocClass,
        flags: AllocFlags,
        npages: usize,
        low: PhysAddr,
        high: PhysAddr,
        align: u64,
        boundary: u64,
    ) -> PageResult<PageId> {
        assert!(npages > 0, "alloc_contig of zero pages");
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        assert!(
            boundary == 0 || boundary.is_power_of_two(),
            "boundary must be zero or a power of two"
        );
        let reclaimer = flags.contains(AllocFlags::RECLAIMER);
        loop {
            for &d in domains {
                let dom = self.sys.domains.get(d);
                if !dom.try_reserve(class, npages as u64, reclaimer) {
                    PageStats::bump(&self.sys.stats.alloc_fails);
                    self.sys.wake_daemon_if_needed(d);
                    continue;
                }
                let drawn = object
                    .and_then(|(obj, pindex)| {
                        self.sys.reserv.alloc_contig(
                            obj.token(),
                            pindex,
                            d,
                            npages,
                            low,
                            high,
                            align,
                            boundary,
                        )
                    })
                    .or_else(|| self.sys.phys.alloc_contig(d, npages, low, high, align, boundary));
                let Some(first) = drawn else {
                    dom.release(npages as u64, &self.sys.stats);
                    continue;
                };
                for i in 0..npages {
                    self.init_allocated(first.offset(i as u32), flags);
                }
                if let Some((obj, pindex)) = object {
                    let guard = obj.lock();
                    for i in 0..npages {
                        let pid = first.offset(i as u32);
                        if let Err(e) = self.sys.insert_locked(obj, &guard, pid, pindex + i as u64)
                        {
                            for k in 0..i {
                                let inserted = first.offset(k as u32);
                                self.sys.remove_locked(obj, &guard, inserted);
                            }
                            drop(guard);
                            for k in 0..npages {
                                self.unwind_fresh_page(first.offset(k as u32), flags);
                            }
                            return Err(e);
                        }
                    }
                }
                self.sys.wake_daemon_if_needed(d);
                return Ok(first);
            }
            if !flags.contains(AllocFlags::WAITOK) {
                return Err(PageError::NoPage);
            }
            self.sys.wait_for_free_any(domains, class);
        }
    }

    /// Re-initialize a page just drawn from the free layers.
    pub(crate) fn init_allocated(&self, pid: PageId, flags: AllocFlags) {
        let frame = self.sys.frames.get(pid);
        frame.ref_settle_for_alloc();
        let was_zero = frame.flags().contains(PageFlags::ZERO);
        let mut fl = PageFlags::empty();
        if flags.contains(AllocFlags::NODUMP) {
            fl |= PageFlags::NODUMP;
        }
        frame.set_flags(fl);
        frame.set_free_order(NO_ORDER);
        frame.clear_valid_dirty();
        debug_assert!(frame.activity().queue.is_none(), "allocated page still queued");
        let busy_word = if flags.contains(AllocFlags::NOBUSY) {
            ALLOC_UNBUSIED
        } else if flags.contains(AllocFlags::SBUSY) {
            ALLOC_SHARED
        } else {
            ALLOC_EXCLUSIVE
        };
        frame.busy_init_alloc(busy_word);
        if flags.contains(AllocFlags::WIRED) {
            frame.wire_acquire();
        }
        if flags.contains(AllocFlags::ZERO) && !was_zero {
            self.sys.pmap.zero(pid);
        }
    }

    /// Undo [`Self::init_allocated`] on a page that never became
    /// reachable, returning it to the free layers.
    pub(crate) fn unwind_fresh_page(&self, pid: PageId, flags: AllocFlags) {
        let frame = self.sys.frames.get(pid);
        if flags.contains(AllocFlags::WIRED) {
            frame.wire_release();
        }
        if flags.contains(AllocFlags::SBUSY) {
            frame.unbusy_shared_raw();
        }
        if !frame.busy_snapshot().is_exclusive() {
            let ok = frame.try_busy_exclusive_raw();
            debug_assert!(ok, "unwound page acquired by someone else");
        }
        self.sys.mark_freed_and_wake(pid);
        self.release_to_free_pool(pid);
    }

    // ------------------------------------------------------------------
    // Freeing
    // ------------------------------------------------------------------

    /// Free an exclusively busied page: unlink it from its object,
    /// pull it off any queue, and hand it back to the free layers.
    /// Passing the owning object saves a registry lookup.
    pub fn free_page(&self, object: Option<&VmObject>, pid: PageId) {
        let frame = self.sys.frames.get(pid);
        let snap = frame.busy_snapshot();
        assert!(
            snap.is_exclusive(),
            "page {:#x}: freeing page not exclusively busied",
            frame.phys().as_u64()
        );
        if frame.ref_snapshot().has_objref() {
            let owner_token = frame.owner_token();
            match object {
                Some(obj) => {
                    assert_eq!(
                        obj.token(),
                        owner_token,
                        "page {:#x}: freed against the wrong object",
                        frame.phys().as_u64()
                    );
                    self.sys.remove_from_object(obj, pid);
                }
                None => {
                    let obj = self.sys.resolve_object(owner_token).unwrap_or_else(|| {
                        panic!(
                            "page {:#x}: owner object died while owning pages",
                            frame.phys().as_u64()
                        )
                    });
                    self.sys.remove_from_object(&obj, pid);
                }
            }
        }
        self.sys.dequeue(pid);
        let rs = frame.ref_snapshot();
        assert!(
            rs.wires() == 0,
            "page {:#x}: freeing wired page",
            frame.phys().as_u64()
        );
        debug_assert!(
            !self.sys.pmap.is_mapped(pid),
            "page {:#x}: freeing page with live mappings",
            frame.phys().as_u64()
        );
        frame.clear_valid_dirty();
        self.sys.mark_freed_and_wake(pid);
        self.release_to_free_pool(pid);
    }

    /// Hand a retired page to the per-CPU cache, falling back to the
    /// buddy allocator, and credit the domain's free counter.
    pub(crate) fn release_to_free_pool(&self, pid: PageId) {
        let d = self.sys.frames.get(pid).domain();
        let absorbed = self.sys.cache.cache_release_batch(self.cpu, d, &[pid]);
        if absorbed == 0 {
            self.sys.phys.free_pages(pid, 0);
        }
        self.sys.domains.get(d).release(1, &self.sys.stats);
    }

    // ------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------

    /// Pin the page against reclamation. The first wiring forces a
    /// deferred dequeue instead of queue residency.
    pub fn wire(&self, pid: PageId) {
        let frame = self.sys.frames.get(pid);
        debug_assert!(
            !frame.busy_snapshot().is_freed(),
            "page {:#x}: wiring a free page",
            frame.phys().as_u64()
        );
        let old = frame.wire_acquire();
        if old.wires() == 0 {
            self.dequeue_deferred(pid);
        }
    }

    /// Drop one wiring. On the last one the page is freed if no object
    /// owns it, otherwise re-admitted to `target`.
    pub fn unwire(&self, pid: PageId, target: QueueId) {
        let frame = self.sys.frames.get(pid);
        let old = frame.wire_release();
        if old.wires() != 1 {
            return;
        }
        if old.has_objref() {
            self.move_to(pid, target, false);
        } else if self.sys.try_busy_exclusive(pid) {
            self.free_page(None, pid);
        } else {
            // A concurrent busy holder reached the page first; the
            // page's fate is theirs now.
            log::debug!("unwire: orphan page {:#x} left to busy holder", pid.raw());
        }
    }

    /// Drop one wiring acquired for a transient hold, re-admitting the
    /// page to the inactive queue.
    pub fn release(&self, pid: PageId) {
        self.unwire(pid, QueueId::Inactive);
    }
}
