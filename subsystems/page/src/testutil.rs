//! Test doubles for the provider traits plus a preassembled test bed.
//! Test-only; nothing here ships.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;
use strata_hal::cpu::{CpuId, CpuTopology};
use strata_hal::{PhysAddr, PAGE_SIZE};

use crate::domain::DomainThresholds;
use crate::frame::{FrameTable, PageId, PhysSegment, NO_ORDER};
use crate::provider::{
    CpuPageCache, Pager, PagerFault, PagePool, Pmap, PhysProvider, ReservProvider,
};
use crate::system::{PageConfig, PageSystem};
use crate::{AllocClass, AllocFlags};

const PHYS_BASE: u64 = 0x10_0000;
const SECOND_BASE: u64 = 0x80_0000;

/// First-fit ascending physical allocator over a shared frame table.
pub struct TestPhys {
    frames: Arc<FrameTable>,
    free: Mutex<Vec<bool>>,
}

impl TestPhys {
    fn new(frames: Arc<FrameTable>) -> Self {
        let mut free = Vec::new();
        free.resize(frames.len(), true);
        for pid in (0..frames.len() as u32).map(PageId::new) {
            frames.get(pid).set_free_order(0);
        }
        Self { frames, free: Mutex::new(free) }
    }

    fn take(&self, free: &mut [bool], pid: PageId) {
        free[pid.index()] = false;
        self.frames.get(pid).set_free_order(NO_ORDER);
    }

    /// Free-list membership, for assertions.
    pub fn is_free_probe(&self, pid: PageId) -> bool {
        self.free.lock()[pid.index()]
    }
}

impl PhysProvider for TestPhys {
    fn alloc_pages(&self, domain: u32, _pool: PagePool, order: u8) -> Option<PageId> {
        let run = 1usize << order;
        let mut free = self.free.lock();
        let mut i = 0;
        while i + run <= free.len() {
            let ok = (i..i + run).all(|k| {
                free[k] && self.frames.get(PageId::new(k as u32)).domain() == domain
            });
            if ok {
                for k in i..i + run {
                    self.take(&mut free, PageId::new(k as u32));
                }
                return Some(PageId::new(i as u32));
            }
            i += 1;
        }
        None
    }

    fn free_pages(&self, pid: PageId, order: u8) {
        let mut free = self.free.lock();
        for k in 0..1usize << order {
            let p = pid.offset(k as u32);
            assert!(!free[p.index()], "double free into the physical allocator");
            free[p.index()] = true;
            self.frames.get(p).set_free_order(0);
        }
    }

    fn alloc_contig(
        &self,
        domain: u32,
        npages: usize,
        low: PhysAddr,
        high: PhysAddr,
        align: u64,
        boundary: u64,
    ) -> Option<PageId> {
        let mut free = self.free.lock();
        for start in 0..free.len().saturating_sub(npages - 1) {
            let first = PageId::new(start as u32);
            let pa = self.frames.get(first).phys();
            if pa < low
                || pa.add((npages * PAGE_SIZE) as u64) > high
                || !pa.is_aligned(align)
                || (boundary != 0
                    && pa.as_u64() % boundary + (npages * PAGE_SIZE) as u64 > boundary)
            {
                continue;
            }
            if self.frames.contiguous_offset(first, npages as u32 - 1).is_none() {
                continue;
            }
            let ok = (start..start + npages).all(|k| {
                free[k] && self.frames.get(PageId::new(k as u32)).domain() == domain
            });
            if ok {
                for k in start..start + npages {
                    self.take(&mut free, PageId::new(k as u32));
                }
                return Some(first);
            }
        }
        None
    }

    fn free_run_order(&self, pid: PageId) -> Option<u8> {
        self.free.lock()[pid.index()].then_some(0)
    }

    fn is_free(&self, pid: PageId) -> bool {
        self.free.lock()[pid.index()]
    }
}

/// Reservation layer that never has reservations.
pub struct NullReserv;

impl ReservProvider for NullReserv {
    fn alloc_page(&self, _object: u64, _pindex: u64, _domain: u32) -> Option<PageId> {
        None
    }

    fn alloc_contig(
        &self,
        _object: u64,
        _pindex: u64,
        _domain: u32,
        _npages: usize,
        _low: PhysAddr,
        _high: PhysAddr,
        _align: u64,
        _boundary: u64,
    ) -> Option<PageId> {
        None
    }

    fn is_page_free(&self, _pid: PageId) -> bool {
        false
    }

    fn level_of(&self, _pid: PageId) -> Option<u8> {
        None
    }

    fn is_fully_populated(&self, _pid: PageId) -> bool {
        false
    }
}

/// Recording pmap.
#[derive(Default)]
pub struct TestPmap {
    zeroed: Mutex<Vec<u32>>,
    copies: AtomicU64,
    unmaps: AtomicU64,
}

impl TestPmap {
    pub fn was_zeroed(&self, pid: PageId) -> bool {
        self.zeroed.lock().contains(&pid.raw())
    }

    pub fn copies(&self) -> u64 {
        self.copies.load(Ordering::Relaxed)
    }

    pub fn unmaps(&self) -> u64 {
        self.unmaps.load(Ordering::Relaxed)
    }
}

impl Pmap for TestPmap {
    fn remove_all_mappings(&self, _pid: PageId) {
        self.unmaps.fetch_add(1, Ordering::Relaxed);
    }

    fn remove_write_mappings(&self, _pid: PageId) {}

    fn is_mapped(&self, _pid: PageId) -> bool {
        false
    }

    fn is_modified(&self, _pid: PageId) -> bool {
        false
    }

    fn clear_modified(&self, _pid: PageId) {}

    fn copy(&self, _src: PageId, _dst: PageId) {
        self.copies.fetch_add(1, Ordering::Relaxed);
    }

    fn zero(&self, pid: PageId) {
        self.zeroed.lock().push(pid.raw());
    }
}

/// Cache that absorbs nothing and holds nothing.
pub struct NullCache;

impl CpuPageCache for NullCache {
    fn cache_alloc(&self, _cpu: CpuId, _domain: u32, _pool: PagePool) -> Option<PageId> {
        None
    }

    fn cache_release_batch(&self, _cpu: CpuId, _domain: u32, _pages: &[PageId]) -> usize {
        0
    }
}

/// Scripted pager: `back` marks indices as present with a read-ahead
/// hint, `fail_next` injects a fault into the next read.
#[derive(Default)]
pub struct TestPager {
    backed: Mutex<HashMap<u64, usize>>,
    fault: Mutex<Option<PagerFault>>,
    reads: AtomicU64,
}

impl TestPager {
    pub fn back(&self, pindex: u64, ahead: usize) {
        self.backed.lock().insert(pindex, ahead);
    }

    pub fn fail_next(&self, fault: PagerFault) {
        *self.fault.lock() = Some(fault);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

impl Pager for TestPager {
    fn has_page(&self, _object: u64, pindex: u64) -> Option<usize> {
        self.backed.lock().get(&pindex).copied()
    }

    fn get_pages(&self, _object: u64, _pages: &[PageId]) -> Result<(), PagerFault> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        match self.fault.lock().take() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

/// A fully wired page system over test doubles.
pub struct TestBed {
    pub sys: PageSystem,
    pub phys: Arc<TestPhys>,
    pub pmap: Arc<TestPmap>,
}

impl TestBed {
    fn assemble(segments: &[PhysSegment], config: PageConfig) -> Self {
        let frames = Arc::new(FrameTable::new(
            segments,
            PageSystem::required_markers(config.domains),
        ));
        let phys = Arc::new(TestPhys::new(Arc::clone(&frames)));
        let pmap = Arc::new(TestPmap::default());
        let sys = PageSystem::new(
            config,
            frames,
            Arc::clone(&phys) as Arc<dyn PhysProvider>,
            Arc::new(NullReserv),
            Arc::clone(&pmap) as Arc<dyn Pmap>,
            Arc::new(NullCache),
        );
        Self { sys, phys, pmap }
    }

    fn loose_thresholds() -> DomainThresholds {
        DomainThresholds {
            free_reserved: 2,
            interrupt_reserve: 1,
            free_severe: 3,
            free_min: 4,
            free_target: 4,
        }
    }

    /// One domain, one CPU, `pages` frames, generous thresholds.
    pub fn with_pages(pages: u32) -> Self {
        Self::assemble(
            &[PhysSegment { start: PhysAddr::new(PHYS_BASE), pages, domain: 0 }],
            PageConfig {
                topology: CpuTopology::new(2),
                domains: 1,
                thresholds: Some(Self::loose_thresholds()),
                ..PageConfig::default()
            },
        )
    }

    /// The default small bed used by most tests.
    pub fn small() -> Self {
        Self::with_pages(16)
    }

    /// One domain with pinned watermarks.
    pub fn with_thresholds(pages: u32, thresholds: DomainThresholds) -> Self {
        Self::assemble(
            &[PhysSegment { start: PhysAddr::new(PHYS_BASE), pages, domain: 0 }],
            PageConfig {
                topology: CpuTopology::new(2),
                domains: 1,
                thresholds: Some(thresholds),
                ..PageConfig::default()
            },
        )
    }

    /// Two domains in separate segments.
    pub fn two_domains(pages0: u32, pages1: u32) -> Self {
        Self::assemble(
            &[
                PhysSegment { start: PhysAddr::new(PHYS_BASE), pages: pages0, domain: 0 },
                PhysSegment { start: PhysAddr::new(SECOND_BASE), pages: pages1, domain: 1 },
            ],
            PageConfig {
                topology: CpuTopology::new(2),
                domains: 2,
                thresholds: Some(Self::loose_thresholds()),
                ..PageConfig::default()
            },
        )
    }

    /// Physical base address of the first segment.
    pub fn phys_base(&self) -> PhysAddr {
        PhysAddr::new(PHYS_BASE)
    }

    /// Allocate one exclusively busied page from domain 0.
    pub fn take_free_page(&self) -> PageId {
        self.sys
            .on_cpu(CpuId::BOOT)
            .alloc_page(None, &[0], AllocClass::Normal, AllocFlags::empty())
            .expect("test bed out of pages")
    }
}
