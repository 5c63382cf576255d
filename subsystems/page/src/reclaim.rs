//! # Contiguous Reclamation
//!
//! Satisfies contiguous allocations on a fragmented system by
//! relocating live pages out of a physical run. A scan finds runs
//! whose pages are reclaimable (free, reservation-eligible, or owned
//! by an evictable object and unbusied); each occupied page is then
//! blocked against wiring, unmapped, copied into a replacement page,
//! and spliced out of its object at the same index. A single page
//! failure aborts the run; up to three passes run with progressively
//! relaxed restrictions on breaking up reservations and superpages.
//!
//! Reclamation never sleeps. Callers that strike out are expected to
//! wait on the domain free condition and retry.

use alloc::vec::Vec;

use strata_hal::{PhysAddr, PAGE_SIZE};

use crate::frame::PageId;
use crate::object::MemAttr;
use crate::system::{CpuCtx, PageSystem};
use crate::{AllocClass, AllocFlags, PageError, PageResult, PageStats};

/// Runs remembered per scan pass; older finds are overwritten.
pub const NRUNS: usize = 16;

/// Reclaimed pages that end a pass early.
pub const MIN_RECLAIM: usize = 8;

/// Restrictions on what a scan pass may break up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOptions {
    /// Leave all reservations intact
    NoReservBreak,
    /// Break partial reservations but leave full superpages intact
    NoSuperBreak,
    /// Anything relocatable goes
    Any,
}

impl CpuCtx<'_> {
    /// Reclaim a contiguous run of `npages` frames inside
    /// `[low, high)`, aligned to `align` and not crossing a `boundary`
    /// multiple. Domains are tried in id order. Returns whether any
    /// run was fully reclaimed; on failure the caller should wait for
    /// free pages and retry.
    pub fn reclaim_contig(
        &self,
        class: AllocClass,
        npages: usize,
        low: PhysAddr,
        high: PhysAddr,
        align: u64,
        boundary: u64,
    ) -> bool {
        assert!(npages > 0, "reclaiming a zero-length run");
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        assert!(
            boundary == 0 || boundary.is_power_of_two(),
            "boundary must be zero or a power of two"
        );
        (0..self.sys.domains().count() as u32)
            .any(|d| self.reclaim_contig_domain(d, class, npages, low, high, align, boundary))
    }

    /// Single-domain reclamation, three passes.
    #[allow(clippy::too_many_arguments)]
    pub fn reclaim_contig_domain(
        &self,
        domain: u32,
        class: AllocClass,
        npages: usize,
        low: PhysAddr,
        high: PhysAddr,
        align: u64,
        boundary: u64,
    ) -> bool {
        let dom = self.sys.domains().get(domain);
        let t = dom.thresholds();
        let free = dom.free_count();
        // Relocation consumes replacement pages; refuse outright when
        // the free count cannot cover the request at this class.
        let admissible = match class {
            AllocClass::Normal => free >= npages as u64 + t.free_reserved,
            AllocClass::System => free >= npages as u64 + t.interrupt_reserve,
            AllocClass::Interrupt => free >= npages as u64,
        };
        if !admissible {
            return false;
        }

        let mut options = ScanOptions::NoReservBreak;
        loop {
            log::debug!(
                "reclaim domain {domain}: scanning for {npages} pages, options {options:?}"
            );
            // Remember the most recent NRUNS candidates; reclaim in
            // LIFO order so the highest runs go first.
            let mut ring = [PageId::new(0); NRUNS];
            let mut found = 0usize;
            let mut cur_low = low;
            while let Some(run) =
                self.sys.scan_contig(domain, npages, cur_low, high, align, boundary, options)
            {
                ring[found % NRUNS] = run;
                found += 1;
                cur_low = self
                    .sys
                    .frames()
                    .get(run)
                    .phys()
                    .add(npages as u64 * PAGE_SIZE as u64);
            }

            let mut reclaimed = 0usize;
            for k in 0..found.min(NRUNS) {
                let run = ring[(found - 1 - k) % NRUNS];
                PageStats::bump(&self.sys.stats().reclaim_runs);
                if self.reclaim_run(class, run, npages, high).is_ok() {
                    reclaimed += npages;
                    if reclaimed >= MIN_RECLAIM {
                        return true;
                    }
                }
            }

            options = match options {
                ScanOptions::NoReservBreak => ScanOptions::NoSuperBreak,
                ScanOptions::NoSuperBreak => ScanOptions::Any,
                ScanOptions::Any => return reclaimed != 0,
            };
        }
    }

    /// Relocate every live page in the run and free the whole run.
    /// Any single-page failure aborts; pages already freed stay freed
    /// (the operation is idempotent across retries).
    fn reclaim_run(
        &self,
        class: AllocClass,
        run_start: PageId,
        npages: usize,
        high: PhysAddr,
    ) -> PageResult<()> {
        let sys = self.sys;
        let frames = sys.frames();
        let domain = frames.get(run_start).domain();
        let mut freed: Vec<PageId> = Vec::new();
        let mut result = Ok(());

        let mut i = 0u32;
        'run: while (i as usize) < npages {
            let pid = run_start.offset(i);
            i += 1;
            let frame = frames.get(pid);
            'page: loop {
                if frame.ref_snapshot().wires() > 0 {
                    result = Err(PageError::WouldBlock);
                    break 'run;
                }
                let token = frame.owner_token();
                if token == 0 {
                    // Unowned: already free, or mid-transition.
                    if let Some(order) = sys.phys().free_run_order(pid) {
                        // Skip the rest of the free run.
                        i += (1u32 << order) - 1;
                        break 'page;
                    }
                    if sys.reserv().is_page_free(pid) || sys.phys().is_free(pid) {
                        break 'page;
                    }
                    result = Err(PageError::WouldBlock);
                    break 'run;
                }
                let Some(obj) = sys.resolve_object(token) else {
                    result = Err(PageError::WouldBlock);
                    break 'run;
                };
                let guard = obj.lock();
                // The page may have moved while we chased the lock.
                if frame.owner_token() != token || obj.lookup(frame.pindex()) != Some(pid) {
                    continue 'page;
                }
                if !obj.kind().evictable()
                    || obj.memattr() != MemAttr::Default
                    || frame.ref_snapshot().wires() > 0
                    || frame.activity().queue.is_none()
                    || !frame.busy_snapshot().is_unbusied()
                {
                    result = Err(PageError::WouldBlock);
                    break 'run;
                }

                if !frame.is_any_valid() {
                    // No meaningful data; discard in place.
                    if !frame.try_busy_exclusive_raw() {
                        result = Err(PageError::WouldBlock);
                        break 'run;
                    }
                    sys.dequeue(pid);
                    sys.remove_locked(&obj, &guard, pid);
                    frame.clear_valid_dirty();
                    sys.mark_freed_and_wake(pid);
                    freed.push(pid);
                    break 'page;
                }

                // Live data: block new wirings, unmap, and relocate.
                if !frame.try_block() {
                    result = Err(PageError::WouldBlock);
                    break 'run;
                }
                if obj.ref_count() > 0 {
                    sys.pmap().remove_all_mappings(pid);
                }
                // A mapping-based wiring may have raced the unmap.
                if frame.ref_snapshot().wires() > 0 {
                    frame.clear_block();
                    result = Err(PageError::WouldBlock);
                    break 'run;
                }
                let Some(new_pid) = self.alloc_replacement(class, run_start, npages, high) else {
                    frame.clear_block();
                    result = Err(PageError::NoPage);
                    break 'run;
                };
                if !frame.try_busy_exclusive_raw() {
                    frame.clear_block();
                    self.unwind_fresh_page(new_pid, AllocFlags::empty());
                    result = Err(PageError::WouldBlock);
                    break 'run;
                }

                sys.pmap().copy(pid, new_pid);
                let new_frame = frames.get(new_pid);
                new_frame.copy_contents_state(frame);
                sys.dequeue(pid);
                let pindex = frame.pindex();
                sys.remove_locked(&obj, &guard, pid);
                sys.insert_locked(&obj, &guard, new_pid, pindex).unwrap_or_else(|_| {
                    panic!("replacement insert failed at index {pindex}")
                });
                frame.clear_block();
                frame.clear_valid_dirty();
                sys.mark_freed_and_wake(pid);
                freed.push(pid);
                PageStats::bump(&sys.stats().reclaim_relocated);

                // The replacement rejoins reclamation before the
                // object unlocks.
                self.deactivate(new_pid);
                sys.unbusy(new_pid);
                break 'page;
            }
        }

        if !freed.is_empty() {
            for &pid in &freed {
                sys.phys().free_pages(pid, 0);
            }
            sys.domains().get(domain).release(freed.len() as u64, sys.stats());
        }
        result
    }

    /// Allocate the one-page relocation target: preferably above
    /// `high`, then below the run, and between the run's end and
    /// `high` only as a last resort.
    fn alloc_replacement(
        &self,
        class: AllocClass,
        run_start: PageId,
        npages: usize,
        high: PhysAddr,
    ) -> Option<PageId> {
        let run_pa = self.sys.frames().get(run_start).phys();
        let run_end = run_pa.add(npages as u64 * PAGE_SIZE as u64);
        self.alloc_one_in_range(class, high, PhysAddr::new(u64::MAX))
            .or_else(|| self.alloc_one_in_range(class, PhysAddr::ZERO, run_pa))
            .or_else(|| self.alloc_one_in_range(class, run_end, high))
    }

    fn alloc_one_in_range(
        &self,
        class: AllocClass,
        low: PhysAddr,
        high: PhysAddr,
    ) -> Option<PageId> {
        if low >= high {
            return None;
        }
        for d in 0..self.sys.domains().count() as u32 {
            let dom = self.sys.domains().get(d);
            if !dom.try_reserve(class, 1, false) {
                continue;
            }
            if let Some(pid) =
                self.sys.phys().alloc_contig(d, 1, low, high, PAGE_SIZE as u64, 0)
            {
                self.init_allocated(pid, AllocFlags::empty());
                return Some(pid);
            }
            dom.release(1, self.sys.stats());
        }
        None
    }
}

impl PageSystem {
    /// Scan one domain for a contiguous run of `npages` reclaimable
    /// frames inside `[low, high)`, starting aligned to `align` and
    /// not crossing a `boundary` multiple. Qualification here is only
    /// a racy hint; every page is re-validated during reclamation.
    #[allow(clippy::too_many_arguments)]
    pub fn scan_contig(
        &self,
        domain: u32,
        npages: usize,
        low: PhysAddr,
        high: PhysAddr,
        align: u64,
        boundary: u64,
        options: ScanOptions,
    ) -> Option<PageId> {
        let frames = self.frames();
        for (first, pages, span_domain) in frames.spans() {
            if span_domain != domain {
                continue;
            }
            let mut run_start = None;
            let mut run_len = 0usize;
            let mut off = 0u32;
            while off < pages {
                let pid = PageId::new(first.raw() + off);
                let frame = frames.get(pid);
                let pa = frame.phys();
                if pa < low || pa.add(PAGE_SIZE as u64) > high {
                    run_start = None;
                    run_len = 0;
                    off += 1;
                    continue;
                }
                let ext = self.scan_classify(pid, options);
                if ext == 0 {
                    run_start = None;
                    run_len = 0;
                    off += 1;
                    continue;
                }
                if run_start.is_none() {
                    // Runs must begin on an eligible boundary.
                    let aligned = pa.is_aligned(align)
                        && (boundary == 0
                            || pa.as_u64() % boundary + (npages * PAGE_SIZE) as u64 <= boundary);
                    if !aligned {
                        off += 1;
                        continue;
                    }
                    run_start = Some(pid);
                }
                run_len += ext as usize;
                if run_len >= npages {
                    return run_start;
                }
                off += ext;
            }
        }
        None
    }

    /// How far a page can extend a candidate run: 0 disqualifies,
    /// 1 << order jumps a whole free run.
    fn scan_classify(&self, pid: PageId, options: ScanOptions) -> u32 {
        let frame = self.frames().get(pid);
        let rs = frame.ref_snapshot();
        if rs.wires() > 0 {
            return 0;
        }
        let token = frame.owner_token();
        if token == 0 {
            if let Some(order) = self.phys().free_run_order(pid) {
                return 1 << order;
            }
            if self.reserv().is_page_free(pid) {
                return 1;
            }
            // Not the head of a free run and not reservation-free:
            // either mid-run (rare in an ascending scan) or
            // transitioning.
            return u32::from(self.phys().is_free(pid));
        }
        match options {
            ScanOptions::NoReservBreak if self.reserv().level_of(pid).is_some() => return 0,
            ScanOptions::NoSuperBreak if self.reserv().is_fully_populated(pid) => return 0,
            _ => {}
        }
        let Some(obj) = self.resolve_object(token) else {
            return 0;
        };
        let eligible = obj.kind().evictable()
            && obj.memattr() == MemAttr::Default
            && frame.activity().queue.is_some()
            && frame.busy_snapshot().is_unbusied();
        u32::from(eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{MemAttr, ObjectKind};
    use crate::testutil::TestBed;
    use strata_hal::cpu::CpuId;

    const ANY: (PhysAddr, PhysAddr) = (PhysAddr::ZERO, PhysAddr::new(u64::MAX));

    #[test]
    fn test_scan_finds_free_run() {
        let bed = TestBed::with_pages(32);
        let run = bed
            .sys
            .scan_contig(0, 8, ANY.0, ANY.1, 1, 0, ScanOptions::NoReservBreak)
            .expect("an all-free domain must yield a run");
        assert_eq!(bed.sys.frames().get(run).domain(), 0);
    }

    #[test]
    fn test_scan_skips_wired_pages() {
        let bed = TestBed::with_pages(8);
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        // Wire a page in the middle of the only possible 8-page run.
        let pid = cpu
            .alloc_page(None, &[0], AllocClass::Normal, AllocFlags::WIRED)
            .unwrap();
        assert!(bed
            .sys
            .scan_contig(0, 8, ANY.0, ANY.1, 1, 0, ScanOptions::Any)
            .is_none());
        bed.sys.unbusy(pid);
        cpu.unwire(pid, crate::astate::QueueId::Inactive);
    }

    #[test]
    fn test_reclaim_relocates_resident_pages() {
        let bed = TestBed::with_pages(64);
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        let obj = bed.sys.create_object(ObjectKind::Anonymous, MemAttr::Default, None);

        // Occupy the low end of the domain with valid resident pages
        // sitting on the inactive queue. The physical double hands out
        // ascending frames, so these are the lowest 16.
        let mut resident = std::vec::Vec::new();
        for idx in 0..16u64 {
            let pid = cpu
                .grab(&obj, idx, &[0], AllocClass::Normal, AllocFlags::empty())
                .unwrap()
                .unwrap();
            bed.sys.frames().get(pid).set_valid_all();
            bed.sys.unbusy(pid);
            cpu.deactivate(pid);
            resident.push(pid);
        }
        cpu.flush_batches();

        // Bound the scan to the occupied region; replacements must
        // then come from above `high`.
        let low = bed.phys_base();
        let high = low.add(16 * strata_hal::PAGE_SIZE as u64);
        let reclaimed = cpu.reclaim_contig(AllocClass::Normal, 8, low, high, 1, 0);
        assert!(reclaimed);
        // Every index is still resident and still valid: relocation
        // replaced frames, not contents.
        for idx in 0..16u64 {
            let pid = obj.lookup(idx).expect("index must survive relocation");
            assert!(bed.sys.frames().get(pid).is_all_valid());
        }
        assert!(bed.sys.stats().snapshot().reclaim_relocated > 0);
        // Relocated copies went through the pmap.
        assert!(bed.pmap.copies() > 0);
    }

    #[test]
    fn test_reclaim_aborts_on_wired_page() {
        let bed = TestBed::with_pages(8);
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        let obj = bed.sys.create_object(ObjectKind::Anonymous, MemAttr::Default, None);
        let pid = cpu
            .grab(&obj, 0, &[0], AllocClass::Normal, AllocFlags::WIRED | AllocFlags::NOBUSY)
            .unwrap()
            .unwrap();
        bed.sys.frames().get(pid).set_valid_all();
        assert!(!cpu.reclaim_contig(AllocClass::Normal, 8, ANY.0, ANY.1, 1, 0));
        cpu.unwire(pid, crate::astate::QueueId::Inactive);
    }

    #[test]
    fn test_reclaim_refuses_device_objects() {
        let bed = TestBed::with_pages(8);
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        let obj = bed.sys.create_object(ObjectKind::Device, MemAttr::Default, None);
        let pid = cpu
            .grab(&obj, 0, &[0], AllocClass::Normal, AllocFlags::empty())
            .unwrap()
            .unwrap();
        bed.sys.frames().get(pid).set_valid_all();
        bed.sys.unbusy(pid);
        cpu.deactivate(pid);
        cpu.flush_batches();
        assert!(!cpu.reclaim_contig(AllocClass::Normal, 8, ANY.0, ANY.1, 1, 0));
    }

    #[test]
    fn test_reclaim_admission_check() {
        let bed = TestBed::with_thresholds(
            16,
            crate::domain::DomainThresholds {
                free_reserved: 12,
                interrupt_reserve: 2,
                free_severe: 13,
                free_min: 14,
                free_target: 15,
            },
        );
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        // 16 free, but 8 + reserve(12) > 16: Normal reclamation is
        // refused before any scanning happens.
        assert!(!cpu.reclaim_contig_domain(0, AllocClass::Normal, 8, ANY.0, ANY.1, 1, 0));
        // System class digs past the Normal reserve.
        assert!(cpu.reclaim_contig_domain(0, AllocClass::System, 8, ANY.0, ANY.1, 1, 0));
    }
}
