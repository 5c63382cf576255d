//! Cross-cutting scenarios exercising several components together.

use alloc::sync::Arc;
use alloc::vec::Vec;

use strata_hal::cpu::CpuId;

use crate::astate::{QueueId, ALL_QUEUES};
use crate::busy::{BusyAcquire, BusyMode};
use crate::object::{MemAttr, ObjectKind};
use crate::provider::{PagerError, PagerFault};
use crate::testutil::{TestBed, TestPager};
use crate::{AllocClass, AllocFlags, PageError};

fn boot(bed: &TestBed) -> crate::CpuCtx<'_> {
    bed.sys.on_cpu(CpuId::BOOT)
}

#[test]
fn test_boot_shape() {
    let bed = TestBed::two_domains(8, 8);
    assert_eq!(bed.sys.domains().count(), 2);
    assert_eq!(bed.sys.frames().len(), 16);
    assert_eq!(bed.sys.frames().marker_ids().count(), 8);
    assert_eq!(bed.sys.domains().get(0).free_count(), 8);
    assert_eq!(bed.sys.domains().get(1).free_count(), 8);
}

#[test]
fn test_free_and_owned_are_mutually_exclusive() {
    let bed = TestBed::small();
    let cpu = boot(&bed);
    let obj = bed.sys.create_object(ObjectKind::Anonymous, MemAttr::Default, None);

    let pid = cpu
        .alloc_page(Some((&obj, 0)), &[0], AllocClass::Normal, AllocFlags::empty())
        .unwrap();
    // Owned: not on any free list.
    assert!(!bed.phys.is_free_probe(pid));
    assert_ne!(bed.sys.frames().get(pid).owner_token(), 0);

    cpu.free_page(Some(&obj), pid);
    // Free: no owner.
    assert!(bed.phys.is_free_probe(pid));
    assert_eq!(bed.sys.frames().get(pid).owner_token(), 0);
}

#[test]
fn test_wired_page_absent_from_all_queue_lists() {
    let bed = TestBed::small();
    let cpu = boot(&bed);
    let pid = bed.take_free_page();
    bed.sys.unbusy(pid);
    cpu.deactivate(pid);
    cpu.flush_batches();

    cpu.wire(pid);
    cpu.flush_batches();

    for q in ALL_QUEUES {
        cpu.scan_reset(0, q);
        let mut members = Vec::new();
        while cpu.scan_collect(0, q, 16, &mut members) > 0 {}
        assert!(!members.contains(&pid), "wired page found on {q:?}");
    }
    cpu.unwire(pid, QueueId::Inactive);
}

#[test]
fn test_concurrent_shared_holders() {
    const THREADS: usize = 8;
    let bed = Arc::new(TestBed::small());
    let pid = bed.take_free_page();
    bed.sys.unbusy(pid);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let bed = Arc::clone(&bed);
            std::thread::spawn(move || bed.sys.try_busy_shared(pid))
        })
        .collect();
    let grabbed = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|&b| b)
        .count();
    assert_eq!(grabbed, THREADS);
    assert_eq!(bed.sys.frames().get(pid).busy_snapshot().sharers() as usize, THREADS);

    // Exclusive cannot get in past any shared holder.
    assert!(!bed.sys.try_busy_exclusive(pid));
    for _ in 0..THREADS {
        bed.sys.unbusy(pid);
    }
    assert!(bed.sys.try_busy_exclusive(pid));
}

#[test]
fn test_exclusive_unbusy_wakes_all_waiters() {
    const WAITERS: usize = 3;
    let bed = Arc::new(TestBed::small());
    let pid = bed.take_free_page();
    // Page is exclusively busied by this thread.

    let handles: Vec<_> = (0..WAITERS)
        .map(|_| {
            let bed = Arc::clone(&bed);
            std::thread::spawn(move || {
                let got = bed.sys.busy_acquire(pid, BusyMode::Exclusive, true, None);
                assert_eq!(got, BusyAcquire::Acquired);
                bed.sys.unbusy(pid);
            })
        })
        .collect();
    std::thread::sleep(std::time::Duration::from_millis(20));
    bed.sys.unbusy(pid);
    for h in handles {
        h.join().unwrap();
    }
    let end = bed.sys.frames().get(pid).busy_snapshot();
    assert!(end.is_unbusied());
    assert!(!end.has_waiters());
}

#[test]
fn test_alloc_waitok_blocks_until_pages_return() {
    let bed = Arc::new(TestBed::small());
    let cpu = boot(&bed);
    // Drain everything Normal admission allows.
    let mut held = Vec::new();
    while let Ok(pid) = cpu.alloc_page(None, &[0], AllocClass::Normal, AllocFlags::empty()) {
        held.push(pid);
    }
    assert!(!held.is_empty());

    let blocked = {
        let bed = Arc::clone(&bed);
        std::thread::spawn(move || {
            let cpu = bed.sys.on_cpu(CpuId::new(1));
            cpu.alloc_page(None, &[0], AllocClass::Normal, AllocFlags::WAITOK).unwrap()
        })
    };
    std::thread::sleep(std::time::Duration::from_millis(10));
    // Returning a few pages crosses free_min and releases the waiter.
    for pid in held.drain(..4) {
        cpu.free_page(None, pid);
    }
    let got = blocked.join().unwrap();
    assert!(bed.sys.frames().get(got).busy_snapshot().is_exclusive());
}

// ----------------------------------------------------------------------
// grab_valid scenarios
// ----------------------------------------------------------------------

fn pager_bed() -> (TestBed, Arc<TestPager>, Arc<crate::object::VmObject>) {
    let bed = TestBed::with_pages(32);
    let pager = Arc::new(TestPager::default());
    let obj = bed.sys.create_object(
        ObjectKind::File,
        MemAttr::Default,
        Some(Arc::clone(&pager) as Arc<dyn crate::provider::Pager>),
    );
    (bed, pager, obj)
}

#[test]
fn test_grab_valid_zero_fills_unbacked_index() {
    let (bed, pager, obj) = pager_bed();
    let cpu = boot(&bed);
    // Nothing backed: a fresh page is zero-filled and fully valid.
    let pid = cpu
        .grab_valid(&obj, 4, &[0], AllocClass::Normal, AllocFlags::empty())
        .unwrap()
        .unwrap();
    assert!(bed.sys.is_valid(pid));
    assert!(bed.pmap.was_zeroed(pid));
    assert_eq!(pager.reads(), 0);
    bed.sys.unbusy(pid);
}

#[test]
fn test_grab_valid_readahead_window() {
    let (bed, pager, obj) = pager_bed();
    let cpu = boot(&bed);
    pager.back(10, 3);

    let pid = cpu
        .grab_valid(&obj, 10, &[0], AllocClass::Normal, AllocFlags::empty())
        .unwrap()
        .unwrap();
    assert_eq!(pager.reads(), 1);
    assert!(bed.sys.is_valid(pid));
    assert!(bed.sys.frames().get(pid).busy_snapshot().is_exclusive());
    // The three read-ahead pages came in behind it, unbusied and bound
    // for the inactive queue.
    for idx in 11..=13u64 {
        let extra = obj.lookup(idx).expect("read-ahead page must be resident");
        assert!(bed.sys.is_valid(extra));
        assert!(bed.sys.frames().get(extra).busy_snapshot().is_unbusied());
        assert_eq!(
            bed.sys.frames().get(extra).activity().queue,
            Some(QueueId::Inactive)
        );
    }
    bed.sys.unbusy(pid);
}

#[test]
fn test_grab_valid_window_stops_at_resident_page() {
    let (bed, pager, obj) = pager_bed();
    let cpu = boot(&bed);
    pager.back(20, 5);
    // Index 22 is already resident; the window must stop before it.
    let blocker = cpu
        .grab(&obj, 22, &[0], AllocClass::Normal, AllocFlags::empty())
        .unwrap()
        .unwrap();
    bed.sys.unbusy(blocker);

    let pid = cpu
        .grab_valid(&obj, 20, &[0], AllocClass::Normal, AllocFlags::empty())
        .unwrap()
        .unwrap();
    assert!(obj.lookup(21).is_some());
    assert_eq!(obj.lookup(23), None);
    assert_eq!(obj.lookup(24), None);
    bed.sys.unbusy(pid);
}

#[test]
fn test_grab_valid_pager_failure_frees_trailing_scratch() {
    let (bed, pager, obj) = pager_bed();
    let cpu = boot(&bed);
    // The requested page has three missing trailing pages; the pager
    // read validates the requested page and only two of the three.
    pager.back(30, 3);
    pager.fail_next(PagerFault { validated: 3, error: PagerError::Io });

    let before = bed.sys.domains().get(0).free_count();
    let err = cpu
        .grab_valid(&obj, 30, &[0], AllocClass::Normal, AllocFlags::empty())
        .unwrap_err();
    assert_eq!(err.error, PageError::Pager(PagerError::Io));

    // The requested page survives, exclusively busied, for inspection.
    let pid = err.page.expect("requested page is handed back");
    assert_eq!(obj.lookup(30), Some(pid));
    assert!(bed.sys.frames().get(pid).busy_snapshot().is_exclusive());
    assert!(bed.sys.is_valid(pid));

    // The two validated read-ahead pages stayed resident; the third,
    // unwired and invalid, was freed.
    assert!(obj.lookup(31).is_some());
    assert!(obj.lookup(32).is_some());
    assert_eq!(obj.lookup(33), None);
    // Window cost: requested + 2 kept read-ahead pages.
    assert_eq!(bed.sys.domains().get(0).free_count(), before - 3);
    bed.sys.unbusy(pid);
}

#[test]
fn test_grab_valid_nocreat_miss() {
    let (bed, _pager, obj) = pager_bed();
    let cpu = boot(&bed);
    let got = cpu
        .grab_valid(&obj, 7, &[0], AllocClass::Normal, AllocFlags::NOCREAT)
        .unwrap();
    assert_eq!(got, None);
}

#[test]
fn test_grab_valid_downgrades_on_request() {
    let (bed, pager, obj) = pager_bed();
    let cpu = boot(&bed);
    pager.back(2, 0);
    let pid = cpu
        .grab_valid(&obj, 2, &[0], AllocClass::Normal, AllocFlags::SBUSY)
        .unwrap()
        .unwrap();
    let snap = bed.sys.frames().get(pid).busy_snapshot();
    assert!(snap.is_shared());
    assert_eq!(snap.sharers(), 1);
    bed.sys.unbusy(pid);
}

#[test]
fn test_grab_valid_wires_on_request() {
    let (bed, pager, obj) = pager_bed();
    let cpu = boot(&bed);
    pager.back(3, 0);
    let pid = cpu
        .grab_valid(
            &obj,
            3,
            &[0],
            AllocClass::Normal,
            AllocFlags::WIRED | AllocFlags::NOBUSY,
        )
        .unwrap()
        .unwrap();
    let frame = bed.sys.frames().get(pid);
    assert_eq!(frame.ref_snapshot().wires(), 1);
    assert!(frame.busy_snapshot().is_unbusied());
    cpu.unwire(pid, QueueId::Inactive);
}

#[test]
fn test_reclaimed_domain_backpressure_round_trip() {
    // End to end: exhaust, observe the daemon watermark, free, retry.
    let bed = TestBed::small();
    let cpu = boot(&bed);
    let mut held = Vec::new();
    while let Ok(pid) = cpu.alloc_page(None, &[0], AllocClass::Normal, AllocFlags::empty()) {
        held.push(pid);
    }
    let d = bed.sys.domains().get(0);
    assert!(d.needs_reclaim());
    assert!(bed.sys.stats().snapshot().daemon_wakeups > 0);

    for pid in held {
        cpu.free_page(None, pid);
    }
    assert!(!d.needs_reclaim());
    assert!(cpu.alloc_page(None, &[0], AllocClass::Normal, AllocFlags::empty()).is_ok());
}
