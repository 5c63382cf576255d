//! # Page Queues & Batching
//!
//! Each domain keeps one locked list per reclamation queue. Transitions
//! are requested in two phases: CAS an intent flag into the page's
//! activity word, then submit the page to a per-CPU batch for the
//! target (domain, queue). Batches drain into the list under the queue
//! lock when they fill, or when a draining thread already holds the
//! lock. Applying a batched entry re-validates the queue id and intent
//! first; stale entries are no-ops.
//!
//! Queue id and the ENQUEUED bit are authoritative only under the
//! queue lock. Everything else about the activity word may change
//! underfoot at any time, so every update here is CAS-with-revalidation.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use spin::Mutex;
use strata_hal::cpu::CpuId;

use crate::astate::{astate_update, ActivityState, IntentFlags, QueueId, ACT_INIT, QUEUE_COUNT};
use crate::frame::{FrameTable, PageId, LINK_NIL};
use crate::system::{CpuCtx, PageSystem};
use crate::PageStats;

/// Capacity of one per-CPU staging batch.
pub const BATCH_CAPACITY: usize = 32;

/// Intrusive doubly-linked list over descriptor link fields. Only ever
/// touched under the owning queue's lock.
pub(crate) struct PageList {
    head: u32,
    tail: u32,
}

impl PageList {
    const fn new() -> Self {
        Self { head: LINK_NIL, tail: LINK_NIL }
    }

    pub(crate) fn next(&self, frames: &FrameTable, pid: PageId) -> Option<PageId> {
        let raw = frames.get(pid).link_next.load(Ordering::Relaxed);
        (raw != LINK_NIL).then(|| PageId::new(raw))
    }

    pub(crate) fn push_tail(&mut self, frames: &FrameTable, pid: PageId) {
        let f = frames.get(pid);
        debug_assert_eq!(f.link_next.load(Ordering::Relaxed), LINK_NIL);
        debug_assert_eq!(f.link_prev.load(Ordering::Relaxed), LINK_NIL);
        f.link_prev.store(self.tail, Ordering::Relaxed);
        f.link_next.store(LINK_NIL, Ordering::Relaxed);
        if self.tail == LINK_NIL {
            self.head = pid.raw();
        } else {
            frames.get(PageId::new(self.tail)).link_next.store(pid.raw(), Ordering::Relaxed);
        }
        self.tail = pid.raw();
    }

    pub(crate) fn push_head(&mut self, frames: &FrameTable, pid: PageId) {
        let f = frames.get(pid);
        debug_assert_eq!(f.link_next.load(Ordering::Relaxed), LINK_NIL);
        debug_assert_eq!(f.link_prev.load(Ordering::Relaxed), LINK_NIL);
        f.link_next.store(self.head, Ordering::Relaxed);
        f.link_prev.store(LINK_NIL, Ordering::Relaxed);
        if self.head == LINK_NIL {
            self.tail = pid.raw();
        } else {
            frames.get(PageId::new(self.head)).link_prev.store(pid.raw(), Ordering::Relaxed);
        }
        self.head = pid.raw();
    }

    pub(crate) fn insert_after(&mut self, frames: &FrameTable, after: PageId, pid: PageId) {
        let next = frames.get(after).link_next.load(Ordering::Relaxed);
        if next == LINK_NIL {
            self.push_tail(frames, pid);
            return;
        }
        let f = frames.get(pid);
        f.link_prev.store(after.raw(), Ordering::Relaxed);
        f.link_next.store(next, Ordering::Relaxed);
        frames.get(after).link_next.store(pid.raw(), Ordering::Relaxed);
        frames.get(PageId::new(next)).link_prev.store(pid.raw(), Ordering::Relaxed);
    }

    pub(crate) fn remove(&mut self, frames: &FrameTable, pid: PageId) {
        let f = frames.get(pid);
        let prev = f.link_prev.load(Ordering::Relaxed);
        let next = f.link_next.load(Ordering::Relaxed);
        debug_assert!(
            prev != LINK_NIL || self.head == pid.raw(),
            "removing a page that is not on the list"
        );
        if prev == LINK_NIL {
            self.head = next;
        } else {
            frames.get(PageId::new(prev)).link_next.store(next, Ordering::Relaxed);
        }
        if next == LINK_NIL {
            self.tail = prev;
        } else {
            frames.get(PageId::new(next)).link_prev.store(prev, Ordering::Relaxed);
        }
        f.link_next.store(LINK_NIL, Ordering::Relaxed);
        f.link_prev.store(LINK_NIL, Ordering::Relaxed);
    }
}

/// One domain's list for one reclamation queue, with a sentinel marker
/// enabling non-disruptive incremental scans.
pub struct PageQueue {
    id: QueueId,
    list: Mutex<PageList>,
    len: AtomicUsize,
    marker: PageId,
}

impl PageQueue {
    pub(crate) fn new(frames: &FrameTable, id: QueueId, marker: PageId) -> Self {
        let mut list = PageList::new();
        list.push_tail(frames, marker);
        Self { id, list: Mutex::new(list), len: AtomicUsize::new(0), marker }
    }

    /// Queue this list serves.
    #[inline]
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Approximate number of resident pages (markers excluded).
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the queue currently holds no pages.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl core::fmt::Debug for PageQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageQueue").field("id", &self.id).field("len", &self.len()).finish()
    }
}

type Batch = ArrayVec<PageId, BATCH_CAPACITY>;

/// Per-CPU staging batches, one per (cpu, domain, queue). Never
/// authoritative; contents are hints that get re-validated at drain.
pub(crate) struct PerCpuTable {
    slots: Box<[Mutex<Batch>]>,
    domains: usize,
}

impl PerCpuTable {
    pub(crate) fn new(cpus: usize, domains: usize) -> Self {
        let n = cpus * domains * QUEUE_COUNT;
        let mut slots = Vec::with_capacity(n);
        slots.resize_with(n, || Mutex::new(Batch::new()));
        Self { slots: slots.into_boxed_slice(), domains }
    }

    fn slot(&self, cpu: CpuId, domain: u32, q: QueueId) -> &Mutex<Batch> {
        let idx = (cpu.as_usize() * self.domains + domain as usize) * QUEUE_COUNT
            + q.raw() as usize;
        &self.slots[idx]
    }
}

impl PageSystem {
    /// Apply every entry of `batch` targeted at (domain, q) under the
    /// queue lock.
    pub(crate) fn drain_entries(&self, domain: u32, q: QueueId, batch: &[PageId]) {
        if batch.is_empty() {
            return;
        }
        let pq = self.domains().queue(domain, q);
        let mut list = pq.list.lock();
        for &pid in batch {
            self.pqbatch_process_page(pq, &mut list, pid);
        }
    }

    /// Commit one deferred transition. Queue id and intents are
    /// re-validated here; anything stale is a no-op.
    fn pqbatch_process_page(&self, pq: &PageQueue, list: &mut PageList, pid: PageId) {
        let frames = self.frames();
        let frame = frames.get(pid);
        loop {
            let cur = frame.activity();
            if cur.queue != Some(pq.id) {
                PageStats::bump(&self.stats().batch_stale);
                return;
            }
            if cur.flags.contains(IntentFlags::DEQUEUE) {
                let new = ActivityState {
                    queue: None,
                    flags: cur.flags - IntentFlags::QUEUE_STATE,
                    act: cur.act,
                };
                if frame.astate_try_cas(cur, new).is_ok() {
                    if cur.flags.contains(IntentFlags::ENQUEUED) {
                        list.remove(frames, pid);
                        pq.len.fetch_sub(1, Ordering::Relaxed);
                    }
                    return;
                }
            } else if cur.flags.intersects(IntentFlags::REQUEUE | IntentFlags::REQUEUE_HEAD) {
                let new = ActivityState {
                    queue: cur.queue,
                    flags: (cur.flags - (IntentFlags::REQUEUE | IntentFlags::REQUEUE_HEAD))
                        | IntentFlags::ENQUEUED,
                    act: cur.act,
                };
                if frame.astate_try_cas(cur, new).is_ok() {
                    if cur.flags.contains(IntentFlags::ENQUEUED) {
                        list.remove(frames, pid);
                    } else {
                        pq.len.fetch_add(1, Ordering::Relaxed);
                    }
                    if cur.flags.contains(IntentFlags::REQUEUE_HEAD) {
                        list.push_head(frames, pid);
                    } else {
                        list.push_tail(frames, pid);
                    }
                    return;
                }
            } else {
                // Only REFERENCED or nothing: no list work pending.
                return;
            }
            self.note_astate_retry();
        }
    }

    /// Eagerly remove the page from whatever queue it occupies. No-op
    /// if the page is not queued; two consecutive calls equal one.
    pub fn dequeue(&self, pid: PageId) {
        let frames = self.frames();
        let frame = frames.get(pid);
        loop {
            let snapshot = frame.activity();
            let Some(q) = snapshot.queue else {
                return;
            };
            let pq = self.domains().queue(frame.domain(), q);
            let mut list = pq.list.lock();
            let mut cur = frame.activity();
            if cur.queue != Some(q) {
                // Moved while we chased the lock; retry.
                continue;
            }
            loop {
                let new = ActivityState {
                    queue: None,
                    flags: cur.flags - IntentFlags::QUEUE_STATE,
                    act: cur.act,
                };
                match frame.astate_try_cas(cur, new) {
                    Ok(()) => {
                        if cur.flags.contains(IntentFlags::ENQUEUED) {
                            list.remove(frames, pid);
                            pq.len.fetch_sub(1, Ordering::Relaxed);
                        }
                        return;
                    }
                    Err(seen) => {
                        // Queue id cannot change while we hold the lock.
                        debug_assert_eq!(seen.queue, Some(q));
                        cur = seen;
                        self.note_astate_retry();
                    }
                }
            }
        }
    }

    /// Record a reference hint for the reclamation daemon.
    pub fn reference_page(&self, pid: PageId) {
        astate_update(self.frames().get(pid), &self.stats().astate_retries, |mut s| {
            if s.flags.contains(IntentFlags::REFERENCED) {
                return None;
            }
            s.flags |= IntentFlags::REFERENCED;
            Some(s)
        });
    }
}

impl CpuCtx<'_> {
    /// Move the page to the active queue.
    pub fn activate(&self, pid: PageId) {
        self.move_to(pid, QueueId::Active, false);
    }

    /// Move the page to the tail of the inactive queue.
    pub fn deactivate(&self, pid: PageId) {
        self.move_to(pid, QueueId::Inactive, false);
    }

    /// Move the page to the head of the inactive queue, first in line
    /// for reclamation.
    pub fn deactivate_noreuse(&self, pid: PageId) {
        self.move_to(pid, QueueId::Inactive, true);
    }

    /// Move the page to the laundry queue for writeback.
    pub fn launder(&self, pid: PageId) {
        self.move_to(pid, QueueId::Laundry, false);
    }

    /// Move the page to the unswappable queue.
    pub fn unswappable(&self, pid: PageId) {
        self.move_to(pid, QueueId::Unswappable, false);
    }

    /// Refresh the page's position in its current queue.
    pub fn requeue(&self, pid: PageId) {
        let frame = self.sys.frames().get(pid);
        let res = astate_update(frame, &self.sys.stats().astate_retries, |mut s| {
            s.queue?;
            if s.flags.contains(IntentFlags::DEQUEUE) {
                return None;
            }
            s.flags |= IntentFlags::REQUEUE;
            Some(s)
        });
        if let Some((old, _)) = res {
            if let Some(q) = old.queue {
                self.pqbatch_submit(pid, frame.domain(), q);
            }
        }
    }

    /// Request queue placement, deferring list work to a batch.
    ///
    /// Wired pages are left alone: wiring keeps pages off the queues,
    /// and the unwire path re-admits them.
    pub(crate) fn move_to(&self, pid: PageId, target: QueueId, head: bool) {
        let frames = self.sys.frames();
        let frame = frames.get(pid);
        loop {
            let cur = frame.activity();
            if frame.ref_snapshot().wires() > 0 {
                return;
            }
            match cur.queue {
                Some(q) if q == target => {
                    if cur.flags.contains(IntentFlags::ENQUEUED) && !head {
                        // Already resident with no accelerated
                        // placement requested: a reference hint is
                        // enough.
                        let mut new = cur;
                        new.flags |= IntentFlags::REFERENCED;
                        if target == QueueId::Active {
                            new.act = new.act.max(ACT_INIT);
                        }
                        if new == cur || frame.astate_try_cas(cur, new).is_ok() {
                            return;
                        }
                    } else {
                        let mut new = cur;
                        new.flags |= if head {
                            IntentFlags::REQUEUE_HEAD
                        } else {
                            IntentFlags::REQUEUE
                        };
                        if target == QueueId::Active {
                            new.act = new.act.max(ACT_INIT);
                        }
                        if frame.astate_try_cas(cur, new).is_ok() {
                            self.pqbatch_submit(pid, frame.domain(), target);
                            return;
                        }
                    }
                }
                Some(_) => {
                    // Cross-queue move: leave the old queue first.
                    self.sys.dequeue(pid);
                    continue;
                }
                None => {
                    let mut new = cur;
                    new.queue = Some(target);
                    new.flags |= if head {
                        IntentFlags::REQUEUE_HEAD
                    } else {
                        IntentFlags::REQUEUE
                    };
                    if target == QueueId::Active {
                        new.act = new.act.max(ACT_INIT);
                    }
                    if frame.astate_try_cas(cur, new).is_ok() {
                        self.pqbatch_submit(pid, frame.domain(), target);
                        return;
                    }
                }
            }
            self.sys.note_astate_retry();
        }
    }

    /// Place a page that is on no queue. Enqueueing an already-queued
    /// page is an invariant violation.
    pub fn enqueue(&self, pid: PageId, target: QueueId) {
        let frame = self.sys.frames().get(pid);
        astate_update(frame, &self.sys.stats().astate_retries, |mut s| {
            assert!(
                s.queue.is_none() && !s.flags.contains(IntentFlags::ENQUEUED),
                "page {:#x}: enqueue of already queued page",
                frame.phys().as_u64()
            );
            s.queue = Some(target);
            s.flags |= IntentFlags::REQUEUE;
            if target == QueueId::Active {
                s.act = s.act.max(ACT_INIT);
            }
            Some(s)
        });
        self.pqbatch_submit(pid, frame.domain(), target);
    }

    /// Request removal from the current queue, deferring list work.
    pub(crate) fn dequeue_deferred(&self, pid: PageId) {
        let frame = self.sys.frames().get(pid);
        let res = astate_update(frame, &self.sys.stats().astate_retries, |mut s| {
            s.queue?;
            if s.flags.contains(IntentFlags::DEQUEUE) {
                return None;
            }
            s.flags |= IntentFlags::DEQUEUE;
            Some(s)
        });
        if let Some((old, _)) = res {
            if let Some(q) = old.queue {
                self.pqbatch_submit(pid, frame.domain(), q);
            }
        }
    }

    /// Stage a deferred transition for (domain, q), draining the batch
    /// if it filled up.
    pub(crate) fn pqbatch_submit(&self, pid: PageId, domain: u32, q: QueueId) {
        let slot = self.sys.percpu().slot(self.cpu, domain, q);
        let full = {
            let mut batch = slot.lock();
            batch.push(pid);
            if batch.is_full() {
                Some(mem::take(&mut *batch))
            } else {
                None
            }
        };
        if let Some(batch) = full {
            PageStats::bump(&self.sys.stats().batch_flushes);
            self.sys.drain_entries(domain, q, &batch);
        }
    }

    /// Flush every staged entry this CPU holds.
    pub fn flush_batches(&self) {
        for domain in 0..self.sys.domains().count() {
            for q in crate::astate::ALL_QUEUES {
                self.flush_batch(domain as u32, q);
            }
        }
    }

    fn flush_batch(&self, domain: u32, q: QueueId) {
        let slot = self.sys.percpu().slot(self.cpu, domain, q);
        let batch = mem::take(&mut *slot.lock());
        self.sys.drain_entries(domain, q, &batch);
    }

    /// Harvest up to `max` reclamation candidates after the queue's
    /// marker, advancing the marker past them. The marker keeps
    /// repeated scans from revisiting pages and never leaves the list,
    /// so concurrent queue traffic is undisturbed. Returns the number
    /// collected; zero means the scan reached the tail.
    pub fn scan_collect(
        &self,
        domain: u32,
        q: QueueId,
        max: usize,
        out: &mut Vec<PageId>,
    ) -> usize {
        // The scanning thread is about to take the queue lock; drain
        // its own staged work for this queue first.
        self.flush_batch(domain, q);

        let frames = self.sys.frames();
        let pq = self.sys.domains().queue(domain, q);
        let mut list = pq.list.lock();
        let mut collected = 0;
        let mut cursor = list.next(frames, pq.marker);
        let mut last = None;
        while collected < max {
            let Some(pid) = cursor else {
                break;
            };
            cursor = list.next(frames, pid);
            if frames.get(pid).is_marker() {
                continue;
            }
            out.push(pid);
            last = Some(pid);
            collected += 1;
        }
        if let Some(last) = last {
            list.remove(frames, pq.marker);
            list.insert_after(frames, last, pq.marker);
        }
        collected
    }

    /// Restart the queue's scan position from the head.
    pub fn scan_reset(&self, domain: u32, q: QueueId) {
        let frames = self.sys.frames();
        let pq = self.sys.domains().queue(domain, q);
        let mut list = pq.list.lock();
        list.remove(frames, pq.marker);
        list.push_head(frames, pq.marker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::astate::ALL_QUEUES;
    use crate::testutil::TestBed;
    use strata_hal::cpu::CpuId;

    #[test]
    fn test_enqueue_then_flush_lands_on_list() {
        let bed = TestBed::small();
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        let pid = bed.take_free_page();
        bed.sys.unbusy(pid);

        cpu.deactivate(pid);
        let st = bed.sys.frames().get(pid).activity();
        assert_eq!(st.queue, Some(QueueId::Inactive));
        assert!(st.flags.contains(IntentFlags::REQUEUE));
        assert!(!st.flags.contains(IntentFlags::ENQUEUED));

        cpu.flush_batches();
        let st = bed.sys.frames().get(pid).activity();
        assert!(st.flags.contains(IntentFlags::ENQUEUED));
        assert_eq!(bed.sys.domains().queue(0, QueueId::Inactive).len(), 1);
    }

    #[test]
    fn test_batch_flushes_when_full() {
        let bed = TestBed::with_pages(BATCH_CAPACITY as u32 + 8);
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        for _ in 0..BATCH_CAPACITY {
            let pid = bed.take_free_page();
            bed.sys.unbusy(pid);
            cpu.deactivate(pid);
        }
        // Capacity reached: the whole batch must have drained without
        // an explicit flush.
        assert_eq!(bed.sys.domains().queue(0, QueueId::Inactive).len(), BATCH_CAPACITY);
        assert!(bed.sys.stats().snapshot().batch_flushes >= 1);
    }

    #[test]
    fn test_dequeue_idempotent() {
        let bed = TestBed::small();
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        let pid = bed.take_free_page();
        bed.sys.unbusy(pid);
        cpu.deactivate(pid);
        cpu.flush_batches();

        bed.sys.dequeue(pid);
        let after_first = bed.sys.frames().get(pid).activity();
        bed.sys.dequeue(pid);
        let after_second = bed.sys.frames().get(pid).activity();
        assert_eq!(after_first, after_second);
        assert_eq!(after_first.queue, None);
        assert_eq!(bed.sys.domains().queue(0, QueueId::Inactive).len(), 0);
    }

    #[test]
    fn test_stale_batch_entry_is_noop() {
        let bed = TestBed::small();
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        let pid = bed.take_free_page();
        bed.sys.unbusy(pid);
        cpu.deactivate(pid);
        // Eager dequeue races ahead of the staged entry.
        bed.sys.dequeue(pid);
        cpu.flush_batches();
        assert_eq!(bed.sys.frames().get(pid).activity().queue, None);
        assert_eq!(bed.sys.domains().queue(0, QueueId::Inactive).len(), 0);
        assert!(bed.sys.stats().snapshot().batch_stale >= 1);
    }

    #[test]
    fn test_move_between_queues() {
        let bed = TestBed::small();
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        let pid = bed.take_free_page();
        bed.sys.unbusy(pid);
        cpu.deactivate(pid);
        cpu.flush_batches();

        cpu.activate(pid);
        cpu.flush_batches();
        let st = bed.sys.frames().get(pid).activity();
        assert_eq!(st.queue, Some(QueueId::Active));
        assert!(st.flags.contains(IntentFlags::ENQUEUED));
        assert!(st.act >= ACT_INIT);
        assert_eq!(bed.sys.domains().queue(0, QueueId::Inactive).len(), 0);
        assert_eq!(bed.sys.domains().queue(0, QueueId::Active).len(), 1);
    }

    #[test]
    fn test_activate_resident_collapses_to_reference() {
        let bed = TestBed::small();
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        let pid = bed.take_free_page();
        bed.sys.unbusy(pid);
        cpu.activate(pid);
        cpu.flush_batches();

        cpu.activate(pid);
        let st = bed.sys.frames().get(pid).activity();
        assert!(st.flags.contains(IntentFlags::REFERENCED));
        assert!(!st.flags.intersects(IntentFlags::REQUEUE | IntentFlags::REQUEUE_HEAD));
    }

    #[test]
    fn test_requeue_head_precedence() {
        let bed = TestBed::small();
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        let a = bed.take_free_page();
        let b = bed.take_free_page();
        bed.sys.unbusy(a);
        bed.sys.unbusy(b);
        cpu.deactivate(a);
        cpu.deactivate(b);
        cpu.flush_batches();

        // Both intents on b: REQUEUE_HEAD must win the placement.
        cpu.requeue(b);
        cpu.deactivate_noreuse(b);
        let st = bed.sys.frames().get(b).activity();
        assert!(st.flags.contains(IntentFlags::REQUEUE | IntentFlags::REQUEUE_HEAD));
        cpu.flush_batches();

        let pq = bed.sys.domains().queue(0, QueueId::Inactive);
        let list = pq.list.lock();
        assert_eq!(list.head, b.raw());
    }

    #[test]
    fn test_wired_page_refuses_queue_placement() {
        let bed = TestBed::small();
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        let pid = bed.take_free_page();
        bed.sys.unbusy(pid);
        bed.sys.frames().get(pid).wire_acquire();
        cpu.activate(pid);
        cpu.flush_batches();
        assert_eq!(bed.sys.frames().get(pid).activity().queue, None);
        bed.sys.frames().get(pid).wire_release();
    }

    #[test]
    fn test_scan_collect_advances_marker() {
        let bed = TestBed::with_pages(16);
        let cpu = bed.sys.on_cpu(CpuId::BOOT);
        let mut pids = Vec::new();
        for _ in 0..6 {
            let pid = bed.take_free_page();
            bed.sys.unbusy(pid);
            cpu.deactivate(pid);
            pids.push(pid);
        }
        cpu.flush_batches();

        let mut batch = Vec::new();
        assert_eq!(cpu.scan_collect(0, QueueId::Inactive, 4, &mut batch), 4);
        assert_eq!(batch, pids[..4]);
        let mut rest = Vec::new();
        assert_eq!(cpu.scan_collect(0, QueueId::Inactive, 4, &mut rest), 2);
        assert_eq!(rest, pids[4..]);
        // Tail reached: nothing further until the scan resets.
        let mut empty = Vec::new();
        assert_eq!(cpu.scan_collect(0, QueueId::Inactive, 4, &mut empty), 0);
        cpu.scan_reset(0, QueueId::Inactive);
        let mut again = Vec::new();
        assert_eq!(cpu.scan_collect(0, QueueId::Inactive, 10, &mut again), 6);
    }

    #[test]
    fn test_every_queue_has_a_marker() {
        let bed = TestBed::small();
        for q in ALL_QUEUES {
            let pq = bed.sys.domains().queue(0, q);
            let list = pq.list.lock();
            assert_ne!(list.head, crate::frame::LINK_NIL);
            assert!(bed.sys.frames().get(PageId::new(list.head)).is_marker());
        }
    }
}
