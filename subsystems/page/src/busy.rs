//! # Page Busy Protocol
//!
//! Per-page mutual exclusion, distinct from object and queue locks.
//! The packed word holds either a shared-holder count or an exclusive
//! owner, plus a WAITERS bit and the FREED sentinel that catches
//! use-after-free. Acquisition is always a CAS attempt; sleeping
//! callers sleep on page identity and must re-validate the page's
//! object and index on every wake, because the page may have been
//! freed and reused while they slept.

use core::sync::atomic::Ordering;

use crate::frame::{PageFrame, PageId};
use crate::object::VmObject;
use crate::system::PageSystem;
use crate::PageStats;

const SHARED: u32 = 0x1;
const EXCLUSIVE: u32 = 0x2;
const WAITERS: u32 = 0x4;
const FREED_BIT: u32 = 0x8;
const ONE_SHARER: u32 = 1 << 4;

/// Word value for an unbusied page: shared tag, zero holders.
pub(crate) const UNBUSIED_WORD: u32 = SHARED;

/// Word value for a page sitting on a free list. Distinct from
/// UNBUSIED so that unbusy-after-free is detectable.
pub(crate) const FREED_WORD: u32 = EXCLUSIVE | FREED_BIT;

/// Decoded view of a page's busy word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyState(u32);

impl BusyState {
    #[inline]
    const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Nobody holds the page.
    #[inline]
    pub const fn is_unbusied(self) -> bool {
        self.0 & !WAITERS == UNBUSIED_WORD
    }

    /// The page is on a free list.
    #[inline]
    pub const fn is_freed(self) -> bool {
        self.0 & FREED_BIT != 0
    }

    /// At least one shared holder.
    #[inline]
    pub const fn is_shared(self) -> bool {
        self.0 & SHARED != 0 && self.sharers() > 0
    }

    /// Exactly one exclusive owner.
    #[inline]
    pub const fn is_exclusive(self) -> bool {
        self.0 & EXCLUSIVE != 0 && !self.is_freed()
    }

    /// Whether someone sleeps on this page.
    #[inline]
    pub const fn has_waiters(self) -> bool {
        self.0 & WAITERS != 0
    }

    /// Number of shared holders (zero unless shared-tagged).
    #[inline]
    pub const fn sharers(self) -> u32 {
        if self.0 & SHARED != 0 {
            self.0 >> 4
        } else {
            0
        }
    }
}

/// Which side of the busy lock to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyMode {
    /// Multiple holders, read-side
    Shared,
    /// Single owner, write-side
    Exclusive,
}

/// Outcome of a blocking busy acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyAcquire {
    /// The page is held in the requested mode
    Acquired,
    /// The page's identity changed while sleeping; retry from lookup
    Stale,
    /// The page was busy and the caller refused to sleep
    WouldBlock,
}

impl PageFrame {
    /// Current busy state. Racy snapshot.
    #[inline]
    pub fn busy_snapshot(&self) -> BusyState {
        BusyState::from_raw(self.busy_state.load(Ordering::Acquire))
    }

    /// Try to take a shared hold. Succeeds from UNBUSIED or SHARED
    /// unless `object_busied` (the owning object is busied, which
    /// blocks new shared holders).
    pub(crate) fn try_busy_shared_raw(&self, object_busied: bool) -> bool {
        if object_busied {
            return false;
        }
        let mut cur = self.busy_state.load(Ordering::Acquire);
        loop {
            if cur & SHARED == 0 {
                return false;
            }
            match self.busy_state.compare_exchange_weak(
                cur,
                cur + ONE_SHARER,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Try to take the exclusive hold. Succeeds only from UNBUSIED.
    pub(crate) fn try_busy_exclusive_raw(&self) -> bool {
        let mut cur = self.busy_state.load(Ordering::Acquire);
        loop {
            let state = BusyState::from_raw(cur);
            if !state.is_unbusied() {
                return false;
            }
            let target = EXCLUSIVE | (cur & WAITERS);
            match self.busy_state.compare_exchange_weak(
                cur,
                target,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Release a shared hold. Returns true when waiters need a wakeup.
    pub(crate) fn unbusy_shared_raw(&self) -> bool {
        let mut cur = self.busy_state.load(Ordering::Acquire);
        loop {
            let state = BusyState::from_raw(cur);
            if state.is_freed() {
                panic!("page {:#x}: shared unbusy of freed page", self.phys().as_u64());
            }
            if !state.is_shared() {
                panic!("page {:#x}: shared unbusy without holders", self.phys().as_u64());
            }
            let target = if state.sharers() > 1 {
                cur - ONE_SHARER
            } else {
                // Last holder out clears the waiters bit too; woken
                // sleepers re-contend from scratch.
                UNBUSIED_WORD
            };
            match self.busy_state.compare_exchange_weak(
                cur,
                target,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return state.sharers() == 1 && state.has_waiters(),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Release the exclusive hold. Returns true when waiters need a
    /// wakeup.
    pub(crate) fn unbusy_exclusive_raw(&self) -> bool {
        // Fast path: no waiters.
        if self
            .busy_state
            .compare_exchange(EXCLUSIVE, UNBUSIED_WORD, Ordering::Release, Ordering::Acquire)
            .is_ok()
        {
            return false;
        }
        let mut cur = self.busy_state.load(Ordering::Acquire);
        loop {
            let state = BusyState::from_raw(cur);
            if state.is_freed() {
                panic!("page {:#x}: exclusive unbusy of freed page", self.phys().as_u64());
            }
            if !state.is_exclusive() {
                panic!(
                    "page {:#x}: exclusive unbusy of non-exclusive page",
                    self.phys().as_u64()
                );
            }
            match self.busy_state.compare_exchange_weak(
                cur,
                UNBUSIED_WORD,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return state.has_waiters(),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Exclusive -> single shared holder, preserving the waiters bit.
    /// Returns true when waiters need a wakeup (shared waiters can now
    /// get in).
    pub(crate) fn busy_downgrade_raw(&self) -> bool {
        let mut cur = self.busy_state.load(Ordering::Acquire);
        loop {
            let state = BusyState::from_raw(cur);
            if !state.is_exclusive() {
                panic!("page {:#x}: downgrade of non-exclusive page", self.phys().as_u64());
            }
            let target = (SHARED | ONE_SHARER) | (cur & WAITERS);
            match self.busy_state.compare_exchange_weak(
                cur,
                target,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return state.has_waiters(),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Set the waiters bit if the word still matches `expected`.
    pub(crate) fn busy_set_waiters(&self, expected: BusyState) -> bool {
        self.busy_state
            .compare_exchange(
                expected.0,
                expected.0 | WAITERS,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Retire an exclusively-held page to the FREED sentinel. Returns
    /// true when waiters need a wakeup; they will re-validate identity
    /// and bail.
    pub(crate) fn busy_mark_freed(&self) -> bool {
        let mut cur = self.busy_state.load(Ordering::Acquire);
        loop {
            let state = BusyState::from_raw(cur);
            if state.is_freed() {
                panic!("page {:#x}: double free", self.phys().as_u64());
            }
            if !state.is_exclusive() {
                panic!("page {:#x}: freeing page not exclusively busied", self.phys().as_u64());
            }
            match self.busy_state.compare_exchange_weak(
                cur,
                FREED_WORD,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return state.has_waiters(),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Install the initial busy word during allocator re-init. The
    /// page must still carry the FREED sentinel.
    pub(crate) fn busy_init_alloc(&self, word: u32) {
        let prev = self.busy_state.swap(word, Ordering::AcqRel);
        if prev & FREED_BIT == 0 {
            panic!("page {:#x}: allocating a page not marked freed", self.phys().as_u64());
        }
    }
}

/// Initial busy word for a freshly allocated exclusive page.
pub(crate) const ALLOC_EXCLUSIVE: u32 = EXCLUSIVE;
/// Initial busy word for a freshly allocated shared page.
pub(crate) const ALLOC_SHARED: u32 = SHARED | ONE_SHARER;
/// Initial busy word for a freshly allocated unbusied page.
pub(crate) const ALLOC_UNBUSIED: u32 = UNBUSIED_WORD;

impl PageSystem {
    /// Non-blocking shared busy attempt, honoring the owning object's
    /// object-busy state.
    pub fn try_busy_shared(&self, pid: PageId) -> bool {
        let frame = self.frames().get(pid);
        let object_busied = match frame.owner_token() {
            0 => false,
            token => self.resolve_object(token).is_some_and(|o| o.is_busied()),
        };
        frame.try_busy_shared_raw(object_busied)
    }

    /// Non-blocking exclusive busy attempt.
    pub fn try_busy_exclusive(&self, pid: PageId) -> bool {
        self.frames().get(pid).try_busy_exclusive_raw()
    }

    /// Acquire the busy lock in `mode`, optionally sleeping.
    ///
    /// When `identity` names an (object, pindex) pair, every wake
    /// re-validates that the page still belongs there; a mismatch
    /// yields [`BusyAcquire::Stale`] and the caller restarts from
    /// lookup. Identity mismatch is never reported as success.
    pub fn busy_acquire(
        &self,
        pid: PageId,
        mode: BusyMode,
        may_sleep: bool,
        identity: Option<(&VmObject, u64)>,
    ) -> BusyAcquire {
        let frame = self.frames().get(pid);
        loop {
            if let Some((obj, pindex)) = identity {
                if frame.owner_token() != obj.token() || frame.pindex() != pindex {
                    return BusyAcquire::Stale;
                }
            }
            if frame.busy_snapshot().is_freed() {
                // Freed and possibly reused; only a fresh lookup can
                // say what lives here now.
                return BusyAcquire::Stale;
            }
            let ok = match mode {
                BusyMode::Shared => self.try_busy_shared(pid),
                BusyMode::Exclusive => self.try_busy_exclusive(pid),
            };
            if ok {
                // The acquire itself can race a final remove; the
                // caller revalidates identity one more time if it
                // cares. Freed pages never satisfy try-busy.
                return BusyAcquire::Acquired;
            }
            if !may_sleep {
                return BusyAcquire::WouldBlock;
            }
            self.busy_sleep_once(pid);
        }
    }

    /// One sleep episode on the page's identity: publish the waiters
    /// bit, then sleep until someone releasing the page wakes the
    /// channel. Spurious wakeups are fine; the caller loops.
    pub(crate) fn busy_sleep_once(&self, pid: PageId) {
        let frame = self.frames().get(pid);
        let chan = self.busy_channel(pid);
        let gen = chan.generation();
        let state = frame.busy_snapshot();
        if state.is_unbusied() || state.is_freed() {
            return;
        }
        if !state.has_waiters() && !frame.busy_set_waiters(state) {
            // Lost a race with a state change; re-evaluate.
            return;
        }
        chan.sleep_until(gen, || {
            let s = frame.busy_snapshot();
            s.is_unbusied() || s.is_freed()
        });
    }

    /// Release whichever hold the caller has.
    pub fn unbusy(&self, pid: PageId) {
        let frame = self.frames().get(pid);
        let state = frame.busy_snapshot();
        let wake = if state.is_exclusive() {
            frame.unbusy_exclusive_raw()
        } else {
            frame.unbusy_shared_raw()
        };
        if wake {
            self.busy_channel(pid).wake_all();
        }
    }

    /// Downgrade an exclusive hold to a single shared hold.
    pub fn busy_downgrade(&self, pid: PageId) {
        if self.frames().get(pid).busy_downgrade_raw() {
            self.busy_channel(pid).wake_all();
        }
    }

    /// Wake anyone sleeping on the page without changing its state.
    pub fn busy_wake(&self, pid: PageId) {
        self.busy_channel(pid).wake_all();
    }

    pub(crate) fn busy_channel(&self, pid: PageId) -> &crate::wait::WaitChannel {
        self.busy_waiters().channel(u64::from(pid.raw()))
    }

    pub(crate) fn mark_freed_and_wake(&self, pid: PageId) {
        if self.frames().get(pid).busy_mark_freed() {
            self.busy_channel(pid).wake_all();
        }
    }

    pub(crate) fn note_astate_retry(&self) {
        PageStats::bump(&self.stats().astate_retries);
    }
}
