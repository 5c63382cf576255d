//! # Packed Reference State
//!
//! One 32-bit word per page holding the wire count, the OBJREF bit
//! (set iff an object owns the page), and the transient BLOCKED bit
//! used during relocation. The word is mutated only through the named
//! CAS operations below; nothing else in the crate touches the raw
//! bits, so the invariants live in one place:
//!
//! - `wire_count > 0` pins the page against reclamation
//! - OBJREF is set exactly while `owner_token` is nonzero
//! - BLOCKED never persists beyond a single relocation attempt

use core::sync::atomic::Ordering;

use strata_hal::cpu::relax;

use crate::frame::PageFrame;

const WIRE_MASK: u32 = 0x3fff_ffff;
const BLOCKED: u32 = 1 << 30;
const OBJREF: u32 = 1 << 31;

/// Decoded view of a page's reference word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefState(u32);

impl RefState {
    #[inline]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Number of wirings pinning the page.
    #[inline]
    pub const fn wires(self) -> u32 {
        self.0 & WIRE_MASK
    }

    /// Whether an object owns the page.
    #[inline]
    pub const fn has_objref(self) -> bool {
        self.0 & OBJREF != 0
    }

    /// Whether a relocation currently blocks new wirings.
    #[inline]
    pub const fn is_blocked(self) -> bool {
        self.0 & BLOCKED != 0
    }
}

impl PageFrame {
    /// Current reference state. A racy snapshot; use the named CAS
    /// mutators to act on it.
    #[inline]
    pub fn ref_snapshot(&self) -> RefState {
        RefState(self.ref_state.load(Ordering::Acquire))
    }

    /// Add one wiring. Returns the prior state; a 0 -> 1 transition
    /// obliges the caller to request a queue dequeue.
    ///
    /// The lockless grab path may wire a page that is concurrently
    /// being freed; callers there must re-validate identity afterwards
    /// and release the wiring on mismatch.
    pub(crate) fn wire_acquire(&self) -> RefState {
        let old = self.ref_state.fetch_add(1, Ordering::AcqRel);
        let old = RefState(old);
        if old.wires() >= WIRE_MASK - 1 {
            panic!("page {:#x}: wire count overflow", self.phys().as_u64());
        }
        old
    }

    /// Drop one wiring. Returns the prior state; the caller owning the
    /// 1 -> 0 transition decides between freeing and re-admission.
    pub(crate) fn wire_release(&self) -> RefState {
        let old = RefState(self.ref_state.fetch_sub(1, Ordering::AcqRel));
        if old.wires() == 0 {
            panic!("page {:#x}: unwire of unwired page", self.phys().as_u64());
        }
        old
    }

    /// Record object ownership. The object lock must be held and the
    /// page exclusively busied.
    pub(crate) fn set_objref(&self) {
        let old = self.ref_state.fetch_or(OBJREF, Ordering::AcqRel);
        if old & OBJREF != 0 {
            panic!("page {:#x}: object reference already present", self.phys().as_u64());
        }
    }

    /// Clear object ownership. Returns the resulting state so the
    /// caller can detect the final-reference transition. Same locking
    /// as [`Self::set_objref`].
    pub(crate) fn clear_objref(&self) -> RefState {
        let old = self.ref_state.fetch_and(!OBJREF, Ordering::AcqRel);
        if old & OBJREF == 0 {
            panic!("page {:#x}: clearing absent object reference", self.phys().as_u64());
        }
        RefState(old & !OBJREF)
    }

    /// Try to block new wirings for a relocation attempt. Fails if the
    /// page is wired or already blocked.
    pub(crate) fn try_block(&self) -> bool {
        let mut cur = self.ref_state.load(Ordering::Acquire);
        loop {
            let state = RefState(cur);
            if state.wires() != 0 || state.is_blocked() {
                return false;
            }
            match self.ref_state.compare_exchange_weak(
                cur,
                cur | BLOCKED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    /// End a relocation attempt. BLOCKED must be set.
    pub(crate) fn clear_block(&self) {
        let old = self.ref_state.fetch_and(!BLOCKED, Ordering::AcqRel);
        debug_assert!(old & BLOCKED != 0, "clearing absent block");
    }

    /// Wait for transient wirings to drain and settle the word at zero.
    /// Used by allocator re-init: a raced lockless grab may hold a
    /// short-lived wiring on a page it is about to reject.
    pub(crate) fn ref_settle_for_alloc(&self) {
        loop {
            let state = self.ref_snapshot();
            if state.has_objref() || state.is_blocked() {
                panic!(
                    "page {:#x}: allocating a referenced page",
                    self.phys().as_u64()
                );
            }
            if state.wires() == 0 {
                return;
            }
            relax();
        }
    }
}
