//! # Activity State
//!
//! The packed per-page queue word: which reclamation queue the page
//! occupies (if any), the intent flags recording queue work requested
//! but not yet applied, and the activity counter the reclamation
//! daemon ages. The word mutates only through bounded CAS with
//! re-validation; the queue id and the ENQUEUED bit are authoritative
//! only while the owning domain-queue lock is held.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::frame::PageFrame;

/// Reclamation queues, per domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueId {
    /// Recently used pages
    Active = 0,
    /// Reclamation candidates
    Inactive = 1,
    /// Dirty pages awaiting writeback
    Laundry = 2,
    /// Pages that cannot be paged out
    Unswappable = 3,
}

/// Number of reclamation queues.
pub const QUEUE_COUNT: usize = 4;

/// All queues, in id order.
pub const ALL_QUEUES: [QueueId; QUEUE_COUNT] =
    [QueueId::Active, QueueId::Inactive, QueueId::Laundry, QueueId::Unswappable];

impl QueueId {
    /// Queue for a raw id.
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Active),
            1 => Some(Self::Inactive),
            2 => Some(Self::Laundry),
            3 => Some(Self::Unswappable),
            _ => None,
        }
    }

    /// Raw id.
    #[inline]
    pub const fn raw(self) -> u8 {
        self as u8
    }
}

const QUEUE_NONE: u8 = 0xff;

const_assert!(QUEUE_COUNT < QUEUE_NONE as usize);

bitflags! {
    /// Intent and residency flags carried in the activity word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IntentFlags: u8 {
        /// The page was referenced; a hint to the reclamation daemon
        const REFERENCED = 1 << 0;
        /// The page is physically linked into its queue's list
        const ENQUEUED = 1 << 1;
        /// Remove from the queue at the next commit
        const DEQUEUE = 1 << 2;
        /// (Re-)insert at the tail at the next commit
        const REQUEUE = 1 << 3;
        /// (Re-)insert at the head at the next commit; takes
        /// precedence over REQUEUE
        const REQUEUE_HEAD = 1 << 4;
    }
}

impl IntentFlags {
    /// Flags tied to queue membership, cleared when the page leaves
    /// its queue.
    pub const QUEUE_STATE: Self = Self::ENQUEUED
        .union(Self::DEQUEUE)
        .union(Self::REQUEUE)
        .union(Self::REQUEUE_HEAD);
}

/// Initial activity count for a page entering the active queue.
pub const ACT_INIT: u8 = 5;

/// Saturation point for the activity count.
pub const ACT_MAX: u8 = 64;

/// Decoded activity word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityState {
    /// Queue the page belongs to, if any
    pub queue: Option<QueueId>,
    /// Intent and residency flags
    pub flags: IntentFlags,
    /// Reclamation-daemon activity count
    pub act: u8,
}

impl ActivityState {
    /// State of a page on no queue with nothing pending.
    pub const fn idle() -> Self {
        Self { queue: None, flags: IntentFlags::empty(), act: 0 }
    }

    /// Pack into the atomic representation.
    pub const fn pack(self) -> u32 {
        let q = match self.queue {
            Some(q) => q as u8,
            None => QUEUE_NONE,
        };
        q as u32 | (self.flags.bits() as u32) << 8 | (self.act as u32) << 16
    }

    /// Unpack from the atomic representation.
    pub fn unpack(raw: u32) -> Self {
        Self {
            queue: QueueId::from_raw((raw & 0xff) as u8),
            flags: IntentFlags::from_bits_truncate(((raw >> 8) & 0xff) as u8),
            act: ((raw >> 16) & 0xff) as u8,
        }
    }

    /// Whether any queue transition is pending.
    #[inline]
    pub fn has_pending(self) -> bool {
        self.flags
            .intersects(IntentFlags::DEQUEUE | IntentFlags::REQUEUE | IntentFlags::REQUEUE_HEAD)
    }
}

impl PageFrame {
    /// Current activity state. Racy snapshot; authoritative for queue
    /// membership only under the domain-queue lock.
    #[inline]
    pub fn activity(&self) -> ActivityState {
        ActivityState::unpack(self.activity_state.load(Ordering::Acquire))
    }

    /// Single CAS attempt old -> new. On failure returns the observed
    /// state.
    pub(crate) fn astate_try_cas(
        &self,
        old: ActivityState,
        new: ActivityState,
    ) -> Result<(), ActivityState> {
        self.activity_state
            .compare_exchange(old.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ActivityState::unpack)
    }
}

/// CAS-with-revalidation update loop. `f` maps the observed state to
/// the desired one, or `None` to abandon the update; retries are
/// counted into `retries` rather than spinning silently.
pub(crate) fn astate_update<F>(
    frame: &PageFrame,
    retries: &AtomicU64,
    mut f: F,
) -> Option<(ActivityState, ActivityState)>
where
    F: FnMut(ActivityState) -> Option<ActivityState>,
{
    let mut old = frame.activity();
    loop {
        let new = f(old)?;
        match frame.astate_try_cas(old, new) {
            Ok(()) => return Some((old, new)),
            Err(seen) => {
                retries.fetch_add(1, Ordering::Relaxed);
                old = seen;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameTable, PageId, PhysSegment};
    use strata_hal::PhysAddr;

    #[test]
    fn test_pack_round_trip() {
        let s = ActivityState {
            queue: Some(QueueId::Laundry),
            flags: IntentFlags::ENQUEUED | IntentFlags::REFERENCED,
            act: 42,
        };
        assert_eq!(ActivityState::unpack(s.pack()), s);
        assert_eq!(ActivityState::unpack(ActivityState::idle().pack()), ActivityState::idle());
    }

    #[test]
    fn test_update_merges_concurrent_bits() {
        let t = FrameTable::new(
            &[PhysSegment { start: PhysAddr::new(0x1000), pages: 1, domain: 0 }],
            0,
        );
        let f = t.get(PageId::new(0));
        let retries = AtomicU64::new(0);
        let (old, new) = astate_update(f, &retries, |mut s| {
            s.flags |= IntentFlags::REFERENCED;
            Some(s)
        })
        .unwrap();
        assert_eq!(old, ActivityState::idle());
        assert!(new.flags.contains(IntentFlags::REFERENCED));
        assert!(f.activity().flags.contains(IntentFlags::REFERENCED));
    }

    #[test]
    fn test_update_abandon() {
        let t = FrameTable::new(
            &[PhysSegment { start: PhysAddr::new(0x1000), pages: 1, domain: 0 }],
            0,
        );
        let f = t.get(PageId::new(0));
        let retries = AtomicU64::new(0);
        assert!(astate_update(f, &retries, |_| None).is_none());
    }
}
