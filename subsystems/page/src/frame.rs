//! # Page Descriptor Table
//!
//! One fixed [`PageFrame`] per physical frame, bulk-created at boot
//! from the physical segment map and never moved or destroyed. The
//! descriptor is pure data; every field has exactly one protection
//! regime, named on its accessor, and callers must use the matching
//! one. There is no whole-table lock and no per-page generic lock.
//!
//! Field protection regimes:
//! - `ref_state`: CAS via the named mutators in [`crate::refstate`]
//! - `busy_state`: CAS via the protocol in [`crate::busy`]
//! - `activity_state`: CAS via [`crate::astate`]; queue id and the
//!   ENQUEUED bit are authoritative only under the domain-queue lock
//! - `owner_token`/`pindex`: the owning object's lock, page exclusively
//!   busied
//! - `valid`/`dirty`: the page's busy state
//! - `pool`/`free_order`: the physical allocator, while the page is on
//!   a free list
//! - queue links: the domain-queue lock

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;
use static_assertions::const_assert;
use strata_hal::{PhysAddr, PAGE_SIZE};

/// Granularity of the valid/dirty tracking, in bytes.
pub const SUB_BLOCK_SIZE: usize = 512;

/// Sub-blocks per page; one valid bit and one dirty bit each.
pub const SUB_BLOCKS: usize = PAGE_SIZE / SUB_BLOCK_SIZE;

/// Bitmask covering every sub-block of a page.
pub const VALID_ALL: u8 = u8::MAX;

const_assert!(SUB_BLOCKS == 8);

/// Link sentinel for pages on no list.
pub(crate) const LINK_NIL: u32 = u32::MAX;

/// Index of a page descriptor in the fixed table.
///
/// The table is an arena; identifiers are slot indices, not addresses,
/// and stay meaningful for the lifetime of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PageId(u32);

impl PageId {
    /// Create an id from a raw slot index
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw slot index
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) const fn raw(self) -> u32 {
        self.0
    }

    /// Id of the descriptor `n` slots after this one
    #[inline]
    pub const fn offset(self, n: u32) -> Self {
        Self(self.0 + n)
    }
}

bitflags! {
    /// Miscellaneous per-page flag bits.
    ///
    /// Mutated only while the page is exclusively held (allocator
    /// re-init or exclusive busy); MARKER is set once at boot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Contents are known to be zero
        const ZERO = 1 << 0;
        /// Exclude from kernel dumps
        const NODUMP = 1 << 1;
        /// Queue sentinel, not a real frame; never allocated
        const MARKER = 1 << 2;
    }
}

/// A contiguous physical segment handed to the table at boot.
#[derive(Debug, Clone, Copy)]
pub struct PhysSegment {
    /// First byte of the segment; must be page-aligned
    pub start: PhysAddr,
    /// Length in pages
    pub pages: u32,
    /// NUMA domain the segment belongs to
    pub domain: u32,
}

/// One physical page frame.
///
/// Created once at boot; the descriptor itself never moves. See the
/// module docs for the protection regime of each field.
#[derive(Debug)]
pub struct PageFrame {
    phys: PhysAddr,
    segment: u16,
    domain: u8,
    flags: AtomicU8,
    pool: AtomicU8,
    free_order: AtomicU8,
    valid: AtomicU8,
    dirty: AtomicU8,
    pub(crate) ref_state: AtomicU32,
    pub(crate) busy_state: AtomicU32,
    pub(crate) activity_state: AtomicU32,
    owner_token: AtomicU64,
    pindex: AtomicU64,
    pub(crate) link_next: AtomicU32,
    pub(crate) link_prev: AtomicU32,
}

/// `free_order` value while the page is not on a physical free list.
pub const NO_ORDER: u8 = u8::MAX;

impl PageFrame {
    fn new(phys: PhysAddr, segment: u16, domain: u8, flags: PageFlags) -> Self {
        Self {
            phys,
            segment,
            domain,
            flags: AtomicU8::new(flags.bits()),
            pool: AtomicU8::new(0),
            free_order: AtomicU8::new(NO_ORDER),
            valid: AtomicU8::new(0),
            dirty: AtomicU8::new(0),
            ref_state: AtomicU32::new(0),
            busy_state: AtomicU32::new(crate::busy::FREED_WORD),
            activity_state: AtomicU32::new(crate::astate::ActivityState::idle().pack()),
            owner_token: AtomicU64::new(0),
            pindex: AtomicU64::new(0),
            link_next: AtomicU32::new(LINK_NIL),
            link_prev: AtomicU32::new(LINK_NIL),
        }
    }

    /// Physical address of the frame (fixed identity).
    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Segment the frame was created from.
    #[inline]
    pub fn segment(&self) -> u16 {
        self.segment
    }

    /// NUMA domain of the frame.
    #[inline]
    pub fn domain(&self) -> u32 {
        u32::from(self.domain)
    }

    /// Current flag bits.
    #[inline]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// Whether this descriptor is a queue sentinel.
    #[inline]
    pub fn is_marker(&self) -> bool {
        self.flags().contains(PageFlags::MARKER)
    }

    pub(crate) fn set_flags(&self, flags: PageFlags) {
        self.flags.store(flags.bits(), Ordering::Relaxed);
    }

    /// Free-pool the page belongs to while free. Maintained by the
    /// physical allocator.
    #[inline]
    pub fn pool(&self) -> u8 {
        self.pool.load(Ordering::Relaxed)
    }

    /// Set the free-pool identity. Physical allocator only.
    pub fn set_pool(&self, pool: u8) {
        self.pool.store(pool, Ordering::Relaxed);
    }

    /// Buddy order of the free run this page heads, or [`NO_ORDER`]
    /// while allocated. Maintained by the physical allocator.
    #[inline]
    pub fn free_order(&self) -> u8 {
        self.free_order.load(Ordering::Relaxed)
    }

    /// Set the free-run order. Physical allocator only.
    pub fn set_free_order(&self, order: u8) {
        self.free_order.store(order, Ordering::Relaxed);
    }

    /// Owning object token, or 0 while unowned. A racy read; callers
    /// must re-validate after acquiring the page.
    #[inline]
    pub fn owner_token(&self) -> u64 {
        self.owner_token.load(Ordering::Acquire)
    }

    /// Index of the page within its owning object. Meaningful only
    /// while [`Self::owner_token`] is nonzero.
    #[inline]
    pub fn pindex(&self) -> u64 {
        self.pindex.load(Ordering::Acquire)
    }

    pub(crate) fn set_owner(&self, token: u64, pindex: u64) {
        self.pindex.store(pindex, Ordering::Release);
        self.owner_token.store(token, Ordering::Release);
    }

    pub(crate) fn clear_owner(&self) {
        self.owner_token.store(0, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Valid/dirty sub-block masks
    // ------------------------------------------------------------------

    /// Bitmask of sub-blocks overlapping `[base, base + len)`.
    pub fn bits_for_range(base: usize, len: usize) -> u8 {
        assert!(base + len <= PAGE_SIZE, "sub-block range out of page");
        if len == 0 {
            return 0;
        }
        let first = base / SUB_BLOCK_SIZE;
        let last = (base + len - 1) / SUB_BLOCK_SIZE;
        (((2u16 << last) - (1u16 << first)) & 0xff) as u8
    }

    /// Current valid mask.
    #[inline]
    pub fn valid_bits(&self) -> u8 {
        self.valid.load(Ordering::Acquire)
    }

    /// Current dirty mask.
    #[inline]
    pub fn dirty_bits(&self) -> u8 {
        self.dirty.load(Ordering::Acquire)
    }

    /// Whether every sub-block holds meaningful data.
    #[inline]
    pub fn is_all_valid(&self) -> bool {
        self.valid_bits() == VALID_ALL
    }

    /// Whether any sub-block holds meaningful data.
    #[inline]
    pub fn is_any_valid(&self) -> bool {
        self.valid_bits() != 0
    }

    /// Mark `[base, base + len)` valid. The page must be busied.
    pub fn set_valid_range(&self, base: usize, len: usize) {
        self.valid.fetch_or(Self::bits_for_range(base, len), Ordering::Release);
    }

    /// Mark the whole page valid. The page must be busied.
    pub fn set_valid_all(&self) {
        self.valid.store(VALID_ALL, Ordering::Release);
    }

    /// Mark `[base, base + len)` dirty. The page must be busied.
    pub fn set_dirty_range(&self, base: usize, len: usize) {
        self.dirty.fetch_or(Self::bits_for_range(base, len), Ordering::Release);
    }

    /// Mark the whole page dirty. The page must be busied.
    pub fn set_dirty_all(&self) {
        self.dirty.store(VALID_ALL, Ordering::Release);
    }

    /// Clear all dirty bits. The page must be busied.
    pub fn undirty(&self) {
        self.dirty.store(0, Ordering::Release);
    }

    pub(crate) fn clear_valid_dirty(&self) {
        self.valid.store(0, Ordering::Release);
        self.dirty.store(0, Ordering::Release);
    }

    pub(crate) fn copy_contents_state(&self, from: &PageFrame) {
        self.valid.store(from.valid_bits(), Ordering::Release);
        self.dirty.store(from.dirty_bits(), Ordering::Release);
    }
}

struct SegmentSpan {
    first_page: u64,
    first_id: u32,
    pages: u32,
    domain: u32,
}

/// The fixed descriptor table plus segment geometry.
pub struct FrameTable {
    frames: Box<[PageFrame]>,
    spans: Box<[SegmentSpan]>,
    real_frames: u32,
}

impl FrameTable {
    /// Bulk-create descriptors for every page of every segment, plus
    /// `markers` sentinel descriptors appended after the real frames.
    pub fn new(segments: &[PhysSegment], markers: usize) -> Self {
        assert!(segments.len() <= usize::from(u16::MAX), "too many segments");
        let total: u64 = segments.iter().map(|s| u64::from(s.pages)).sum();
        assert!(total + markers as u64 <= u64::from(u32::MAX - 1), "frame table too large");

        let mut frames = Vec::with_capacity(total as usize + markers);
        let mut spans = Vec::with_capacity(segments.len());
        for (si, seg) in segments.iter().enumerate() {
            assert!(seg.start.is_aligned(PAGE_SIZE as u64), "segment start unaligned");
            spans.push(SegmentSpan {
                first_page: seg.start.page_number(),
                first_id: frames.len() as u32,
                pages: seg.pages,
                domain: seg.domain,
            });
            for i in 0..u64::from(seg.pages) {
                frames.push(PageFrame::new(
                    seg.start.add(i * PAGE_SIZE as u64),
                    si as u16,
                    seg.domain as u8,
                    PageFlags::empty(),
                ));
            }
        }
        let real_frames = frames.len() as u32;
        for _ in 0..markers {
            frames.push(PageFrame::new(PhysAddr::ZERO, u16::MAX, 0, PageFlags::MARKER));
        }

        log::info!(
            "frame table initialized: {} frames in {} segments, {} markers",
            real_frames,
            segments.len(),
            markers
        );

        Self { frames: frames.into_boxed_slice(), spans: spans.into_boxed_slice(), real_frames }
    }

    /// Descriptor for `pid`.
    #[inline]
    pub fn get(&self, pid: PageId) -> &PageFrame {
        &self.frames[pid.index()]
    }

    /// Number of real (allocatable) frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.real_frames as usize
    }

    /// Whether the table holds no real frames.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.real_frames == 0
    }

    /// Ids of the sentinel descriptors.
    pub fn marker_ids(&self) -> impl Iterator<Item = PageId> + '_ {
        (self.real_frames..self.frames.len() as u32).map(PageId::new)
    }

    /// Descriptor id owning the given physical address, if the address
    /// falls inside a known segment.
    pub fn pid_for_phys(&self, addr: PhysAddr) -> Option<PageId> {
        let pn = addr.page_number();
        for span in self.spans.iter() {
            if pn >= span.first_page && pn < span.first_page + u64::from(span.pages) {
                return Some(PageId::new(span.first_id + (pn - span.first_page) as u32));
            }
        }
        None
    }

    /// Number of real frames per domain, indexed by domain id.
    pub fn frames_per_domain(&self, domains: usize) -> Vec<u64> {
        let mut counts = Vec::new();
        counts.resize(domains, 0u64);
        for span in self.spans.iter() {
            counts[span.domain as usize] += u64::from(span.pages);
        }
        counts
    }

    /// Iterate segment spans as (first id, page count, domain), in
    /// ascending physical order within each segment.
    pub(crate) fn spans(&self) -> impl Iterator<Item = (PageId, u32, u32)> + '_ {
        self.spans.iter().map(|s| (PageId::new(s.first_id), s.pages, s.domain))
    }

    /// Id of the page `n` frames after `pid` if it stays inside the
    /// same segment, making the pair physically contiguous.
    pub fn contiguous_offset(&self, pid: PageId, n: u32) -> Option<PageId> {
        let frame = self.get(pid);
        let span = &self.spans[usize::from(frame.segment())];
        let rel = pid.raw() - span.first_id;
        if rel + n < span.pages {
            Some(pid.offset(n))
        } else {
            None
        }
    }
}

impl core::fmt::Debug for FrameTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameTable")
            .field("frames", &self.frames.len())
            .field("segments", &self.spans.len())
            .finish()
    }
}
