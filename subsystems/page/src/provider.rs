//! # External Collaborators
//!
//! Traits consumed by the page layer: the buddy/segment physical
//! allocator, the reservation (superpage) allocator, the pmap, the
//! pager, and the per-CPU page cache. The page layer owns admission
//! (the domain free counters) and descriptor state; these providers
//! own the physical free metadata and the mapping/IO machinery.

use strata_hal::cpu::CpuId;
use strata_hal::PhysAddr;

use crate::frame::PageId;

/// Free pools the physical allocator segregates pages into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePool {
    /// Pages destined for object-owned use
    Default,
    /// Pages for direct kernel use
    Direct,
}

/// The buddy/segment physical free-list allocator.
pub trait PhysProvider: Send + Sync {
    /// Take a naturally-aligned run of `1 << order` pages from the
    /// domain's free lists.
    fn alloc_pages(&self, domain: u32, pool: PagePool, order: u8) -> Option<PageId>;

    /// Return a run of `1 << order` pages to the free lists.
    fn free_pages(&self, pid: PageId, order: u8);

    /// Take `npages` physically contiguous pages whose addresses fall
    /// in `[low, high)`, aligned to `align`, not crossing a `boundary`
    /// multiple (0 = unconstrained).
    fn alloc_contig(
        &self,
        domain: u32,
        npages: usize,
        low: PhysAddr,
        high: PhysAddr,
        align: u64,
        boundary: u64,
    ) -> Option<PageId>;

    /// Buddy order of the free run headed by `pid`, if `pid` is free
    /// and heads one.
    fn free_run_order(&self, pid: PageId) -> Option<u8>;

    /// Whether `pid` currently sits on a free list.
    fn is_free(&self, pid: PageId) -> bool;
}

/// The reservation (superpage) allocator.
pub trait ReservProvider: Send + Sync {
    /// Satisfy a single-page allocation from an existing or new
    /// reservation for (object, pindex).
    fn alloc_page(&self, object_token: u64, pindex: u64, domain: u32) -> Option<PageId>;

    /// Satisfy a contiguous allocation from a reservation.
    #[allow(clippy::too_many_arguments)]
    fn alloc_contig(
        &self,
        object_token: u64,
        pindex: u64,
        domain: u32,
        npages: usize,
        low: PhysAddr,
        high: PhysAddr,
        align: u64,
        boundary: u64,
    ) -> Option<PageId>;

    /// Whether `pid` belongs to a reservation but is not handed out.
    fn is_page_free(&self, pid: PageId) -> bool;

    /// Reservation level of `pid`, or `None` outside any reservation.
    fn level_of(&self, pid: PageId) -> Option<u8>;

    /// Whether `pid` sits inside a fully-populated reservation.
    fn is_fully_populated(&self, pid: PageId) -> bool;
}

/// The mapping layer.
pub trait Pmap: Send + Sync {
    /// Tear down every mapping of the page.
    fn remove_all_mappings(&self, pid: PageId);

    /// Downgrade every mapping of the page to read-only.
    fn remove_write_mappings(&self, pid: PageId);

    /// Whether any mapping of the page exists.
    fn is_mapped(&self, pid: PageId) -> bool;

    /// Whether hardware recorded a modification of the page.
    fn is_modified(&self, pid: PageId) -> bool;

    /// Clear the hardware modification record.
    fn clear_modified(&self, pid: PageId);

    /// Copy the contents of `src` into `dst`.
    fn copy(&self, src: PageId, dst: PageId);

    /// Zero-fill the page.
    fn zero(&self, pid: PageId);
}

/// Why a pager read failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerError {
    /// The backing device failed
    Io,
    /// The requested range does not exist in the backing store
    BadRange,
}

/// Partial outcome of a failed pager read: the leading `validated`
/// pages hold good data, the rest do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagerFault {
    /// Pages validated before the failure, counted from the front
    pub validated: usize,
    /// The failure itself
    pub error: PagerError,
}

/// The backing store.
pub trait Pager: Send + Sync {
    /// Whether the store backs (object, pindex); on a hit, how many
    /// immediately following indices are cheap to read in the same
    /// operation.
    fn has_page(&self, object_token: u64, pindex: u64) -> Option<usize>;

    /// Read data for a run of pages starting at the first entry's
    /// index. The caller marks pages valid afterwards; on failure the
    /// fault reports how many leading pages were populated.
    fn get_pages(&self, object_token: u64, pages: &[PageId]) -> Result<(), PagerFault>;
}

/// The per-CPU page cache in front of the buddy allocator.
pub trait CpuPageCache: Send + Sync {
    /// Take one page from the CPU's cache, if it has one.
    fn cache_alloc(&self, cpu: CpuId, domain: u32, pool: PagePool) -> Option<PageId>;

    /// Offer freed pages to the CPU's cache; returns how many it
    /// absorbed. The remainder goes back to the buddy allocator.
    fn cache_release_batch(&self, cpu: CpuId, domain: u32, pages: &[PageId]) -> usize;
}
