//! # Object Surface
//!
//! The slice of the virtual-memory object the page layer links
//! against: the page index, resident-page bookkeeping, the object
//! lock, and the attributes reclamation consults (kind, memory
//! attribute, object-busy). Everything richer about objects lives in
//! the object layer proper.
//!
//! Per-object insert/remove is totally ordered by the object lock. The
//! index additionally sits behind a read/write lock of its own so the
//! lockless grab path can search it without taking the object lock;
//! every lockless hit is re-validated against the descriptor after
//! acquisition.

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use hashbrown::HashMap;
use spin::{Mutex, MutexGuard, RwLock};

use crate::frame::PageId;
use crate::provider::Pager;
use crate::system::PageSystem;
use crate::{PageError, PageResult};

/// What backs an object; decides eviction eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Anonymous memory
    Anonymous,
    /// Swap-backed memory
    Swap,
    /// File-backed memory
    File,
    /// Device memory; never relocated or evicted
    Device,
}

impl ObjectKind {
    /// Whether pages of this kind may be relocated or reclaimed.
    #[inline]
    pub const fn evictable(self) -> bool {
        !matches!(self, Self::Device)
    }
}

/// Caching attribute of an object's pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAttr {
    /// Ordinary write-back memory
    Default,
    /// Uncacheable mappings
    Uncacheable,
    /// Write-combining mappings
    WriteCombining,
}

/// Guard proving the object lock is held.
pub type ObjectGuard<'a> = MutexGuard<'a, ()>;

/// The page layer's view of one VM object.
pub struct VmObject {
    token: u64,
    kind: ObjectKind,
    memattr: MemAttr,
    lock: Mutex<()>,
    index: RwLock<HashMap<u64, PageId>>,
    resident: AtomicUsize,
    refs: AtomicUsize,
    busied: AtomicBool,
    pager: Option<Arc<dyn Pager>>,
}

impl VmObject {
    pub(crate) fn new(
        token: u64,
        kind: ObjectKind,
        memattr: MemAttr,
        pager: Option<Arc<dyn Pager>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token,
            kind,
            memattr,
            lock: Mutex::new(()),
            index: RwLock::new(HashMap::new()),
            resident: AtomicUsize::new(0),
            refs: AtomicUsize::new(0),
            busied: AtomicBool::new(false),
            pager,
        })
    }

    /// Unique nonzero identity used for descriptor re-validation.
    #[inline]
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Backing kind.
    #[inline]
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Memory attribute of the object's pages.
    #[inline]
    pub fn memattr(&self) -> MemAttr {
        self.memattr
    }

    /// Pager backing this object, if any.
    #[inline]
    pub fn pager(&self) -> Option<&Arc<dyn Pager>> {
        self.pager.as_ref()
    }

    /// Take the object lock.
    pub fn lock(&self) -> ObjectGuard<'_> {
        self.lock.lock()
    }

    /// Pages currently linked into the object.
    #[inline]
    pub fn resident_count(&self) -> usize {
        self.resident.load(Ordering::Acquire)
    }

    /// External references to the object (mappings etc.).
    #[inline]
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Add an external reference.
    pub fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop an external reference.
    pub fn drop_ref(&self) {
        let old = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "object {:#x}: reference underflow", self.token);
    }

    /// Whether the object is object-busied, which blocks new shared
    /// page holds.
    #[inline]
    pub fn is_busied(&self) -> bool {
        self.busied.load(Ordering::Acquire)
    }

    /// Mark the object busied.
    pub fn busy_object(&self) {
        self.busied.store(true, Ordering::Release);
    }

    /// Clear the object-busied mark.
    pub fn unbusy_object(&self) {
        self.busied.store(false, Ordering::Release);
    }

    /// Look up a resident page by index. Safe without the object lock;
    /// the result is a hint that must be re-validated after acquiring
    /// the page.
    pub fn lookup(&self, pindex: u64) -> Option<PageId> {
        self.index.read().get(&pindex).copied()
    }
}

impl core::fmt::Debug for VmObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObject")
            .field("token", &self.token)
            .field("kind", &self.kind)
            .field("resident", &self.resident_count())
            .finish()
    }
}

impl PageSystem {
    /// Link an exclusively busied, unowned page into `object` at
    /// `pindex`. Fails with [`PageError::Exists`] when the index slot
    /// is taken; the page is untouched in that case.
    pub fn insert_into_object(
        &self,
        object: &VmObject,
        pid: PageId,
        pindex: u64,
    ) -> PageResult<()> {
        let guard = object.lock();
        self.insert_locked(object, &guard, pid, pindex)
    }

    pub(crate) fn insert_locked(
        &self,
        object: &VmObject,
        _guard: &ObjectGuard<'_>,
        pid: PageId,
        pindex: u64,
    ) -> PageResult<()> {
        let frame = self.frames().get(pid);
        assert!(
            frame.busy_snapshot().is_exclusive(),
            "page {:#x}: insert without exclusive busy",
            frame.phys().as_u64()
        );
        let mut index = object.index.write();
        if index.contains_key(&pindex) {
            return Err(PageError::Exists);
        }
        index.insert(pindex, pid);
        drop(index);
        frame.set_owner(object.token(), pindex);
        frame.set_objref();
        object.resident.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Unlink an exclusively busied page from its object. Returns true
    /// when this removed the final reference (no wirings remain), in
    /// which case the caller owns freeing the page.
    pub fn remove_from_object(&self, object: &VmObject, pid: PageId) -> bool {
        let guard = object.lock();
        self.remove_locked(object, &guard, pid)
    }

    pub(crate) fn remove_locked(
        &self,
        object: &VmObject,
        _guard: &ObjectGuard<'_>,
        pid: PageId,
    ) -> bool {
        let frame = self.frames().get(pid);
        assert!(
            frame.busy_snapshot().is_exclusive(),
            "page {:#x}: remove without exclusive busy",
            frame.phys().as_u64()
        );
        assert_eq!(
            frame.owner_token(),
            object.token(),
            "page {:#x}: removed from the wrong object",
            frame.phys().as_u64()
        );
        let pindex = frame.pindex();
        let removed = object.index.write().remove(&pindex);
        assert_eq!(removed, Some(pid), "object index out of sync at {pindex}");
        object.resident.fetch_sub(1, Ordering::AcqRel);
        frame.clear_owner();
        let after = frame.clear_objref();
        after.wires() == 0
    }

    /// Register a new object with the page layer.
    pub fn create_object(
        &self,
        kind: ObjectKind,
        memattr: MemAttr,
        pager: Option<Arc<dyn Pager>>,
    ) -> Arc<VmObject> {
        let token = self.next_object_token();
        let object = VmObject::new(token, kind, memattr, pager);
        let mut registry = self.object_registry().write();
        // Opportunistically drop entries whose objects died.
        registry.retain(|_, weak: &mut Weak<VmObject>| weak.strong_count() > 0);
        registry.insert(token, Arc::downgrade(&object));
        object
    }

    /// Resolve a descriptor's owner token back to its object, if it is
    /// still alive.
    pub fn resolve_object(&self, token: u64) -> Option<Arc<VmObject>> {
        self.object_registry().read().get(&token).and_then(Weak::upgrade)
    }
}
