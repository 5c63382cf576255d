//! # Grab
//!
//! Combined lookup-or-allocate-and-acquire, the operation fault and
//! pager paths live on: `LOOKUP -> try-acquire-if-found |
//! maybe-allocate-if-missing -> [sleep and retry on busy conflict] ->
//! DONE | FAIL`.
//!
//! The lockless path searches the object index without the object
//! lock, acquires the page non-blocking, and re-validates identity
//! afterwards; any mismatch releases the page and restarts from
//! lookup, never reports success. The locked fallback may additionally
//! allocate on a miss and sleep on conflicts, re-validating identity
//! on every wake. `grab_valid` extends the locked path with a bounded
//! pager read-ahead window.

use alloc::vec::Vec;

use crate::astate::QueueId;
use crate::frame::PageId;
use crate::object::VmObject;
use crate::system::CpuCtx;
use crate::{AllocClass, AllocFlags, PageError, PageResult, PageStats};

/// Failure of [`CpuCtx::grab_valid`]. On a pager failure the
/// originally requested page is handed back still exclusively busied
/// so the caller can inspect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrabValidError {
    /// What went wrong
    pub error: PageError,
    /// The requested page, still exclusively busied, when it survived
    /// the failure
    pub page: Option<PageId>,
}

impl CpuCtx<'_> {
    /// Lockless grab: unsynchronized lookup, non-blocking acquire,
    /// post-acquire identity check. `Ok(None)` is a miss, not an
    /// error; this path never allocates.
    pub fn grab_unlocked(
        &self,
        obj: &VmObject,
        pindex: u64,
        flags: AllocFlags,
    ) -> PageResult<Option<PageId>> {
        loop {
            let Some(pid) = obj.lookup(pindex) else {
                return Ok(None);
            };
            if !self.try_acquire(pid, flags) {
                if flags.contains(AllocFlags::NOWAIT) {
                    return Err(PageError::WouldBlock);
                }
                self.sys.busy_sleep_once(pid);
                continue;
            }
            // The lookup was racy; the page may have been freed and
            // reused behind it. Mismatch means retry, never success.
            let frame = self.sys.frames().get(pid);
            if frame.owner_token() != obj.token() || frame.pindex() != pindex {
                PageStats::bump(&self.sys.stats().grab_restarts);
                self.release_acquired(pid, flags);
                continue;
            }
            return Ok(Some(pid));
        }
    }

    /// Grab a page, allocating on a miss unless
    /// [`AllocFlags::NOCREAT`] asks for a plain miss report.
    pub fn grab(
        &self,
        obj: &VmObject,
        pindex: u64,
        domains: &[u32],
        class: AllocClass,
        flags: AllocFlags,
    ) -> PageResult<Option<PageId>> {
        match self.grab_unlocked(obj, pindex, flags)? {
            Some(pid) => return Ok(Some(pid)),
            None => {
                if flags.contains(AllocFlags::NOCREAT) {
                    return Ok(None);
                }
            }
        }
        self.grab_locked(obj, pindex, domains, class, flags)
    }

    fn grab_locked(
        &self,
        obj: &VmObject,
        pindex: u64,
        domains: &[u32],
        class: AllocClass,
        flags: AllocFlags,
    ) -> PageResult<Option<PageId>> {
        loop {
            let guard = obj.lock();
            if let Some(pid) = obj.lookup(pindex) {
                if self.try_acquire(pid, flags) {
                    return Ok(Some(pid));
                }
                if flags.contains(AllocFlags::NOWAIT) {
                    return Err(PageError::WouldBlock);
                }
                // Bias the daemon away from the page while we sleep.
                self.sys.reference_page(pid);
                drop(guard);
                self.sys.busy_sleep_once(pid);
                continue;
            }
            if flags.contains(AllocFlags::NOCREAT) {
                return Ok(None);
            }
            match self.alloc_attempt(Some((obj, &guard, pindex)), domains, class, flags) {
                Ok(pid) => return Ok(Some(pid)),
                Err(PageError::NoPage) => {
                    drop(guard);
                    if !flags.contains(AllocFlags::WAITOK) {
                        return Err(PageError::NoPage);
                    }
                    self.sys.wait_for_free_any(domains, class);
                }
                Err(_) => {
                    // Lost an insertion race despite holding the lock;
                    // restart from lookup.
                    continue;
                }
            }
        }
    }

    /// Non-blocking acquisition in the mode the flags ask for.
    fn try_acquire(&self, pid: PageId, flags: AllocFlags) -> bool {
        let frame = self.sys.frames().get(pid);
        if flags.contains(AllocFlags::NOBUSY) {
            assert!(
                flags.contains(AllocFlags::WIRED),
                "a busy-less grab must wire the page"
            );
            // Wire-only acquire; identity revalidation catches a page
            // that was freed under the wiring.
            frame.wire_acquire();
            return true;
        }
        let ok = if flags.contains(AllocFlags::SBUSY) {
            self.sys.try_busy_shared(pid)
        } else {
            self.sys.try_busy_exclusive(pid)
        };
        if ok && flags.contains(AllocFlags::WIRED) {
            frame.wire_acquire();
        }
        ok
    }

    /// Release an acquisition that failed identity validation.
    fn release_acquired(&self, pid: PageId, flags: AllocFlags) {
        if flags.contains(AllocFlags::WIRED) || flags.contains(AllocFlags::NOBUSY) {
            self.unwire(pid, QueueId::Inactive);
        }
        if !flags.contains(AllocFlags::NOBUSY) {
            self.sys.unbusy(pid);
        }
    }

    /// Grab a page and make sure it holds valid data, reading from the
    /// object's pager when it does not. A pager read covers a bounded
    /// window of missing trailing pages in the same operation.
    ///
    /// On a pager failure the unwired read-ahead pages are freed, the
    /// error is returned, and the requested page stays exclusively
    /// busied inside the error for the caller to inspect.
    pub fn grab_valid(
        &self,
        obj: &VmObject,
        pindex: u64,
        domains: &[u32],
        class: AllocClass,
        flags: AllocFlags,
    ) -> Result<Option<PageId>, GrabValidError> {
        let fail = |error: PageError| GrabValidError { error, page: None };
        loop {
            let guard = obj.lock();
            let pid = if let Some(pid) = obj.lookup(pindex) {
                if !self.sys.try_busy_exclusive(pid) {
                    let frame = self.sys.frames().get(pid);
                    if frame.is_all_valid()
                        && flags.contains(AllocFlags::SBUSY)
                        && self.sys.try_busy_shared(pid)
                    {
                        // Fully valid and shared access is enough.
                        return Ok(Some(self.grab_valid_finish(pid, flags)));
                    }
                    if flags.contains(AllocFlags::NOWAIT) {
                        return Err(fail(PageError::WouldBlock));
                    }
                    self.sys.reference_page(pid);
                    drop(guard);
                    self.sys.busy_sleep_once(pid);
                    continue;
                }
                pid
            } else {
                if flags.contains(AllocFlags::NOCREAT) {
                    return Ok(None);
                }
                // Allocate exclusively busied regardless of the final
                // busy mode; the data still has to be produced and the
                // caller's wire/busy requests apply on the way out.
                let alloc_flags = flags
                    - (AllocFlags::NOBUSY
                        | AllocFlags::SBUSY
                        | AllocFlags::ZERO
                        | AllocFlags::WIRED);
                match self.alloc_attempt(Some((obj, &guard, pindex)), domains, class, alloc_flags)
                {
                    Ok(pid) => pid,
                    Err(PageError::NoPage) => {
                        drop(guard);
                        if !flags.contains(AllocFlags::WAITOK) {
                            return Err(fail(PageError::NoPage));
                        }
                        self.sys.wait_for_free_any(domains, class);
                        continue;
                    }
                    Err(e) => return Err(fail(e)),
                }
            };

            let frame = self.sys.frames().get(pid);
            if frame.is_all_valid() {
                return Ok(Some(self.grab_valid_finish(pid, flags)));
            }
            let backed = obj
                .pager()
                .cloned()
                .and_then(|p| p.has_page(obj.token(), pindex).map(|ahead| (p, ahead)));
            let Some((pager, ahead)) = backed else {
                // No backing data exists; the page is fresh zeroes.
                self.sys.pmap().zero(pid);
                frame.set_valid_all();
                frame.undirty();
                return Ok(Some(self.grab_valid_finish(pid, flags)));
            };

            // Assemble the read window: the requested page plus
            // missing trailing pages, bounded by configuration and cut
            // short at the first resident page or allocation failure.
            let cap = self.sys.config().readahead_max.max(1);
            let mut window = Vec::with_capacity(cap.min(ahead + 1));
            window.push(pid);
            for i in 1..=ahead as u64 {
                if window.len() >= cap {
                    break;
                }
                let idx = pindex + i;
                if obj.lookup(idx).is_some() {
                    break;
                }
                match self.alloc_attempt(
                    Some((obj, &guard, idx)),
                    domains,
                    class,
                    AllocFlags::empty(),
                ) {
                    Ok(p) => window.push(p),
                    Err(_) => break,
                }
            }

            // One read for the whole window. Pager IO can sleep for as
            // long as it likes; the object lock must not be held.
            drop(guard);
            let read = pager.get_pages(obj.token(), &window);
            let guard = obj.lock();

            match read {
                Ok(()) => {
                    for &p in &window {
                        self.sys.frames().get(p).set_valid_all();
                    }
                    for &extra in &window[1..] {
                        self.deactivate(extra);
                        self.sys.unbusy(extra);
                    }
                    drop(guard);
                    return Ok(Some(self.grab_valid_finish(pid, flags)));
                }
                Err(fault) => {
                    for (i, &p) in window.iter().enumerate() {
                        if i < fault.validated {
                            self.sys.frames().get(p).set_valid_all();
                        }
                    }
                    for (i, &extra) in window.iter().enumerate().skip(1) {
                        let ef = self.sys.frames().get(extra);
                        if i < fault.validated {
                            self.deactivate(extra);
                            self.sys.unbusy(extra);
                        } else if ef.ref_snapshot().wires() == 0 {
                            // Unwired scratch with no data: gone.
                            self.sys.remove_locked(obj, &guard, extra);
                            ef.clear_valid_dirty();
                            self.sys.mark_freed_and_wake(extra);
                            self.release_to_free_pool(extra);
                        }
                        // Wired pages stay busied for the caller.
                    }
                    drop(guard);
                    return Err(GrabValidError {
                        error: PageError::Pager(fault.error),
                        page: Some(pid),
                    });
                }
            }
        }
    }

    /// Apply the caller's wire and busy-mode requests to an acquired,
    /// valid page.
    fn grab_valid_finish(&self, pid: PageId, flags: AllocFlags) -> PageId {
        if flags.contains(AllocFlags::WIRED) {
            self.wire(pid);
        }
        if flags.contains(AllocFlags::NOBUSY) {
            self.sys.unbusy(pid);
        } else if flags.contains(AllocFlags::SBUSY)
            && self.sys.frames().get(pid).busy_snapshot().is_exclusive()
        {
            self.sys.busy_downgrade(pid);
        }
        pid
    }
}
