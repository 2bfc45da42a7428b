//! Descent and search over the trie of B+-trees.
//!
//! The read path is entirely optimistic: every pointer hop snapshots
//! the page version before and validates it after, retrying from the
//! storage root on any mismatch. Write paths descend the same way and
//! only then take the border page lock, re-validating under it.

use crate::buffer::page::{Page, PagePtr, INVALID_PAGE_PTR};
use crate::error::Validation::{self, Invalid, Valid};
use crate::error::{Error, Result};
use crate::index::border::{BorderPage, FindKeyResult};
use crate::index::intermediate::IntermediatePage;
use crate::index::key::{remaining_at_layer, slice_at_layer, suffix_at_layer, KeySlice};
use crate::index::page::{PageHeader, PageKind};
use crate::index::storage::MasstreeStorage;
use crate::index::version::{PageVersionSnapshot, VERSION_LOCKED_BIT};
use crate::session::Session;
use crate::trx::{ReadSetEntry, WriteKind};

/// A border page reached by one descent, with the stable version the
/// caller must validate against.
#[derive(Clone, Copy)]
pub(crate) struct BorderTarget {
    pub ptr: PagePtr,
    pub stable: PageVersionSnapshot,
}

/// Outcome of the optimistic read-path locate.
pub(crate) enum LocateResult {
    Found {
        page: PagePtr,
        slot: usize,
        stable: PageVersionSnapshot,
    },
    NotFound {
        page: PagePtr,
        stable: PageVersionSnapshot,
        gap: (KeySlice, KeySlice),
    },
}

/// Outcome of the locked write-path locate.
pub(crate) enum WriteTarget {
    /// Exact record found; its page is left locked for the caller.
    Record { page: PagePtr, slot: usize },
    /// No record for the key; the page was unlocked again.
    Missing {
        page: PagePtr,
        version: u64,
        gap: (KeySlice, KeySlice),
    },
}

impl MasstreeStorage {
    #[inline]
    pub(crate) fn resolve(&self, ptr: PagePtr) -> *mut Page {
        self.pool().resolve(ptr)
    }

    /// # Safety
    ///
    /// Caller observes the page under the optimistic protocol or a
    /// lock; the pointer must come from this storage's pool.
    #[inline]
    pub(crate) unsafe fn header_of<'s>(&'s self, ptr: PagePtr) -> &'s PageHeader {
        unsafe { &*(self.resolve(ptr) as *const PageHeader) }
    }

    /// # Safety
    ///
    /// See [`Self::header_of`]; additionally the page must be a border
    /// page (kind is immutable after init).
    #[inline]
    pub(crate) unsafe fn border_of<'s>(&'s self, ptr: PagePtr) -> &'s BorderPage {
        debug_assert_eq!(unsafe { self.header_of(ptr) }.kind(), PageKind::Border);
        unsafe { &*(self.resolve(ptr) as *const BorderPage) }
    }

    /// # Safety
    ///
    /// Caller holds the page lock (or the page is invisible).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn border_mut_of<'s>(&'s self, ptr: PagePtr) -> &'s mut BorderPage {
        debug_assert_eq!(unsafe { self.header_of(ptr) }.kind(), PageKind::Border);
        unsafe { &mut *(self.resolve(ptr) as *mut BorderPage) }
    }

    /// # Safety
    ///
    /// See [`Self::border_of`].
    #[inline]
    pub(crate) unsafe fn intermediate_of<'s>(&'s self, ptr: PagePtr) -> &'s IntermediatePage {
        debug_assert_eq!(unsafe { self.header_of(ptr) }.kind(), PageKind::Intermediate);
        unsafe { &*(self.resolve(ptr) as *const IntermediatePage) }
    }

    /// # Safety
    ///
    /// Caller holds the page lock (or the page is invisible).
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn intermediate_mut_of<'s>(&'s self, ptr: PagePtr) -> &'s mut IntermediatePage {
        debug_assert_eq!(unsafe { self.header_of(ptr) }.kind(), PageKind::Intermediate);
        unsafe { &mut *(self.resolve(ptr) as *mut IntermediatePage) }
    }

    /// Walk from a layer root down to the border page covering `slice`.
    ///
    /// Each hop verifies the parent version after snapshotting the
    /// child, so the returned `(page, stable)` pair was reached through
    /// a consistent path. Any interference invalidates.
    pub(crate) fn try_descend_to_border(
        &self,
        root: PagePtr,
        slice: KeySlice,
    ) -> Validation<BorderTarget> {
        if root == INVALID_PAGE_PTR {
            return Invalid;
        }
        let mut cur = root;
        // SAFETY: optimistic access validated through version words.
        let mut header = unsafe { self.header_of(cur) };
        let mut cur_stable = header.version.stable();
        loop {
            if cur_stable.is_deleted() {
                return Invalid;
            }
            if !header.within_fences(slice) {
                // a split narrowed this page while we were on the way;
                // the right sibling chain covers the rest of the range.
                if slice >= header.high_fence && header.foster_child() != INVALID_PAGE_PTR {
                    cur = header.foster_child();
                    header = unsafe { self.header_of(cur) };
                    cur_stable = header.version.stable();
                    continue;
                }
                return Invalid;
            }
            match header.kind() {
                PageKind::Border => {
                    return Valid(BorderTarget {
                        ptr: cur,
                        stable: cur_stable,
                    });
                }
                PageKind::Intermediate => {
                    let page = unsafe { self.intermediate_of(cur) };
                    page.prefetch();
                    let mini_idx = page.find_minipage(cur_stable.key_count(), slice);
                    let mini = page.mini_page(mini_idx);
                    mini.prefetch();
                    let mini_stable = mini.mini_version.stable();
                    // the mini-page choice is only meaningful if the
                    // top-level separators did not move meanwhile.
                    verify!(self.validate_version(cur, cur_stable));
                    let ptr_idx = mini.find_pointer(mini_stable.key_count(), slice);
                    let child = mini.pointer(ptr_idx).read();
                    verify!(self.validate_mini(page, mini_idx, mini_stable));
                    if child == INVALID_PAGE_PTR {
                        return Invalid;
                    }
                    let child_header = unsafe { self.header_of(child) };
                    let child_stable = child_header.version.stable();
                    verify!(self.validate_version(cur, cur_stable));
                    cur = child;
                    header = child_header;
                    cur_stable = child_stable;
                }
            }
        }
    }

    #[inline]
    fn validate_version(&self, ptr: PagePtr, stable: PageVersionSnapshot) -> Validation<()> {
        let header = unsafe { self.header_of(ptr) };
        if header.version.validate(stable) {
            Valid(())
        } else {
            Invalid
        }
    }

    #[inline]
    fn validate_mini(
        &self,
        page: &IntermediatePage,
        mini_idx: usize,
        stable: PageVersionSnapshot,
    ) -> Validation<()> {
        if page.mini_page(mini_idx).mini_version.validate(stable) {
            Valid(())
        } else {
            Invalid
        }
    }

    /// Optimistic full-key locate across layers.
    pub(crate) fn try_locate_record(&self, key: &[u8]) -> Validation<LocateResult> {
        let mut layer = 0usize;
        let mut root = self.root_pointer().read();
        loop {
            let slice = slice_at_layer(key, layer);
            let remaining = remaining_at_layer(key, layer);
            let suffix = suffix_at_layer(key, layer);
            let target = verify!(self.try_descend_to_border(root, slice));
            let border = unsafe { self.border_of(target.ptr) };
            let count = target.stable.key_count();
            match border.find_key(count, slice, remaining, suffix) {
                Some(idx) if border.points_to_next_layer(idx) => {
                    let next = border.next_layer(idx).read();
                    verify!(self.validate_version(target.ptr, target.stable));
                    layer += 1;
                    root = next;
                }
                Some(idx) => {
                    verify!(self.validate_version(target.ptr, target.stable));
                    return Valid(LocateResult::Found {
                        page: target.ptr,
                        slot: idx,
                        stable: target.stable,
                    });
                }
                None => {
                    let gap = border.gap_around(count, slice);
                    verify!(self.validate_version(target.ptr, target.stable));
                    return Valid(LocateResult::NotFound {
                        page: target.ptr,
                        stable: target.stable,
                        gap,
                    });
                }
            }
        }
    }

    /// Locked full-key locate for write paths. On `Record` the border
    /// page is returned still locked.
    pub(crate) fn try_lock_record(&self, key: &[u8]) -> Validation<WriteTarget> {
        let mut layer = 0usize;
        let mut root = self.root_pointer().read();
        loop {
            let slice = slice_at_layer(key, layer);
            let remaining = remaining_at_layer(key, layer);
            let suffix = suffix_at_layer(key, layer);
            let target = verify!(self.try_descend_to_border(root, slice));
            // SAFETY: lock acquired right below.
            let border = unsafe { self.border_mut_of(target.ptr) };
            border.header.version.lock();
            if border.header.version.is_deleted() || !border.header.within_fences(slice) {
                border.header.version.unlock();
                return Invalid;
            }
            let count = border.key_count();
            match border.find_key_for_reserve(count, slice, remaining, suffix) {
                FindKeyResult::NextLayer(idx) => {
                    let next = border.next_layer(idx).read();
                    border.header.version.unlock();
                    layer += 1;
                    root = next;
                }
                FindKeyResult::Found(idx) => {
                    return Valid(WriteTarget::Record {
                        page: target.ptr,
                        slot: idx,
                    });
                }
                FindKeyResult::NotFound { .. } | FindKeyResult::Conflict(_) => {
                    let gap = border.gap_around(count, slice);
                    let version = border.header.version.word() & !VERSION_LOCKED_BIT;
                    border.header.version.unlock();
                    return Valid(WriteTarget::Missing {
                        page: target.ptr,
                        version,
                        gap,
                    });
                }
            }
        }
    }

    pub(crate) fn delete_record_internal(&self, session: &mut Session, key: &[u8]) -> Result<()> {
        for _ in 0..session.retry_limit() {
            match verify_continue!(self.try_lock_record(key)) {
                WriteTarget::Record { page, slot } => {
                    // SAFETY: page locked by try_lock_record.
                    let border = unsafe { self.border_mut_of(page) };
                    let owner = border.owner(slot);
                    let snap = owner.lock();
                    if snap.is_deleted() {
                        owner.unlock_restore(snap);
                        border.header.version.unlock();
                        session.record_read(ReadSetEntry {
                            page,
                            slot,
                            owner: snap,
                        });
                        return Err(Error::KeyNotFound);
                    }
                    owner.unlock(true);
                    Self::record_write(session, page, slot, WriteKind::Delete, &[]);
                    border.header.version.unlock();
                    return Ok(());
                }
                WriteTarget::Missing { page, version, gap } => {
                    session.record_range_lock(crate::trx::RangeLockEntry {
                        page,
                        low_slice: gap.0,
                        high_slice: gap.1,
                        version,
                    });
                    return Err(Error::KeyNotFound);
                }
            }
        }
        Err(Error::RaceAborted)
    }

    pub(crate) fn overwrite_record_internal(
        &self,
        session: &mut Session,
        key: &[u8],
        payload: &[u8],
        payload_offset: usize,
    ) -> Result<()> {
        for _ in 0..session.retry_limit() {
            match verify_continue!(self.try_lock_record(key)) {
                WriteTarget::Record { page, slot } => {
                    let border = unsafe { self.border_mut_of(page) };
                    let snap = border.owner(slot).lock();
                    if snap.is_deleted() {
                        border.owner(slot).unlock_restore(snap);
                        border.header.version.unlock();
                        session.record_read(ReadSetEntry {
                            page,
                            slot,
                            owner: snap,
                        });
                        return Err(Error::KeyNotFound);
                    }
                    if payload_offset + payload.len() > border.payload_len(slot) {
                        border.owner(slot).unlock_restore(snap);
                        border.header.version.unlock();
                        return Err(Error::ShortPayload);
                    }
                    border.payload_mut(slot)[payload_offset..payload_offset + payload.len()]
                        .copy_from_slice(payload);
                    border.owner(slot).unlock(false);
                    Self::record_write(session, page, slot, WriteKind::Overwrite, payload);
                    border.header.version.unlock();
                    return Ok(());
                }
                WriteTarget::Missing { page, version, gap } => {
                    session.record_range_lock(crate::trx::RangeLockEntry {
                        page,
                        low_slice: gap.0,
                        high_slice: gap.1,
                        version,
                    });
                    return Err(Error::KeyNotFound);
                }
            }
        }
        Err(Error::RaceAborted)
    }

    pub(crate) fn increment_record_internal<T>(
        &self,
        session: &mut Session,
        key: &[u8],
        value: &mut T,
        payload_offset: usize,
    ) -> Result<()>
    where
        T: bytemuck::Pod + std::ops::Add<Output = T>,
    {
        for _ in 0..session.retry_limit() {
            match verify_continue!(self.try_lock_record(key)) {
                WriteTarget::Record { page, slot } => {
                    let border = unsafe { self.border_mut_of(page) };
                    let snap = border.owner(slot).lock();
                    if snap.is_deleted() {
                        border.owner(slot).unlock_restore(snap);
                        border.header.version.unlock();
                        session.record_read(ReadSetEntry {
                            page,
                            slot,
                            owner: snap,
                        });
                        return Err(Error::KeyNotFound);
                    }
                    let size = std::mem::size_of::<T>();
                    if payload_offset + size > border.payload_len(slot) {
                        border.owner(slot).unlock_restore(snap);
                        border.header.version.unlock();
                        return Err(Error::ShortPayload);
                    }
                    let range = payload_offset..payload_offset + size;
                    let current: T =
                        bytemuck::pod_read_unaligned(&border.payload(slot)[range.clone()]);
                    let total = current + *value;
                    border.payload_mut(slot)[range].copy_from_slice(bytemuck::bytes_of(&total));
                    border.owner(slot).unlock(false);
                    Self::record_write(
                        session,
                        page,
                        slot,
                        WriteKind::Increment,
                        bytemuck::bytes_of(&total),
                    );
                    border.header.version.unlock();
                    *value = total;
                    return Ok(());
                }
                WriteTarget::Missing { page, version, gap } => {
                    session.record_range_lock(crate::trx::RangeLockEntry {
                        page,
                        low_slice: gap.0,
                        high_slice: gap.1,
                        version,
                    });
                    return Err(Error::KeyNotFound);
                }
            }
        }
        Err(Error::RaceAborted)
    }
}
