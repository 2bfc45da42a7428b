//! Structural modification operations: slot reservation on full pages,
//! border and intermediate splits, root growth, and next-layer
//! promotion.
//!
//! Lock discipline: a writer never acquires a parent lock while holding
//! a child lock. Split paths therefore release the child, lock the
//! parent, re-lock the child, and re-validate that the split is still
//! needed. Record locks are only taken under the owning page's lock.

use crate::buffer::page::{PagePtr, INVALID_PAGE_PTR};
use crate::error::Validation::{Invalid, Valid};
use crate::error::{Error, Result, Validation};
use crate::index::border::{BorderPage, FindKeyResult};
use crate::index::intermediate::IntermediatePage;
use crate::index::key::{
    fits_in_slot, remaining_at_layer, slice_at_layer, suffix_at_layer, KeySlice, INFIMUM_SLICE,
    SLICE_LEN, SUPREMUM_SLICE,
};
use crate::index::page::{DualPagePointer, PageKind};
use crate::index::storage::MasstreeStorage;
use crate::session::Session;
use crate::trx::WriteKind;

impl MasstreeStorage {
    pub(crate) fn insert_record_internal(
        &self,
        session: &mut Session,
        key: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        'retry: for _ in 0..session.retry_limit() {
            let mut layer = 0usize;
            let mut root = self.root_pointer().read();
            loop {
                let slice = slice_at_layer(key, layer);
                let remaining = remaining_at_layer(key, layer);
                let suffix = suffix_at_layer(key, layer);
                let target = match self.try_descend_to_border(root, slice) {
                    Valid(t) => t,
                    Invalid => continue 'retry,
                };
                // SAFETY: mutated only under the lock taken right below.
                let border = unsafe { self.border_mut_of(target.ptr) };
                border.header.version.lock();
                if border.header.version.is_deleted() || !border.header.within_fences(slice) {
                    border.header.version.unlock();
                    continue 'retry;
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
                        let res = self.insert_over_existing(session, target.ptr, idx, payload);
                        border.header.version.unlock();
                        return res;
                    }
                    FindKeyResult::Conflict(idx) => {
                        // two long keys share the slice: push the
                        // resident record down one layer.
                        let next = match self.create_next_layer(target.ptr, idx, layer) {
                            Ok(next) => next,
                            Err(e) => {
                                border.header.version.unlock();
                                return Err(e);
                            }
                        };
                        border.header.version.unlock();
                        layer += 1;
                        root = next;
                    }
                    FindKeyResult::NotFound { insert_at } => {
                        if !fits_in_slot(remaining) {
                            // remaining length cannot live in a slot;
                            // eagerly open the next layer and descend.
                            if border.can_accommodate(count, SLICE_LEN + 1, 15) {
                                let next = match self.reserve_empty_next_layer(
                                    target.ptr,
                                    insert_at,
                                    slice,
                                    layer,
                                ) {
                                    Ok(next) => next,
                                    Err(e) => {
                                        border.header.version.unlock();
                                        return Err(e);
                                    }
                                };
                                border.header.version.unlock();
                                layer += 1;
                                root = next;
                                continue;
                            }
                        } else if border.can_accommodate(count, remaining, payload.len()) {
                            let seq = self.next_owner_seq();
                            border.header.version.set_inserting();
                            border.reserve_record(
                                insert_at,
                                slice,
                                remaining,
                                suffix,
                                payload.len(),
                                seq,
                            );
                            border.payload_mut(insert_at).copy_from_slice(payload);
                            border.owner(insert_at).unlock(false);
                            Self::record_write(
                                session,
                                target.ptr,
                                insert_at,
                                WriteKind::Insert,
                                payload,
                            );
                            border.header.version.unlock();
                            return Ok(());
                        }
                        // no room: split this page and retry.
                        border.header.version.unlock();
                        self.split_page(target.ptr, layer, slice, key)?;
                        continue 'retry;
                    }
                }
            }
        }
        Err(Error::RaceAborted)
    }

    /// Insert onto an existing slot: conflict if the record is live,
    /// revive in place if it is logically deleted and the new payload
    /// fits its heap allocation. Caller holds the page lock.
    fn insert_over_existing(
        &self,
        session: &mut Session,
        page: PagePtr,
        idx: usize,
        payload: &[u8],
    ) -> Result<()> {
        let border = unsafe { self.border_mut_of(page) };
        let snap = border.owner(idx).stable();
        if !snap.is_deleted() {
            session.record_read(crate::trx::ReadSetEntry {
                page,
                slot: idx,
                owner: snap,
            });
            return Err(Error::KeyAlreadyExists);
        }
        if payload.len() > border.payload_capacity(idx) {
            // dead record too small to revive in place; physical
            // compaction is the snapshot layer's job.
            return Err(Error::OutOfPageMemory);
        }
        let _ = border.owner(idx).lock();
        border.set_payload_len(idx, payload.len());
        border.payload_mut(idx).copy_from_slice(payload);
        border.owner(idx).unlock(false);
        Self::record_write(session, page, idx, WriteKind::Insert, payload);
        Ok(())
    }

    /// Promote the conflicting record at `idx` into a fresh next-layer
    /// root and morph the slot into a layer pointer. Caller holds the
    /// page lock; returns the new layer's root.
    fn create_next_layer(&self, page: PagePtr, idx: usize, layer: usize) -> Result<PagePtr> {
        let border = unsafe { self.border_mut_of(page) };
        debug_assert!(border.header.version.is_locked());
        let new_ptr = self.pool().allocate(self.config().node_hint)?;
        // SAFETY: fresh zeroed frame, invisible until the slot morphs.
        let new_root = unsafe { &mut *(self.resolve(new_ptr) as *mut BorderPage) };
        new_root.init(
            self.id(),
            new_ptr,
            layer + 1,
            INFIMUM_SLICE,
            SUPREMUM_SLICE,
            INVALID_PAGE_PTR,
            true,
        );

        let snap = border.owner(idx).lock();
        new_root.copy_initial_record(border, idx, snap.0);

        let dual = DualPagePointer::null();
        dual.set_volatile(new_ptr);
        border.set_next_layer(idx, &dual);
        border.owner(idx).set_moved();
        border.owner(idx).unlock(false);
        Ok(new_ptr)
    }

    /// Install an empty next-layer root under `slice`, for keys whose
    /// remaining length cannot be stored in a slot. Caller holds the
    /// page lock and has checked accommodation.
    fn reserve_empty_next_layer(
        &self,
        page: PagePtr,
        insert_at: usize,
        slice: KeySlice,
        layer: usize,
    ) -> Result<PagePtr> {
        let border = unsafe { self.border_mut_of(page) };
        debug_assert!(border.header.version.is_locked());
        let new_ptr = self.pool().allocate(self.config().node_hint)?;
        let new_root = unsafe { &mut *(self.resolve(new_ptr) as *mut BorderPage) };
        new_root.init(
            self.id(),
            new_ptr,
            layer + 1,
            INFIMUM_SLICE,
            SUPREMUM_SLICE,
            INVALID_PAGE_PTR,
            true,
        );
        let dual = DualPagePointer::null();
        dual.set_volatile(new_ptr);
        border.header.version.set_inserting();
        border.reserve_next_layer(insert_at, slice, &dual);
        Ok(new_ptr)
    }

    /// Split the page covering `slice` at the given layer. Benign races
    /// (someone else split first, page no longer full) return Ok; the
    /// caller re-descends either way.
    fn split_page(&self, ptr: PagePtr, layer: usize, slice: KeySlice, key: &[u8]) -> Result<()> {
        let header = unsafe { self.header_of(ptr) };
        if header.version.stable().is_root() {
            self.grow_root(ptr, layer, key)
        } else {
            self.split_nonroot(ptr, layer, slice, key)
        }
    }

    /// Lock the in-layer parent of `child`, following foster links if
    /// an intermediate split relocated the range. Returns the locked
    /// parent, or Invalid if the hint chain failed.
    fn lock_parent_of(&self, child: PagePtr, slice: KeySlice) -> Validation<PagePtr> {
        let child_header = unsafe { self.header_of(child) };
        let mut candidate = child_header.parent();
        for _ in 0..64 {
            if candidate == INVALID_PAGE_PTR {
                return Invalid;
            }
            let parent = unsafe { self.intermediate_of(candidate) };
            parent.header.version.lock();
            if parent.header.version.is_deleted() {
                parent.header.version.unlock();
                return Invalid;
            }
            if parent.header.within_fences(slice) {
                // must actually hold the child pointer for this slice.
                let mini_idx = parent.find_minipage(parent.key_count(), slice);
                let mini = parent.mini_page(mini_idx);
                let ptr_idx = mini.find_pointer(mini.key_count(), slice);
                if mini.pointer(ptr_idx).read() == child {
                    return Valid(candidate);
                }
                parent.header.version.unlock();
                return Invalid;
            }
            let foster = parent.header.foster_child();
            parent.header.version.unlock();
            candidate = foster;
        }
        Invalid
    }

    fn split_nonroot(
        &self,
        child_ptr: PagePtr,
        layer: usize,
        slice: KeySlice,
        key: &[u8],
    ) -> Result<()> {
        let parent_ptr = match self.lock_parent_of(child_ptr, slice) {
            Valid(p) => p,
            // hint chain broken; let the caller re-descend and retry.
            Invalid => return Ok(()),
        };
        let parent = unsafe { self.intermediate_mut_of(parent_ptr) };

        // parent must be able to take one separator before we commit to
        // splitting the child.
        if !parent.can_insert_locally(slice) && !parent.can_split_minipage() {
            parent.header.version.unlock();
            self.split_page(parent_ptr, layer, slice, key)?;
            return Ok(());
        }

        let child_header = unsafe { self.header_of(child_ptr) };
        child_header.version.lock();
        if child_header.version.is_deleted()
            || !child_header.within_fences(slice)
            || child_header.parent() != parent_ptr
        {
            child_header.version.unlock();
            parent.header.version.unlock();
            return Ok(());
        }

        let foster_ptr = match self.pool().allocate(self.config().node_hint) {
            Ok(p) => p,
            Err(e) => {
                child_header.version.unlock();
                parent.header.version.unlock();
                return Err(e);
            }
        };

        child_header.version.set_splitting();
        let split_slice = match child_header.kind() {
            PageKind::Border => {
                let child = unsafe { self.border_mut_of(child_ptr) };
                if child.key_count() < 2 {
                    // someone emptied it meanwhile; nothing to split.
                    child.header.version.unlock();
                    parent.header.version.unlock();
                    unsafe { self.pool().deallocate(foster_ptr) };
                    return Ok(());
                }
                let split_slice = child.choose_split_slice();
                let foster = unsafe { &mut *(self.resolve(foster_ptr) as *mut BorderPage) };
                foster.init(
                    self.id(),
                    foster_ptr,
                    child.header.version.layer(),
                    split_slice,
                    child.header.high_fence,
                    parent_ptr,
                    false,
                );
                child.split_into(foster, split_slice);
                split_slice
            }
            PageKind::Intermediate => {
                let child = unsafe { self.intermediate_mut_of(child_ptr) };
                let foster = unsafe { &mut *(self.resolve(foster_ptr) as *mut IntermediatePage) };
                foster.init(
                    self.id(),
                    foster_ptr,
                    child.header.version.layer(),
                    INFIMUM_SLICE,
                    SUPREMUM_SLICE,
                    parent_ptr,
                    false,
                );
                child.split_into(foster)
            }
        };
        child_header.set_foster_child(foster_ptr);
        child_header.version.set_has_foster();

        self.install_in_parent(parent_ptr, split_slice, foster_ptr);

        child_header.version.unlock();
        parent.header.version.unlock();
        Ok(())
    }

    /// Insert `(split_slice, foster)` into the locked parent, splitting
    /// the target mini-page first if it is full. Caller verified
    /// capacity before the child split started.
    fn install_in_parent(&self, parent_ptr: PagePtr, split_slice: KeySlice, foster: PagePtr) {
        let parent = unsafe { self.intermediate_mut_of(parent_ptr) };
        debug_assert!(parent.header.version.is_locked());
        let mut mini_idx = parent.find_minipage(parent.key_count(), split_slice);
        if parent.mini_page(mini_idx).key_count() == crate::index::intermediate::MAX_MINI_SEPARATORS
        {
            parent.header.version.set_inserting();
            parent.split_minipage(mini_idx);
            mini_idx = parent.find_minipage(parent.key_count(), split_slice);
        }
        let mini = parent.mini_page_mut(mini_idx);
        let pos = mini.find_pointer(mini.key_count(), split_slice);
        let _ = mini.mini_version.lock();
        mini.mini_version.set_inserting();
        mini.insert(pos, split_slice, foster);
        mini.mini_version.unlock();
    }

    /// Replace a full layer root: split it and install a fresh
    /// intermediate root over the two halves. For layer 0 the storage
    /// root pointer is CASed; for deeper layers the next-layer pointer
    /// in the previous layer's border page is rewritten under that
    /// page's lock.
    fn grow_root(&self, root_ptr: PagePtr, layer: usize, key: &[u8]) -> Result<()> {
        if layer == 0 {
            return self.grow_root_locked(root_ptr, None);
        }
        // re-locate the border slot holding this layer's root pointer.
        let parent_layer = layer - 1;
        let slice = slice_at_layer(key, parent_layer);
        let remaining = remaining_at_layer(key, parent_layer);
        let suffix = suffix_at_layer(key, parent_layer);
        'retry: for _ in 0..self.config().optimistic_retry_limit {
            let mut root = self.root_pointer().read();
            // walk down to the border page of the previous layer.
            for l in 0..parent_layer {
                let s = slice_at_layer(key, l);
                let target = match self.try_descend_to_border(root, s) {
                    Valid(t) => t,
                    Invalid => continue 'retry,
                };
                let border = unsafe { self.border_of(target.ptr) };
                let count = target.stable.key_count();
                match border.find_key(count, s, remaining_at_layer(key, l), suffix_at_layer(key, l))
                {
                    Some(idx) if border.points_to_next_layer(idx) => {
                        let next = border.next_layer(idx).read();
                        if !border.header.version.validate(target.stable) {
                            continue 'retry;
                        }
                        root = next;
                    }
                    _ => continue 'retry,
                }
            }
            let target = match self.try_descend_to_border(root, slice) {
                Valid(t) => t,
                Invalid => continue 'retry,
            };
            let border = unsafe { self.border_mut_of(target.ptr) };
            border.header.version.lock();
            if border.header.version.is_deleted() || !border.header.within_fences(slice) {
                border.header.version.unlock();
                continue 'retry;
            }
            let count = border.key_count();
            let idx = match border.find_key_for_reserve(count, slice, remaining, suffix) {
                FindKeyResult::NextLayer(idx) => idx,
                _ => {
                    border.header.version.unlock();
                    continue 'retry;
                }
            };
            if border.next_layer(idx).read() != root_ptr {
                // the layer root was already replaced.
                border.header.version.unlock();
                return Ok(());
            }
            let res = self.grow_root_locked(root_ptr, Some((target.ptr, idx)));
            border.header.version.unlock();
            return res;
        }
        Err(Error::RaceAborted)
    }

    /// Split the locked-down root page and swing the root pointer. If
    /// `parent_slot` is given the pointer lives in a border slot of the
    /// previous layer (whose page the caller holds locked); otherwise
    /// it is the storage root.
    fn grow_root_locked(
        &self,
        root_ptr: PagePtr,
        parent_slot: Option<(PagePtr, usize)>,
    ) -> Result<()> {
        let header = unsafe { self.header_of(root_ptr) };
        header.version.lock();
        if header.version.is_deleted() || !header.version.is_root() {
            header.version.unlock();
            return Ok(());
        }
        let layer = header.version.layer();

        let foster_ptr = match self.pool().allocate(self.config().node_hint) {
            Ok(p) => p,
            Err(e) => {
                header.version.unlock();
                return Err(e);
            }
        };
        let new_root_ptr = match self.pool().allocate(self.config().node_hint) {
            Ok(p) => p,
            Err(e) => {
                unsafe { self.pool().deallocate(foster_ptr) };
                header.version.unlock();
                return Err(e);
            }
        };

        header.version.set_splitting();
        let split_slice = match header.kind() {
            PageKind::Border => {
                let child = unsafe { self.border_mut_of(root_ptr) };
                if child.key_count() < 2 {
                    child.header.version.unlock();
                    unsafe {
                        self.pool().deallocate(foster_ptr);
                        self.pool().deallocate(new_root_ptr);
                    }
                    return Ok(());
                }
                let split_slice = child.choose_split_slice();
                let foster = unsafe { &mut *(self.resolve(foster_ptr) as *mut BorderPage) };
                foster.init(
                    self.id(),
                    foster_ptr,
                    layer,
                    split_slice,
                    child.header.high_fence,
                    new_root_ptr,
                    false,
                );
                child.split_into(foster, split_slice);
                split_slice
            }
            PageKind::Intermediate => {
                let child = unsafe { self.intermediate_mut_of(root_ptr) };
                let foster = unsafe { &mut *(self.resolve(foster_ptr) as *mut IntermediatePage) };
                foster.init(
                    self.id(),
                    foster_ptr,
                    layer,
                    INFIMUM_SLICE,
                    SUPREMUM_SLICE,
                    new_root_ptr,
                    false,
                );
                child.split_into(foster)
            }
        };
        header.set_foster_child(foster_ptr);
        header.version.set_has_foster();

        // SAFETY: fresh zeroed frame, invisible until the CAS below.
        let new_root = unsafe { &mut *(self.resolve(new_root_ptr) as *mut IntermediatePage) };
        new_root.init_as_new_root(
            self.id(),
            new_root_ptr,
            layer,
            INFIMUM_SLICE,
            SUPREMUM_SLICE,
            split_slice,
            root_ptr,
            foster_ptr,
        );
        header.set_parent(new_root_ptr);
        header.version.clear_is_root();

        match parent_slot {
            None => {
                let swung = self.root_pointer().cas_volatile(root_ptr, new_root_ptr);
                debug_assert!(swung, "root CAS lost while holding the root lock");
            }
            Some((border_ptr, idx)) => {
                let border = unsafe { self.border_of(border_ptr) };
                debug_assert!(border.header.version.is_locked());
                border.next_layer(idx).set_volatile(new_root_ptr);
            }
        }
        header.version.unlock();
        Ok(())
    }
}
