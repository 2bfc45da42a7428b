use crate::buffer::page::{BufferPage, PagePtr, PAGE_SIZE};
use crate::index::key::{KeySlice, KEY_LENGTH_MAX, KEY_LENGTH_NEXT_LAYER, SLICE_LEN};
use crate::index::page::{prefetch_cachelines, DualPagePointer, PageHeader, PageKind, StorageId};
use crate::trx::OwnerId;
use std::mem;

pub const BORDER_MAX_KEYS: usize = 64;
pub const BORDER_HEADER_SIZE: usize = 1344;
pub const BORDER_DATA_SIZE: usize = PAGE_SIZE - BORDER_HEADER_SIZE;

const _: () = assert!(mem::size_of::<BorderPage>() == PAGE_SIZE);
const _: () = assert!(BORDER_HEADER_SIZE % 16 == 0);

/// Border (leaf) page.
///
/// Memory layout as below:
///
/// ```text
/// ┌───────────────────────────┐
/// │ common header(64)         │
/// ├───────────────────────────┤
/// │ remaining_key_len(64)     │
/// ├───────────────────────────┤
/// │ slices(512)               │
/// ├───────────────────────────┤
/// │ offsets(64)               │
/// ├───────────────────────────┤
/// │ payload_len(128)          │
/// ├───────────────────────────┤
/// │ owner_ids(512)            │
/// ├───────────────────────────┤ 1344
/// │ record heap(2752)         │
/// │ grows from the tail       │
/// └───────────────────────────┘
/// ```
///
/// Slots `0..key_count` are ordered by `(slice, remaining length)` with
/// every remaining length above the slice size collapsing into one rank,
/// so at most two slots share a slice and the long one sorts last.
/// Records are 16-byte aligned in the heap so a record can be replaced
/// in place by a next-layer dual pointer. Heap space of superseded
/// records is reclaimed only when the page itself is retired.
#[repr(C)]
pub struct BorderPage {
    pub header: PageHeader,
    /// Key length remaining at this layer, including the slice bytes.
    /// `KEY_LENGTH_NEXT_LAYER` marks a next-layer pointer slot.
    remaining_key_len: [u8; BORDER_MAX_KEYS],
    slices: [KeySlice; BORDER_MAX_KEYS],
    /// Record offset in the heap, divided by 16.
    offsets: [u8; BORDER_MAX_KEYS],
    payload_len: [u16; BORDER_MAX_KEYS],
    owner_ids: [OwnerId; BORDER_MAX_KEYS],
    data: [u8; BORDER_DATA_SIZE],
}

impl BufferPage for BorderPage {}

/// Outcome of locating the slot an insert should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindKeyResult {
    /// No slot for this key; a new slot belongs at `insert_at`.
    NotFound { insert_at: usize },
    /// Exact match on a local record.
    Found(usize),
    /// Slot points to the next layer.
    NextLayer(usize),
    /// A local record shares the slice, both keys exceed the slice, and
    /// the suffixes differ: next-layer promotion is required.
    Conflict(usize),
}

#[inline]
fn align16(len: usize) -> usize {
    (len + 15) & !15
}

/// Rank of a remaining length for in-page ordering: lengths within the
/// slice order by value, everything longer (including the next-layer
/// sentinel) shares the top rank since only one such slot may exist per
/// slice.
#[inline]
fn len_rank(len: u8) -> u8 {
    if len as usize > SLICE_LEN {
        SLICE_LEN as u8 + 1
    } else {
        len
    }
}

impl BorderPage {
    #[inline]
    pub fn init(
        &mut self,
        storage_id: StorageId,
        page_id: PagePtr,
        layer: usize,
        low_fence: KeySlice,
        high_fence: KeySlice,
        in_layer_parent: PagePtr,
        is_root: bool,
    ) {
        self.header.init(
            storage_id,
            page_id,
            PageKind::Border,
            layer,
            low_fence,
            high_fence,
            in_layer_parent,
            is_root,
        );
    }

    #[inline]
    pub fn key_count(&self) -> usize {
        self.header.version.key_count()
    }

    #[inline]
    pub fn slice(&self, idx: usize) -> KeySlice {
        debug_assert!(idx < BORDER_MAX_KEYS);
        self.slices[idx]
    }

    #[inline]
    pub fn remaining_key_len(&self, idx: usize) -> usize {
        self.remaining_key_len[idx] as usize
    }

    #[inline]
    pub fn payload_len(&self, idx: usize) -> usize {
        self.payload_len[idx] as usize
    }

    #[inline]
    pub fn points_to_next_layer(&self, idx: usize) -> bool {
        self.remaining_key_len[idx] == KEY_LENGTH_NEXT_LAYER
    }

    #[inline]
    pub fn owner(&self, idx: usize) -> &OwnerId {
        &self.owner_ids[idx]
    }

    #[inline]
    pub fn suffix_len(&self, idx: usize) -> usize {
        debug_assert!(!self.points_to_next_layer(idx));
        (self.remaining_key_len[idx] as usize).saturating_sub(SLICE_LEN)
    }

    #[inline]
    fn record_offset(&self, idx: usize) -> usize {
        debug_assert!(((self.offsets[idx] as usize) << 4) < BORDER_DATA_SIZE);
        (self.offsets[idx] as usize) << 4
    }

    /// Key suffix stored ahead of the payload.
    #[inline]
    pub fn suffix(&self, idx: usize) -> &[u8] {
        let off = self.record_offset(idx);
        &self.data[off..off + self.suffix_len(idx)]
    }

    #[inline]
    pub fn payload(&self, idx: usize) -> &[u8] {
        let off = self.record_offset(idx) + self.suffix_len(idx);
        &self.data[off..off + self.payload_len[idx] as usize]
    }

    #[inline]
    pub fn payload_mut(&mut self, idx: usize) -> &mut [u8] {
        let off = self.record_offset(idx) + self.suffix_len(idx);
        let len = self.payload_len[idx] as usize;
        &mut self.data[off..off + len]
    }

    /// Next-layer root pointer stored in place of the record.
    #[inline]
    pub fn next_layer(&self, idx: usize) -> &DualPagePointer {
        debug_assert!(self.points_to_next_layer(idx));
        let off = self.record_offset(idx);
        debug_assert!(off % 16 == 0);
        // SAFETY: records are 16-byte aligned in a page-aligned frame and
        // next-layer slots are reserved with at least 16 bytes.
        unsafe { &*(self.data.as_ptr().add(off) as *const DualPagePointer) }
    }

    /// Payload capacity of the record's heap allocation.
    #[inline]
    pub fn payload_capacity(&self, idx: usize) -> usize {
        align16(self.suffix_len(idx) + self.payload_len[idx] as usize) - self.suffix_len(idx)
    }

    /// Shrink or grow the live payload within the record's allocation.
    #[inline]
    pub fn set_payload_len(&mut self, idx: usize, len: usize) {
        debug_assert!(len <= self.payload_capacity(idx));
        self.payload_len[idx] = len as u16;
    }

    #[inline]
    fn record_size(remaining: usize, payload_count: usize) -> usize {
        let suffix_len = remaining.saturating_sub(SLICE_LEN);
        align16(suffix_len + payload_count)
    }

    /// Lowest heap offset currently allocated, in bytes.
    #[inline]
    fn heap_watermark(&self, count: usize) -> usize {
        let mut min = BORDER_DATA_SIZE;
        for i in 0..count {
            let off = (self.offsets[i] as usize) << 4;
            if off < min {
                min = off;
            }
        }
        min
    }

    /// Whether one more record of the given shape fits.
    #[inline]
    pub fn can_accommodate(&self, count: usize, remaining: usize, payload_count: usize) -> bool {
        if count >= BORDER_MAX_KEYS {
            return false;
        }
        Self::record_size(remaining, payload_count) <= self.heap_watermark(count)
    }

    /// First slot index whose `(slice, rank)` is not below the probe.
    /// Rank 0 positions before every slot of the slice; a rank above
    /// the next-layer rank positions after all of them.
    #[inline]
    pub fn lower_bound_rank(&self, count: usize, slice: KeySlice, rank: u8) -> usize {
        self.lower_bound(count, slice, rank)
    }

    #[inline]
    fn lower_bound(&self, count: usize, slice: KeySlice, rank: u8) -> usize {
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let key = (self.slices[mid], len_rank(self.remaining_key_len[mid]));
            if key < (slice, rank) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Locate a key for the read path. `count` comes from a stable
    /// version snapshot; the result must be validated against it.
    #[inline]
    pub fn find_key(
        &self,
        count: usize,
        slice: KeySlice,
        remaining: usize,
        suffix: &[u8],
    ) -> Option<usize> {
        self.prefetch_additional_if_needed(count);
        let mut i = self.lower_bound(count, slice, 0);
        while i < count && self.slices[i] == slice {
            let len = self.remaining_key_len[i] as usize;
            if remaining <= SLICE_LEN {
                if len == remaining {
                    return Some(i);
                }
            } else {
                if self.points_to_next_layer(i) {
                    return Some(i);
                }
                if len > SLICE_LEN {
                    if len == remaining && self.suffix(i) == suffix {
                        return Some(i);
                    }
                    // the only long slot for this slice did not match.
                    return None;
                }
            }
            i += 1;
        }
        None
    }

    /// Specialized search for 8-byte normalized keys, which never reach
    /// a second layer.
    #[inline]
    pub fn find_key_normalized(&self, count: usize, slice: KeySlice) -> Option<usize> {
        let mut i = self.lower_bound(count, slice, 0);
        while i < count && self.slices[i] == slice {
            if self.remaining_key_len[i] as usize == SLICE_LEN {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// Locate the slot an insert should use. Caller holds the page lock.
    #[inline]
    pub fn find_key_for_reserve(
        &self,
        count: usize,
        slice: KeySlice,
        remaining: usize,
        suffix: &[u8],
    ) -> FindKeyResult {
        let mut i = self.lower_bound(count, slice, 0);
        while i < count && self.slices[i] == slice {
            let len = self.remaining_key_len[i] as usize;
            if remaining <= SLICE_LEN {
                if len == remaining {
                    return FindKeyResult::Found(i);
                }
            } else {
                if self.points_to_next_layer(i) {
                    return FindKeyResult::NextLayer(i);
                }
                if len > SLICE_LEN {
                    if len == remaining && self.suffix(i) == suffix {
                        return FindKeyResult::Found(i);
                    }
                    return FindKeyResult::Conflict(i);
                }
            }
            i += 1;
        }
        let rank = if remaining > SLICE_LEN {
            SLICE_LEN as u8 + 1
        } else {
            remaining as u8
        };
        FindKeyResult::NotFound {
            insert_at: self.lower_bound(count, slice, rank),
        }
    }

    /// The slot whose key is the greatest at or below the probe, for
    /// range-lock evidence on a miss.
    #[inline]
    pub fn gap_around(&self, count: usize, slice: KeySlice) -> (KeySlice, KeySlice) {
        let i = self.lower_bound(count, slice, 0);
        let low = if i == 0 {
            self.header.low_fence
        } else {
            self.slices[i - 1]
        };
        let high = if i >= count {
            self.header.high_fence
        } else {
            self.slices[i]
        };
        (low, high)
    }

    /// Install a new physical record that does not exist logically yet:
    /// slot metadata, key suffix, and an owner word carrying the locked
    /// and deleted bits. The payload area is sized but not written; the
    /// caller fills it under the record lock and then clears the delete
    /// bit.
    ///
    /// Caller holds the page lock with inserting set.
    #[inline]
    pub fn reserve_record(
        &mut self,
        idx: usize,
        slice: KeySlice,
        remaining: usize,
        suffix: &[u8],
        payload_count: usize,
        owner_seq: u64,
    ) {
        debug_assert!(remaining <= KEY_LENGTH_MAX);
        debug_assert!(self.header.version.is_locked());
        let count = self.key_count();
        debug_assert!(idx <= count);
        debug_assert!(self.can_accommodate(count, remaining, payload_count));
        debug_assert_eq!(suffix.len(), remaining.saturating_sub(SLICE_LEN));

        let record_size = Self::record_size(remaining, payload_count);
        let offset = self.heap_watermark(count) - record_size;

        self.shift_right(idx, count);
        self.slices[idx] = slice;
        self.remaining_key_len[idx] = remaining as u8;
        self.offsets[idx] = (offset >> 4) as u8;
        self.payload_len[idx] = payload_count as u16;
        self.owner_ids[idx].store_initial(OwnerId::initial(owner_seq));
        if !suffix.is_empty() {
            self.data[offset..offset + suffix.len()].copy_from_slice(suffix);
        }
        self.header.version.set_key_count(count + 1);
    }

    /// Install a slot that points to a next-layer root from the start.
    /// Used when a key too long for a local record lands in a gap.
    #[inline]
    pub fn reserve_next_layer(&mut self, idx: usize, slice: KeySlice, root: &DualPagePointer) {
        debug_assert!(self.header.version.is_locked());
        let count = self.key_count();
        debug_assert!(self.can_accommodate(count, SLICE_LEN + 1, 16 - 1));

        let offset = self.heap_watermark(count) - 16;
        self.shift_right(idx, count);
        self.slices[idx] = slice;
        self.remaining_key_len[idx] = KEY_LENGTH_NEXT_LAYER;
        self.offsets[idx] = (offset >> 4) as u8;
        self.payload_len[idx] = 0;
        self.owner_ids[idx].store_initial(0);
        self.next_layer_at(offset).copy_from(root);
        self.header.version.set_key_count(count + 1);
    }

    /// Morph an existing long record into a next-layer pointer. The
    /// record's owner must be locked; a next-layer slot is never turned
    /// back into a record.
    #[inline]
    pub fn set_next_layer(&mut self, idx: usize, root: &DualPagePointer) {
        debug_assert!(self.remaining_key_len[idx] as usize > SLICE_LEN);
        let off = self.record_offset(idx);
        self.remaining_key_len[idx] = KEY_LENGTH_NEXT_LAYER;
        self.payload_len[idx] = 0;
        self.next_layer_at(off).copy_from(root);
    }

    #[inline]
    fn next_layer_at(&mut self, offset: usize) -> &DualPagePointer {
        debug_assert!(offset % 16 == 0 && offset + 16 <= BORDER_DATA_SIZE);
        // SAFETY: 16 aligned, 16 bytes reserved.
        unsafe { &*(self.data.as_ptr().add(offset) as *const DualPagePointer) }
    }

    #[inline]
    fn shift_right(&mut self, idx: usize, count: usize) {
        debug_assert!(count < BORDER_MAX_KEYS);
        self.remaining_key_len.copy_within(idx..count, idx + 1);
        self.slices.copy_within(idx..count, idx + 1);
        self.offsets.copy_within(idx..count, idx + 1);
        self.payload_len.copy_within(idx..count, idx + 1);
        for i in (idx..count).rev() {
            let w = self.owner_ids[i].raw();
            self.owner_ids[i + 1].store_initial(w);
        }
    }

    /// Copy the record at `src_idx` of `src` as the initial record of a
    /// fresh next-layer root, keyed by the next 8 bytes of the original
    /// suffix. `owner_word` is the unlocked owner snapshot taken before
    /// the source record was locked for promotion. This page is still
    /// invisible, so no synchronization is needed.
    #[inline]
    pub fn copy_initial_record(&mut self, src: &BorderPage, src_idx: usize, owner_word: u64) {
        debug_assert_eq!(self.key_count(), 0);
        let src_suffix = src.suffix(src_idx);
        debug_assert!(!src_suffix.is_empty());
        let slice = crate::index::key::slice_from_bytes(
            &src_suffix[..src_suffix.len().min(SLICE_LEN)],
        );
        let remaining = src.remaining_key_len(src_idx) - SLICE_LEN;
        let suffix = if src_suffix.len() > SLICE_LEN {
            &src_suffix[SLICE_LEN..]
        } else {
            &[]
        };
        let payload_count = src.payload_len(src_idx);

        let record_size = Self::record_size(remaining, payload_count);
        let offset = BORDER_DATA_SIZE - record_size;
        self.slices[0] = slice;
        self.remaining_key_len[0] = remaining as u8;
        self.offsets[0] = (offset >> 4) as u8;
        self.payload_len[0] = payload_count as u16;
        self.owner_ids[0].store_initial(owner_word);
        self.data[offset..offset + suffix.len()].copy_from_slice(suffix);
        let payload_off = offset + suffix.len();
        self.data[payload_off..payload_off + payload_count]
            .copy_from_slice(src.payload(src_idx));
        self.header.version.set_key_count(1);
    }

    /// Median split slice on a clean slice boundary: every slot of one
    /// slice stays on one side, and at least one slot remains left.
    #[inline]
    pub fn choose_split_slice(&self) -> KeySlice {
        let count = self.key_count();
        debug_assert!(count >= 2);
        let mut mid = count / 2;
        // walk back to the first slot of the median slice.
        while mid > 0 && self.slices[mid - 1] == self.slices[mid] {
            mid -= 1;
        }
        if mid == 0 {
            // median slice starts at slot 0; split after it instead.
            let first = self.slices[0];
            mid = (0..count)
                .find(|&i| self.slices[i] != first)
                .expect("border page with a single slice cannot fill up");
        }
        self.slices[mid]
    }

    /// Move every slot with `slice >= split_slice` into the foster
    /// child and logically truncate this page. Owner words of moved
    /// records get the moved bit so the transactional layer can forward
    /// its references. Caller holds this page's lock with splitting set;
    /// the foster page is invisible.
    #[inline]
    pub fn split_into(&mut self, foster: &mut BorderPage, split_slice: KeySlice) {
        debug_assert!(self.header.version.is_locked());
        let count = self.key_count();
        let left = self.lower_bound(count, split_slice, 0);
        debug_assert!(left > 0 && left < count);

        for (dst, src_idx) in (left..count).enumerate() {
            foster.append_from(dst, self, src_idx);
            self.owner_ids[src_idx].set_moved();
        }
        foster.header.version.set_key_count(count - left);

        // compact the surviving records so the space freed by the moved
        // half becomes reusable. Moved records' heap data dies here;
        // their owner words already carry the moved bit and relocation
        // goes by key.
        let mut scratch = [0u8; BORDER_DATA_SIZE];
        let mut tail = BORDER_DATA_SIZE;
        for i in 0..left {
            let size = if self.points_to_next_layer(i) {
                16
            } else {
                align16(self.suffix_len(i) + self.payload_len(i))
            };
            let off = self.record_offset(i);
            tail -= size;
            scratch[tail..tail + size].copy_from_slice(&self.data[off..off + size]);
            self.offsets[i] = (tail >> 4) as u8;
        }
        self.data[tail..].copy_from_slice(&scratch[tail..]);

        self.header.high_fence = split_slice;
        self.header.version.set_key_count(left);
    }

    /// Append one slot copied from another border page. Only used to
    /// build invisible pages (foster children), so records pack tightly
    /// from the tail.
    #[inline]
    fn append_from(&mut self, idx: usize, src: &BorderPage, src_idx: usize) {
        self.slices[idx] = src.slices[src_idx];
        self.remaining_key_len[idx] = src.remaining_key_len[src_idx];
        self.payload_len[idx] = src.payload_len[src_idx];
        self.owner_ids[idx].store_initial(src.owner(src_idx).raw());

        let watermark = if idx == 0 {
            BORDER_DATA_SIZE
        } else {
            (self.offsets[idx - 1] as usize) << 4
        };
        if src.points_to_next_layer(src_idx) {
            let offset = watermark - 16;
            self.offsets[idx] = (offset >> 4) as u8;
            self.next_layer_at(offset).copy_from(src.next_layer(src_idx));
        } else {
            let suffix_len = src.suffix_len(src_idx);
            let payload_len = src.payload_len(src_idx);
            let record_size = align16(suffix_len + payload_len);
            let offset = watermark - record_size;
            self.offsets[idx] = (offset >> 4) as u8;
            let src_off = src.record_offset(src_idx);
            self.data[offset..offset + suffix_len + payload_len]
                .copy_from_slice(&src.data[src_off..src_off + suffix_len + payload_len]);
        }
    }

    /// Reconstruct the key bytes of a slot relative to this layer.
    #[inline]
    pub fn key_of(&self, idx: usize, buf: &mut Vec<u8>) {
        let remaining = self.remaining_key_len(idx);
        debug_assert!(remaining != KEY_LENGTH_NEXT_LAYER as usize);
        let slice_bytes = self.slices[idx].to_be_bytes();
        buf.extend_from_slice(&slice_bytes[..remaining.min(SLICE_LEN)]);
        if remaining > SLICE_LEN {
            buf.extend_from_slice(self.suffix(idx));
        }
    }

    /// Prefetch header, length and slice arrays.
    #[inline]
    pub fn prefetch(&self) {
        prefetch_cachelines(self as *const _ as *const u8, 4);
    }

    #[inline]
    pub fn prefetch_additional_if_needed(&self, key_count: usize) {
        if key_count > 16 {
            // first prefetch covered header, lengths, and 16 slices.
            let lines = ((key_count - 16) >> 3) + 1;
            prefetch_cachelines(
                (self as *const _ as *const u8).wrapping_add(256),
                lines.min(48),
            );
        }
    }

    /// Debug invariant walk of one page. Panics on corruption.
    pub fn verify(&self) {
        let count = self.key_count();
        assert!(count <= BORDER_MAX_KEYS);
        for i in 0..count {
            assert!(self.header.within_fences(self.slices[i]), "slice out of fences");
            if i > 0 {
                let prev = (self.slices[i - 1], len_rank(self.remaining_key_len[i - 1]));
                let cur = (self.slices[i], len_rank(self.remaining_key_len[i]));
                assert!(prev < cur, "slots out of order");
            }
        }
    }
}
