use crate::buffer::page::{BufferPage, PagePtr, PAGE_SIZE};
use crate::index::key::KeySlice;
use crate::index::page::{prefetch_cachelines, DualPagePointer, PageHeader, PageKind, StorageId};
use crate::index::version::PageVersion;
use std::mem;

/// Top-level separators partitioning the page into mini-pages.
pub const MAX_SEPARATORS: usize = 9;
/// Separators inside one mini-page.
pub const MAX_MINI_SEPARATORS: usize = 15;

const _: () = assert!(mem::size_of::<MiniPage>() == 384);
const _: () = assert!(mem::size_of::<IntermediatePage>() == PAGE_SIZE);

/// One of the up-to-10 mini-pages of an intermediate page. Mini-pages
/// carry their own version word so localized child installs only lock
/// one sixteenth of the fan-out.
#[repr(C)]
pub struct MiniPage {
    pub mini_version: PageVersion,
    separators: [KeySlice; MAX_MINI_SEPARATORS],
    pointers: [DualPagePointer; MAX_MINI_SEPARATORS + 1],
}

impl MiniPage {
    #[inline]
    pub fn key_count(&self) -> usize {
        self.mini_version.key_count()
    }

    /// Navigate a searching slice to one of the pointers in this
    /// mini-page. `count` comes from a stable mini version snapshot.
    #[inline]
    pub fn find_pointer(&self, count: usize, slice: KeySlice) -> usize {
        debug_assert!(count <= MAX_MINI_SEPARATORS);
        for i in 0..count {
            if slice < self.separators[i] {
                return i;
            }
        }
        count
    }

    #[inline]
    pub fn separator(&self, idx: usize) -> KeySlice {
        self.separators[idx]
    }

    #[inline]
    pub fn pointer(&self, idx: usize) -> &DualPagePointer {
        &self.pointers[idx]
    }

    /// Insert a separator at `pos` with its right-hand pointer at
    /// `pos + 1`. Caller holds the mini-page lock with inserting set
    /// (or exclusively owns an invisible page).
    #[inline]
    pub fn insert(&mut self, pos: usize, separator: KeySlice, right: PagePtr) {
        let count = self.key_count();
        debug_assert!(count < MAX_MINI_SEPARATORS);
        debug_assert!(pos <= count);
        self.separators.copy_within(pos..count, pos + 1);
        for i in (pos + 1..count + 1).rev() {
            self.pointers[i + 1].copy_from(&self.pointers[i]);
        }
        self.separators[pos] = separator;
        self.pointers[pos + 1] = DualPagePointer::null();
        self.pointers[pos + 1].set_volatile(right);
        self.mini_version.set_key_count(count + 1);
    }

    /// Copy full contents from another mini-page. Only valid under the
    /// enclosing page lock or on an invisible page.
    #[inline]
    fn copy_from(&mut self, src: &MiniPage) {
        let count = src.key_count();
        self.separators = src.separators;
        for i in 0..MAX_MINI_SEPARATORS + 1 {
            self.pointers[i].copy_from(&src.pointers[i]);
        }
        self.mini_version = PageVersion::new();
        self.mini_version.set_key_count(count);
    }

    /// Rebuild from a slice range of another mini-page.
    #[inline]
    fn copy_range_from(&mut self, src: &MiniPage, sep_from: usize, sep_to: usize) {
        let count = sep_to - sep_from;
        for i in 0..count {
            self.separators[i] = src.separators[sep_from + i];
        }
        for i in 0..count + 1 {
            self.pointers[i].copy_from(&src.pointers[sep_from + i]);
        }
        self.mini_version = PageVersion::new();
        self.mini_version.set_key_count(count);
    }

    /// Prefetch version and separators.
    #[inline]
    pub fn prefetch(&self) {
        prefetch_cachelines(self as *const _ as *const u8, 2);
    }
}

/// Intermediate page: two-level fan-out of up to 9 top separators over
/// 10 mini-pages of up to 15 separators and 16 child pointers each.
///
/// Iff `separators[i-1] <= slice < separators[i]`, the search goes to
/// `mini_pages[i]`; below `separators[0]` to `mini_pages[0]`, at or
/// above the last separator to `mini_pages[key_count]`.
#[repr(C)]
pub struct IntermediatePage {
    pub header: PageHeader,
    separators: [KeySlice; MAX_SEPARATORS],
    _reserved: [u8; 120],
    mini_pages: [MiniPage; MAX_SEPARATORS + 1],
}

impl BufferPage for IntermediatePage {}

impl IntermediatePage {
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
            PageKind::Intermediate,
            layer,
            low_fence,
            high_fence,
            in_layer_parent,
            is_root,
        );
    }

    /// Build a fresh root over a just-split pair of children. The page
    /// is invisible until its pointer is installed by CAS.
    #[inline]
    pub fn init_as_new_root(
        &mut self,
        storage_id: StorageId,
        page_id: PagePtr,
        layer: usize,
        low_fence: KeySlice,
        high_fence: KeySlice,
        split_slice: KeySlice,
        left: PagePtr,
        right: PagePtr,
    ) {
        self.init(storage_id, page_id, layer, low_fence, high_fence, 0, true);
        let mini = &mut self.mini_pages[0];
        mini.separators[0] = split_slice;
        mini.pointers[0].set_volatile(left);
        mini.pointers[1].set_volatile(right);
        mini.mini_version.set_key_count(1);
    }

    #[inline]
    pub fn key_count(&self) -> usize {
        self.header.version.key_count()
    }

    /// Navigate a searching slice to one of the mini-pages. `count`
    /// comes from a stable page version snapshot.
    #[inline]
    pub fn find_minipage(&self, count: usize, slice: KeySlice) -> usize {
        debug_assert!(count <= MAX_SEPARATORS);
        for i in 0..count {
            if slice < self.separators[i] {
                return i;
            }
        }
        count
    }

    #[inline]
    pub fn separator(&self, idx: usize) -> KeySlice {
        self.separators[idx]
    }

    #[inline]
    pub fn mini_page(&self, idx: usize) -> &MiniPage {
        debug_assert!(idx <= MAX_SEPARATORS);
        &self.mini_pages[idx]
    }

    #[inline]
    pub fn mini_page_mut(&mut self, idx: usize) -> &mut MiniPage {
        debug_assert!(idx <= MAX_SEPARATORS);
        &mut self.mini_pages[idx]
    }

    /// Whether the mini-page holding `slice` can take one more
    /// separator without restructuring.
    #[inline]
    pub fn can_insert_locally(&self, slice: KeySlice) -> bool {
        let mini = self.mini_page(self.find_minipage(self.key_count(), slice));
        mini.key_count() < MAX_MINI_SEPARATORS
    }

    /// Whether a full mini-page can be split inside this page.
    #[inline]
    pub fn can_split_minipage(&self) -> bool {
        self.key_count() < MAX_SEPARATORS
    }

    /// Split the given full mini-page in two, promoting its median
    /// separator to the top level. Caller holds the page lock with
    /// inserting set.
    #[inline]
    pub fn split_minipage(&mut self, mini_idx: usize) {
        debug_assert!(self.header.version.is_locked());
        let top_count = self.key_count();
        debug_assert!(top_count < MAX_SEPARATORS);
        debug_assert_eq!(self.mini_pages[mini_idx].key_count(), MAX_MINI_SEPARATORS);

        // make room for the new mini-page right of the full one.
        for i in (mini_idx + 1..top_count + 1).rev() {
            // split mini borrow: source and destination are distinct.
            let (left, right) = self.mini_pages.split_at_mut(i + 1);
            right[0].copy_from(&left[i]);
        }

        let mid = MAX_MINI_SEPARATORS / 2;
        let promoted = self.mini_pages[mini_idx].separator(mid);
        {
            let (left, right) = self.mini_pages.split_at_mut(mini_idx + 1);
            let src = &left[mini_idx];
            right[0].copy_range_from(src, mid + 1, MAX_MINI_SEPARATORS);
        }
        // truncate the left half in place.
        self.mini_pages[mini_idx].mini_version.set_key_count(mid);

        self.separators.copy_within(mini_idx..top_count, mini_idx + 1);
        self.separators[mini_idx] = promoted;
        self.header.version.set_key_count(top_count + 1);
    }

    /// Move the upper half of mini-pages into the foster child and
    /// return the promoted separator. Caller holds this page's lock
    /// with splitting set; the foster page is invisible, initialized,
    /// and gets its fences assigned here.
    #[inline]
    pub fn split_into(&mut self, foster: &mut IntermediatePage) -> KeySlice {
        debug_assert!(self.header.version.is_locked());
        let top_count = self.key_count();
        debug_assert!(top_count >= 2);
        let mid = top_count / 2;
        let split_slice = self.separators[mid];
        foster.header.low_fence = split_slice;
        foster.header.high_fence = self.header.high_fence;

        let foster_seps = top_count - mid - 1;
        for i in 0..foster_seps {
            foster.separators[i] = self.separators[mid + 1 + i];
        }
        for i in 0..foster_seps + 1 {
            foster.mini_pages[i].copy_from(&self.mini_pages[mid + 1 + i]);
        }
        foster.header.version.set_key_count(foster_seps);

        self.header.high_fence = split_slice;
        self.header.version.set_key_count(mid);
        split_slice
    }

    /// Iterate every child pointer in order.
    #[inline]
    pub fn for_each_child(&self, mut f: impl FnMut(PagePtr)) {
        let top_count = self.key_count();
        for m in 0..top_count + 1 {
            let mini = &self.mini_pages[m];
            let count = mini.key_count();
            for p in 0..count + 1 {
                f(mini.pointer(p).read());
            }
        }
    }

    /// Prefetch header, top separators and the first mini-page.
    #[inline]
    pub fn prefetch(&self) {
        prefetch_cachelines(self as *const _ as *const u8, 3);
    }

    /// Debug invariant walk of one page. Panics on corruption.
    pub fn verify(&self) {
        let top_count = self.key_count();
        assert!(top_count <= MAX_SEPARATORS);
        for i in 0..top_count {
            assert!(self.header.within_fences(self.separators[i]), "separator out of fences");
            if i > 0 {
                assert!(self.separators[i - 1] < self.separators[i], "separators out of order");
            }
        }
        for m in 0..top_count + 1 {
            let mini = &self.mini_pages[m];
            let count = mini.key_count();
            assert!(count <= MAX_MINI_SEPARATORS);
            for i in 0..count {
                if i > 0 {
                    assert!(mini.separators[i - 1] < mini.separators[i], "mini separators out of order");
                }
                if m > 0 {
                    assert!(mini.separators[i] >= self.separators[m - 1]);
                }
                if m < top_count {
                    assert!(mini.separators[i] < self.separators[m]);
                }
            }
            for p in 0..count + 1 {
                assert!(!mini.pointer(p).is_null(), "null child pointer");
            }
        }
    }
}
