use crate::buffer::page::{PagePtr, INVALID_PAGE_PTR, PAGE_SIZE};
use crate::index::key::{KeySlice, SUPREMUM_SLICE};
use crate::index::version::PageVersion;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

pub type StorageId = u32;

/// Page kind is discriminated by a tag byte in the header; pages carry
/// no RTTI and are always reinterpreted from a pooled 4 KiB frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
    Border = 1,
    Intermediate = 2,
}

impl PageKind {
    #[inline]
    pub fn from_u8(value: u8) -> PageKind {
        match value {
            1 => PageKind::Border,
            2 => PageKind::Intermediate,
            _ => unreachable!("invalid page kind"),
        }
    }
}

const _: () = assert!(mem::size_of::<PageHeader>() == 64);

/// Common 64-byte header embedded at the start of both page kinds.
///
/// Fences and layer are immutable after initialization except that a
/// split narrows `high_fence` under the page lock. The parent link is a
/// non-owning hint validated through version words; the pool is the
/// sole owner of pages.
#[repr(C)]
pub struct PageHeader {
    pub version: PageVersion,
    /// This page's own opaque pointer, for installing into parents.
    pub page_id: PagePtr,
    pub storage_id: StorageId,
    kind: u8,
    /// Snapshot pages are read-only images produced by the durability
    /// layer; this core only ever creates volatile pages.
    pub snapshot: bool,
    _pad: [u8; 10],
    /// Inclusive low fence of slices reachable through this page.
    pub low_fence: KeySlice,
    /// Exclusive high fence, except the supremum which is inclusive.
    pub high_fence: KeySlice,
    /// In-layer parent hint. Null for a layer root. Non-owning: must be
    /// re-validated under the parent's lock before use.
    in_layer_parent: AtomicU64,
    /// Right sibling installed by split, followed by scans and by
    /// descents that raced with a split.
    foster_child: AtomicU64,
}

impl PageHeader {
    /// Initialize the header of an invisible, freshly allocated page.
    #[inline]
    pub fn init(
        &mut self,
        storage_id: StorageId,
        page_id: PagePtr,
        kind: PageKind,
        layer: usize,
        low_fence: KeySlice,
        high_fence: KeySlice,
        in_layer_parent: PagePtr,
        is_root: bool,
    ) {
        self.version = PageVersion::new();
        self.version.init(layer, is_root);
        self.page_id = page_id;
        self.storage_id = storage_id;
        self.kind = kind as u8;
        self.snapshot = false;
        self._pad = [0; 10];
        self.low_fence = low_fence;
        self.high_fence = high_fence;
        self.in_layer_parent = AtomicU64::new(in_layer_parent);
        self.foster_child = AtomicU64::new(INVALID_PAGE_PTR);
    }

    #[inline]
    pub fn parent(&self) -> PagePtr {
        self.in_layer_parent.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_parent(&self, parent: PagePtr) {
        self.in_layer_parent.store(parent, Ordering::Release);
    }

    #[inline]
    pub fn kind(&self) -> PageKind {
        PageKind::from_u8(self.kind)
    }

    /// Whether a slice belongs to this page's fence range.
    #[inline]
    pub fn within_fences(&self, slice: KeySlice) -> bool {
        slice >= self.low_fence && (slice < self.high_fence || self.high_fence == SUPREMUM_SLICE)
    }

    #[inline]
    pub fn foster_child(&self) -> PagePtr {
        self.foster_child.load(Ordering::Acquire)
    }

    /// Publish the foster child. Caller holds the page lock with
    /// splitting set.
    #[inline]
    pub fn set_foster_child(&self, foster: PagePtr) {
        debug_assert!(self.version.is_locked());
        self.foster_child.store(foster, Ordering::Release);
    }
}

const _: () = assert!(mem::size_of::<DualPagePointer>() == 16);

/// Pointer pair `{volatile, snapshot}`. Readers prefer the volatile
/// side when it is non-null and fall back to the snapshot image.
/// The volatile side is the CAS target of root replacement and child
/// installation.
#[repr(C)]
pub struct DualPagePointer {
    volatile: AtomicU64,
    snapshot: AtomicU64,
}

impl DualPagePointer {
    #[inline]
    pub fn null() -> Self {
        DualPagePointer {
            volatile: AtomicU64::new(INVALID_PAGE_PTR),
            snapshot: AtomicU64::new(INVALID_PAGE_PTR),
        }
    }

    /// The side a reader should follow.
    #[inline]
    pub fn read(&self) -> PagePtr {
        let v = self.volatile.load(Ordering::Acquire);
        if v != INVALID_PAGE_PTR {
            v
        } else {
            self.snapshot.load(Ordering::Acquire)
        }
    }

    #[inline]
    pub fn volatile(&self) -> PagePtr {
        self.volatile.load(Ordering::Acquire)
    }

    #[inline]
    pub fn snapshot(&self) -> PagePtr {
        self.snapshot.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_volatile(&self, ptr: PagePtr) {
        self.volatile.store(ptr, Ordering::Release);
    }

    #[inline]
    pub fn cas_volatile(&self, old: PagePtr, new: PagePtr) -> bool {
        self.volatile
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Copy both sides from another pointer. Only valid while the
    /// destination is invisible or its page is locked.
    #[inline]
    pub fn copy_from(&self, other: &DualPagePointer) {
        self.volatile
            .store(other.volatile.load(Ordering::Acquire), Ordering::Release);
        self.snapshot
            .store(other.snapshot.load(Ordering::Acquire), Ordering::Release);
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.read() == INVALID_PAGE_PTR
    }
}

pub const CACHELINE_SIZE: usize = 64;

/// Prefetch the first `lines` cachelines of a page sized region.
#[inline]
pub fn prefetch_cachelines(ptr: *const u8, lines: usize) {
    debug_assert!(lines * CACHELINE_SIZE <= PAGE_SIZE);
    #[cfg(target_arch = "x86_64")]
    unsafe {
        for i in 0..lines {
            std::arch::x86_64::_mm_prefetch::<{ std::arch::x86_64::_MM_HINT_T0 }>(
                ptr.add(i * CACHELINE_SIZE) as *const i8,
            );
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (ptr, lines);
    }
}
