use crate::buffer::page::{page_ptr, page_ptr_frame, page_ptr_node, BufferPage, Page, PagePtr, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::lifetime::StaticLifetime;
use libc::{
    c_void, madvise, mmap, munmap, MADV_DONTFORK, MADV_HUGEPAGE, MAP_ANONYMOUS, MAP_FAILED,
    MAP_PRIVATE, PROT_READ, PROT_WRITE,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const SAFETY_PAGES: usize = 10;

/// A fixed-size page pool pre-allocated with mmap().
///
/// Page frames are 4 KiB aligned by construction (mmap returns page
/// aligned memory and frames are sized PAGE_SIZE). Frames are handed out
/// as opaque [`PagePtr`] handles; the pool is the only component that
/// resolves a handle to an address.
///
/// The pool does not support swap or evict. Retired index pages go
/// through [`crate::buffer::release::PageReleaseBatch`] and come back to
/// the free list once no reader can observe them.
pub struct FixedPagePool {
    pages: *mut Page,
    size: usize,
    node: usize,
    free_list: Mutex<Vec<usize>>,
    allocated: AtomicUsize,
}

impl FixedPagePool {
    /// Create a page pool with given capacity in bytes on the given
    /// memory node.
    ///
    /// The hosting engine is expected to bind this thread to the node
    /// before calling, so first-touch places the region correctly.
    #[inline]
    pub fn with_capacity(pool_size: usize, node: usize) -> Result<Self> {
        let size = pool_size / PAGE_SIZE;
        if size < SAFETY_PAGES {
            return Err(Error::PagePoolSizeTooSmall);
        }
        let total_bytes = PAGE_SIZE * (size + SAFETY_PAGES);
        let pages = unsafe { mmap_allocate(total_bytes)? } as *mut Page;
        // free frames handed out from the back, so low indexes go first.
        let free_list = (0..size).rev().collect();
        Ok(FixedPagePool {
            pages,
            size,
            node,
            free_list: Mutex::new(free_list),
            allocated: AtomicUsize::new(0),
        })
    }

    /// Create a page pool with given capacity, leak it to heap and
    /// return the static reference.
    #[inline]
    pub fn with_capacity_static(pool_size: usize, node: usize) -> Result<&'static Self> {
        let pool = Self::with_capacity(pool_size, node)?;
        Ok(StaticLifetime::new_static(pool))
    }

    /// Returns the maximum page number of this pool.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of pages currently allocated.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Allocate one zeroed page frame.
    ///
    /// The node hint is accepted for interface compatibility with a
    /// multi-node pool set; this pool serves from its own node only.
    #[inline]
    pub fn allocate(&self, _node_hint: usize) -> Result<PagePtr> {
        let frame = {
            let mut g = self.free_list.lock();
            match g.pop() {
                Some(frame) => frame,
                None => return Err(Error::OutOfPageMemory),
            }
        };
        self.allocated.fetch_add(1, Ordering::Relaxed);
        let ptr = page_ptr(self.node, frame);
        // SAFETY: frame comes from the free list so no one else references it.
        unsafe {
            (*self.resolve_raw(ptr)).zero();
        }
        Ok(ptr)
    }

    /// Return a page frame to the free list.
    ///
    /// # Safety
    ///
    /// Caller must guarantee no thread still holds a reference into the
    /// page. Index pages go through the epoch-bound release batch which
    /// upholds this.
    #[inline]
    pub unsafe fn deallocate(&self, ptr: PagePtr) {
        debug_assert_eq!(page_ptr_node(ptr), self.node);
        let frame = page_ptr_frame(ptr);
        debug_assert!(frame < self.size);
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        self.free_list.lock().push(frame);
    }

    /// Resolve an opaque page pointer to the page address.
    #[inline]
    pub fn resolve(&self, ptr: PagePtr) -> *mut Page {
        debug_assert_eq!(page_ptr_node(ptr), self.node);
        self.resolve_raw(ptr)
    }

    #[inline]
    fn resolve_raw(&self, ptr: PagePtr) -> *mut Page {
        let frame = page_ptr_frame(ptr);
        debug_assert!(frame < self.size + SAFETY_PAGES);
        // SAFETY: frame index is bounded by pool size; region is mmap-owned.
        unsafe { self.pages.add(frame) }
    }
}

impl Drop for FixedPagePool {
    #[inline]
    fn drop(&mut self) {
        let total_bytes = PAGE_SIZE * (self.size + SAFETY_PAGES);
        unsafe {
            mmap_deallocate(self.pages as *mut u8, total_bytes);
        }
    }
}

unsafe impl Send for FixedPagePool {}

unsafe impl Sync for FixedPagePool {}

unsafe impl StaticLifetime for FixedPagePool {}

#[inline]
unsafe fn mmap_allocate(total_bytes: usize) -> Result<*mut u8> {
    unsafe {
        let memory_chunk = mmap(
            std::ptr::null_mut(),
            total_bytes,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        );
        if memory_chunk == MAP_FAILED {
            return Err(Error::InsufficientMemory(total_bytes));
        }
        madvise(memory_chunk, total_bytes, MADV_HUGEPAGE);
        madvise(memory_chunk, total_bytes, MADV_DONTFORK);
        Ok(memory_chunk as *mut u8)
    }
}

#[inline]
unsafe fn mmap_deallocate(ptr: *mut u8, total_bytes: usize) {
    unsafe {
        munmap(ptr as *mut c_void, total_bytes);
    }
}
