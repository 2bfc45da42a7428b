use crate::buffer::page::PagePtr;
use crate::buffer::pool::FixedPagePool;
use crate::epoch::{Epoch, EpochService};
use std::collections::VecDeque;

/// Per-thread batch of retired pages tagged with their retirement epoch.
///
/// A page enters the batch when a structural modification supersedes it
/// (split retires the pre-split image, root replacement retires the old
/// root chain on drop). It returns to the pool's free list only after
/// the global epoch has advanced past its tag and no thread still pins
/// an epoch at or before it.
pub struct PageReleaseBatch {
    retired: VecDeque<(Epoch, PagePtr)>,
}

impl PageReleaseBatch {
    #[inline]
    pub fn new() -> Self {
        PageReleaseBatch {
            retired: VecDeque::new(),
        }
    }

    /// Returns number of pages waiting for reclamation.
    #[inline]
    pub fn len(&self) -> usize {
        self.retired.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.retired.is_empty()
    }

    /// Retire one page under the given epoch.
    #[inline]
    pub fn enqueue(&mut self, ptr: PagePtr, epoch: Epoch) {
        debug_assert!(
            self.retired.back().map(|(e, _)| *e <= epoch).unwrap_or(true),
            "retirement epochs must be monotonic"
        );
        self.retired.push_back((epoch, ptr));
    }

    /// Reclaim every page whose tag is strictly below the oldest epoch
    /// any thread still pins. Returns how many pages were reclaimed.
    #[inline]
    pub fn reclaim(&mut self, epochs: &EpochService, pool: &FixedPagePool) -> usize {
        let min_active = epochs.min_active();
        let mut reclaimed = 0;
        while let Some((epoch, ptr)) = self.retired.front().copied() {
            if epoch >= min_active {
                break;
            }
            self.retired.pop_front();
            // SAFETY: no thread pins an epoch at or before the tag, so the
            // page is unreachable from any optimistic reader.
            unsafe {
                pool.deallocate(ptr);
            }
            reclaimed += 1;
        }
        reclaimed
    }

    /// Drop every retired page back to the pool unconditionally.
    ///
    /// # Safety
    ///
    /// Only valid when the caller can prove quiescence, e.g. single
    /// threaded teardown of the whole storage.
    #[inline]
    pub unsafe fn reclaim_all(&mut self, pool: &FixedPagePool) -> usize {
        let mut reclaimed = 0;
        while let Some((_, ptr)) = self.retired.pop_front() {
            unsafe {
                pool.deallocate(ptr);
            }
            reclaimed += 1;
        }
        reclaimed
    }
}

impl Default for PageReleaseBatch {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::page::PAGE_SIZE;

    #[test]
    fn test_release_batch_respects_pins() {
        let pool = FixedPagePool::with_capacity(64 * PAGE_SIZE, 0).unwrap();
        let epochs = EpochService::new();
        let pin = epochs.register();
        let mut batch = PageReleaseBatch::new();

        let p1 = pool.allocate(0).unwrap();
        let p2 = pool.allocate(0).unwrap();

        let e = epochs.current();
        pin.enter(e);
        batch.enqueue(p1, e);
        batch.enqueue(p2, e);

        // reader still pins the retirement epoch, nothing may be freed.
        epochs.advance();
        assert_eq!(batch.reclaim(&epochs, &pool), 0);
        assert_eq!(pool.allocated(), 2);

        pin.leave();
        epochs.advance();
        assert_eq!(batch.reclaim(&epochs, &pool), 2);
        assert_eq!(pool.allocated(), 0);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_release_batch_partial_reclaim() {
        let pool = FixedPagePool::with_capacity(64 * PAGE_SIZE, 0).unwrap();
        let epochs = EpochService::new();
        let mut batch = PageReleaseBatch::new();

        let p1 = pool.allocate(0).unwrap();
        batch.enqueue(p1, epochs.current());
        let e2 = epochs.advance();
        let p2 = pool.allocate(0).unwrap();
        batch.enqueue(p2, e2);

        epochs.advance();
        // both epochs are below min_active now.
        assert_eq!(batch.reclaim(&epochs, &pool), 2);
    }
}
