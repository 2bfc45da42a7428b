//! Page version word: the synchronization medium of the whole index.
//!
//! One 64-bit atomic per page (and per mini-page inside intermediate
//! pages) combines the writer lock with the state an optimistic reader
//! must validate. Readers never take the lock: they spin for a stable
//! snapshot, read the page body, then check the snapshot is unchanged.
//!
//! Bit layout, high to low:
//!
//! ```text
//! ┌─────────┬───────────┬───────────┬─────────┬────────────┬─────────┬──────────┬───────────────┬────────────┐
//! │locked(1)│inserting(1)│splitting(1)│deleted(1)│has_foster(1)│is_root(1)│ layer(5) │ key_count(10) │ vsplit(43) │
//! └─────────┴───────────┴───────────┴─────────┴────────────┴─────────┴──────────┴───────────────┴────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

pub const VERSION_LOCKED_BIT: u64 = 1 << 63;
pub const VERSION_INSERTING_BIT: u64 = 1 << 62;
pub const VERSION_SPLITTING_BIT: u64 = 1 << 61;
pub const VERSION_DELETED_BIT: u64 = 1 << 60;
pub const VERSION_HAS_FOSTER_BIT: u64 = 1 << 59;
pub const VERSION_IS_ROOT_BIT: u64 = 1 << 58;

const LAYER_SHIFT: u32 = 53;
const LAYER_MASK: u64 = 0x1F;
const KEY_COUNT_SHIFT: u32 = 43;
const KEY_COUNT_MASK: u64 = 0x3FF;
const VSPLIT_MASK: u64 = (1 << KEY_COUNT_SHIFT) - 1;

const IN_MODIFICATION_MASK: u64 =
    VERSION_LOCKED_BIT | VERSION_INSERTING_BIT | VERSION_SPLITTING_BIT;

/// Maximum key count the version word can carry. Page layouts stay well
/// below this.
pub const VERSION_MAX_KEY_COUNT: usize = KEY_COUNT_MASK as usize;

#[repr(transparent)]
pub struct PageVersion(AtomicU64);

/// One observed value of a version word. Snapshots returned by
/// [`PageVersion::stable`] have all modification bits clear, so plain
/// equality implements the optimistic-read check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageVersionSnapshot(pub u64);

impl PageVersionSnapshot {
    #[inline]
    pub fn is_locked(self) -> bool {
        self.0 & VERSION_LOCKED_BIT != 0
    }

    #[inline]
    pub fn is_inserting(self) -> bool {
        self.0 & VERSION_INSERTING_BIT != 0
    }

    #[inline]
    pub fn is_splitting(self) -> bool {
        self.0 & VERSION_SPLITTING_BIT != 0
    }

    #[inline]
    pub fn is_deleted(self) -> bool {
        self.0 & VERSION_DELETED_BIT != 0
    }

    #[inline]
    pub fn has_foster(self) -> bool {
        self.0 & VERSION_HAS_FOSTER_BIT != 0
    }

    #[inline]
    pub fn is_root(self) -> bool {
        self.0 & VERSION_IS_ROOT_BIT != 0
    }

    #[inline]
    pub fn layer(self) -> usize {
        ((self.0 >> LAYER_SHIFT) & LAYER_MASK) as usize
    }

    #[inline]
    pub fn key_count(self) -> usize {
        ((self.0 >> KEY_COUNT_SHIFT) & KEY_COUNT_MASK) as usize
    }

    #[inline]
    pub fn vsplit(self) -> u64 {
        self.0 & VSPLIT_MASK
    }
}

impl PageVersion {
    #[inline]
    pub const fn new() -> Self {
        PageVersion(AtomicU64::new(0))
    }

    /// Word for a freshly initialized page. The page is not yet visible
    /// to any other thread.
    #[inline]
    pub fn init(&self, layer: usize, is_root: bool) {
        debug_assert!(layer as u64 <= LAYER_MASK);
        let mut w = (layer as u64) << LAYER_SHIFT;
        if is_root {
            w |= VERSION_IS_ROOT_BIT;
        }
        self.0.store(w, Ordering::Release);
    }

    /// Raw load of the version word, for range-lock evidence.
    #[inline]
    pub fn word(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Spin until a snapshot with no modification in progress is
    /// observed and return it. Readers must call this before touching
    /// page contents and re-check it afterwards.
    #[inline]
    pub fn stable(&self) -> PageVersionSnapshot {
        loop {
            let w = self.0.load(Ordering::Acquire);
            if w & IN_MODIFICATION_MASK == 0 {
                return PageVersionSnapshot(w);
            }
            std::hint::spin_loop();
        }
    }

    /// Acquire the exclusive page lock, spinning as long as necessary.
    #[inline]
    pub fn lock(&self) -> PageVersionSnapshot {
        loop {
            let w = self.0.load(Ordering::Acquire);
            if w & VERSION_LOCKED_BIT == 0
                && self
                    .0
                    .compare_exchange_weak(
                        w,
                        w | VERSION_LOCKED_BIT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                return PageVersionSnapshot(w);
            }
            std::hint::spin_loop();
        }
    }

    /// Try to acquire the exclusive page lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<PageVersionSnapshot> {
        let w = self.0.load(Ordering::Acquire);
        if w & VERSION_LOCKED_BIT != 0 {
            return None;
        }
        self.0
            .compare_exchange(w, w | VERSION_LOCKED_BIT, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(PageVersionSnapshot)
    }

    /// Release the page lock. Clears inserting and splitting; bumps the
    /// split counter iff splitting was set.
    #[inline]
    pub fn unlock(&self) {
        let w = self.0.load(Ordering::Relaxed);
        debug_assert!(w & VERSION_LOCKED_BIT != 0);
        let mut next = w;
        if w & VERSION_SPLITTING_BIT != 0 {
            next = (next & !VSPLIT_MASK) | ((w & VSPLIT_MASK).wrapping_add(1) & VSPLIT_MASK);
        }
        next &= !IN_MODIFICATION_MASK;
        self.0.store(next, Ordering::Release);
    }

    /// Set the inserting bit. Caller holds the lock.
    #[inline]
    pub fn set_inserting(&self) {
        debug_assert!(self.is_locked());
        self.0.fetch_or(VERSION_INSERTING_BIT, Ordering::AcqRel);
    }

    /// Set the splitting bit. Caller holds the lock.
    #[inline]
    pub fn set_splitting(&self) {
        debug_assert!(self.is_locked());
        self.0.fetch_or(VERSION_SPLITTING_BIT, Ordering::AcqRel);
    }

    /// Mark the page retired. Caller holds the lock.
    #[inline]
    pub fn set_deleted(&self) {
        debug_assert!(self.is_locked());
        self.0.fetch_or(VERSION_DELETED_BIT, Ordering::AcqRel);
    }

    /// Record that a split installed a foster child. Caller holds the
    /// lock.
    #[inline]
    pub fn set_has_foster(&self) {
        debug_assert!(self.is_locked());
        self.0.fetch_or(VERSION_HAS_FOSTER_BIT, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_is_root(&self) {
        debug_assert!(self.is_locked());
        self.0.fetch_and(!VERSION_IS_ROOT_BIT, Ordering::AcqRel);
    }

    /// Publish a new key count. Caller holds the lock (or exclusively
    /// owns an invisible page).
    #[inline]
    pub fn set_key_count(&self, count: usize) {
        debug_assert!(count <= VERSION_MAX_KEY_COUNT);
        let w = self.0.load(Ordering::Relaxed);
        let next = (w & !(KEY_COUNT_MASK << KEY_COUNT_SHIFT)) | ((count as u64) << KEY_COUNT_SHIFT);
        self.0.store(next, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.0.load(Ordering::Acquire) & VERSION_LOCKED_BIT != 0
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.load(Ordering::Acquire) & VERSION_IS_ROOT_BIT != 0
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.0.load(Ordering::Acquire) & VERSION_DELETED_BIT != 0
    }

    #[inline]
    pub fn has_foster(&self) -> bool {
        self.0.load(Ordering::Acquire) & VERSION_HAS_FOSTER_BIT != 0
    }

    #[inline]
    pub fn layer(&self) -> usize {
        PageVersionSnapshot(self.0.load(Ordering::Acquire)).layer()
    }

    #[inline]
    pub fn key_count(&self) -> usize {
        PageVersionSnapshot(self.0.load(Ordering::Acquire)).key_count()
    }

    /// Returns whether the given stable snapshot still matches.
    #[inline]
    pub fn validate(&self, snapshot: PageVersionSnapshot) -> bool {
        let w = self.0.load(Ordering::Acquire);
        w & !VERSION_LOCKED_BIT == snapshot.0
    }
}

impl Default for PageVersion {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_version_init_fields() {
        let v = PageVersion::new();
        v.init(3, true);
        let s = v.stable();
        assert_eq!(s.layer(), 3);
        assert!(s.is_root());
        assert_eq!(s.key_count(), 0);
        assert_eq!(s.vsplit(), 0);
        assert!(!s.is_locked() && !s.is_inserting() && !s.is_splitting());
    }

    #[test]
    fn test_lock_insert_unlock_changes_snapshot() {
        let v = PageVersion::new();
        v.init(0, false);
        let before = v.stable();

        let _ = v.lock();
        v.set_inserting();
        v.set_key_count(1);
        v.unlock();

        let after = v.stable();
        assert_ne!(before, after);
        assert_eq!(after.key_count(), 1);
        // no split happened, vsplit unchanged.
        assert_eq!(after.vsplit(), before.vsplit());
    }

    #[test]
    fn test_unlock_bumps_vsplit_only_when_splitting() {
        let v = PageVersion::new();
        v.init(0, false);

        let _ = v.lock();
        v.unlock();
        assert_eq!(v.stable().vsplit(), 0);

        let _ = v.lock();
        v.set_splitting();
        v.set_has_foster();
        v.unlock();
        let s = v.stable();
        assert_eq!(s.vsplit(), 1);
        assert!(s.has_foster());
    }

    #[test]
    fn test_validate_ignores_lock_bit_only() {
        let v = PageVersion::new();
        v.init(0, false);
        let s = v.stable();
        assert!(v.validate(s));
        let _ = v.lock();
        // lock alone does not invalidate readers.
        assert!(v.validate(s));
        v.set_key_count(5);
        assert!(!v.validate(s));
        v.unlock();
    }

    #[test]
    fn test_stable_spins_through_writer() {
        let v = Arc::new(PageVersion::new());
        v.init(0, false);
        let _ = v.lock();
        v.set_inserting();

        let v2 = Arc::clone(&v);
        let handle = std::thread::spawn(move || {
            // blocks until the writer below unlocks.
            let s = v2.stable();
            assert_eq!(s.key_count(), 7);
        });

        std::thread::sleep(std::time::Duration::from_millis(10));
        v.set_key_count(7);
        v.unlock();
        handle.join().unwrap();
    }

    #[test]
    fn test_try_lock() {
        let v = PageVersion::new();
        v.init(0, false);
        let g = v.try_lock();
        assert!(g.is_some());
        assert!(v.try_lock().is_none());
        v.unlock();
        assert!(v.try_lock().is_some());
        v.unlock();
    }
}
