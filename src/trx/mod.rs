//! Per-record transactional version words and the read/write evidence
//! this core hands to the optimistic concurrency control layer.
//!
//! The OCC layer owns commit protocol and validation; this core only
//! co-locates one [`OwnerId`] word with every border-page record, locks
//! it around physical record changes, and reports what it observed.

use crate::buffer::page::PagePtr;
use crate::index::key::KeySlice;
use std::sync::atomic::{AtomicU64, Ordering};

pub const OWNER_LOCKED_BIT: u64 = 1 << 63;
pub const OWNER_DELETED_BIT: u64 = 1 << 62;
pub const OWNER_MOVED_BIT: u64 = 1 << 61;
const OWNER_STATUS_MASK: u64 = OWNER_LOCKED_BIT | OWNER_DELETED_BIT | OWNER_MOVED_BIT;

/// Transactional version word of one record, co-located with the record
/// in its border page so that lock and payload share cache locality.
///
/// A freshly reserved record starts locked and deleted; the writer fills
/// the payload, then clears the delete bit and unlocks, making the
/// insert atomic with respect to readers.
#[repr(transparent)]
pub struct OwnerId(AtomicU64);

/// Unlocked copy of an owner word, as stored in read sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerIdSnapshot(pub u64);

impl OwnerIdSnapshot {
    #[inline]
    pub fn is_deleted(self) -> bool {
        self.0 & OWNER_DELETED_BIT != 0
    }

    #[inline]
    pub fn is_moved(self) -> bool {
        self.0 & OWNER_MOVED_BIT != 0
    }

    /// Sequence payload outside the status bits.
    #[inline]
    pub fn seq(self) -> u64 {
        self.0 & !OWNER_STATUS_MASK
    }
}

impl OwnerId {
    /// Initial word of a reserved record: locked and logically deleted.
    #[inline]
    pub fn initial(seq: u64) -> u64 {
        debug_assert!(seq & OWNER_STATUS_MASK == 0);
        OWNER_LOCKED_BIT | OWNER_DELETED_BIT | seq
    }

    /// Raw store, only for page initialization paths where no other
    /// thread can observe the record yet.
    #[inline]
    pub fn store_initial(&self, word: u64) {
        self.0.store(word, Ordering::Release);
    }

    /// Raw load, for copying owner state into an invisible page during
    /// split or layer creation.
    #[inline]
    pub fn raw(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Spin until the word is unlocked and return that snapshot.
    #[inline]
    pub fn stable(&self) -> OwnerIdSnapshot {
        loop {
            let w = self.0.load(Ordering::Acquire);
            if w & OWNER_LOCKED_BIT == 0 {
                return OwnerIdSnapshot(w);
            }
            std::hint::spin_loop();
        }
    }

    /// Acquire the record lock, spinning as long as necessary.
    #[inline]
    pub fn lock(&self) -> OwnerIdSnapshot {
        loop {
            let w = self.0.load(Ordering::Acquire);
            if w & OWNER_LOCKED_BIT == 0
                && self
                    .0
                    .compare_exchange_weak(
                        w,
                        w | OWNER_LOCKED_BIT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                return OwnerIdSnapshot(w);
            }
            std::hint::spin_loop();
        }
    }

    /// Release the record lock, optionally rewriting the status bits.
    ///
    /// The sequence payload is bumped so read-set validation catches the
    /// change.
    #[inline]
    pub fn unlock(&self, deleted: bool) {
        let w = self.0.load(Ordering::Relaxed);
        debug_assert!(w & OWNER_LOCKED_BIT != 0);
        let mut next = (w & OWNER_MOVED_BIT) | (w.wrapping_add(1) & !OWNER_STATUS_MASK);
        if deleted {
            next |= OWNER_DELETED_BIT;
        }
        self.0.store(next, Ordering::Release);
    }

    /// Release the record lock without logical change, restoring the
    /// pre-lock snapshot so read-set validation is not disturbed.
    #[inline]
    pub fn unlock_restore(&self, snapshot: OwnerIdSnapshot) {
        debug_assert!(self.0.load(Ordering::Relaxed) & OWNER_LOCKED_BIT != 0);
        self.0.store(snapshot.0, Ordering::Release);
    }

    /// Mark the record as relocated by a split. Caller holds the page
    /// lock of the record's page.
    #[inline]
    pub fn set_moved(&self) {
        self.0.fetch_or(OWNER_MOVED_BIT, Ordering::AcqRel);
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.0.load(Ordering::Acquire) & OWNER_DELETED_BIT != 0
    }

    #[inline]
    pub fn is_moved(&self) -> bool {
        self.0.load(Ordering::Acquire) & OWNER_MOVED_BIT != 0
    }
}

/// Evidence of one record read, consumed by the OCC layer at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSetEntry {
    pub page: PagePtr,
    pub slot: usize,
    pub owner: OwnerIdSnapshot,
}

/// Evidence that a key gap was observed empty; detects phantom inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeLockEntry {
    pub page: PagePtr,
    pub low_slice: KeySlice,
    pub high_slice: KeySlice,
    /// Page version word observed while the gap was inspected.
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Insert,
    Delete,
    Overwrite,
    Increment,
}

/// Evidence of one record write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSetEntry {
    pub page: PagePtr,
    pub slot: usize,
    pub kind: WriteKind,
    pub payload: Vec<u8>,
}
