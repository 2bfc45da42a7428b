use crate::buffer::pool::FixedPagePool;
use crate::buffer::release::PageReleaseBatch;
use crate::epoch::{EpochPin, EpochService};
use crate::trx::{RangeLockEntry, ReadSetEntry, WriteSetEntry};

/// Per-thread context of index operations.
///
/// A session carries everything one worker thread accumulates while
/// operating on a storage: the epoch pin protecting its optimistic
/// references, the read/range/write evidence sets the transactional
/// layer consumes, and the release batch of pages this thread retired.
///
/// Sessions are not Sync; one session serves exactly one thread.
pub struct Session<'a> {
    epochs: &'a EpochService,
    pin: EpochPin,
    read_set: Vec<ReadSetEntry>,
    range_locks: Vec<RangeLockEntry>,
    write_set: Vec<WriteSetEntry>,
    release_batch: PageReleaseBatch,
    retry_limit: usize,
}

impl<'a> Session<'a> {
    #[inline]
    pub fn new(epochs: &'a EpochService, retry_limit: usize) -> Self {
        Session {
            epochs,
            pin: epochs.register(),
            read_set: vec![],
            range_locks: vec![],
            write_set: vec![],
            release_batch: PageReleaseBatch::new(),
            retry_limit,
        }
    }

    #[inline]
    pub fn retry_limit(&self) -> usize {
        self.retry_limit
    }

    /// Pin the current epoch around one operation or scan.
    #[inline]
    pub(crate) fn enter(&self) {
        self.pin.enter(self.epochs.current());
    }

    #[inline]
    pub(crate) fn leave(&self) {
        self.pin.leave();
    }

    #[inline]
    pub(crate) fn record_read(&mut self, entry: ReadSetEntry) {
        self.read_set.push(entry);
    }

    #[inline]
    pub(crate) fn record_range_lock(&mut self, entry: RangeLockEntry) {
        self.range_locks.push(entry);
    }

    #[inline]
    pub(crate) fn record_write(&mut self, entry: WriteSetEntry) {
        self.write_set.push(entry);
    }

    /// Retire a page superseded by a structural modification.
    #[inline]
    pub(crate) fn retire_page(&mut self, ptr: crate::buffer::page::PagePtr) {
        self.release_batch.enqueue(ptr, self.epochs.current());
    }

    #[inline]
    pub fn read_set(&self) -> &[ReadSetEntry] {
        &self.read_set
    }

    #[inline]
    pub fn range_locks(&self) -> &[RangeLockEntry] {
        &self.range_locks
    }

    #[inline]
    pub fn write_set(&self) -> &[WriteSetEntry] {
        &self.write_set
    }

    /// Hand the accumulated evidence to the transactional layer and
    /// reset for the next transaction.
    #[inline]
    pub fn take_evidence(&mut self) -> (Vec<ReadSetEntry>, Vec<RangeLockEntry>, Vec<WriteSetEntry>) {
        (
            std::mem::take(&mut self.read_set),
            std::mem::take(&mut self.range_locks),
            std::mem::take(&mut self.write_set),
        )
    }

    /// Pages retired by this session, still waiting for readers to
    /// drain.
    #[inline]
    pub fn retired_pages(&self) -> usize {
        self.release_batch.len()
    }

    /// Return retired pages whose epoch has fully drained to the pool.
    #[inline]
    pub fn reclaim(&mut self, pool: &FixedPagePool) -> usize {
        self.release_batch.reclaim(self.epochs, pool)
    }

    /// Drop all retired pages back to the pool.
    ///
    /// # Safety
    ///
    /// Caller must guarantee quiescence: no concurrent reader can still
    /// observe the retired pages.
    #[inline]
    pub unsafe fn reclaim_all(&mut self, pool: &FixedPagePool) -> usize {
        unsafe { self.release_batch.reclaim_all(pool) }
    }
}

impl Drop for Session<'_> {
    #[inline]
    fn drop(&mut self) {
        self.pin.leave();
        debug_assert!(
            self.release_batch.is_empty(),
            "session dropped with unreclaimed retired pages"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trx::{OwnerIdSnapshot, WriteKind};

    #[test]
    fn test_session_evidence_sets() {
        let epochs = EpochService::new();
        let mut session = Session::new(&epochs, 100);
        session.record_read(ReadSetEntry {
            page: 1,
            slot: 0,
            owner: OwnerIdSnapshot(0),
        });
        session.record_write(WriteSetEntry {
            page: 1,
            slot: 0,
            kind: WriteKind::Insert,
            payload: b"v".to_vec(),
        });
        assert_eq!(session.read_set().len(), 1);
        assert_eq!(session.write_set().len(), 1);

        let (reads, ranges, writes) = session.take_evidence();
        assert_eq!((reads.len(), ranges.len(), writes.len()), (1, 0, 1));
        assert!(session.read_set().is_empty());
        assert!(session.write_set().is_empty());
    }

    #[test]
    fn test_session_epoch_pin() {
        let epochs = EpochService::new();
        let session = Session::new(&epochs, 100);
        let e0 = epochs.current();
        session.enter();
        epochs.advance();
        assert_eq!(epochs.min_active(), e0);
        session.leave();
        assert_eq!(epochs.min_active(), e0 + 1);
    }
}
