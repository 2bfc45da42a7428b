//! Ordered range scans across pages and layers.
//!
//! A scanner keeps one frame per layer on its path. Within a layer it
//! consumes whole border pages under a single version validation,
//! advancing page by page along high fences (splits hand the scan to
//! the foster sibling through the descent's right-sibling hop). A
//! next-layer slot suspends the current frame and pushes one for the
//! deeper layer; popping resumes right after the slot.
//!
//! The scanner pins the reclamation epoch for its whole lifetime.

use crate::buffer::page::{PagePtr, INVALID_PAGE_PTR};
use crate::error::Validation::{Invalid, Valid};
use crate::error::{Error, Result};
use crate::index::key::{
    normalized_key, slice_at_layer, KeySlice, INFIMUM_SLICE, SLICE_LEN, SUPREMUM_SLICE,
};
use crate::index::storage::MasstreeStorage;
use crate::session::Session;
use std::collections::VecDeque;

/// Rank probe positioning after every slot of a slice, including a
/// next-layer slot.
const RANK_PAST_SLICE: u8 = SLICE_LEN as u8 + 2;

struct LayerFrame {
    root: PagePtr,
    /// Key bytes consumed by the layers above.
    prefix: Vec<u8>,
    resume_slice: KeySlice,
    resume_rank: u8,
}

enum PageOutcome {
    /// Enter the next layer below the slot with this slice.
    DescendLayer { slice: KeySlice, child: PagePtr },
    /// Page exhausted; continue at its high fence or pop the layer.
    EndOfPage { high_fence: KeySlice },
}

pub struct MasstreeScanner<'a, 'b> {
    storage: &'a MasstreeStorage,
    session: &'a mut Session<'b>,
    stack: Vec<LayerFrame>,
    pending: VecDeque<(Vec<u8>, Vec<u8>)>,
    start: Vec<u8>,
    /// Exclusive upper bound on full keys.
    end: Option<Vec<u8>>,
    finished: bool,
}

impl<'a, 'b> MasstreeScanner<'a, 'b> {
    pub(crate) fn new(
        storage: &'a MasstreeStorage,
        session: &'a mut Session<'b>,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Self {
        session.enter();
        let root = storage.root_pointer().read();
        let mut scanner = MasstreeScanner {
            storage,
            session,
            stack: vec![],
            pending: VecDeque::new(),
            start: start.to_vec(),
            end: end.map(|e| e.to_vec()),
            finished: root == INVALID_PAGE_PTR,
        };
        if !scanner.finished {
            scanner.stack.push(LayerFrame {
                root,
                prefix: vec![],
                resume_slice: slice_at_layer(start, 0),
                resume_rank: 0,
            });
        }
        scanner
    }

    /// The next record in key order, or None when the range is done.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if let Some(kv) = self.pending.pop_front() {
                return Ok(Some(kv));
            }
            if self.finished || self.stack.is_empty() {
                return Ok(None);
            }
            self.fill_from_top_frame()?;
        }
    }

    /// Read one border page of the top frame under a single validation
    /// and advance the frame past it.
    fn fill_from_top_frame(&mut self) -> Result<()> {
        for _ in 0..self.session.retry_limit() {
            let frame = self.stack.last().expect("scan stack underflow");
            let target = match self
                .storage
                .try_descend_to_border(frame.root, frame.resume_slice)
            {
                Valid(t) => t,
                Invalid => continue,
            };
            // SAFETY: optimistic read validated before the batch is kept.
            let border = unsafe { self.storage.border_of(target.ptr) };
            let count = target.stable.key_count();

            let mut batch: Vec<(Vec<u8>, Vec<u8>)> = vec![];
            let mut outcome = None;
            let first = border.lower_bound_rank(count, frame.resume_slice, frame.resume_rank);
            for i in first..count {
                if border.points_to_next_layer(i) {
                    outcome = Some(PageOutcome::DescendLayer {
                        slice: border.slice(i),
                        child: border.next_layer(i).read(),
                    });
                    break;
                }
                let owner = border.owner(i).stable();
                if owner.is_deleted() || owner.is_moved() {
                    continue;
                }
                let mut key = frame.prefix.clone();
                border.key_of(i, &mut key);
                batch.push((key, border.payload(i).to_vec()));
            }
            let outcome = outcome.unwrap_or(PageOutcome::EndOfPage {
                high_fence: border.header.high_fence,
            });
            if !border.header.version.validate(target.stable) {
                continue;
            }

            // commit: adjust the stack, then publish the batch.
            match outcome {
                PageOutcome::DescendLayer { slice, child } => {
                    let frame = self.stack.last_mut().expect("scan stack underflow");
                    frame.resume_slice = slice;
                    frame.resume_rank = RANK_PAST_SLICE;
                    let mut prefix = frame.prefix.clone();
                    prefix.extend_from_slice(&slice.to_be_bytes());
                    self.stack.push(LayerFrame {
                        root: child,
                        prefix,
                        resume_slice: INFIMUM_SLICE,
                        resume_rank: 0,
                    });
                }
                PageOutcome::EndOfPage { high_fence } => {
                    if high_fence == SUPREMUM_SLICE {
                        self.stack.pop();
                    } else {
                        let frame = self.stack.last_mut().expect("scan stack underflow");
                        frame.resume_slice = high_fence;
                        frame.resume_rank = 0;
                    }
                }
            }

            for (key, payload) in batch {
                if key.as_slice() < self.start.as_slice() {
                    continue;
                }
                if let Some(end) = &self.end {
                    if key.as_slice() >= end.as_slice() {
                        self.finished = true;
                        self.stack.clear();
                        break;
                    }
                }
                self.pending.push_back((key, payload));
            }
            return Ok(());
        }
        Err(Error::RaceAborted)
    }
}

impl Drop for MasstreeScanner<'_, '_> {
    #[inline]
    fn drop(&mut self) {
        self.session.leave();
    }
}

impl MasstreeStorage {
    /// Scan records with keys in `[start, end)` in ascending key order.
    /// `end = None` scans to the end of the index.
    #[inline]
    pub fn scan<'a, 'b>(
        &'a self,
        session: &'a mut Session<'b>,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> MasstreeScanner<'a, 'b> {
        MasstreeScanner::new(self, session, start, end)
    }

    /// Scan 8-byte normalized keys in `[start, end)` slice order.
    #[inline]
    pub fn scan_normalized<'a, 'b>(
        &'a self,
        session: &'a mut Session<'b>,
        start: KeySlice,
        end: Option<KeySlice>,
    ) -> MasstreeScanner<'a, 'b> {
        let start_key = normalized_key(start);
        match end {
            Some(end) => {
                let end_key = normalized_key(end);
                MasstreeScanner::new(self, session, &start_key, Some(&end_key))
            }
            None => MasstreeScanner::new(self, session, &start_key, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::page::PAGE_SIZE;
    use crate::buffer::pool::FixedPagePool;
    use crate::config::MasstreeConfig;
    use crate::lifetime::StaticLifetime;

    fn new_storage() -> (&'static FixedPagePool, &'static MasstreeStorage) {
        let pool = FixedPagePool::with_capacity_static(1024 * PAGE_SIZE, 0).unwrap();
        let storage =
            MasstreeStorage::create(pool, 1, "scan_test", MasstreeConfig::default()).unwrap();
        (pool, StaticLifetime::new_static(storage))
    }

    fn destroy_storage(pool: &'static FixedPagePool, storage: &'static MasstreeStorage) {
        let mut session = storage.session();
        storage.drop_storage(&mut session);
        storage.epochs().advance();
        session.reclaim(pool);
        assert_eq!(pool.allocated(), 0);
        drop(session);
        unsafe {
            StaticLifetime::drop_static(storage);
            StaticLifetime::drop_static(pool);
        }
    }

    fn collect(scanner: &mut MasstreeScanner) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = vec![];
        while let Some(kv) = scanner.next().unwrap() {
            out.push(kv);
        }
        out
    }

    #[test]
    fn test_scan_empty_storage() {
        let (pool, storage) = new_storage();
        {
            let mut session = storage.session();
            let mut scanner = storage.scan(&mut session, &[], None);
            assert!(scanner.next().unwrap().is_none());
        }
        destroy_storage(pool, storage);
    }

    #[test]
    fn test_scan_bounded_range() {
        let (pool, storage) = new_storage();
        {
            let mut session = storage.session();
            for i in 0u64..100 {
                storage
                    .insert_record_normalized(&mut session, i, &i.to_be_bytes())
                    .unwrap();
            }
            let mut scanner = storage.scan_normalized(&mut session, 10, Some(20));
            let got = collect(&mut scanner);
            drop(scanner);
            assert_eq!(got.len(), 10);
            for (j, (key, _)) in got.iter().enumerate() {
                assert_eq!(key, &normalized_key(10 + j as u64));
            }
        }
        destroy_storage(pool, storage);
    }

    #[test]
    fn test_scan_skips_deleted() {
        let (pool, storage) = new_storage();
        {
            let mut session = storage.session();
            for i in 0u64..10 {
                storage
                    .insert_record_normalized(&mut session, i, b"v")
                    .unwrap();
            }
            for i in (0u64..10).step_by(2) {
                storage.delete_record_normalized(&mut session, i).unwrap();
            }
            let mut scanner = storage.scan(&mut session, &[], None);
            let got = collect(&mut scanner);
            drop(scanner);
            let keys: Vec<u64> = got
                .iter()
                .map(|(k, _)| u64::from_be_bytes(k.as_slice().try_into().unwrap()))
                .collect();
            assert_eq!(keys, vec![1, 3, 5, 7, 9]);
        }
        destroy_storage(pool, storage);
    }

    #[test]
    fn test_scan_across_layers_in_key_order() {
        let (pool, storage) = new_storage();
        {
            let mut session = storage.session();
            let keys: Vec<&[u8]> = vec![
                b"a",
                b"abcdefgh",
                b"abcdefgh1",
                b"abcdefgh12345678",
                b"abcdefgh2",
                b"abcdefgi",
                b"b",
            ];
            // insert shuffled, expect lexicographic order out.
            for key in keys.iter().rev() {
                storage.insert_record(&mut session, key, key).unwrap();
            }
            let mut scanner = storage.scan(&mut session, &[], None);
            let got = collect(&mut scanner);
            drop(scanner);
            let got_keys: Vec<&[u8]> = got.iter().map(|(k, _)| k.as_slice()).collect();
            assert_eq!(got_keys, keys);
            // payload rides along unchanged through layer hops.
            for (k, v) in &got {
                assert_eq!(k, v);
            }
        }
        destroy_storage(pool, storage);
    }

    #[test]
    fn test_scan_start_inside_shared_slice() {
        let (pool, storage) = new_storage();
        {
            let mut session = storage.session();
            storage.insert_record(&mut session, b"abcdefgh1", b"1").unwrap();
            storage.insert_record(&mut session, b"abcdefgh2", b"2").unwrap();
            storage.insert_record(&mut session, b"abcdefgh3", b"3").unwrap();
            let mut scanner = storage.scan(&mut session, b"abcdefgh2", None);
            let got = collect(&mut scanner);
            drop(scanner);
            let got_keys: Vec<&[u8]> = got.iter().map(|(k, _)| k.as_slice()).collect();
            assert_eq!(got_keys, vec![&b"abcdefgh2"[..], &b"abcdefgh3"[..]]);
        }
        destroy_storage(pool, storage);
    }
}
