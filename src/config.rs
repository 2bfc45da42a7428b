use crate::buffer::pool::FixedPagePool;
use crate::error::Result;
use byte_unit::Byte;
use serde::{Deserialize, Serialize};

pub const DEFAULT_POOL_SIZE: Byte = Byte::from_u64(64 * 1024 * 1024);
pub const DEFAULT_NODE_HINT: usize = 0;
pub const DEFAULT_OPTIMISTIC_RETRY_LIMIT: usize = 10_000;

/// Configuration of a Masstree storage and its page pool.
///
/// The pool is sized in bytes and converted to whole pages.
/// Node hint is forwarded to the pool on every allocation so the
/// hosting engine can map it to a NUMA node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasstreeConfig {
    // Total bytes reserved for the page pool backing this storage.
    pub pool_size: Byte,
    // Preferred memory node for page allocation.
    pub node_hint: usize,
    // How many times an optimistic read retries before the operation
    // fails with RaceAborted.
    pub optimistic_retry_limit: usize,
}

impl MasstreeConfig {
    /// Total bytes of the page pool.
    #[inline]
    pub fn pool_size<T>(mut self, pool_size: T) -> Self
    where
        Byte: From<T>,
    {
        self.pool_size = Byte::from(pool_size);
        self
    }

    /// Preferred allocation node.
    #[inline]
    pub fn node_hint(mut self, node_hint: usize) -> Self {
        self.node_hint = node_hint;
        self
    }

    /// Bound on optimistic read retries.
    #[inline]
    pub fn optimistic_retry_limit(mut self, optimistic_retry_limit: usize) -> Self {
        assert!(optimistic_retry_limit > 0);
        self.optimistic_retry_limit = optimistic_retry_limit;
        self
    }

    /// Build the page pool this configuration describes, leaked to a
    /// static reference.
    #[inline]
    pub fn build_pool_static(&self) -> Result<&'static FixedPagePool> {
        FixedPagePool::with_capacity_static(self.pool_size.as_u64() as usize, self.node_hint)
    }
}

impl Default for MasstreeConfig {
    #[inline]
    fn default() -> Self {
        MasstreeConfig {
            pool_size: DEFAULT_POOL_SIZE,
            node_hint: DEFAULT_NODE_HINT,
            optimistic_retry_limit: DEFAULT_OPTIMISTIC_RETRY_LIMIT,
        }
    }
}
