use super::error::{BirchError, Result};
use super::types::{FrameId, PageId};

/// Size of a page in bytes (4 KB)
pub const PAGE_SIZE: usize = 4096;

/// Invalid page ID constant
pub const INVALID_PAGE_ID: PageId = PageId(u32::MAX);

/// Invalid frame ID constant
pub const INVALID_FRAME_ID: FrameId = FrameId(u32::MAX);

/// Page holding the index name -> root page id records
pub const HEADER_PAGE_ID: PageId = PageId(0);

/// Default buffer pool size (number of frames)
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 64;

/// Default number of entries per page table bucket
pub const DEFAULT_BUCKET_CAPACITY: usize = 8;

/// Upper bound on the extendible hash directory depth
pub const MAX_GLOBAL_DEPTH: u32 = 24;

/// Smallest leaf capacity that still leaves both halves non-empty after a split
pub const MIN_LEAF_MAX_SIZE: usize = 2;

/// Smallest internal capacity (in children) that can be split into two nodes
pub const MIN_INTERNAL_MAX_SIZE: usize = 3;

/// Buffer pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolConfig {
    /// Number of frames in the pool.
    pub pool_size: usize,
    /// Entries per bucket in the page table.
    pub bucket_capacity: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_BUFFER_POOL_SIZE,
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
        }
    }
}

impl BufferPoolConfig {
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(BirchError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.bucket_capacity == 0 {
            return Err(BirchError::InvalidConfig(
                "bucket_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// B+Tree node capacities. `None` means "as many entries as fit in a page".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BTreeConfig {
    /// Maximum number of key/value pairs in a leaf.
    pub leaf_max_size: Option<usize>,
    /// Maximum number of children of an internal node.
    pub internal_max_size: Option<usize>,
}

impl BTreeConfig {
    pub fn new(leaf_max_size: usize, internal_max_size: usize) -> Self {
        Self {
            leaf_max_size: Some(leaf_max_size),
            internal_max_size: Some(internal_max_size),
        }
    }

    /// Resolves the configured sizes against the page capacities and checks
    /// the lower bounds. Returns `(leaf_max_size, internal_max_size)`.
    pub fn resolve(&self, leaf_capacity: usize, internal_capacity: usize) -> Result<(usize, usize)> {
        let leaf = self.leaf_max_size.unwrap_or(leaf_capacity);
        let internal = self.internal_max_size.unwrap_or(internal_capacity);

        if leaf < MIN_LEAF_MAX_SIZE {
            return Err(BirchError::InvalidConfig(format!(
                "leaf_max_size {} is below {}",
                leaf, MIN_LEAF_MAX_SIZE
            )));
        }
        if internal < MIN_INTERNAL_MAX_SIZE {
            return Err(BirchError::InvalidConfig(format!(
                "internal_max_size {} is below {}",
                internal, MIN_INTERNAL_MAX_SIZE
            )));
        }
        if leaf > leaf_capacity {
            return Err(BirchError::InvalidConfig(format!(
                "leaf_max_size {} does not fit in a page (capacity {})",
                leaf, leaf_capacity
            )));
        }
        if internal > internal_capacity {
            return Err(BirchError::InvalidConfig(format!(
                "internal_max_size {} does not fit in a page (capacity {})",
                internal, internal_capacity
            )));
        }

        Ok((leaf, internal))
    }
}
