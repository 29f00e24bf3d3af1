use thiserror::Error;

use super::types::{FrameId, PageId};

/// Storage engine error types
#[derive(Error, Debug)]
pub enum BirchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Page {0} not found")]
    PageNotFound(PageId),

    #[error("Frame {0} not found")]
    FrameNotFound(FrameId),

    /// No free frame and nothing evictable: every frame is pinned.
    #[error("Buffer pool is full, no evictable frames available")]
    BufferPoolFull,

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("Page {0} is still pinned")]
    PageStillPinned(PageId),

    #[error("Disk scheduler error: {0}")]
    DiskScheduler(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Header page is full")]
    HeaderPageFull,

    #[error("Index name is too long: {0}")]
    IndexNameTooLong(String),

    #[error("Index record {0} already exists")]
    RecordAlreadyExists(String),

    #[error("Index record {0} not found")]
    RecordNotFound(String),

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),
}

impl BirchError {
    /// Whether the failed operation may succeed if retried after other
    /// holders release their pins.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BirchError::BufferPoolFull)
    }
}

pub type Result<T> = std::result::Result<T, BirchError>;
