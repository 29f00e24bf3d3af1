//! Birchdb - a disk-backed, concurrent B+Tree index and the storage layers
//! beneath it.
//!
//! # Architecture
//!
//! - **Storage** (`storage`): page-granular file I/O
//!   - `DiskManager`: reads, writes, allocates and frees pages of one file
//!   - `DiskScheduler`: background worker serializing disk requests
//!   - `HeaderPage`: page 0, mapping index names to root page ids
//!
//! - **Hashing** (`hash`): `ExtendibleHashTable`, a bucketed directory that
//!   doubles as it grows; the buffer pool's page table
//!
//! - **Buffer Pool** (`buffer`): caches pages in a fixed set of frames
//!   - `BufferPoolManager`: pins, loads, evicts and flushes pages
//!   - `LruReplacer`: picks the least recently unpinned frame to evict
//!   - `ReadPageGuard`/`WritePageGuard`: RAII latch plus pin on one page
//!
//! - **Index** (`index`): `BPlusTree`, generic over fixed-width keys and
//!   values, with latch-crabbing concurrency and an ordered iterator
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use birchdb::buffer::BufferPoolManager;
//! use birchdb::common::BTreeConfig;
//! use birchdb::index::{BPlusTree, OrdComparator};
//! use birchdb::storage::disk::DiskManager;
//!
//! let disk_manager = Arc::new(DiskManager::new("test.db").unwrap());
//! let bpm = Arc::new(BufferPoolManager::new(64, disk_manager));
//!
//! let tree: BPlusTree<i64, i64, _> =
//!     BPlusTree::new("orders", Arc::clone(&bpm), OrdComparator, BTreeConfig::default()).unwrap();
//! tree.insert(42, 4200).unwrap();
//! assert_eq!(tree.get(&42).unwrap(), Some(4200));
//!
//! // Persist the tree; reopening "orders" on this file finds it again
//! bpm.flush_all_pages().unwrap();
//! ```

pub mod buffer;
pub mod common;
pub mod hash;
pub mod index;
pub mod storage;

// Re-export commonly used types at the crate root
pub use common::{BirchError, PageId, RecordId, Result, SlotId};
