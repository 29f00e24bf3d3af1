//! Integration tests for the buffer pool manager

use std::sync::Arc;
use std::thread;

use birchdb::buffer::BufferPoolManager;
use birchdb::common::{BirchError, PageId};
use birchdb::storage::disk::DiskManager;
use tempfile::NamedTempFile;

fn create_bpm(pool_size: usize) -> (BufferPoolManager, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let dm = Arc::new(DiskManager::new(temp_file.path()).unwrap());
    let bpm = BufferPoolManager::new(pool_size, dm);
    (bpm, temp_file)
}

#[test]
fn test_buffer_pool_basic_operations() {
    let (bpm, _temp) = create_bpm(10);

    let page_id = bpm.new_page().unwrap().page_id();
    assert_eq!(page_id, PageId::new(0));

    // Write data to the page
    {
        let mut guard = bpm.fetch_page_write(page_id).unwrap();
        guard.data_mut()[..4].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(guard.is_dirty());
    }

    // Read data back
    {
        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(&guard.data()[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }
    assert_eq!(bpm.get_pin_count(page_id), Some(0));
}

#[test]
fn test_buffer_pool_persistence() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    let page_id;
    let test_data = b"Persistence test data";

    // Write data
    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, dm);

        let mut guard = bpm.new_page().unwrap().write();
        page_id = guard.page_id();
        guard.data_mut()[..test_data.len()].copy_from_slice(test_data);
        drop(guard);

        assert!(bpm.flush_page(page_id).unwrap());
    }

    // Read data back with a new BPM
    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, dm);

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(&guard.data()[..test_data.len()], test_data);
    }
}

#[test]
fn test_buffer_pool_eviction() {
    let (bpm, _temp) = create_bpm(3);

    // Fill the buffer pool
    let mut page_ids = Vec::new();
    for i in 0..3u8 {
        let mut guard = bpm.new_page().unwrap().write();
        guard.data_mut()[0] = i;
        page_ids.push(guard.page_id());
    }

    // All pages should be unpinned now
    for &pid in &page_ids {
        assert_eq!(bpm.get_pin_count(pid), Some(0));
    }
    assert_eq!(bpm.free_frame_count(), 0);
    assert_eq!(bpm.evictable_count(), 3);

    // Creating a new page evicts the least recently unpinned one, page 0
    let new_pid = bpm.new_page().unwrap().page_id();
    assert_eq!(new_pid, PageId::new(3));
    assert_eq!(bpm.get_pin_count(page_ids[0]), None);

    // The evicted page's data was written back
    for (i, &pid) in page_ids.iter().enumerate() {
        let guard = bpm.fetch_page_read(pid).unwrap();
        assert_eq!(guard.data()[0], i as u8);
    }
}

#[test]
fn test_buffer_pool_lru_order_follows_unpin() {
    let (bpm, _temp) = create_bpm(3);
    let ids: Vec<PageId> = (0..3).map(|_| bpm.new_page().unwrap().page_id()).collect();

    // Touch page 0 again so page 1 becomes the oldest unpinned page
    drop(bpm.fetch_page_read(ids[0]).unwrap());

    bpm.new_page().unwrap();
    assert_eq!(bpm.get_pin_count(ids[1]), None);
    assert_eq!(bpm.get_pin_count(ids[0]), Some(0));
    assert_eq!(bpm.get_pin_count(ids[2]), Some(0));
}

#[test]
fn test_buffer_pool_pin_prevents_eviction() {
    let (bpm, _temp) = create_bpm(2);

    // Keep both pages pinned
    let _handle1 = bpm.new_page().unwrap();
    let handle2 = bpm.new_page().unwrap();
    let _guard2 = bpm.fetch_page_read(handle2.page_id()).unwrap();
    assert_eq!(bpm.get_pin_count(handle2.page_id()), Some(2));

    let result = bpm.new_page();
    assert!(matches!(result, Err(BirchError::BufferPoolFull)));
    assert!(BirchError::BufferPoolFull.is_retryable());

    // Releasing one pin is not enough, releasing the other is
    drop(handle2);
    assert!(bpm.new_page().is_err());
    drop(_guard2);
    assert!(bpm.new_page().is_ok());
}

#[test]
fn test_buffer_pool_delete_page() {
    let (bpm, _temp) = create_bpm(10);

    let pid = {
        let mut guard = bpm.new_page().unwrap().write();
        guard.data_mut()[0] = 42;
        guard.page_id()
    };

    assert!(bpm.delete_page(pid).unwrap());
    assert_eq!(bpm.get_pin_count(pid), None);
    assert_eq!(bpm.free_frame_count(), 10);

    // Deleted pages cannot be fetched until reallocated
    assert!(matches!(bpm.fetch_page(pid), Err(BirchError::PageNotFound(_))));
    assert_eq!(bpm.new_page().unwrap().page_id(), pid);
}

#[test]
fn test_buffer_pool_cannot_delete_pinned_page() {
    let (bpm, _temp) = create_bpm(10);

    let handle = bpm.new_page().unwrap();
    let pid = handle.page_id();

    let result = bpm.delete_page(pid);
    assert!(matches!(result, Err(BirchError::PageStillPinned(_))));

    drop(handle);
    assert!(bpm.delete_page(pid).unwrap());
}

#[test]
fn test_buffer_pool_flush_all() {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_path_buf();

    let page_ids;

    // Write data to multiple pages
    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, dm);

        page_ids = (0..5u8)
            .map(|i| {
                let mut guard = bpm.new_page().unwrap().write();
                guard.data_mut()[0] = i;
                guard.page_id()
            })
            .collect::<Vec<_>>();

        let writes_before = bpm.disk_manager().get_num_writes();
        bpm.flush_all_pages().unwrap();
        assert_eq!(bpm.disk_manager().get_num_writes(), writes_before + 5);

        // Nothing is dirty any more
        bpm.flush_all_pages().unwrap();
        assert_eq!(bpm.disk_manager().get_num_writes(), writes_before + 5);
    }

    // Read back with new BPM
    {
        let dm = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = BufferPoolManager::new(10, dm);

        for (i, &pid) in page_ids.iter().enumerate() {
            let guard = bpm.fetch_page_read(pid).unwrap();
            assert_eq!(guard.data()[0], i as u8);
        }
    }
}

#[test]
fn test_buffer_pool_flush_missing_page() {
    let (bpm, _temp) = create_bpm(4);
    assert!(!bpm.flush_page(PageId::new(7)).unwrap());
    assert!(matches!(
        bpm.flush_page(birchdb::common::INVALID_PAGE_ID),
        Err(BirchError::InvalidPageId(_))
    ));
}

#[test]
fn test_buffer_pool_concurrent_access() {
    let (bpm, _temp) = create_bpm(10);
    let bpm = Arc::new(bpm);

    let page_id = bpm.new_page().unwrap().page_id();

    // Writers bump a counter in the page under the exclusive latch
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let bpm = Arc::clone(&bpm);
            thread::spawn(move || {
                for _ in 0..100 {
                    let mut guard = bpm.fetch_page_write(page_id).unwrap();
                    let data = guard.data_mut();
                    let count = u32::from_le_bytes(data[..4].try_into().unwrap());
                    data[..4].copy_from_slice(&(count + 1).to_le_bytes());
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let guard = bpm.fetch_page_read(page_id).unwrap();
    assert_eq!(u32::from_le_bytes(guard.data()[..4].try_into().unwrap()), 400);
    drop(guard);
    assert_eq!(bpm.get_pin_count(page_id), Some(0));
}

#[test]
fn test_buffer_pool_concurrent_eviction() {
    let (bpm, _temp) = create_bpm(8);
    let bpm = Arc::new(bpm);

    let page_ids: Vec<PageId> = (0..32u32)
        .map(|i| {
            let mut guard = bpm.new_page().unwrap().write();
            guard.data_mut()[..4].copy_from_slice(&i.to_le_bytes());
            guard.page_id()
        })
        .collect();
    let page_ids = Arc::new(page_ids);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let bpm = Arc::clone(&bpm);
            let page_ids = Arc::clone(&page_ids);
            thread::spawn(move || {
                for round in 0..200 {
                    let i = (t * 7 + round * 3) % page_ids.len();
                    let guard = bpm.fetch_page_read(page_ids[i]).unwrap();
                    let value = u32::from_le_bytes(guard.data()[..4].try_into().unwrap());
                    assert_eq!(value, i as u32);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_buffer_pool_large_workload() {
    let (bpm, _temp) = create_bpm(5); // Small pool to force evictions

    let page_ids: Vec<_> = (0..20).map(|_| bpm.new_page().unwrap().page_id()).collect();

    for &pid in &page_ids {
        let mut guard = bpm.fetch_page_write(pid).unwrap();
        guard.data_mut()[..4].copy_from_slice(&pid.as_u32().to_le_bytes());
    }

    for &pid in &page_ids {
        let guard = bpm.fetch_page_read(pid).unwrap();
        let id_bytes: [u8; 4] = guard.data()[..4].try_into().unwrap();
        assert_eq!(u32::from_le_bytes(id_bytes), pid.as_u32());
    }
}
