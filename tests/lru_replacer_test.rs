//! Integration tests for the LRU replacer

use std::sync::Arc;
use std::thread;

use birchdb::buffer::LruReplacer;
use birchdb::common::FrameId;

#[test]
fn test_lru_replacer_eviction_order() {
    let replacer = LruReplacer::new();

    for i in 1..=6 {
        replacer.track(FrameId::new(i));
    }
    assert_eq!(replacer.count(), 6);

    assert_eq!(replacer.select_victim(), Some(FrameId::new(1)));
    assert_eq!(replacer.select_victim(), Some(FrameId::new(2)));
    assert_eq!(replacer.select_victim(), Some(FrameId::new(3)));
    assert_eq!(replacer.count(), 3);
}

#[test]
fn test_lru_replacer_pinned_frames_not_evicted() {
    let replacer = LruReplacer::new();

    for i in 0..4 {
        replacer.track(FrameId::new(i));
    }
    // Pinning a frame takes it out of the replacer
    assert!(replacer.untrack(FrameId::new(0)));
    assert!(replacer.untrack(FrameId::new(2)));
    assert!(!replacer.untrack(FrameId::new(2)));

    assert_eq!(replacer.select_victim(), Some(FrameId::new(1)));
    assert_eq!(replacer.select_victim(), Some(FrameId::new(3)));
    assert_eq!(replacer.select_victim(), None);
}

#[test]
fn test_lru_replacer_unpin_again_refreshes() {
    let replacer = LruReplacer::new();

    replacer.track(FrameId::new(0));
    replacer.track(FrameId::new(1));
    replacer.track(FrameId::new(2));

    // Frame 0 is pinned and unpinned again, making it the newest
    replacer.untrack(FrameId::new(0));
    replacer.track(FrameId::new(0));

    assert_eq!(replacer.select_victim(), Some(FrameId::new(1)));
    assert_eq!(replacer.select_victim(), Some(FrameId::new(2)));
    assert_eq!(replacer.select_victim(), Some(FrameId::new(0)));
}

#[test]
fn test_lru_replacer_duplicate_track_is_single_entry() {
    let replacer = LruReplacer::new();

    replacer.track(FrameId::new(5));
    replacer.track(FrameId::new(5));
    assert_eq!(replacer.count(), 1);
    assert!(replacer.contains(FrameId::new(5)));

    assert_eq!(replacer.select_victim(), Some(FrameId::new(5)));
    assert!(!replacer.contains(FrameId::new(5)));
    assert_eq!(replacer.select_victim(), None);
}

#[test]
fn test_lru_replacer_concurrent_access() {
    let replacer = Arc::new(LruReplacer::new());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let replacer = Arc::clone(&replacer);
            thread::spawn(move || {
                for i in 0..25 {
                    replacer.track(FrameId::new((t * 25 + i) as u32));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(replacer.count(), 100);

    let mut victims: Vec<FrameId> = (0..100).map(|_| replacer.select_victim().unwrap()).collect();
    victims.sort();
    victims.dedup();
    assert_eq!(victims.len(), 100);
    assert_eq!(replacer.count(), 0);
}
