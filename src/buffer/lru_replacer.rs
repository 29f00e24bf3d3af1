use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

/// LRU Replacement Policy
///
/// Every tracked id carries an age counter. Touching an id resets its age to
/// zero and ages every other tracked id by one, so the id with the largest age
/// is the one left untouched the longest. Victim selection is a linear scan,
/// which keeps the bookkeeping a single map instead of a linked list.
///
/// Ties on the maximum age are broken by picking the smallest id.
///
/// In the buffer pool the tracked ids are frames whose pin count dropped to
/// zero; a frame is untracked again as soon as it is pinned.
pub struct LruReplacer<T> {
    /// Age of each tracked id
    ages: Mutex<HashMap<T, u64>>,
}

impl<T> LruReplacer<T>
where
    T: Copy + Eq + Hash + Ord,
{
    /// Creates an empty replacer.
    pub fn new() -> Self {
        Self {
            ages: Mutex::new(HashMap::new()),
        }
    }

    /// Starts tracking `id`, or refreshes it if it is already tracked.
    /// Afterwards `id` is the most recently touched entry.
    pub fn track(&self, id: T) {
        let mut ages = self.ages.lock();

        for (tracked, age) in ages.iter_mut() {
            if *tracked != id {
                *age += 1;
            }
        }
        ages.insert(id, 0);
    }

    /// Removes and returns the least recently touched id.
    /// Returns None if nothing is tracked.
    pub fn select_victim(&self) -> Option<T> {
        let mut ages = self.ages.lock();

        let mut victim: Option<(T, u64)> = None;
        for (&id, &age) in ages.iter() {
            let replace = match victim {
                None => true,
                Some((v_id, v_age)) => age > v_age || (age == v_age && id < v_id),
            };
            if replace {
                victim = Some((id, age));
            }
        }

        let (id, _) = victim?;
        ages.remove(&id);
        Some(id)
    }

    /// Stops tracking `id`. Returns whether it was tracked.
    pub fn untrack(&self, id: T) -> bool {
        self.ages.lock().remove(&id).is_some()
    }

    /// Returns the number of tracked ids.
    pub fn count(&self) -> usize {
        self.ages.lock().len()
    }

    /// Returns whether `id` is currently tracked.
    pub fn contains(&self, id: T) -> bool {
        self.ages.lock().contains_key(&id)
    }
}

impl<T> Default for LruReplacer<T>
where
    T: Copy + Eq + Hash + Ord,
{
    fn default() -> Self {
        Self::new()
    }
}
