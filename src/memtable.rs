//! In-memory write buffers: the sorted staging area for recent writes and
//! the handoff queue of sealed buffers awaiting persistence.
//!
//! A [`Memtable`] is a concurrent ordered map from key to value-or-tombstone
//! with a running byte-size estimate. The skip list allows sealed memtables
//! to serve concurrent readers and the flush worker without extra locking;
//! the write path is serialized by the engine's lock on the [`MemtableSet`].
//!
//! A [`MemtableSet`] holds one mutable *active* memtable plus a FIFO queue
//! of sealed, immutable memtables. When the active table exceeds its size
//! threshold it is *rotated*: pushed onto the tail of the flush queue and
//! replaced by a fresh empty table. Reads consult the active table first,
//! then the queue from newest to oldest; the flush worker drains the head,
//! so a key's newest write always lives in a younger table than any of its
//! older writes.

use crossbeam_skiplist::SkipMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Sorted in-memory table mapping keys to values or tombstones (`None`).
#[derive(Debug, Default)]
pub struct Memtable {
    data: SkipMap<Vec<u8>, Option<Vec<u8>>>,
    size: AtomicUsize,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            size: AtomicUsize::new(0),
        }
    }

    /// Inserts or overwrites a key. `None` records a tombstone.
    ///
    /// The size estimate counts key and value bytes (tombstones contribute
    /// key bytes only); an overwrite subtracts the old pair's contribution
    /// before adding the new one. Callers must serialize writers.
    pub fn put(&self, key: Vec<u8>, value: Option<Vec<u8>>) {
        let added = key.len() + value.as_ref().map_or(0, |v| v.len());
        if let Some(old) = self.data.get(&key) {
            let removed = key.len() + old.value().as_ref().map_or(0, |v| v.len());
            self.size.fetch_sub(removed, Ordering::SeqCst);
        }
        self.data.insert(key, value);
        self.size.fetch_add(added, Ordering::SeqCst);
    }

    /// Looks up a key. The outer `Option` distinguishes "not in this table"
    /// from a stored tombstone (`Some(None)`).
    pub fn get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Estimated byte size of the table contents.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterates all entries in ascending key order, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, Option<Vec<u8>>)> + '_ {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
    }
}

/// The active memtable plus the FIFO queue of sealed memtables.
///
/// The set itself carries no lock; the engine guards it with a
/// multi-reader/single-writer lock and takes the writer for `put`, `delete`
/// and rotation.
pub struct MemtableSet {
    active: Arc<Memtable>,
    flush_queue: VecDeque<Arc<Memtable>>,
    threshold_bytes: usize,
}

impl MemtableSet {
    pub fn new(threshold_bytes: usize) -> Self {
        Self {
            active: Arc::new(Memtable::new()),
            flush_queue: VecDeque::new(),
            threshold_bytes,
        }
    }

    /// Applies a write to the active table, rotating it afterwards if it
    /// reached the size threshold.
    pub fn put(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) {
        self.active.put(key, value);
        if self.active.size() >= self.threshold_bytes {
            self.rotate();
        }
    }

    /// Seals the active memtable onto the tail of the flush queue and
    /// installs a fresh empty one.
    pub fn rotate(&mut self) {
        if self.active.is_empty() {
            return;
        }
        let sealed = std::mem::replace(&mut self.active, Arc::new(Memtable::new()));
        self.flush_queue.push_back(sealed);
    }

    /// Looks up a key in the active table, then the sealed tables from
    /// newest to oldest. The first hit (tombstones included) wins.
    pub fn get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        if let Some(entry) = self.active.get(key) {
            return Some(entry);
        }
        for memtable in self.flush_queue.iter().rev() {
            if let Some(entry) = memtable.get(key) {
                return Some(entry);
            }
        }
        None
    }

    /// The oldest sealed memtable, if any, left in place.
    pub fn peek_flushable(&self) -> Option<Arc<Memtable>> {
        self.flush_queue.front().cloned()
    }

    /// Removes and returns the oldest sealed memtable.
    pub fn poll_flushable(&mut self) -> Option<Arc<Memtable>> {
        self.flush_queue.pop_front()
    }

    pub fn flushable_count(&self) -> usize {
        self.flush_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let memtable = Memtable::new();
        memtable.put(b"key1".to_vec(), Some(b"value1".to_vec()));
        memtable.put(b"key2".to_vec(), Some(b"value2".to_vec()));
        memtable.put(b"key3".to_vec(), None);

        assert_eq!(memtable.get(b"key1"), Some(Some(b"value1".to_vec())));
        assert_eq!(memtable.get(b"key2"), Some(Some(b"value2".to_vec())));
        assert_eq!(memtable.get(b"key3"), Some(None));
        assert_eq!(memtable.get(b"key4"), None);
    }

    #[test]
    fn test_size_accounting() {
        let memtable = Memtable::new();
        memtable.put(b"key".to_vec(), Some(b"value".to_vec()));
        assert_eq!(memtable.size(), 8);

        // Overwrite replaces the old contribution instead of accumulating.
        memtable.put(b"key".to_vec(), Some(b"longer-value".to_vec()));
        assert_eq!(memtable.size(), 15);

        // Tombstones count key bytes only.
        memtable.put(b"key".to_vec(), None);
        assert_eq!(memtable.size(), 3);
    }

    #[test]
    fn test_iter_is_sorted() {
        let memtable = Memtable::new();
        memtable.put(b"cherry".to_vec(), Some(b"3".to_vec()));
        memtable.put(b"apple".to_vec(), Some(b"1".to_vec()));
        memtable.put(b"banana".to_vec(), None);

        let keys: Vec<Vec<u8>> = memtable.iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![b"apple".to_vec(), b"banana".to_vec(), b"cherry".to_vec()]
        );
    }

    #[test]
    fn test_rotation_on_threshold() {
        let mut set = MemtableSet::new(16);
        set.put(b"a".to_vec(), Some(b"12345678".to_vec()));
        assert_eq!(set.flushable_count(), 0);

        set.put(b"b".to_vec(), Some(b"12345678".to_vec()));
        assert_eq!(set.flushable_count(), 1);

        // The fresh active table starts empty.
        set.put(b"c".to_vec(), Some(b"x".to_vec()));
        assert_eq!(set.flushable_count(), 1);
        assert_eq!(set.get(b"c"), Some(Some(b"x".to_vec())));
    }

    #[test]
    fn test_read_order_newest_first() {
        let mut set = MemtableSet::new(1024);
        set.put(b"k".to_vec(), Some(b"old".to_vec()));
        set.rotate();
        set.put(b"k".to_vec(), Some(b"mid".to_vec()));
        set.rotate();
        set.put(b"k".to_vec(), Some(b"new".to_vec()));

        // Active shadows sealed; newer sealed shadows older sealed.
        assert_eq!(set.get(b"k"), Some(Some(b"new".to_vec())));

        let mut drained = MemtableSet::new(1024);
        drained.put(b"k".to_vec(), Some(b"old".to_vec()));
        drained.rotate();
        drained.put(b"k".to_vec(), Some(b"new".to_vec()));
        drained.rotate();
        assert_eq!(drained.get(b"k"), Some(Some(b"new".to_vec())));
    }

    #[test]
    fn test_tombstone_shadows_older_value() {
        let mut set = MemtableSet::new(1024);
        set.put(b"k".to_vec(), Some(b"v".to_vec()));
        set.rotate();
        set.put(b"k".to_vec(), None);
        assert_eq!(set.get(b"k"), Some(None));
    }

    #[test]
    fn test_flush_queue_is_fifo() {
        let mut set = MemtableSet::new(1024);
        set.put(b"first".to_vec(), Some(b"1".to_vec()));
        set.rotate();
        set.put(b"second".to_vec(), Some(b"2".to_vec()));
        set.rotate();

        let head = set.peek_flushable().expect("queue should have a head");
        assert_eq!(head.get(b"first"), Some(Some(b"1".to_vec())));

        let polled = set.poll_flushable().expect("poll should return the head");
        assert!(Arc::ptr_eq(&head, &polled));
        let next = set.poll_flushable().expect("second sealed table");
        assert_eq!(next.get(b"second"), Some(Some(b"2".to_vec())));
        assert!(set.poll_flushable().is_none());
    }

    #[test]
    fn test_rotate_empty_active_is_noop() {
        let mut set = MemtableSet::new(1024);
        set.rotate();
        assert_eq!(set.flushable_count(), 0);
    }
}
