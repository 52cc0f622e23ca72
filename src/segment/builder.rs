//! k-way merge of sorted segments into one or more size-bounded outputs.
//!
//! The heap merges all input iterators in ascending key order. When several
//! inputs carry the same key, the entry from the input with the smallest
//! index pops first and wins; later pops of that key are stale duplicates
//! and are discarded. Tombstones are carried through the merge like any
//! other entry so they keep shadowing older copies of the key that may
//! still live in deeper levels.

use super::{encoded_len, Segment, SegmentIterator, SegmentWriter};
use crate::config::Config;
use crate::error::Result;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;

/// Heap entry tagged with the index of the iterator it came from.
struct HeapEntry {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    input: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.input == other.input
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap pops the greatest entry, so key order is reversed to pop
    // the smallest key first. Equal keys pop the smallest input index first:
    // that entry is the newest version of the key.
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => other.input.cmp(&self.input),
            ord => ord.reverse(),
        }
    }
}

/// Merges input segments into new segments no larger than a target size.
///
/// Inputs must be ordered newest-first: for a level-`n` compaction that is
/// the level-`n` tables in manifest order (most recent flush first)
/// followed by the level-`n+1` tables. The tie-break on input index is what
/// encodes temporal order, so level-0 entries shadow target-level entries
/// and newer level-0 segments shadow older ones.
pub struct SortedRunBuilder<'a> {
    inputs: Vec<SegmentIterator>,
    target_size: u64,
    config: &'a Config,
}

impl<'a> SortedRunBuilder<'a> {
    pub fn new(inputs: Vec<SegmentIterator>, target_size: u64, config: &'a Config) -> Self {
        Self {
            inputs,
            target_size,
            config,
        }
    }

    /// Runs the merge to completion, writing outputs under `dir`.
    pub fn run(mut self, dir: &Path) -> Result<Vec<Segment>> {
        let mut heap = BinaryHeap::new();
        for (input, iter) in self.inputs.iter_mut().enumerate() {
            if let Some(entry) = iter.next() {
                let (key, value) = entry?;
                heap.push(HeapEntry { key, value, input });
            }
        }

        let mut outputs = Vec::new();
        let mut writer: Option<SegmentWriter> = None;
        let mut last_key: Option<Vec<u8>> = None;

        while let Some(HeapEntry { key, value, input }) = heap.pop() {
            if last_key.as_deref() != Some(key.as_slice()) {
                let entry_size = encoded_len(&key, value.as_deref());

                // Split before the entry that would push the current output
                // past the target size.
                if let Some(current) = writer.take() {
                    if current.bytes_written() + entry_size > self.target_size {
                        outputs.push(current.finish()?);
                    } else {
                        writer = Some(current);
                    }
                }
                if writer.is_none() {
                    writer = Some(SegmentWriter::create(dir, self.config)?);
                }
                if let Some(current) = writer.as_mut() {
                    current.append(&key, value.as_deref())?;
                }
                last_key = Some(key);
            }

            if let Some(entry) = self.inputs[input].next() {
                let (key, value) = entry?;
                heap.push(HeapEntry { key, value, input });
            }
        }

        if let Some(current) = writer {
            outputs.push(current.finish()?);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as DbResult;
    use tempfile::TempDir;

    fn build_segment(
        dir: &TempDir,
        config: &Config,
        entries: &[(&str, Option<&str>)],
    ) -> Segment {
        let mut writer = SegmentWriter::create(dir.path(), config).expect("create writer");
        for (key, value) in entries {
            writer
                .append(key.as_bytes(), value.map(str::as_bytes))
                .expect("append");
        }
        writer.finish().expect("finish")
    }

    fn merge(
        dir: &TempDir,
        config: &Config,
        inputs: &[&Segment],
        target_size: u64,
    ) -> Vec<Segment> {
        let iters = inputs
            .iter()
            .map(|segment| segment.iter())
            .collect::<DbResult<Vec<_>>>()
            .expect("input iterators");
        SortedRunBuilder::new(iters, target_size, config)
            .run(dir.path())
            .expect("merge")
    }

    fn collect(segments: &[Segment]) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        segments
            .iter()
            .flat_map(|segment| {
                segment
                    .iter()
                    .expect("iterator")
                    .collect::<DbResult<Vec<_>>>()
                    .expect("entries")
            })
            .collect()
    }

    #[test]
    fn test_merge_disjoint_inputs() {
        let dir = TempDir::new().expect("temp dir");
        let config = Config::new(dir.path());
        let left = build_segment(&dir, &config, &[("a", Some("1")), ("c", Some("3"))]);
        let right = build_segment(&dir, &config, &[("b", Some("2")), ("d", Some("4"))]);

        let outputs = merge(&dir, &config, &[&left, &right], u64::MAX);
        assert_eq!(outputs.len(), 1);

        let entries = collect(&outputs);
        let keys: Vec<&[u8]> = entries.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"a" as &[u8], b"b", b"c", b"d"]);
    }

    #[test]
    fn test_newest_input_wins_ties() {
        let dir = TempDir::new().expect("temp dir");
        let config = Config::new(dir.path());
        // Input 0 is the newer source and must win for the shared key.
        let newer = build_segment(&dir, &config, &[("k", Some("new")), ("x", Some("1"))]);
        let older = build_segment(&dir, &config, &[("k", Some("old")), ("y", Some("2"))]);

        let outputs = merge(&dir, &config, &[&newer, &older], u64::MAX);
        let entries = collect(&outputs);

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], (b"k".to_vec(), Some(b"new".to_vec())));
    }

    #[test]
    fn test_newer_level0_shadows_older_level0() {
        let dir = TempDir::new().expect("temp dir");
        let config = Config::new(dir.path());
        let newest = build_segment(&dir, &config, &[("k", Some("v3"))]);
        let middle = build_segment(&dir, &config, &[("k", Some("v2"))]);
        let oldest = build_segment(&dir, &config, &[("k", Some("v1"))]);

        let outputs = merge(&dir, &config, &[&newest, &middle, &oldest], u64::MAX);
        let entries = collect(&outputs);
        assert_eq!(entries, vec![(b"k".to_vec(), Some(b"v3".to_vec()))]);
    }

    #[test]
    fn test_tombstones_survive_merge() {
        let dir = TempDir::new().expect("temp dir");
        let config = Config::new(dir.path());
        let newer = build_segment(&dir, &config, &[("doomed", None)]);
        let older = build_segment(&dir, &config, &[("doomed", Some("value"))]);

        let outputs = merge(&dir, &config, &[&newer, &older], u64::MAX);
        let entries = collect(&outputs);
        assert_eq!(entries, vec![(b"doomed".to_vec(), None)]);
    }

    #[test]
    fn test_output_split_by_target_size() {
        let dir = TempDir::new().expect("temp dir");
        let config = Config::new(dir.path());

        let entries: Vec<(String, Option<String>)> = (0..50)
            .map(|i| (format!("key_{i:03}"), Some(format!("value_{i:03}"))))
            .collect();
        let refs: Vec<(&str, Option<&str>)> = entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_deref()))
            .collect();
        let input = build_segment(&dir, &config, &refs);

        // Each entry encodes to 24 bytes; a 100-byte target forces splits.
        let outputs = merge(&dir, &config, &[&input], 100);
        assert!(outputs.len() > 1, "expected multiple outputs");

        let merged = collect(&outputs);
        assert_eq!(merged.len(), entries.len());

        // Outputs are contiguous, ordered and within the size bound.
        let mut previous_max: Option<Vec<u8>> = None;
        for segment in &outputs {
            if let Some(prev) = &previous_max {
                assert!(segment.min_key() > prev.as_slice());
            }
            previous_max = Some(segment.max_key().to_vec());
            let size = std::fs::metadata(segment.path()).expect("metadata").len();
            assert!(size <= 100, "output larger than target: {size}");
        }
    }

    #[test]
    fn test_duplicate_suppressed_across_split_boundary() {
        let dir = TempDir::new().expect("temp dir");
        let config = Config::new(dir.path());
        let newer = build_segment(
            &dir,
            &config,
            &[("a", Some("1")), ("b", Some("fresh")), ("c", Some("3"))],
        );
        let older = build_segment(&dir, &config, &[("b", Some("stale")), ("d", Some("4"))]);

        // Target small enough that outputs split around "b".
        let outputs = merge(&dir, &config, &[&newer, &older], 24);
        let merged = collect(&outputs);

        let b_entries: Vec<_> = merged.iter().filter(|(k, _)| k == b"b").collect();
        assert_eq!(b_entries.len(), 1);
        assert_eq!(b_entries[0].1, Some(b"fresh".to_vec()));
        assert_eq!(merged.len(), 4);
    }
}
