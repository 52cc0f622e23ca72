//! Block-by-block forward iteration over a segment.

use super::{decode_entry, Segment};
use crate::error::Result;

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};

/// Single-pass iterator yielding every physical entry of a segment in
/// ascending key order, tombstones included.
///
/// Walks the block index one handle at a time; each block is read from disk
/// as a unit and decoded entry by entry from the in-memory buffer. The file
/// handle is released on drop.
pub struct SegmentIterator {
    file: File,
    blocks: std::vec::IntoIter<super::BlockHandle>,
    current: Option<Cursor<Vec<u8>>>,
}

impl SegmentIterator {
    pub(crate) fn new(segment: &Segment) -> Result<Self> {
        Ok(Self {
            file: File::open(segment.path())?,
            blocks: segment.block_handles().into_iter(),
            current: None,
        })
    }

    /// Loads the next block into memory; false when the index is exhausted.
    fn load_next_block(&mut self) -> Result<bool> {
        let Some(handle) = self.blocks.next() else {
            self.current = None;
            return Ok(false);
        };
        self.file.seek(SeekFrom::Start(handle.offset))?;
        let mut block = vec![0u8; handle.len as usize];
        self.file.read_exact(&mut block)?;
        self.current = Some(Cursor::new(block));
        Ok(true)
    }
}

impl Iterator for SegmentIterator {
    type Item = Result<(Vec<u8>, Option<Vec<u8>>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cursor) = &mut self.current {
                if (cursor.position() as usize) < cursor.get_ref().len() {
                    return Some(decode_entry(cursor));
                }
            }
            match self.load_next_block() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.current = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::segment::SegmentWriter;
    use tempfile::TempDir;

    #[test]
    fn test_iterates_all_entries_in_order() {
        let dir = TempDir::new().expect("temp dir");
        // Tiny blocks so the iterator has to cross block boundaries.
        let config = Config::new(dir.path()).block_size(48);

        let entries: Vec<(String, Option<String>)> = (0..40)
            .map(|i| {
                let value = if i % 5 == 0 {
                    None
                } else {
                    Some(format!("value_{i:02}"))
                };
                (format!("key_{i:02}"), value)
            })
            .collect();

        let mut writer = SegmentWriter::create(dir.path(), &config).expect("create writer");
        for (key, value) in &entries {
            writer
                .append(key.as_bytes(), value.as_deref().map(str::as_bytes))
                .expect("append");
        }
        let segment = writer.finish().expect("finish");

        let decoded: Vec<(Vec<u8>, Option<Vec<u8>>)> = segment
            .iter()
            .expect("iterator")
            .collect::<crate::error::Result<_>>()
            .expect("entries decode");

        assert_eq!(decoded.len(), entries.len());
        for ((key, value), (expected_key, expected_value)) in decoded.iter().zip(&entries) {
            assert_eq!(key, &expected_key.as_bytes().to_vec());
            assert_eq!(
                value,
                &expected_value.as_ref().map(|v| v.as_bytes().to_vec())
            );
        }

        // Ascending key order across every block.
        for pair in decoded.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }

    #[test]
    fn test_single_entry_segment() {
        let dir = TempDir::new().expect("temp dir");
        let config = Config::new(dir.path());
        let mut writer = SegmentWriter::create(dir.path(), &config).expect("create writer");
        writer.append(b"only", Some(b"one")).expect("append");
        let segment = writer.finish().expect("finish");

        let mut iter = segment.iter().expect("iterator");
        let (key, value) = iter.next().expect("first entry").expect("decodes");
        assert_eq!(key, b"only");
        assert_eq!(value, Some(b"one".to_vec()));
        assert!(iter.next().is_none());
    }
}
