//! Immutable sorted on-disk segments (SSTables).
//!
//! A segment file is a flat sequence of entries, each encoded as
//! `key_len:u32-BE, key, value_len:u32-BE, value` with no header, footer or
//! checksum. A tombstone is an entry with `value_len = 0`. Entries are
//! grouped into *blocks* of at most `block_size` on-disk bytes; an entry
//! that would overflow the current block starts the next one. Point lookups
//! read exactly one block.
//!
//! The block index (`first key of block -> offset/length`), the Bloom
//! filter, and the min/max key bounds live only in memory: opening an
//! existing segment rebuilds all three with a sequential scan using the
//! same block accounting as the writer.

pub mod builder;
pub mod iter;

pub use builder::SortedRunBuilder;
pub use iter::SegmentIterator;

use crate::bloom::BloomFilter;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::memtable::Memtable;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Byte range of one block within a segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub len: u64,
}

/// Process-wide suffix keeping segment file names unique even when two
/// segments are created within the same nanosecond.
static SEGMENT_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_segment_path(dir: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    let seq = SEGMENT_SEQ.fetch_add(1, Ordering::SeqCst);
    dir.join(format!("sstable_{nanos}_{seq}.sst"))
}

/// On-disk size of one encoded entry.
pub(crate) fn encoded_len(key: &[u8], value: Option<&[u8]>) -> u64 {
    (4 + key.len() + 4 + value.map_or(0, <[u8]>::len)) as u64
}

/// Decodes one entry from a reader positioned at an entry boundary.
/// A zero value length decodes as a tombstone (`None`).
pub(crate) fn decode_entry<R: Read>(reader: &mut R) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    let key_len = reader
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Corrupted(format!("entry key length: {e}")))? as usize;
    let mut key = vec![0u8; key_len];
    reader
        .read_exact(&mut key)
        .map_err(|e| Error::Corrupted(format!("entry key bytes: {e}")))?;

    let value_len = reader
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Corrupted(format!("entry value length: {e}")))? as usize;
    let value = if value_len == 0 {
        None
    } else {
        let mut value = vec![0u8; value_len];
        reader
            .read_exact(&mut value)
            .map_err(|e| Error::Corrupted(format!("entry value bytes: {e}")))?;
        Some(value)
    };

    Ok((key, value))
}

/// An immutable sorted key/value file with an in-memory block index and
/// Bloom filter.
pub struct Segment {
    path: PathBuf,
    index: BTreeMap<Vec<u8>, BlockHandle>,
    bloom: BloomFilter,
    min_key: Vec<u8>,
    max_key: Vec<u8>,
}

impl Segment {
    /// Writes a sealed memtable out as a fresh segment.
    pub fn from_memtable(dir: &Path, memtable: &Memtable, config: &Config) -> Result<Segment> {
        let mut writer = SegmentWriter::create(dir, config)?;
        for (key, value) in memtable.iter() {
            writer.append(&key, value.as_deref())?;
        }
        writer.finish()
    }

    /// Opens an existing segment file, rebuilding the block index, Bloom
    /// filter and key bounds by scanning it sequentially.
    pub fn open(path: &Path, config: &Config) -> Result<Segment> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut index = BTreeMap::new();
        let mut bloom = BloomFilter::new(config.bloom_bits, config.bloom_hashes);
        let mut min_key: Option<Vec<u8>> = None;
        let mut max_key: Option<Vec<u8>> = None;

        let mut offset = 0u64;
        let mut block_start = 0u64;
        let mut block_bytes = 0u64;
        let mut first_key_of_block: Option<Vec<u8>> = None;

        while let Some(key_len) = read_u32_or_eof(&mut reader)? {
            let key_len = key_len as usize;
            if key_len == 0 {
                return Err(Error::Corrupted(format!(
                    "zero-length key in {}",
                    path.display()
                )));
            }
            if offset + 4 + key_len as u64 + 4 > file_len {
                return Err(Error::Corrupted(format!(
                    "entry overruns file in {}",
                    path.display()
                )));
            }
            let mut key = vec![0u8; key_len];
            reader
                .read_exact(&mut key)
                .map_err(|e| Error::Corrupted(format!("key bytes in {}: {e}", path.display())))?;

            let value_len = reader
                .read_u32::<BigEndian>()
                .map_err(|e| Error::Corrupted(format!("value length in {}: {e}", path.display())))?
                as usize;
            let pair = 4 + key.len() as u64 + 4 + value_len as u64;
            if offset + pair > file_len {
                return Err(Error::Corrupted(format!(
                    "value overruns file in {}",
                    path.display()
                )));
            }
            if value_len > 0 {
                let mut value = vec![0u8; value_len];
                reader.read_exact(&mut value).map_err(|e| {
                    Error::Corrupted(format!("value bytes in {}: {e}", path.display()))
                })?;
            }

            if let Some(max) = &max_key {
                if key.as_slice() <= max.as_slice() {
                    return Err(Error::Corrupted(format!(
                        "keys out of order in {}",
                        path.display()
                    )));
                }
            }

            if block_bytes > 0 && block_bytes + pair > config.block_size as u64 {
                if let Some(first_key) = first_key_of_block.take() {
                    index.insert(
                        first_key,
                        BlockHandle {
                            offset: block_start,
                            len: offset - block_start,
                        },
                    );
                }
                block_start = offset;
                block_bytes = 0;
            }
            if block_bytes == 0 {
                first_key_of_block = Some(key.clone());
            }

            bloom.add(&key);
            if min_key.is_none() {
                min_key = Some(key.clone());
            }
            max_key = Some(key);
            offset += pair;
            block_bytes += pair;
        }

        if block_bytes > 0 {
            if let Some(first_key) = first_key_of_block.take() {
                index.insert(
                    first_key,
                    BlockHandle {
                        offset: block_start,
                        len: offset - block_start,
                    },
                );
            }
        }

        match (min_key, max_key) {
            (Some(min_key), Some(max_key)) => Ok(Segment {
                path: path.to_path_buf(),
                index,
                bloom,
                min_key,
                max_key,
            }),
            _ => Err(Error::Corrupted(format!(
                "segment {} holds no entries",
                path.display()
            ))),
        }
    }

    /// Point lookup. Returns `None` on a miss, `Some(None)` when the key is
    /// tombstoned here, and `Some(Some(value))` on a live hit.
    ///
    /// Reads exactly one block; never crosses a block boundary.
    pub fn get(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        if key < self.min_key.as_slice() || key > self.max_key.as_slice() {
            return Ok(None);
        }
        if !self.bloom.might_contain(key) {
            return Ok(None);
        }
        let Some((_, handle)) = self
            .index
            .range::<[u8], _>((std::ops::Bound::Unbounded, std::ops::Bound::Included(key)))
            .next_back()
        else {
            return Ok(None);
        };

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(handle.offset))?;
        let mut block = vec![0u8; handle.len as usize];
        file.read_exact(&mut block)?;

        let mut cursor = &block[..];
        while !cursor.is_empty() {
            let (entry_key, entry_value) = decode_entry(&mut cursor)?;
            if entry_key.as_slice() == key {
                return Ok(Some(entry_value));
            }
            if entry_key.as_slice() > key {
                break;
            }
        }
        Ok(None)
    }

    /// Unlinks the segment file. Failing to unlink an existing file is an
    /// error.
    pub fn delete(&self) -> Result<()> {
        fs::remove_file(&self.path)
            .map_err(|e| Error::Io(format!("failed to delete segment {}: {e}", self.path.display())))
    }

    /// Ordered iterator over every physical entry, tombstones included.
    pub fn iter(&self) -> Result<SegmentIterator> {
        SegmentIterator::new(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Relative file name as recorded in the manifest.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn min_key(&self) -> &[u8] {
        &self.min_key
    }

    pub fn max_key(&self) -> &[u8] {
        &self.max_key
    }

    /// Block handles in key order.
    pub(crate) fn block_handles(&self) -> Vec<BlockHandle> {
        self.index.values().copied().collect()
    }
}

/// Reads a big-endian u32, distinguishing a clean end-of-file at an entry
/// boundary (`None`) from a truncated header (corruption).
fn read_u32_or_eof<R: Read>(reader: &mut R) -> Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Corrupted("truncated entry header".to_string()));
        }
        filled += n;
    }
    Ok(Some(u32::from_be_bytes(buf)))
}

/// Streaming writer shared by flush and compaction.
///
/// Entries must be appended in strictly ascending key order; block
/// accounting, the Bloom filter and the key bounds are maintained as each
/// entry lands.
pub struct SegmentWriter {
    file: BufWriter<File>,
    path: PathBuf,
    index: BTreeMap<Vec<u8>, BlockHandle>,
    bloom: BloomFilter,
    min_key: Option<Vec<u8>>,
    max_key: Option<Vec<u8>>,
    block_size: usize,
    offset: u64,
    block_start: u64,
    block_bytes: u64,
    first_key_of_block: Option<Vec<u8>>,
}

impl SegmentWriter {
    /// Creates a freshly named `sstable_<nanos>_<seq>.sst` under `dir`.
    pub fn create(dir: &Path, config: &Config) -> Result<Self> {
        let path = next_segment_path(dir);
        let file = BufWriter::new(File::create(&path)?);
        Ok(Self {
            file,
            path,
            index: BTreeMap::new(),
            bloom: BloomFilter::new(config.bloom_bits, config.bloom_hashes),
            min_key: None,
            max_key: None,
            block_size: config.block_size,
            offset: 0,
            block_start: 0,
            block_bytes: 0,
            first_key_of_block: None,
        })
    }

    pub fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let pair = encoded_len(key, value);

        if self.block_bytes > 0 && self.block_bytes + pair > self.block_size as u64 {
            self.finish_block();
        }
        if self.block_bytes == 0 {
            self.first_key_of_block = Some(key.to_vec());
            self.block_start = self.offset;
        }

        self.file.write_u32::<BigEndian>(key.len() as u32)?;
        self.file.write_all(key)?;
        match value {
            Some(value) => {
                self.file.write_u32::<BigEndian>(value.len() as u32)?;
                self.file.write_all(value)?;
            }
            None => self.file.write_u32::<BigEndian>(0)?,
        }

        self.offset += pair;
        self.block_bytes += pair;
        self.bloom.add(key);
        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.max_key = Some(key.to_vec());
        Ok(())
    }

    /// Total bytes appended so far.
    pub fn bytes_written(&self) -> u64 {
        self.offset
    }

    fn finish_block(&mut self) {
        if let Some(first_key) = self.first_key_of_block.take() {
            self.index.insert(
                first_key,
                BlockHandle {
                    offset: self.block_start,
                    len: self.offset - self.block_start,
                },
            );
        }
        self.block_start = self.offset;
        self.block_bytes = 0;
    }

    /// Finalizes the trailing block, syncs the file and returns the segment.
    pub fn finish(mut self) -> Result<Segment> {
        self.finish_block();
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        match (self.min_key, self.max_key) {
            (Some(min_key), Some(max_key)) => Ok(Segment {
                path: self.path,
                index: self.index,
                bloom: self.bloom,
                min_key,
                max_key,
            }),
            _ => {
                fs::remove_file(&self.path)?;
                Err(Error::InvalidState("segment with no entries".to_string()))
            }
        }
    }
}
