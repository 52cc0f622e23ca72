//! Authoritative catalog of live segments per level.
//!
//! The in-memory mirror is a map from level index to an ordered list of
//! segments, newest-first (the most recent flush sits at index 0 of level
//! 0; level-0 segments may overlap in key range, so this order encodes
//! recency for reads).
//!
//! # Persistence
//!
//! Every mutation writes a full snapshot to a monotonically numbered file
//! `MANIFEST-NNNNNN` — the serialized `level -> [segment file names]`
//! mapping — and then atomically repoints the `CURRENT` file at it. On
//! startup, `CURRENT` names the snapshot to load and every listed segment
//! is reopened from disk. A crash between the two writes leaves `CURRENT`
//! pointing at the previous complete snapshot.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::segment::Segment;

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CURRENT_FILE: &str = "CURRENT";
const MANIFEST_PREFIX: &str = "MANIFEST-";

/// Serialized form of one snapshot: level -> relative segment file names.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestSnapshot {
    levels: BTreeMap<u32, Vec<String>>,
}

/// In-memory mirror of the segment catalog plus its snapshot persistence.
///
/// The engine guards the manifest with a multi-reader/single-writer lock;
/// all mutating operations persist a new snapshot before returning.
pub struct Manifest {
    dir: PathBuf,
    levels: BTreeMap<u32, Vec<Arc<Segment>>>,
    next_snapshot: u64,
}

impl Manifest {
    /// Loads the catalog named by `CURRENT`, or initializes an empty one
    /// (writing `MANIFEST-000001` and `CURRENT`) for a fresh directory.
    pub fn open(dir: &Path, config: &Config) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let current = dir.join(CURRENT_FILE);
        if !current.exists() {
            let mut manifest = Self {
                dir: dir.to_path_buf(),
                levels: BTreeMap::new(),
                next_snapshot: 1,
            };
            manifest.persist()?;
            return Ok(manifest);
        }

        let name = fs::read_to_string(&current)?.trim().to_string();
        let number = parse_manifest_number(&name)?;
        let bytes = fs::read(dir.join(&name))?;
        let snapshot: ManifestSnapshot = bincode::deserialize(&bytes)?;

        let mut levels = BTreeMap::new();
        for (level, names) in snapshot.levels {
            let mut segments = Vec::with_capacity(names.len());
            for file_name in names {
                let segment = Segment::open(&dir.join(&file_name), config)?;
                segments.push(Arc::new(segment));
            }
            if !segments.is_empty() {
                levels.insert(level, segments);
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            levels,
            next_snapshot: number + 1,
        })
    }

    /// Snapshot copy of one level's segment list, newest-first.
    pub fn sstables(&self, level: u32) -> Vec<Arc<Segment>> {
        self.levels.get(&level).cloned().unwrap_or_default()
    }

    /// Largest populated level, or `None` when the catalog is empty.
    pub fn max_level(&self) -> Option<u32> {
        self.levels.keys().next_back().copied()
    }

    /// Prepends a segment at the given level (newest-first) and persists.
    pub fn add_sstable(&mut self, level: u32, segment: Arc<Segment>) -> Result<()> {
        self.levels.entry(level).or_default().insert(0, segment);
        self.persist()
    }

    /// Atomically replaces the contents of `source_level` and
    /// `source_level + 1` with `new_tables` at the target level.
    ///
    /// `expected` must be the concatenation of the current source-level list
    /// and the current target-level list — exactly the tables the caller
    /// merged. If either level changed in the meantime (a flush installed a
    /// new level-0 segment mid-merge), nothing is mutated and an error is
    /// returned so the caller can abandon the compaction.
    pub fn replace(
        &mut self,
        source_level: u32,
        expected: &[Arc<Segment>],
        new_tables: Vec<Arc<Segment>>,
    ) -> Result<()> {
        let target_level = source_level + 1;
        let matches = {
            let current: Vec<&Arc<Segment>> = self
                .sstables_ref(source_level)
                .chain(self.sstables_ref(target_level))
                .collect();
            current.len() == expected.len()
                && current
                    .iter()
                    .zip(expected)
                    .all(|(live, merged)| live.path() == merged.path())
        };
        if !matches {
            return Err(Error::InvalidState(format!(
                "levels {source_level}/{target_level} no longer hold the merged tables"
            )));
        }

        self.levels.remove(&source_level);
        self.levels.remove(&target_level);
        if !new_tables.is_empty() {
            self.levels.insert(target_level, new_tables);
        }
        self.persist()
    }

    fn sstables_ref(&self, level: u32) -> impl Iterator<Item = &Arc<Segment>> {
        self.levels.get(&level).into_iter().flatten()
    }

    /// Writes a new numbered snapshot, then repoints `CURRENT` at it.
    fn persist(&mut self) -> Result<()> {
        let snapshot = ManifestSnapshot {
            levels: self
                .levels
                .iter()
                .map(|(&level, segments)| {
                    (level, segments.iter().map(|s| s.file_name()).collect())
                })
                .collect(),
        };

        let name = format!("{MANIFEST_PREFIX}{:06}", self.next_snapshot);
        let bytes = bincode::serialize(&snapshot)?;
        let mut file = File::create(self.dir.join(&name))?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        // CURRENT is switched via rename so readers never observe a partial
        // pointer.
        let tmp = self.dir.join("CURRENT.tmp");
        fs::write(&tmp, &name)?;
        fs::rename(&tmp, self.dir.join(CURRENT_FILE))?;

        self.next_snapshot += 1;
        Ok(())
    }
}

fn parse_manifest_number(name: &str) -> Result<u64> {
    name.strip_prefix(MANIFEST_PREFIX)
        .and_then(|digits| digits.parse::<u64>().ok())
        .ok_or_else(|| Error::Corrupted(format!("malformed manifest name: {name}")))
}
