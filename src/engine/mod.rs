//! The engine facade: put/get/delete dispatch across the memtable set and
//! the leveled segments, plus lifecycle of the background workers.
//!
//! # Locking
//!
//! Two multi-reader/single-writer locks guard all shared state: one on the
//! memtable set, one on the manifest. When both are needed they are taken
//! in that order, never the reverse.
//!
//! - `put`/`delete` take the memtable-set writer.
//! - `get` takes the memtable-set reader and releases it before taking the
//!   manifest reader.
//! - Flush takes the memtable-set writer then the manifest writer, but only
//!   to install an already-written segment.
//! - Compaction takes the manifest writer, only to swap the level lists.
//!
//! Writes to the same key are ordered by the memtable-set writer lock; the
//! later write wins. Shadowing across tiers holds because flush installs a
//! segment before removing its memtable from the queue, and compaction's
//! `replace` is atomic under the manifest writer lock.

mod compaction;
mod flush;
mod tasks;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::memtable::MemtableSet;
use crate::scheduler::Scheduler;

use std::fs;
use std::sync::{Arc, Mutex, RwLock};

/// Shared mutable state reachable from foreground calls and background
/// tasks.
pub(crate) struct EngineState {
    pub(crate) memtables: RwLock<MemtableSet>,
    pub(crate) manifest: RwLock<Manifest>,
}

/// An embedded LSM key-value store rooted at one data directory.
pub struct Engine {
    config: Config,
    pub(crate) state: Arc<EngineState>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl Engine {
    /// Opens the store, creating the data directory if needed and reloading
    /// the segment catalog named by the manifest's `CURRENT` pointer.
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let manifest = Manifest::open(&config.data_dir, &config)?;
        let memtables = MemtableSet::new(config.memtable_threshold_bytes);

        Ok(Self {
            state: Arc::new(EngineState {
                memtables: RwLock::new(memtables),
                manifest: RwLock::new(manifest),
            }),
            config,
            scheduler: Mutex::new(None),
        })
    }

    /// Spawns the flush and compaction workers. Requires a tokio runtime;
    /// calling twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut scheduler = self.scheduler.lock()?;
        if scheduler.is_some() {
            return Ok(());
        }
        let fresh = Scheduler::new();
        fresh.register(Arc::new(tasks::FlushTask::new(
            self.state.clone(),
            self.config.clone(),
        )));
        fresh.register(Arc::new(tasks::CompactionTask::new(
            self.state.clone(),
            self.config.clone(),
        )));
        *scheduler = Some(fresh);
        Ok(())
    }

    /// Stops the background workers, awaiting in-flight ticks up to the
    /// configured shutdown timeout.
    pub async fn stop(&self) -> Result<()> {
        let scheduler = self.scheduler.lock()?.take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown(self.config.shutdown_timeout).await?;
        }
        Ok(())
    }

    /// Stores a value. The write is durable after the next flush.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("empty key".to_string()));
        }
        if value.is_empty() {
            // The on-disk format cannot tell an empty value from a
            // tombstone, so empty values are refused up front.
            return Err(Error::InvalidInput("empty value".to_string()));
        }
        self.state
            .memtables
            .write()?
            .put(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    /// Deletes a key by writing a tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("empty key".to_string()));
        }
        self.state.memtables.write()?.put(key.to_vec(), None);
        Ok(())
    }

    /// Looks up a key: the memtable set first, then segments level by level
    /// and newest-first within a level. The first hit wins; a tombstone hit
    /// reports absence.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.is_empty() {
            return Err(Error::InvalidInput("empty key".to_string()));
        }

        {
            let memtables = self.state.memtables.read()?;
            if let Some(entry) = memtables.get(key) {
                return Ok(entry);
            }
        }

        let manifest = self.state.manifest.read()?;
        let Some(max_level) = manifest.max_level() else {
            return Ok(None);
        };
        for level in 0..=max_level {
            for segment in manifest.sstables(level) {
                if let Some(entry) = segment.get(key)? {
                    return Ok(entry);
                }
            }
        }
        Ok(None)
    }

    /// Seals the active memtable regardless of its size.
    pub fn rotate_memtable(&self) -> Result<()> {
        self.state.memtables.write()?.rotate();
        Ok(())
    }

    /// Drains one sealed memtable to a level-0 segment. Returns false when
    /// there was nothing to flush.
    pub fn flush(&self) -> Result<bool> {
        flush::flush_once(&self.state, &self.config)
    }

    /// Runs one compaction pass over all levels.
    pub fn compact(&self) -> Result<()> {
        compaction::compact_once(&self.state, &self.config)
    }
}
