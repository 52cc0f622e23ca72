//! Draining sealed memtables to level-0 segments.

use super::EngineState;
use crate::config::Config;
use crate::error::Result;
use crate::segment::Segment;

use std::sync::Arc;

/// Flushes the oldest sealed memtable, if any, to a level-0 segment.
///
/// The segment is written with no locks held; the writer locks on the
/// memtable set and the manifest (in that order) are only taken to install
/// the segment and pop the queue head. Readers keep finding the keys in the
/// sealed memtable until the manifest install has happened, so there is no
/// window where the data is in neither place. Returns false when the queue
/// was empty.
pub(crate) fn flush_once(state: &EngineState, config: &Config) -> Result<bool> {
    let memtable = {
        let memtables = state.memtables.read()?;
        memtables.peek_flushable()
    };
    let Some(memtable) = memtable else {
        return Ok(false);
    };

    let segment = Segment::from_memtable(&config.data_dir, &memtable, config)?;
    tracing::info!(
        segment = %segment.file_name(),
        bytes = memtable.size(),
        "flushed memtable to level-0 segment"
    );

    let mut memtables = state.memtables.write()?;
    let mut manifest = state.manifest.write()?;
    manifest.add_sstable(0, Arc::new(segment))?;
    let polled = memtables.poll_flushable();
    // Only the flush path pops the queue and its ticks never overlap, so the
    // head must still be the memtable that was just written out.
    debug_assert!(matches!(&polled, Some(polled) if Arc::ptr_eq(polled, &memtable)));
    Ok(true)
}
