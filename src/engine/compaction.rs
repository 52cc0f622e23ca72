//! Bottom-up level compaction.
//!
//! Each pass walks the levels from 0 upward. A level holding more tables
//! than its configured threshold is merged — together with the entire next
//! level — into fresh segments that replace both. The merge runs outside
//! the locks; the manifest `replace` verifies at install time that the
//! levels still hold exactly the merged tables and refuses otherwise, which
//! covers a flush landing a new level-0 segment mid-merge.

use super::EngineState;
use crate::config::Config;
use crate::error::Result;
use crate::segment::{Segment, SortedRunBuilder};

use std::sync::Arc;

/// Runs one compaction pass over all levels.
pub(crate) fn compact_once(state: &EngineState, config: &Config) -> Result<()> {
    let max_level = {
        let manifest = state.manifest.read()?;
        manifest.max_level()
    };
    let Some(max_level) = max_level else {
        return Ok(());
    };

    for level in 0..=max_level {
        let (source, target) = {
            let manifest = state.manifest.read()?;
            let source = manifest.sstables(level);
            if source.len() <= config.level_threshold(level) {
                continue;
            }
            (source, manifest.sstables(level + 1))
        };

        // Merge inputs newest-first: source level in manifest order, then
        // the target level. The builder's tie-break relies on this order.
        let mut expected = source;
        expected.extend(target);

        let mut inputs = Vec::with_capacity(expected.len());
        for segment in &expected {
            inputs.push(segment.iter()?);
        }
        let outputs =
            SortedRunBuilder::new(inputs, config.segment_size, config).run(&config.data_dir)?;
        let new_tables: Vec<Arc<Segment>> = outputs.into_iter().map(Arc::new).collect();

        let mut manifest = state.manifest.write()?;
        if let Err(e) = manifest.replace(level, &expected, new_tables.clone()) {
            // A flush changed level 0 while the merge ran. Drop the fresh
            // outputs and let the next tick retry against current state.
            drop(manifest);
            for segment in &new_tables {
                if let Err(delete_err) = segment.delete() {
                    tracing::warn!(
                        segment = %segment.file_name(),
                        error = %delete_err,
                        "failed to remove abandoned compaction output"
                    );
                }
            }
            tracing::warn!(level, error = %e, "compaction pass abandoned");
            return Ok(());
        }
        for segment in &expected {
            segment.delete()?;
        }
        tracing::info!(
            source_level = level,
            target_level = level + 1,
            merged = expected.len(),
            produced = new_tables.len(),
            "compacted level"
        );
    }

    Ok(())
}
