//! Background task bindings for the scheduler.

use super::{compaction, flush, EngineState};
use crate::config::Config;
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};

use std::sync::Arc;
use std::time::Duration;

pub(crate) struct FlushTask {
    state: Arc<EngineState>,
    config: Config,
}

impl FlushTask {
    pub(crate) fn new(state: Arc<EngineState>, config: Config) -> Self {
        Self { state, config }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "flush"
    }

    fn interval(&self) -> Duration {
        self.config.flush_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        flush::flush_once(&self.state, &self.config)?;
        Ok(())
    }
}

pub(crate) struct CompactionTask {
    state: Arc<EngineState>,
    config: Config,
}

impl CompactionTask {
    pub(crate) fn new(state: Arc<EngineState>, config: Config) -> Self {
        Self { state, config }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.config.compaction_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        compaction::compact_once(&self.state, &self.config)
    }
}
