mod handlers;
mod housekeeping;


use crate::batch::BatchAggregator;
use crate::config::Config;
use crate::dispatch::{Dispatcher, StreamedTimes};
use crate::pipeline::{DispatchPipeline, RelayStats};
use crate::session::{SessionRegistry, SessionStore};
use crate::vitals::VitalsCache;
use anyhow::Result;
use std::sync::Arc;

/// Owns the four per-patient tables and routes every inbound message to them.
///
/// Each table sits behind its own lock; handlers take one lock at a time and
/// never across network or file I/O.
#[derive(Clone)]
pub struct RelayProcessor {
    registry: Arc<SessionRegistry>,
    vitals: Arc<VitalsCache>,
    aggregator: Arc<BatchAggregator>,
    streamed: Arc<StreamedTimes>,
    pipeline: DispatchPipeline,
    sensor_device_type: Arc<str>,
    stats: Arc<RelayStats>,
}

impl RelayProcessor {
    pub fn new(config: &Config, store: SessionStore) -> Result<Self> {
        let target = config.api_target()?;
        let streamed = Arc::new(StreamedTimes::new());
        let file_sink = config.write_to_file.then(|| config.output_dir.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            target,
            config.request_timeout(),
            file_sink,
            streamed.clone(),
        )?);
        let vitals = Arc::new(VitalsCache::new(config.vitals_ttl_secs));
        let stats = Arc::new(RelayStats::new());
        let pipeline = DispatchPipeline::new(
            dispatcher,
            vitals.clone(),
            &config.data_source,
            config.max_inflight_dispatches,
            stats.clone(),
        );

        Ok(Self {
            registry: Arc::new(SessionRegistry::new(store)),
            vitals,
            aggregator: Arc::new(BatchAggregator::new(config.batch_size)),
            streamed,
            pipeline,
            sensor_device_type: Arc::from(config.sensor_device_type.as_str()),
            stats,
        })
    }

    /// Reloads running sessions persisted by a previous run.
    pub async fn restore(&self) -> Result<usize> {
        let restored = self.registry.restore().await?;
        tracing::info!(patients = restored, "Monitoring {restored} patients");
        Ok(restored)
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Waits for every flushed batch handed to the dispatch pipeline.
    pub async fn settle(&self) {
        self.pipeline.settle().await;
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    #[cfg(test)]
    pub(crate) fn vitals(&self) -> &VitalsCache {
        &self.vitals
    }

    #[cfg(test)]
    pub(crate) fn aggregator(&self) -> &BatchAggregator {
        &self.aggregator
    }

    #[cfg(test)]
    pub(crate) fn streamed(&self) -> &StreamedTimes {
        &self.streamed
    }
}
