use crate::batch::FlushedBatch;
use crate::dispatch::Dispatcher;
use crate::payload::compose;
use crate::vitals::{CachedVitals, VitalsCache};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

#[derive(Debug)]
pub struct RelayStats {
    pub samples_accepted: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub deliveries_ok: AtomicU64,
    pub deliveries_failed: AtomicU64,
    pub inflight_dispatches: AtomicU64,
    pub control_connected: AtomicBool,
    pub telemetry_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            samples_accepted: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            deliveries_ok: AtomicU64::new(0),
            deliveries_failed: AtomicU64::new(0),
            inflight_dispatches: AtomicU64::new(0),
            control_connected: AtomicBool::new(false),
            telemetry_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_control_connected(&self, connected: bool) {
        self.control_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_telemetry_connected(&self, connected: bool) {
        self.telemetry_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    #[cfg(test)]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

/// Runs composition and delivery for flushed batches off the ingest path.
///
/// Each batch gets its own task; a semaphore caps how many of them talk to the
/// clinical API at once. Submitting never waits on that cap.
#[derive(Clone)]
pub struct DispatchPipeline {
    dispatcher: Arc<Dispatcher>,
    vitals: Arc<VitalsCache>,
    data_source: Arc<str>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    stats: Arc<RelayStats>,
}

impl DispatchPipeline {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        vitals: Arc<VitalsCache>,
        data_source: &str,
        max_inflight: usize,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            dispatcher,
            vitals,
            data_source: Arc::from(data_source),
            permits: Arc::new(Semaphore::new(max_inflight.max(1))),
            tracker: TaskTracker::new(),
            stats,
        }
    }

    /// Snapshots the patient's vitals at flush time, then spawns delivery.
    /// Only the spawned task waits for a dispatch permit.
    pub async fn submit(&self, batch: FlushedBatch) {
        self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
        let vitals = self.vitals.read(&batch.patient_id).await;
        tracing::debug!(
            trace_id = %batch.trace_id,
            patient = %batch.patient_id,
            samples = batch.samples.len(),
            "batch flushed"
        );
        let pipeline = self.clone();
        self.tracker.spawn(async move {
            let Ok(_permit) = pipeline.permits.clone().acquire_owned().await else {
                return;
            };
            pipeline.process(batch, vitals).await;
        });
    }

    async fn process(&self, batch: FlushedBatch, vitals: Option<CachedVitals>) {
        let Some(payload) = compose(&batch, vitals.as_ref(), &self.data_source) else {
            tracing::debug!(
                trace_id = %batch.trace_id,
                patient = %batch.patient_id,
                "no sample carried a facility id; nothing to send"
            );
            return;
        };

        self.stats.inflight_dispatches.fetch_add(1, Ordering::Relaxed);
        let delivered = self
            .dispatcher
            .deliver(&batch.patient_id, &payload, &batch.trace_id)
            .await;
        self.stats.inflight_dispatches.fetch_sub(1, Ordering::Relaxed);

        if delivered {
            self.stats.deliveries_ok.fetch_add(1, Ordering::Relaxed);
            self.stats.clear_error();
        } else {
            self.stats.deliveries_failed.fetch_add(1, Ordering::Relaxed);
            self.stats
                .record_error(format!("delivery failed for {}", batch.trace_id));
        }
    }

    /// Waits until every submitted batch has finished delivering.
    pub async fn settle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
