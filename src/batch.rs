use crate::telemetry::EcgSample;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// A detached group of ECG samples ready for composition and delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedBatch {
    pub patient_id: String,
    pub samples: Vec<EcgSample>,
    /// `{patient id}-{last packet number}`, carried through to the delivery logs.
    pub trace_id: String,
}

impl FlushedBatch {
    fn new(patient_id: String, samples: Vec<EcgSample>) -> Self {
        let last_packet = samples.last().map(|sample| sample.packet_no).unwrap_or_default();
        let trace_id = format!("{patient_id}-{last_packet}");
        Self {
            patient_id,
            samples,
            trace_id,
        }
    }
}

/// Per-patient pending ECG batches, bounded at `batch_size` samples.
pub struct BatchAggregator {
    batch_size: usize,
    pending: Mutex<HashMap<String, Vec<EcgSample>>>,
}

impl BatchAggregator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Appends a sample and returns a batch when one is ready to flush.
    ///
    /// A discharge sample flushes on its own straight away and leaves any
    /// pending samples for the patient where they are. Otherwise the sample
    /// joins the pending batch, which is detached as soon as it reaches the
    /// batch size.
    pub async fn append(&self, sample: EcgSample) -> Option<FlushedBatch> {
        if sample.discharge {
            let patient_id = sample.patient_id.clone();
            return Some(FlushedBatch::new(patient_id, vec![sample]));
        }

        let patient_id = sample.patient_id.clone();
        let mut pending = self.pending.lock().await;
        let batch = pending
            .entry(patient_id.clone())
            .or_insert_with(|| Vec::with_capacity(self.batch_size));
        tracing::trace!(
            patient = %patient_id,
            packet = sample.packet_no,
            waveform_len = sample.waveform.len(),
            "buffered ECG sample"
        );
        batch.push(sample);
        if batch.len() < self.batch_size {
            return None;
        }

        let samples = pending.remove(&patient_id)?;
        Some(FlushedBatch::new(patient_id, samples))
    }

    /// Drops the pending batch for a patient without flushing it.
    pub async fn discard(&self, patient_id: &str) -> usize {
        self.pending
            .lock()
            .await
            .remove(patient_id)
            .map(|samples| samples.len())
            .unwrap_or(0)
    }

    pub async fn pending_len(&self, patient_id: &str) -> usize {
        self.pending
            .lock()
            .await
            .get(patient_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(patient_id: &str, packet_no: i64) -> EcgSample {
        EcgSample {
            facility_id: "F1".to_string(),
            patient_id: patient_id.to_string(),
            device_id: "D1".to_string(),
            packet_no,
            timestamp: 1_718_000_000 + packet_no,
            rhythm_type: "NSR".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_batch_flushes_once_in_arrival_order() {
        let aggregator = BatchAggregator::new(30);
        let mut flushed = Vec::new();
        for packet in 1..=30 {
            if let Some(batch) = aggregator.append(sample("P1", packet)).await {
                flushed.push(batch);
            }
        }

        assert_eq!(flushed.len(), 1);
        let batch = &flushed[0];
        assert_eq!(batch.patient_id, "P1");
        assert_eq!(batch.trace_id, "P1-30");
        let packets: Vec<i64> = batch.samples.iter().map(|s| s.packet_no).collect();
        assert_eq!(packets, (1..=30).collect::<Vec<_>>());
        assert_eq!(aggregator.pending_len("P1").await, 0);
    }

    #[tokio::test]
    async fn patients_batch_independently() {
        let aggregator = BatchAggregator::new(3);
        assert!(aggregator.append(sample("P1", 1)).await.is_none());
        assert!(aggregator.append(sample("P2", 1)).await.is_none());
        assert!(aggregator.append(sample("P1", 2)).await.is_none());
        let flushed = aggregator.append(sample("P1", 3)).await.expect("flush");
        assert_eq!(flushed.patient_id, "P1");
        assert_eq!(aggregator.pending_len("P2").await, 1);
    }

    #[tokio::test]
    async fn discharge_flushes_alone_and_keeps_pending() {
        let aggregator = BatchAggregator::new(30);
        for packet in 1..=5 {
            assert!(aggregator.append(sample("P1", packet)).await.is_none());
        }

        let mut discharge = sample("P1", 6);
        discharge.discharge = true;
        let flushed = aggregator.append(discharge).await.expect("immediate flush");

        assert_eq!(flushed.samples.len(), 1);
        assert_eq!(flushed.samples[0].packet_no, 6);
        assert_eq!(flushed.trace_id, "P1-6");
        assert_eq!(aggregator.pending_len("P1").await, 5);
    }

    #[tokio::test]
    async fn discard_drops_pending_without_flush() {
        let aggregator = BatchAggregator::new(30);
        for packet in 1..=29 {
            aggregator.append(sample("P1", packet)).await;
        }
        assert_eq!(aggregator.discard("P1").await, 29);
        assert_eq!(aggregator.discard("P1").await, 0);

        // The next sample starts a fresh batch instead of completing the old one.
        assert!(aggregator.append(sample("P1", 30)).await.is_none());
        assert_eq!(aggregator.pending_len("P1").await, 1);
    }
}
