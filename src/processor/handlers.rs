use super::RelayProcessor;
use crate::control::{SvcAction, SvcStart};
use crate::telemetry::{parse_telemetry_payload, EcgSample, InboundMessage, VitalsReading};
use std::sync::atomic::Ordering;

impl RelayProcessor {
    /// Decodes one telemetry record and hands it to the matching handler.
    ///
    /// Rejected payloads are logged from the buffer as the decoder left it.
    /// Strings are unescaped in place, so escapes may show up resolved.
    pub async fn route_telemetry(&self, payload: &mut [u8]) {
        match parse_telemetry_payload(payload) {
            Ok(Some(InboundMessage::Vitals(reading))) => self.handle_vitals(reading).await,
            Ok(Some(InboundMessage::Ecg(sample))) => self.handle_ecg(sample).await,
            Ok(None) => {
                let raw = String::from_utf8_lossy(payload);
                tracing::warn!(raw = %raw, "unknown telemetry shape; dropping");
            }
            Err(err) => {
                let raw = String::from_utf8_lossy(payload);
                tracing::warn!(error = %err, raw = %raw, "failed to decode telemetry payload");
            }
        }
    }

    pub async fn handle_ecg(&self, sample: EcgSample) {
        // High-rate stream; drops for inactive patients are counted, not logged.
        if !self.registry.is_accepting_telemetry(&sample.patient_id).await {
            self.stats.samples_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.stats.samples_accepted.fetch_add(1, Ordering::Relaxed);

        if let Some(batch) = self.aggregator.append(sample).await {
            self.pipeline.submit(batch).await;
        }
    }

    pub async fn handle_vitals(&self, reading: VitalsReading) {
        if reading.patient_id.is_empty() {
            tracing::debug!(device = %reading.device_id, "vitals reading without patient id");
            return;
        }
        if !self.registry.is_accepting_telemetry(&reading.patient_id).await {
            tracing::info!(
                patient = %reading.patient_id,
                device = %reading.device_id,
                "vitals for inactive patient; caching anyway"
            );
        }
        self.vitals.update(&reading).await;
    }

    pub async fn handle_svc_start(&self, start: SvcStart) {
        if start.device_type != *self.sensor_device_type {
            tracing::debug!(
                patient = %start.patient_id,
                device_type = %start.device_type,
                "ignoring svc_start for other device type"
            );
            return;
        }
        match self
            .registry
            .start(&start.patient_id, &start.facility_id, &start.patch_id)
            .await
        {
            Ok(()) => tracing::info!(
                patient = %start.patient_id,
                device = %start.patch_id,
                facility = %start.facility_id,
                "monitoring session started"
            ),
            Err(err) => {
                tracing::warn!(
                    patient = %start.patient_id,
                    device = %start.patch_id,
                    error = %err,
                    "failed to start monitoring session"
                );
                self.stats.record_error(format!("session start: {err:#}"));
            }
        }
    }

    pub async fn handle_svc_action(&self, action: SvcAction) {
        if !action.is_stop() {
            tracing::debug!(device = %action.patch_id, action = %action.action, "ignoring svc_action");
            return;
        }
        match self.registry.stop_by_device(&action.patch_id).await {
            Ok(Some(patient_id)) => {
                let discarded = self.aggregator.discard(&patient_id).await;
                tracing::info!(
                    patient = %patient_id,
                    device = %action.patch_id,
                    discarded,
                    "monitoring session stopped"
                );
            }
            Ok(None) => {
                tracing::info!(device = %action.patch_id, "stop for device with no running session");
            }
            Err(err) => {
                tracing::warn!(device = %action.patch_id, error = %err, "failed to stop monitoring session");
                self.stats.record_error(format!("session stop: {err:#}"));
            }
        }
    }
}
