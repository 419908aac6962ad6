use super::RelayProcessor;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RULE_WIDTH: usize = 66;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientLine {
    pub patient_id: String,
    pub device_id: String,
    /// Delivered at least once since the previous tick.
    pub streaming: bool,
    /// Device id of a cached vitals entry that survived eviction.
    pub vitals_device: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub patients: Vec<PatientLine>,
    pub pruned: Vec<String>,
    pub evicted_devices: Vec<String>,
    pub streamed_rows: usize,
    pub persist_error: Option<String>,
    pub deliveries_ok: u64,
    pub deliveries_failed: u64,
    pub inflight_dispatches: u64,
    pub samples_dropped: u64,
    pub control_connected: bool,
    pub telemetry_connected: bool,
}

impl fmt::Display for HousekeepingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "--- Housekeeping Report ---")?;
        writeln!(
            f,
            "{:<15} | {:<15} | {:<10} | {:<18}",
            "Patient", "Device ID", "Streaming?", "Recent Vital Device?"
        )?;
        writeln!(f, "{}", "-".repeat(RULE_WIDTH))?;
        if self.patients.is_empty() {
            writeln!(f, "No active patients being monitored.")?;
        }
        for line in &self.patients {
            writeln!(
                f,
                "{:<15} | {:<15} | {:<10} | {:<18}",
                line.patient_id,
                line.device_id,
                line.streaming,
                line.vitals_device.as_deref().unwrap_or("none")
            )?;
        }
        if !self.pruned.is_empty() {
            writeln!(
                f,
                "Pruned {} stopped patient(s) from memory.",
                self.pruned.len()
            )?;
        }
        let cleared = if self.evicted_devices.is_empty() {
            "none".to_string()
        } else {
            format!("[{}]", self.evicted_devices.join(", "))
        };
        writeln!(
            f,
            "Stale vitals entries cleared ({}): {}",
            self.evicted_devices.len(),
            cleared
        )?;
        match &self.persist_error {
            Some(err) => writeln!(f, "Last-streamed update failed: {err}")?,
            None => writeln!(f, "Last-streamed rows updated: {}", self.streamed_rows)?,
        }
        writeln!(
            f,
            "Deliveries ok/failed/in flight: {}/{}/{}, ECG samples dropped: {}",
            self.deliveries_ok,
            self.deliveries_failed,
            self.inflight_dispatches,
            self.samples_dropped
        )?;
        writeln!(
            f,
            "MQTT connected: control={} telemetry={}",
            self.control_connected, self.telemetry_connected
        )?;
        write!(f, "{}", "-".repeat(RULE_WIDTH))
    }
}

impl RelayProcessor {
    /// One reconciliation pass: prune stopped sessions, persist delivery
    /// times, evict stale vitals, then summarise what is left.
    pub async fn housekeeping_tick(&self, now: DateTime<Utc>) -> HousekeepingReport {
        let pruned = self.registry.prune_stopped().await;

        let updates = self.streamed.drain().await;
        let mut streamed_rows = 0;
        let mut persist_error = None;
        if !updates.is_empty() {
            match self.registry.record_last_streamed(&updates).await {
                Ok(rows) => {
                    streamed_rows = rows;
                    tracing::debug!(rows, "updated last streamed time");
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to persist last streamed times");
                    self.stats.record_error(format!("last streamed update: {err:#}"));
                    persist_error = Some(format!("{err:#}"));
                }
            }
        }

        let eviction = self.vitals.evict_stale(now).await;

        let patients = self
            .registry
            .sessions()
            .await
            .into_iter()
            .map(|session| PatientLine {
                streaming: updates.contains_key(&session.patient_id),
                vitals_device: eviction.fresh.get(&session.patient_id).cloned(),
                patient_id: session.patient_id,
                device_id: session.device_id,
            })
            .collect();

        HousekeepingReport {
            patients,
            pruned,
            evicted_devices: eviction
                .evicted_device_ids()
                .into_iter()
                .map(str::to_string)
                .collect(),
            streamed_rows,
            persist_error,
            deliveries_ok: self.stats.deliveries_ok.load(Ordering::Relaxed),
            deliveries_failed: self.stats.deliveries_failed.load(Ordering::Relaxed),
            inflight_dispatches: self.stats.inflight_dispatches.load(Ordering::Relaxed),
            samples_dropped: self.stats.samples_dropped.load(Ordering::Relaxed),
            control_connected: self.stats.control_connected.load(Ordering::Relaxed),
            telemetry_connected: self.stats.telemetry_connected.load(Ordering::Relaxed),
        }
    }

    pub async fn run_housekeeping(&self, interval: Duration, cancel: CancellationToken) {
        tracing::info!(interval_secs = interval.as_secs(), "housekeeping loop started");
        let mut ticker = tokio::time::interval(interval);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("housekeeping loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.housekeeping_tick(Utc::now()).await;
                    tracing::info!("{report}");
                }
            }
        }
    }
}
