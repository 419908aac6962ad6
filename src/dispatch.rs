use crate::config::ApiTarget;
use crate::payload::OutboundPayload;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("clinical API returned non-success status {0}")]
    Status(StatusCode),
    #[error("clinical API request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Patients with a successful delivery since the last housekeeping drain.
#[derive(Debug, Default)]
pub struct StreamedTimes {
    pending: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl StreamedTimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, patient_id: &str, at: DateTime<Utc>) {
        self.pending.lock().await.insert(patient_id.to_string(), at);
    }

    /// Takes every pending entry, leaving the set empty.
    pub async fn drain(&self) -> HashMap<String, DateTime<Utc>> {
        std::mem::take(&mut *self.pending.lock().await)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

pub struct Dispatcher {
    client: Client,
    target: ApiTarget,
    file_sink: Option<PathBuf>,
    streamed: Arc<StreamedTimes>,
}

impl Dispatcher {
    pub fn new(
        target: ApiTarget,
        timeout: Duration,
        file_sink: Option<PathBuf>,
        streamed: Arc<StreamedTimes>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build clinical API client")?;
        Ok(Self {
            client,
            target,
            file_sink,
            streamed,
        })
    }

    /// Sends the payload to the API and, when enabled, the file sink. The two
    /// run side by side; a failure in one does not affect the other. Returns
    /// whether the API accepted the record.
    pub async fn deliver(
        &self,
        patient_id: &str,
        payload: &OutboundPayload,
        trace_id: &str,
    ) -> bool {
        let file_write = async {
            let Some(dir) = self.file_sink.as_deref() else {
                return;
            };
            let written =
                write_to_file(dir, patient_id, &payload.patch_id, payload.timestamp, payload).await;
            if let Err(err) = written {
                tracing::warn!(
                    trace_id,
                    patient = %patient_id,
                    error = %format!("{err:#}"),
                    "failed to write payload file"
                );
            }
        };
        let (_, sent) = tokio::join!(file_write, self.send_to_api(patient_id, payload, trace_id));
        sent.is_ok()
    }

    /// One authenticated POST, no retry. A success marks the patient as
    /// streamed for the next housekeeping pass.
    pub async fn send_to_api(
        &self,
        patient_id: &str,
        payload: &OutboundPayload,
        trace_id: &str,
    ) -> Result<StatusCode, DeliveryError> {
        let result = self
            .client
            .post(&self.target.endpoint)
            .bearer_auth(&self.target.api_key)
            .json(payload)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    trace_id,
                    patient = %patient_id,
                    error = %err,
                    "error sending batch to clinical API"
                );
                return Err(err.into());
            }
        };

        let status = response.status();
        if status.as_u16() >= 300 {
            tracing::warn!(
                trace_id,
                patient = %patient_id,
                status = %status,
                "clinical API returned non-success status"
            );
            return Err(DeliveryError::Status(status));
        }

        tracing::info!(
            trace_id,
            patient = %patient_id,
            status = %status,
            "sent batch to clinical API"
        );
        self.streamed.record(patient_id, Utc::now()).await;
        Ok(status)
    }
}

/// Writes the pretty-printed payload to `<dir>/<patient>/<device>_<timestamp>.json`.
pub async fn write_to_file(
    dir: &Path,
    patient_id: &str,
    device_id: &str,
    timestamp: i64,
    payload: &OutboundPayload,
) -> Result<PathBuf> {
    let patient_dir = dir.join(patient_id);
    tokio::fs::create_dir_all(&patient_dir)
        .await
        .with_context(|| format!("create {}", patient_dir.display()))?;
    let path = patient_dir.join(format!("{device_id}_{timestamp}.json"));
    let body = serde_json::to_vec_pretty(payload).context("encode payload")?;
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
