use super::db::SessionStore;
use super::types::{Session, SessionStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory view of monitoring sessions, backed by [`SessionStore`].
///
/// The lock only ever guards map access; store writes happen before or after
/// it is taken, never while it is held.
pub struct SessionRegistry {
    store: SessionStore,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Reloads every persisted running session into memory.
    pub async fn restore(&self) -> Result<usize> {
        let running = self.store.load_running().await?;
        let mut sessions = self.sessions.write().await;
        for session in running {
            sessions.insert(session.patient_id.clone(), session);
        }
        Ok(sessions.len())
    }

    pub async fn start(&self, patient_id: &str, facility_id: &str, device_id: &str) -> Result<()> {
        let now = Utc::now();
        self.store
            .start_session(patient_id, facility_id, device_id, now)
            .await?;
        let session = Session::running(patient_id, facility_id, device_id, now);
        self.sessions
            .write()
            .await
            .insert(patient_id.to_string(), session);
        Ok(())
    }

    /// Stops the running session bound to `device_id`. Returns the patient id
    /// when a session matched.
    pub async fn stop_by_device(&self, device_id: &str) -> Result<Option<String>> {
        let patient_id = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .find(|session| session.is_running() && session.device_id == device_id)
                .map(|session| session.patient_id.clone())
        };
        let Some(patient_id) = patient_id else {
            return Ok(None);
        };

        let now = Utc::now();
        self.store.stop_session(&patient_id, now).await?;

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&patient_id) {
            session.status = SessionStatus::Stopped;
            session.end_time = Some(now);
        }
        Ok(Some(patient_id))
    }

    pub async fn is_accepting_telemetry(&self, patient_id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(patient_id)
            .map(Session::is_running)
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub async fn is_known(&self, patient_id: &str) -> bool {
        self.sessions.read().await.contains_key(patient_id)
    }

    /// Drops stopped sessions from memory. Persisted rows are left as they are.
    pub async fn prune_stopped(&self) -> Vec<String> {
        let stopped: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|session| !session.is_running())
                .map(|session| session.patient_id.clone())
                .collect()
        };
        if stopped.is_empty() {
            return stopped;
        }

        let mut sessions = self.sessions.write().await;
        stopped
            .into_iter()
            .filter(|patient_id| {
                // A restart may have landed between the two locks.
                let still_stopped = sessions
                    .get(patient_id)
                    .map(|session| !session.is_running())
                    .unwrap_or(false);
                if still_stopped {
                    sessions.remove(patient_id);
                }
                still_stopped
            })
            .collect()
    }

    /// Persists delivery timestamps, then mirrors them onto the in-memory
    /// sessions once the batch has committed.
    pub async fn record_last_streamed(
        &self,
        updates: &HashMap<String, DateTime<Utc>>,
    ) -> Result<usize> {
        let written = self.store.update_last_streamed(updates).await?;
        if written > 0 {
            let mut sessions = self.sessions.write().await;
            for (patient_id, streamed_at) in updates {
                if let Some(session) = sessions.get_mut(patient_id) {
                    session.last_streamed_time = Some(*streamed_at);
                }
            }
        }
        Ok(written)
    }

    /// Snapshot of the in-memory sessions, ordered by patient id.
    pub async fn sessions(&self) -> Vec<Session> {
        let mut out: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.patient_id.cmp(&b.patient_id));
        out
    }

    #[cfg(test)]
    pub async fn get(&self, patient_id: &str) -> Option<Session> {
        self.sessions.read().await.get(patient_id).cloned()
    }

    #[cfg(test)]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }
}
