use chrono::{DateTime, Utc};

const STATUS_RUNNING: &str = "running";
const STATUS_STOPPED: &str = "stopped";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => STATUS_RUNNING,
            SessionStatus::Stopped => STATUS_STOPPED,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            STATUS_RUNNING => Some(SessionStatus::Running),
            STATUS_STOPPED => Some(SessionStatus::Stopped),
            _ => None,
        }
    }
}

/// A patient's monitoring period, tied to the device that was started for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub patient_id: String,
    pub device_id: String,
    pub facility_id: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_streamed_time: Option<DateTime<Utc>>,
}

impl Session {
    pub fn running(
        patient_id: &str,
        facility_id: &str,
        device_id: &str,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            device_id: device_id.to_string(),
            facility_id: facility_id.to_string(),
            status: SessionStatus::Running,
            start_time,
            end_time: None,
            last_streamed_time: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}
