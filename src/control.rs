use serde::Deserialize;

pub const ACTION_STOP: &str = "stop";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SvcStart {
    pub patch_id: String,
    pub facility_id: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub provider_id: String,
    pub patient_id: String,
    #[serde(default)]
    pub device_type: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SvcAction {
    pub patch_id: String,
    pub action: String,
}

impl SvcAction {
    pub fn is_stop(&self) -> bool {
        self.action == ACTION_STOP
    }
}

pub fn parse_svc_start(payload: &[u8]) -> Option<SvcStart> {
    match serde_json::from_slice::<SvcStart>(payload) {
        Ok(start) => Some(start),
        Err(err) => {
            tracing::warn!(
                error = %err,
                raw = %String::from_utf8_lossy(payload),
                "failed to decode svc_start payload"
            );
            None
        }
    }
}

pub fn parse_svc_action(payload: &[u8]) -> Option<SvcAction> {
    match serde_json::from_slice::<SvcAction>(payload) {
        Ok(action) => Some(action),
        Err(err) => {
            tracing::warn!(
                error = %err,
                raw = %String::from_utf8_lossy(payload),
                "failed to decode svc_action payload"
            );
            None
        }
    }
}
