use crate::batch::FlushedBatch;
use crate::vitals::{BloodPressure, CachedVitals, VitalSign};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

pub const BIOSENSOR_STATUS_CONNECTED: &str = "Connected";

fn is_zero(value: &i64) -> bool {
    *value == 0
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutboundPayload {
    #[serde(rename = "deviceType")]
    pub device_type: String,
    #[serde(rename = "patientRef")]
    pub patient_ref: String,
    #[serde(rename = "FacilityId")]
    pub facility_id: String,
    #[serde(rename = "PatchId")]
    pub patch_id: String,
    #[serde(rename = "PatientName")]
    pub patient_name: String,
    #[serde(rename = "TimeStamp")]
    pub timestamp: i64,
    #[serde(rename = "BedId")]
    pub bed_id: String,
    #[serde(rename = "Gender")]
    pub gender: String,
    #[serde(rename = "Age")]
    pub age: i64,
    #[serde(rename = "BiosensorStatus")]
    pub biosensor_status: String,
    #[serde(rename = "source")]
    pub source: String,
    #[serde(rename = "SensorData")]
    pub sensor_data: Vec<SensorDataItem>,
    #[serde(rename = "SPO2")]
    pub spo2: OutboundVitalSign,
    #[serde(rename = "PR")]
    pub pulse_rate: OutboundVitalSign,
    #[serde(rename = "BP")]
    pub bp: OutboundBloodPressure,
    #[serde(rename = "ArrythmiaData")]
    pub arrhythmia_data: Vec<ArrhythmiaItem>,
    #[serde(rename = "ews")]
    pub ews: JsonValue,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SensorDataItem {
    #[serde(rename = "SEQ")]
    pub seq: i64,
    #[serde(rename = "TimeStamp")]
    pub timestamp: i64,
    #[serde(rename = "HR")]
    pub heart_rate: i64,
    #[serde(rename = "rhythmType")]
    pub rhythm_type: String,
    #[serde(rename = "RR")]
    pub respiration_rate: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct OutboundVitalSign {
    #[serde(rename = "IsValid")]
    pub is_valid: bool,
    #[serde(rename = "Value", skip_serializing_if = "is_zero")]
    pub value: i64,
    #[serde(rename = "TimeStamp", skip_serializing_if = "is_zero")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct OutboundBloodPressure {
    #[serde(rename = "IsValid")]
    pub is_valid: bool,
    #[serde(rename = "Sys", skip_serializing_if = "is_zero")]
    pub systolic: i64,
    #[serde(rename = "Dia", skip_serializing_if = "is_zero")]
    pub diastolic: i64,
    #[serde(rename = "TimeStamp", skip_serializing_if = "is_zero")]
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ArrhythmiaItem {
    #[serde(rename = "rhythmType")]
    pub rhythm_type: String,
}

impl From<VitalSign> for OutboundVitalSign {
    fn from(sign: VitalSign) -> Self {
        Self {
            is_valid: sign.valid,
            value: sign.value,
            timestamp: sign.timestamp,
        }
    }
}

impl From<BloodPressure> for OutboundBloodPressure {
    fn from(bp: BloodPressure) -> Self {
        Self {
            is_valid: bp.valid,
            systolic: bp.systolic,
            diastolic: bp.diastolic,
            timestamp: bp.timestamp,
        }
    }
}

/// Early-warning-score block. Always attached, never computed.
fn ews_placeholder() -> JsonValue {
    json!({ "ewsInfo": {} })
}

/// Merges a flushed batch with the vitals captured at flush time.
///
/// Header fields come from the first sample carrying a facility id; without
/// one there is nothing to send and `None` is returned. Every sample becomes a
/// sensor-data entry in arrival order, and the arrhythmia summary is the last
/// sample's rhythm.
pub fn compose(
    batch: &FlushedBatch,
    vitals: Option<&CachedVitals>,
    data_source: &str,
) -> Option<OutboundPayload> {
    let header = batch
        .samples
        .iter()
        .find(|sample| !sample.facility_id.is_empty())?;
    let last = batch.samples.last()?;

    let sensor_data = batch
        .samples
        .iter()
        .map(|sample| SensorDataItem {
            seq: sample.packet_no,
            timestamp: sample.timestamp,
            heart_rate: sample.heart_rate,
            rhythm_type: sample.rhythm_type.clone(),
            respiration_rate: sample.respiration_rate,
        })
        .collect();

    let (spo2, pulse_rate, bp): (OutboundVitalSign, OutboundVitalSign, OutboundBloodPressure) =
        match vitals {
            Some(vitals) => (
                vitals.spo2.into(),
                vitals.pulse_rate.into(),
                vitals.bp.into(),
            ),
            None => Default::default(),
        };

    Some(OutboundPayload {
        device_type: header.device_type.clone(),
        patient_ref: format!(
            "{}-{}-{}",
            header.facility_id, header.patient_id, header.admission_id
        ),
        facility_id: header.facility_id.clone(),
        patch_id: header.device_id.clone(),
        patient_name: header.patient_name.clone(),
        timestamp: header.timestamp,
        bed_id: String::new(),
        gender: header.gender.clone(),
        age: header.age,
        biosensor_status: BIOSENSOR_STATUS_CONNECTED.to_string(),
        source: data_source.to_string(),
        sensor_data,
        spo2,
        pulse_rate,
        bp,
        arrhythmia_data: vec![ArrhythmiaItem {
            rhythm_type: last.rhythm_type.clone(),
        }],
        ews: ews_placeholder(),
    })
}
