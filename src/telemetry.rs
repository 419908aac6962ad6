use anyhow::Result;
use serde::{Deserialize, Deserializer};

/// One ECG waveform packet from a monitoring device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EcgSample {
    pub facility_id: String,
    pub patient_id: String,
    pub admission_id: String,
    pub device_id: String,
    pub device_type: String,
    pub patient_name: String,
    pub gender: String,
    pub age: i64,
    pub timestamp: i64,
    pub packet_no: i64,
    pub waveform: Vec<f64>,
    pub heart_rate: i64,
    pub respiration_rate: i64,
    pub rhythm_type: String,
    pub discharge: bool,
}

/// A BP / SpO2 / pulse-rate reading from the companion vitals device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VitalsReading {
    pub patient_id: String,
    pub facility_id: String,
    pub admission_id: String,
    pub device_id: String,
    pub epoch_time: i64,
    pub bp_systolic: i64,
    pub bp_diastolic: i64,
    pub spo2: i64,
    pub pulse_rate: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Vitals(VitalsReading),
    Ecg(EcgSample),
}

#[derive(Debug, Default, Deserialize)]
struct WireBp {
    #[serde(default, rename = "bpSystolic")]
    systolic: i64,
    #[serde(default, rename = "bpDiastolic")]
    diastolic: i64,
}

#[derive(Debug, Default, Deserialize)]
struct WireSpo2 {
    #[serde(default)]
    spo2: i64,
    #[serde(default, rename = "pulseRate")]
    pulse_rate: i64,
}

// Wraps any value that was present, including an explicit null, so `None`
// means the key was absent.
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

// Both device shapes share the telemetry topic, so every field is optional and
// the message kind is decided afterwards by which keys were present.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTelemetry {
    #[serde(default)]
    facility_id: String,
    #[serde(default)]
    patient_id: String,
    #[serde(default)]
    admission_id: String,
    #[serde(default)]
    device_id: String,
    // The vitals device spells it with a capital D.
    #[serde(default, rename = "deviceID")]
    device_id_upper: String,
    #[serde(default)]
    device_type: String,
    #[serde(default)]
    patient_name: String,
    #[serde(default)]
    gender: String,
    #[serde(default)]
    age: i64,
    #[serde(default)]
    current_timestamp: i64,
    #[serde(default)]
    epoch_time: i64,
    #[serde(default)]
    packet_no: i64,
    #[serde(default, rename = "ECG_CH_A", deserialize_with = "present")]
    ecg_ch_a: Option<Option<Vec<f64>>>,
    #[serde(default, rename = "HR")]
    hr: i64,
    #[serde(default, rename = "RR")]
    rr: i64,
    #[serde(default)]
    rhythm_type: String,
    #[serde(default, rename = "Discharge")]
    discharge: Option<bool>,
    #[serde(default, deserialize_with = "present")]
    bp: Option<Option<WireBp>>,
    #[serde(default, deserialize_with = "present")]
    spo2: Option<Option<WireSpo2>>,
}

fn either(preferred: String, fallback: String) -> String {
    if preferred.is_empty() {
        fallback
    } else {
        preferred
    }
}

/// Decodes a telemetry payload and routes it by shape: a `bp` or `spo2` key
/// makes it a vitals reading, otherwise an `ECG_CH_A` key makes it an ECG
/// sample. A key counts even when its value is null. Returns `Ok(None)` for
/// records that match neither shape.
pub fn parse_telemetry_payload(payload: &mut [u8]) -> Result<Option<InboundMessage>> {
    let wire: WireTelemetry = simd_json::serde::from_slice(payload)?;

    if wire.bp.is_some() || wire.spo2.is_some() {
        let bp = wire.bp.flatten().unwrap_or_default();
        let spo2 = wire.spo2.flatten().unwrap_or_default();
        return Ok(Some(InboundMessage::Vitals(VitalsReading {
            patient_id: wire.patient_id,
            facility_id: wire.facility_id,
            admission_id: wire.admission_id,
            device_id: either(wire.device_id_upper, wire.device_id),
            epoch_time: wire.epoch_time,
            bp_systolic: bp.systolic,
            bp_diastolic: bp.diastolic,
            spo2: spo2.spo2,
            pulse_rate: spo2.pulse_rate,
        })));
    }

    let Some(waveform) = wire.ecg_ch_a else {
        return Ok(None);
    };
    let waveform = waveform.unwrap_or_default();

    Ok(Some(InboundMessage::Ecg(EcgSample {
        facility_id: wire.facility_id,
        patient_id: wire.patient_id,
        admission_id: wire.admission_id,
        device_id: either(wire.device_id, wire.device_id_upper),
        device_type: wire.device_type,
        patient_name: wire.patient_name,
        gender: wire.gender,
        age: wire.age,
        timestamp: wire.current_timestamp,
        packet_no: wire.packet_no,
        waveform,
        heart_rate: wire.hr,
        respiration_rate: wire.rr,
        rhythm_type: wire.rhythm_type,
        discharge: wire.discharge.unwrap_or(false),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecg_packet_decodes_all_fields() {
        let mut payload = br#"{
            "facilityId":"F1","patientId":"P1","admissionId":"A9","deviceId":"D1",
            "deviceType":"BIOSENSOR_NEXUS","patientName":"Jane","gender":"F","age":61,
            "currentTimestamp":1718000000,"packetNo":42,"ECG_CH_A":[0.1,0.2,-0.3],
            "HR":72,"RR":16,"rhythmType":"NSR","Discharge":true
        }"#
        .to_vec();
        let parsed = parse_telemetry_payload(&mut payload).unwrap();
        let Some(InboundMessage::Ecg(sample)) = parsed else {
            panic!("expected ECG sample, got {parsed:?}");
        };
        assert_eq!(sample.patient_id, "P1");
        assert_eq!(sample.admission_id, "A9");
        assert_eq!(sample.age, 61);
        assert_eq!(sample.packet_no, 42);
        assert_eq!(sample.waveform.len(), 3);
        assert_eq!(sample.heart_rate, 72);
        assert_eq!(sample.respiration_rate, 16);
        assert_eq!(sample.rhythm_type, "NSR");
        assert!(sample.discharge);
    }

    #[test]
    fn vitals_fields_take_precedence_over_ecg_field() {
        let mut payload = br#"{
            "patientId":"P1","deviceID":"BP-7","epochTime":1718000001,
            "spo2":{"spo2":97,"pulseRate":72},
            "ECG_CH_A":[1.0]
        }"#
        .to_vec();
        let parsed = parse_telemetry_payload(&mut payload).unwrap();
        let Some(InboundMessage::Vitals(reading)) = parsed else {
            panic!("expected vitals reading, got {parsed:?}");
        };
        assert_eq!(reading.device_id, "BP-7");
        assert_eq!(reading.spo2, 97);
        assert_eq!(reading.pulse_rate, 72);
        assert_eq!(reading.bp_systolic, 0);
    }

    #[test]
    fn bp_only_reading_routes_to_vitals() {
        let mut payload =
            br#"{"patientId":"P2","bp":{"bpSystolic":120,"bpDiastolic":80}}"#.to_vec();
        let parsed = parse_telemetry_payload(&mut payload).unwrap();
        assert!(matches!(
            parsed,
            Some(InboundMessage::Vitals(VitalsReading { bp_systolic: 120, bp_diastolic: 80, .. }))
        ));
    }

    #[test]
    fn null_vitals_field_still_routes_to_vitals() {
        let mut payload =
            br#"{"patientId":"P3","deviceID":"BP-7","bp":null,"ECG_CH_A":[0.5]}"#.to_vec();
        let parsed = parse_telemetry_payload(&mut payload).unwrap();
        let Some(InboundMessage::Vitals(reading)) = parsed else {
            panic!("expected vitals reading, got {parsed:?}");
        };
        assert_eq!(reading.patient_id, "P3");
        assert_eq!(reading.bp_systolic, 0);
        assert_eq!(reading.spo2, 0);

        let mut payload = br#"{"patientId":"P3","spo2":null}"#.to_vec();
        assert!(matches!(
            parse_telemetry_payload(&mut payload).unwrap(),
            Some(InboundMessage::Vitals(_))
        ));
    }

    #[test]
    fn null_waveform_still_routes_to_ecg() {
        let mut payload = br#"{"patientId":"P1","packetNo":3,"ECG_CH_A":null}"#.to_vec();
        let parsed = parse_telemetry_payload(&mut payload).unwrap();
        let Some(InboundMessage::Ecg(sample)) = parsed else {
            panic!("expected ECG sample, got {parsed:?}");
        };
        assert_eq!(sample.packet_no, 3);
        assert!(sample.waveform.is_empty());
    }

    #[test]
    fn both_device_id_spellings_decode() {
        let mut vitals = br#"{
            "patientId":"P1","deviceId":"ECG-1","deviceID":"BP-7",
            "spo2":{"spo2":96,"pulseRate":70}
        }"#
        .to_vec();
        let parsed = parse_telemetry_payload(&mut vitals).unwrap();
        let Some(InboundMessage::Vitals(reading)) = parsed else {
            panic!("expected vitals reading, got {parsed:?}");
        };
        assert_eq!(reading.device_id, "BP-7");

        let mut ecg = br#"{
            "patientId":"P1","deviceId":"ECG-1","deviceID":"BP-7","ECG_CH_A":[0.1]
        }"#
        .to_vec();
        let parsed = parse_telemetry_payload(&mut ecg).unwrap();
        let Some(InboundMessage::Ecg(sample)) = parsed else {
            panic!("expected ECG sample, got {parsed:?}");
        };
        assert_eq!(sample.device_id, "ECG-1");

        let mut fallback = br#"{"patientId":"P1","deviceId":"BP-8","bp":{"bpSystolic":118}}"#
            .to_vec();
        let parsed = parse_telemetry_payload(&mut fallback).unwrap();
        assert!(matches!(
            parsed,
            Some(InboundMessage::Vitals(VitalsReading { ref device_id, .. })) if device_id == "BP-8"
        ));
    }

    #[test]
    fn unknown_shape_is_not_routed() {
        let mut payload = br#"{"patientId":"P1","temperature":36.6}"#.to_vec();
        assert_eq!(parse_telemetry_payload(&mut payload).unwrap(), None);
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let mut payload = b"{not json".to_vec();
        assert!(parse_telemetry_payload(&mut payload).is_err());
    }
}
