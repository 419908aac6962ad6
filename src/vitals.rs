use crate::telemetry::VitalsReading;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VitalSign {
    pub valid: bool,
    pub value: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BloodPressure {
    pub valid: bool,
    pub systolic: i64,
    pub diastolic: i64,
    pub timestamp: i64,
}

/// Latest vitals for one patient. `last_updated` is the wall-clock time the
/// entry was written, not the reading's own timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedVitals {
    pub bp: BloodPressure,
    pub spo2: VitalSign,
    pub pulse_rate: VitalSign,
    pub device_id: String,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Eviction {
    /// `(patient id, device id)` of every entry removed.
    pub evicted: Vec<(String, String)>,
    /// Device id of every surviving entry, keyed by patient id.
    pub fresh: HashMap<String, String>,
}

impl Eviction {
    pub fn evicted_device_ids(&self) -> Vec<&str> {
        self.evicted
            .iter()
            .map(|(_, device_id)| device_id.as_str())
            .filter(|device_id| !device_id.is_empty())
            .collect()
    }
}

pub struct VitalsCache {
    ttl: chrono::Duration,
    entries: RwLock<HashMap<String, CachedVitals>>,
}

impl VitalsCache {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            ttl: chrono::Duration::seconds(ttl_secs.max(0)),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn update(&self, reading: &VitalsReading) -> CachedVitals {
        self.update_at(reading, Utc::now()).await
    }

    /// SpO2 and pulse rate always overwrite; BP only overwrites when the
    /// reading carries a nonzero systolic value.
    pub async fn update_at(&self, reading: &VitalsReading, now: DateTime<Utc>) -> CachedVitals {
        let mut entries = self.entries.write().await;
        let vitals = entries.entry(reading.patient_id.clone()).or_default();

        vitals.device_id = reading.device_id.clone();
        vitals.spo2 = VitalSign {
            valid: true,
            value: reading.spo2,
            timestamp: reading.epoch_time,
        };
        vitals.pulse_rate = VitalSign {
            valid: true,
            value: reading.pulse_rate,
            timestamp: reading.epoch_time,
        };
        if reading.bp_systolic != 0 {
            vitals.bp = BloodPressure {
                valid: true,
                systolic: reading.bp_systolic,
                diastolic: reading.bp_diastolic,
                timestamp: reading.epoch_time,
            };
        }
        vitals.last_updated = now;
        vitals.clone()
    }

    pub async fn read(&self, patient_id: &str) -> Option<CachedVitals> {
        self.entries.read().await.get(patient_id).cloned()
    }

    /// Removes every entry last written more than the TTL before `now`.
    pub async fn evict_stale(&self, now: DateTime<Utc>) -> Eviction {
        let mut outcome = Eviction::default();
        let mut entries = self.entries.write().await;
        entries.retain(|patient_id, vitals| {
            if now - vitals.last_updated > self.ttl {
                outcome
                    .evicted
                    .push((patient_id.clone(), vitals.device_id.clone()));
                false
            } else {
                outcome
                    .fresh
                    .insert(patient_id.clone(), vitals.device_id.clone());
                true
            }
        });
        outcome.evicted.sort();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn reading(spo2: i64, pulse_rate: i64, systolic: i64, diastolic: i64) -> VitalsReading {
        VitalsReading {
            patient_id: "P1".to_string(),
            device_id: "BP-1".to_string(),
            epoch_time: 1_718_000_000,
            spo2,
            pulse_rate,
            bp_systolic: systolic,
            bp_diastolic: diastolic,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn zero_systolic_keeps_previous_bp() {
        let cache = VitalsCache::new(300);
        cache.update(&reading(95, 80, 120, 80)).await;

        let mut next = reading(97, 72, 0, 0);
        next.epoch_time += 60;
        next.device_id = "BP-2".to_string();
        let vitals = cache.update(&next).await;

        assert_eq!(vitals.spo2.value, 97);
        assert_eq!(vitals.pulse_rate.value, 72);
        assert_eq!(vitals.spo2.timestamp, next.epoch_time);
        assert!(vitals.bp.valid);
        assert_eq!(vitals.bp.systolic, 120);
        assert_eq!(vitals.bp.diastolic, 80);
        assert_eq!(vitals.bp.timestamp, 1_718_000_000);
        assert_eq!(vitals.device_id, "BP-2");
    }

    #[tokio::test]
    async fn zero_systolic_without_history_leaves_bp_invalid() {
        let cache = VitalsCache::new(300);
        cache.update(&reading(97, 72, 0, 0)).await;
        let vitals = cache.read("P1").await.expect("cached");
        assert!(!vitals.bp.valid);
        assert!(vitals.spo2.valid);
        assert!(vitals.pulse_rate.valid);
    }

    #[tokio::test]
    async fn evicts_entries_older_than_ttl() {
        let cache = VitalsCache::new(300);
        let start = Utc::now();
        cache.update_at(&reading(97, 72, 0, 0), start).await;
        let mut other = reading(99, 60, 0, 0);
        other.patient_id = "P2".to_string();
        other.device_id = "BP-9".to_string();
        cache
            .update_at(&other, start + ChronoDuration::seconds(200))
            .await;

        let at_ttl = cache.evict_stale(start + ChronoDuration::seconds(300)).await;
        assert!(at_ttl.evicted.is_empty());
        assert_eq!(at_ttl.fresh.len(), 2);

        let outcome = cache.evict_stale(start + ChronoDuration::seconds(301)).await;
        assert_eq!(outcome.evicted, vec![("P1".to_string(), "BP-1".to_string())]);
        assert_eq!(outcome.evicted_device_ids(), vec!["BP-1"]);
        assert_eq!(outcome.fresh.get("P2").map(String::as_str), Some("BP-9"));
        assert!(cache.read("P1").await.is_none());
        assert!(cache.read("P2").await.is_some());
    }
}
