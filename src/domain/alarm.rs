// Alarm event domain models
use crate::domain::error::SourceError;
use crate::domain::geometry::GeoPoint;
use crate::domain::sample::parse_timestamp_ms;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmSeverity {
    Info,
    #[default]
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmEvent {
    pub vehicle_id: String,
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    pub severity: AlarmSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alarm_type: Option<String>,
}

impl AlarmEvent {
    pub fn new(
        vehicle_id: &str,
        timestamp_ms: i64,
        severity: AlarmSeverity,
        message: &str,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            timestamp_ms,
            location: None,
            severity,
            message: message.to_string(),
            alarm_type: None,
        }
    }

    pub fn with_location(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }
}

/// Alarm record as delivered by data sources.
#[derive(Debug, Clone, Deserialize)]
pub struct AlarmRecord {
    pub vehicle_id: String,
    pub timestamp: String,
    #[serde(default)]
    pub severity: AlarmSeverity,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub alarm_type: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

impl AlarmRecord {
    pub fn into_event(self) -> Result<AlarmEvent, SourceError> {
        let timestamp_ms = parse_timestamp_ms(&self.timestamp)
            .ok_or_else(|| SourceError::InvalidTimestamp(self.timestamp.clone()))?;

        let mut event =
            AlarmEvent::new(&self.vehicle_id, timestamp_ms, self.severity, &self.message);
        event.alarm_type = self.alarm_type;
        match self
            .location
            .filter(|l| l.latitude.is_finite() && l.longitude.is_finite())
        {
            Some(location) => Ok(event.with_location(location)),
            None => Ok(event),
        }
    }
}

/// Classify a notification title against known alarm types.
/// A type matches when every one of its words occurs in the title.
pub fn classify_alarm(title: &str, alarm_types: &[String]) -> Option<String> {
    let title = title.to_lowercase();
    alarm_types
        .iter()
        .find(|alarm_type| {
            alarm_type
                .to_lowercase()
                .split_whitespace()
                .all(|keyword| title.contains(keyword))
        })
        .cloned()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmCluster {
    pub bucket: i64,
    pub centroid: GeoPoint,
    pub representative_timestamp_ms: i64,
    pub max_severity: AlarmSeverity,
    pub vehicle_ids: BTreeSet<String>,
    pub alarms: Vec<AlarmEvent>,
}

impl AlarmCluster {
    pub fn new(bucket: i64, anchor: GeoPoint, alarm: AlarmEvent) -> Self {
        let mut vehicle_ids = BTreeSet::new();
        vehicle_ids.insert(alarm.vehicle_id.clone());
        Self {
            bucket,
            centroid: anchor,
            representative_timestamp_ms: alarm.timestamp_ms,
            max_severity: alarm.severity,
            vehicle_ids,
            alarms: vec![alarm],
        }
    }

    /// Adds a member and updates the running centroid.
    pub fn add(&mut self, anchor: GeoPoint, alarm: AlarmEvent) {
        let n = self.alarms.len() as f64;
        self.centroid = GeoPoint::new(
            (self.centroid.latitude * n + anchor.latitude) / (n + 1.0),
            (self.centroid.longitude * n + anchor.longitude) / (n + 1.0),
        );
        self.representative_timestamp_ms = self.representative_timestamp_ms.max(alarm.timestamp_ms);
        self.max_severity = self.max_severity.max(alarm.severity);
        self.vehicle_ids.insert(alarm.vehicle_id.clone());
        self.alarms.push(alarm);
    }
}
