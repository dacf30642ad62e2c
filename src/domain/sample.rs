// Position/telemetry sample domain models
use crate::domain::error::SourceError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Categorical vehicle states recorded alongside a position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleStates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motion_controller: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haulage_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub vehicle_id: String,
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offpath_deviation_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states: Option<VehicleStates>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch_deg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roll_deg: Option<f64>,
}

impl Sample {
    pub fn new(
        vehicle_id: &str,
        timestamp_ms: i64,
        latitude: f64,
        longitude: f64,
        speed_kmh: f64,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            timestamp_ms,
            latitude,
            longitude,
            speed_kmh,
            offpath_deviation_m: None,
            states: None,
            pitch_deg: None,
            roll_deg: None,
        }
    }

    pub fn has_valid_position(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }

    pub fn motion_controller(&self) -> Option<&str> {
        self.states
            .as_ref()
            .and_then(|s| s.motion_controller.as_deref())
    }
}

/// Inclusive time range in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeRange {
    pub fn new(start_ms: i64, end_ms: i64) -> Self {
        if start_ms <= end_ms {
            Self { start_ms, end_ms }
        } else {
            Self {
                start_ms: end_ms,
                end_ms: start_ms,
            }
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_ms - self.start_ms
    }

    /// A range with no room to advance (empty or single-instant data).
    pub fn is_degenerate(&self) -> bool {
        self.start_ms >= self.end_ms
    }

    pub fn contains(&self, t: i64) -> bool {
        t >= self.start_ms && t <= self.end_ms
    }

    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start_ms.max(other.start_ms);
        let end = self.end_ms.min(other.end_ms);
        (start <= end).then(|| TimeRange::new(start, end))
    }
}

/// Sample record as delivered by data sources (ISO-8601 timestamps).
#[derive(Debug, Clone, Deserialize)]
pub struct SampleRecord {
    pub timestamp: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub speed_kmh: Option<f64>,
    #[serde(default)]
    pub offpath_deviation: Option<f64>,
    #[serde(default)]
    pub states: Option<VehicleStates>,
    #[serde(default)]
    pub pitch_deg: Option<f64>,
    #[serde(default)]
    pub roll_deg: Option<f64>,
}

impl SampleRecord {
    /// Missing coordinates become NaN so the trace store reports and drops them.
    /// A missing or null speed reads as stationary.
    pub fn into_sample(self, vehicle_id: &str) -> Result<Sample, SourceError> {
        let timestamp_ms = parse_timestamp_ms(&self.timestamp)
            .ok_or_else(|| SourceError::InvalidTimestamp(self.timestamp.clone()))?;

        Ok(Sample {
            vehicle_id: vehicle_id.to_string(),
            timestamp_ms,
            latitude: self.latitude.unwrap_or(f64::NAN),
            longitude: self.longitude.unwrap_or(f64::NAN),
            speed_kmh: self.speed_kmh.filter(|v| v.is_finite()).unwrap_or(0.0),
            offpath_deviation_m: self.offpath_deviation.filter(|d| d.is_finite()),
            states: self.states,
            pitch_deg: self.pitch_deg.filter(|d| d.is_finite()),
            roll_deg: self.roll_deg.filter(|d| d.is_finite()),
        })
    }
}

/// Parse an ISO-8601 timestamp; offset-less values are taken as UTC.
pub fn parse_timestamp_ms(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Some(time.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

pub fn format_timestamp_ms(timestamp_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}
