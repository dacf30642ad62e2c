// Shape analytics result models
use crate::domain::sample::TimeRange;
use serde::Serialize;
use std::collections::BTreeMap;

/// Speed histogram bucket for an absolute speed in km/h.
pub fn speed_bucket(speed_kmh: f64) -> usize {
    match speed_kmh.abs() {
        s if s < 5.0 => 0,
        s if s < 15.0 => 1,
        s if s < 25.0 => 2,
        s if s < 35.0 => 3,
        _ => 4,
    }
}

/// Severity bucket for an absolute off-path deviation in metres.
pub fn offpath_severity(deviation_m: f64) -> usize {
    match deviation_m.abs() {
        d if d < 0.8 => 0,
        d if d <= 1.2 => 1,
        _ => 2,
    }
}

pub fn percentages<const N: usize>(counts: &[u64; N]) -> [f64; N] {
    let total: u64 = counts.iter().sum();
    let mut out = [0.0; N];
    if total > 0 {
        for (slot, count) in out.iter_mut().zip(counts) {
            *slot = *count as f64 * 100.0 / total as f64;
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpeedStats {
    pub sample_count: u64,
    pub avg_kmh: f64,
    pub min_kmh: f64,
    pub max_kmh: f64,
    pub histogram: [u64; 5],
    pub histogram_percentages: [f64; 5],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OffpathStats {
    pub sample_count: u64,
    pub avg_abs_m: f64,
    pub max_abs_m: f64,
    pub severity_counts: [u64; 3],
    pub severity_percentages: [f64; 3],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DwellStats {
    pub total_time_seconds: f64,
    pub entry_count: u64,
    pub average_visit_seconds: f64,
    pub max_continuous_seconds: f64,
}

impl DwellStats {
    pub fn record_visit(&mut self, seconds: f64) {
        self.total_time_seconds += seconds;
        self.entry_count += 1;
        self.max_continuous_seconds = self.max_continuous_seconds.max(seconds);
        self.average_visit_seconds = self.total_time_seconds / self.entry_count as f64;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShapeStats {
    pub shape_id: String,
    pub shape_name: String,
    pub point_count: u64,
    pub speed: SpeedStats,
    pub offpath: OffpathStats,
    pub state_durations_s: BTreeMap<String, f64>,
    pub state_percentages: BTreeMap<String, f64>,
    pub distance_m: f64,
    pub dwell_time: DwellStats,
}

impl ShapeStats {
    pub fn new(shape_id: &str, shape_name: &str) -> Self {
        Self {
            shape_id: shape_id.to_string(),
            shape_name: shape_name.to_string(),
            ..Default::default()
        }
    }

    /// Recompute every derived percentage from the raw totals.
    pub fn refresh_percentages(&mut self) {
        self.speed.histogram_percentages = percentages(&self.speed.histogram);
        self.offpath.severity_percentages = percentages(&self.offpath.severity_counts);
        let total: f64 = self.state_durations_s.values().sum();
        self.state_percentages = self
            .state_durations_s
            .iter()
            .map(|(state, secs)| {
                let pct = if total > 0.0 { secs * 100.0 / total } else { 0.0 };
                (state.clone(), pct)
            })
            .collect();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingInfo {
    pub original_points: usize,
    pub retained_points: usize,
    pub step: usize,
    pub sample_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShapeAnalyticsResult {
    pub vehicle_ids: Vec<String>,
    pub shapes: Vec<ShapeStats>,
    pub unassigned_points: u64,
    pub total_points_processed: u64,
    pub original_point_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<TimeRange>,
    pub processing_time_ms: u64,
}

impl ShapeAnalyticsResult {
    pub fn shape(&self, shape_id: &str) -> Option<&ShapeStats> {
        self.shapes.iter().find(|s| s.shape_id == shape_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsPhase {
    Sampling,
    Processing,
    Finalizing,
    Combining,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsProgress {
    pub phase: AnalyticsPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_shape: Option<String>,
    pub percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
}
