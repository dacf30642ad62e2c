// Trace store - per-vehicle, time-ordered sample sequences
use crate::domain::sample::{Sample, TimeRange};
use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome of loading one vehicle's samples. Dropped samples are data defects, not errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub vehicle_id: String,
    pub accepted: usize,
    pub dropped_invalid_position: usize,
    pub collapsed_duplicates: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleSummary {
    pub vehicle_id: String,
    pub data_points: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
}

#[derive(Debug, Clone, Default)]
pub struct TraceStore {
    traces: BTreeMap<String, Vec<Sample>>,
}

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a vehicle's samples, replacing any previous trace.
    /// Input order is not trusted: samples are re-sorted and duplicate
    /// timestamps collapse to the last one written.
    pub fn load(&mut self, vehicle_id: &str, samples: Vec<Sample>) -> LoadReport {
        let total = samples.len();
        let mut valid: Vec<Sample> = samples
            .into_iter()
            .filter(Sample::has_valid_position)
            .collect();
        let dropped_invalid_position = total - valid.len();

        // Stable sort keeps input order among equal timestamps, so the last
        // written sample is the last of its run.
        valid.sort_by_key(|s| s.timestamp_ms);
        let before_dedup = valid.len();
        let mut trace: Vec<Sample> = Vec::with_capacity(valid.len());
        for sample in valid {
            match trace.last_mut() {
                Some(last) if last.timestamp_ms == sample.timestamp_ms => *last = sample,
                _ => trace.push(sample),
            }
        }
        let collapsed_duplicates = before_dedup - trace.len();

        if dropped_invalid_position > 0 {
            tracing::warn!(
                "Dropped {} samples with missing or non-finite coordinates for {}",
                dropped_invalid_position,
                vehicle_id
            );
        }
        if collapsed_duplicates > 0 {
            tracing::debug!(
                "Collapsed {} duplicate timestamps for {}",
                collapsed_duplicates,
                vehicle_id
            );
        }

        let report = LoadReport {
            vehicle_id: vehicle_id.to_string(),
            accepted: trace.len(),
            dropped_invalid_position,
            collapsed_duplicates,
        };
        self.traces.insert(vehicle_id.to_string(), trace);
        report
    }

    pub fn trace(&self, vehicle_id: &str) -> Option<&[Sample]> {
        self.traces.get(vehicle_id).map(|t| t.as_slice())
    }

    pub fn traces(&self) -> impl Iterator<Item = (&str, &[Sample])> {
        self.traces.iter().map(|(id, t)| (id.as_str(), t.as_slice()))
    }

    pub fn vehicle_ids(&self) -> Vec<String> {
        self.traces.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.values().all(|t| t.is_empty())
    }

    pub fn total_samples(&self) -> usize {
        self.traces.values().map(|t| t.len()).sum()
    }

    /// Min/max timestamp across all vehicles, or `(0, 0)` when nothing is loaded.
    pub fn global_range(&self) -> TimeRange {
        let bounds = self
            .traces
            .values()
            .filter_map(|t| Some((t.first()?.timestamp_ms, t.last()?.timestamp_ms)))
            .reduce(|(a_min, a_max), (b_min, b_max)| (a_min.min(b_min), a_max.max(b_max)));

        match bounds {
            Some((start, end)) => TimeRange::new(start, end),
            None => TimeRange::default(),
        }
    }

    pub fn vehicle_summaries(&self) -> Vec<VehicleSummary> {
        self.traces
            .iter()
            .map(|(id, trace)| VehicleSummary {
                vehicle_id: id.clone(),
                data_points: trace.len(),
                time_range: match (trace.first(), trace.last()) {
                    (Some(first), Some(last)) => {
                        Some(TimeRange::new(first.timestamp_ms, last.timestamp_ms))
                    }
                    _ => None,
                },
            })
            .collect()
    }

    /// Sample closest in time to `t`; ties resolve to the earlier sample.
    pub fn nearest_sample(&self, vehicle_id: &str, t: i64) -> Option<&Sample> {
        let trace = self.trace(vehicle_id)?;
        let idx = trace.partition_point(|s| s.timestamp_ms < t);
        let after = trace.get(idx);
        let before = idx.checked_sub(1).and_then(|i| trace.get(i));
        match (before, after) {
            (Some(b), Some(a)) => {
                if (t - b.timestamp_ms) <= (a.timestamp_ms - t) {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (Some(b), None) => Some(b),
            (None, a) => a,
        }
    }

    /// Samples whose timestamps fall inside `range` (inclusive).
    pub fn window(&self, vehicle_id: &str, range: &TimeRange) -> &[Sample] {
        let Some(trace) = self.trace(vehicle_id) else {
            return &[];
        };
        let start = trace.partition_point(|s| s.timestamp_ms < range.start_ms);
        let end = trace.partition_point(|s| s.timestamp_ms <= range.end_ms);
        &trace[start..end.max(start)]
    }
}
