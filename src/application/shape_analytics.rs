// Shape analytics engine - attributes trace samples to map regions and aggregates statistics
use crate::domain::analytics::{
    offpath_severity, speed_bucket, AnalyticsPhase, AnalyticsProgress, DwellStats, SamplingInfo,
    ShapeAnalyticsResult, ShapeStats,
};
use crate::domain::error::AnalyticsError;
use crate::domain::geometry::{haversine_m, BoundingBox, GeoPoint};
use crate::domain::region::{Geometry, Polygon, Position, RegionCollection, RegionShape};
use crate::domain::sample::{Sample, TimeRange};
use crate::infrastructure::config::AnalyticsConfig;
use rstar::{RTree, RTreeObject, AABB};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

const UNKNOWN_STATE: &str = "unknown";

/// Extract analyzable regions, skipping excluded categories and shapes without area.
pub fn extract_shapes(
    collection: &RegionCollection,
    excluded_categories: &[String],
) -> Vec<RegionShape> {
    let mut shapes = Vec::new();
    for (index, feature) in collection.features.iter().enumerate() {
        if feature.is_excluded(excluded_categories) {
            continue;
        }
        let Some(geometry) = &feature.geometry else {
            continue;
        };

        let mut polygons = Vec::new();
        let mut degenerate = 0;
        collect_polygons(geometry, &mut polygons, &mut degenerate);
        let id = feature.id(index);
        if degenerate > 0 {
            tracing::debug!("Dropped {} degenerate polygons from shape {}", degenerate, id);
        }

        match RegionShape::new(id, feature.name(), feature.category(), polygons) {
            Some(shape) => shapes.push(shape),
            None => tracing::debug!("Feature {} has no enclosed area; not analyzable", index),
        }
    }
    shapes
}

fn collect_polygons(geometry: &Geometry, out: &mut Vec<Polygon>, degenerate: &mut usize) {
    match geometry {
        Geometry::Polygon { coordinates } => push_polygon(coordinates, out, degenerate),
        Geometry::MultiPolygon { coordinates } => {
            for rings in coordinates {
                push_polygon(rings, out, degenerate);
            }
        }
        Geometry::GeometryCollection { geometries } => {
            for child in geometries {
                collect_polygons(child, out, degenerate);
            }
        }
        Geometry::NonAreal => {}
    }
}

fn push_polygon(rings: &[Vec<Position>], out: &mut Vec<Polygon>, degenerate: &mut usize) {
    match Polygon::from_rings(rings) {
        Some(polygon) => out.push(polygon),
        None => *degenerate += 1,
    }
}

/// The collection without excluded-category features.
pub fn filter_collection(
    collection: &RegionCollection,
    excluded_categories: &[String],
) -> RegionCollection {
    RegionCollection {
        features: collection
            .features
            .iter()
            .filter(|f| !f.is_excluded(excluded_categories))
            .cloned()
            .collect(),
    }
}

pub fn point_in_shape(point: GeoPoint, shape: &RegionShape) -> bool {
    shape.contains(point)
}

/// Shape envelope stored in the R-tree.
struct ShapeEnvelope {
    position: usize,
    area: f64,
    bbox: BoundingBox,
}

impl RTreeObject for ShapeEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bbox.min_lon, self.bbox.min_lat],
            [self.bbox.max_lon, self.bbox.max_lat],
        )
    }
}

/// Region lookup with a deterministic overlap policy: the smallest containing
/// shape wins, ties going to the earlier shape.
pub struct ShapeIndex<'a> {
    shapes: &'a [RegionShape],
    tree: RTree<ShapeEnvelope>,
}

impl<'a> ShapeIndex<'a> {
    pub fn new(shapes: &'a [RegionShape]) -> Self {
        let envelopes = shapes
            .iter()
            .enumerate()
            .map(|(position, shape)| ShapeEnvelope {
                position,
                area: shape.area_deg2(),
                bbox: shape.bbox,
            })
            .collect();
        Self {
            shapes,
            tree: RTree::bulk_load(envelopes),
        }
    }

    /// Index (into the original slice) of the shape containing `point`.
    pub fn locate(&self, point: GeoPoint) -> Option<usize> {
        let query = AABB::from_point([point.longitude, point.latitude]);
        self.tree
            .locate_in_envelope_intersecting(&query)
            .filter(|candidate| point_in_shape(point, &self.shapes[candidate.position]))
            .min_by(|a, b| {
                a.area
                    .total_cmp(&b.area)
                    .then(a.position.cmp(&b.position))
            })
            .map(|candidate| candidate.position)
    }
}

/// Cooperative cancellation checked at every chunk boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Accumulator {
    speed_sum: f64,
    offpath_sum: f64,
}

#[derive(Clone)]
pub struct ShapeAnalyticsEngine {
    config: AnalyticsConfig,
}

impl ShapeAnalyticsEngine {
    pub fn new(config: AnalyticsConfig) -> Self {
        Self { config }
    }

    /// Uniform sampling plan for a trace of `len` points, or None when under the threshold.
    pub fn sampling_plan(&self, len: usize) -> Option<SamplingInfo> {
        if len <= self.config.max_points_threshold {
            return None;
        }
        let rate = self.config.sample_rate;
        let step = if rate.is_finite() && rate > 0.0 && rate <= 1.0 {
            ((1.0 / rate).round() as usize).max(1)
        } else {
            len.div_ceil(self.config.max_points_threshold.max(1))
        };
        let retained_points = len.div_ceil(step);
        Some(SamplingInfo {
            original_points: len,
            retained_points,
            step,
            sample_rate: retained_points as f64 / len as f64,
        })
    }

    /// Per-region statistics for one vehicle's trace.
    ///
    /// Work is split into chunks of `chunk_size` samples; between chunks the
    /// task yields, reports progress and checks `cancel`. A cancelled run
    /// returns `AnalyticsError::Cancelled` and no partial result.
    pub async fn compute_analytics<F>(
        &self,
        vehicle_id: &str,
        trace: &[Sample],
        shapes: &[RegionShape],
        window: Option<TimeRange>,
        cancel: &CancellationFlag,
        mut progress: F,
    ) -> Result<ShapeAnalyticsResult, AnalyticsError>
    where
        F: FnMut(AnalyticsProgress),
    {
        let started = Instant::now();
        let trace = match &window {
            Some(range) => {
                let start = trace.partition_point(|s| s.timestamp_ms < range.start_ms);
                let end = trace.partition_point(|s| s.timestamp_ms <= range.end_ms);
                &trace[start..end.max(start)]
            }
            None => trace,
        };

        let sampling = self.sampling_plan(trace.len());
        let samples: Vec<&Sample> = match &sampling {
            Some(plan) => {
                tracing::info!(
                    "Sampling {} of {} points for {} (every {}th)",
                    plan.retained_points,
                    plan.original_points,
                    vehicle_id,
                    plan.step
                );
                progress(AnalyticsProgress {
                    phase: AnalyticsPhase::Sampling,
                    vehicle_id: Some(vehicle_id.to_string()),
                    current_shape: None,
                    percentage: 0.0,
                    estimated_remaining_ms: None,
                });
                trace.iter().step_by(plan.step).collect()
            }
            None => trace.iter().collect(),
        };

        let total = samples.len();
        let index = ShapeIndex::new(shapes);
        let chunk_size = self.config.chunk_size.max(1);
        let mut located: Vec<Option<usize>> = Vec::with_capacity(total);

        for chunk in samples.chunks(chunk_size) {
            if cancel.is_cancelled() {
                tracing::info!(
                    "Analytics for {} cancelled at {}/{}",
                    vehicle_id,
                    located.len(),
                    total
                );
                return Err(AnalyticsError::Cancelled {
                    processed: located.len(),
                    total,
                });
            }

            located.extend(
                chunk
                    .iter()
                    .map(|s| index.locate(GeoPoint::new(s.latitude, s.longitude))),
            );

            let processed = located.len();
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let remaining = (total - processed) as u64;
            progress(AnalyticsProgress {
                phase: AnalyticsPhase::Processing,
                vehicle_id: Some(vehicle_id.to_string()),
                current_shape: located
                    .last()
                    .copied()
                    .flatten()
                    .map(|i| shapes[i].name.clone()),
                percentage: processed as f64 * 100.0 / total as f64,
                estimated_remaining_ms: Some(elapsed_ms * remaining / processed as u64),
            });
            tokio::task::yield_now().await;
        }

        if cancel.is_cancelled() {
            return Err(AnalyticsError::Cancelled {
                processed: total,
                total,
            });
        }

        let mut result = accumulate(&samples, &located, shapes);
        result.vehicle_ids = vec![vehicle_id.to_string()];
        result.original_point_count = trace.len() as u64;
        result.sampling = sampling;
        result.window = window;
        result.processing_time_ms = started.elapsed().as_millis() as u64;

        progress(AnalyticsProgress {
            phase: AnalyticsPhase::Finalizing,
            vehicle_id: Some(vehicle_id.to_string()),
            current_shape: None,
            percentage: 100.0,
            estimated_remaining_ms: Some(0),
        });
        tracing::debug!(
            "Analytics for {}: {} points over {} shapes in {} ms",
            vehicle_id,
            total,
            result.shapes.len(),
            result.processing_time_ms
        );
        Ok(result)
    }
}

/// Single ordered pass over located samples. Each sample's duration is the
/// time to the next retained sample, attributed to its own state and shape.
fn accumulate(
    samples: &[&Sample],
    located: &[Option<usize>],
    shapes: &[RegionShape],
) -> ShapeAnalyticsResult {
    let mut stats: Vec<Option<ShapeStats>> = vec![None; shapes.len()];
    let mut sums: Vec<Accumulator> = shapes.iter().map(|_| Accumulator::default()).collect();
    let mut unassigned = 0u64;
    let mut open_visit: Option<(usize, f64)> = None;

    for (i, sample) in samples.iter().enumerate() {
        let next = samples.get(i + 1);
        let dt_s = next
            .map(|n| (n.timestamp_ms - sample.timestamp_ms) as f64 / 1000.0)
            .unwrap_or(0.0);

        let Some(k) = located[i] else {
            unassigned += 1;
            close_visit(&mut open_visit, &mut stats);
            continue;
        };

        let shape_stats =
            stats[k].get_or_insert_with(|| ShapeStats::new(&shapes[k].id, &shapes[k].name));
        let sum = &mut sums[k];
        shape_stats.point_count += 1;

        let speed = sample.speed_kmh.abs();
        if speed.is_finite() {
            let s = &mut shape_stats.speed;
            if s.sample_count == 0 {
                s.min_kmh = speed;
                s.max_kmh = speed;
            } else {
                s.min_kmh = s.min_kmh.min(speed);
                s.max_kmh = s.max_kmh.max(speed);
            }
            s.sample_count += 1;
            sum.speed_sum += speed;
            s.avg_kmh = sum.speed_sum / s.sample_count as f64;
            s.histogram[speed_bucket(speed)] += 1;
        }

        if let Some(deviation) = sample.offpath_deviation_m.filter(|d| d.is_finite()) {
            let o = &mut shape_stats.offpath;
            let abs = deviation.abs();
            o.sample_count += 1;
            sum.offpath_sum += abs;
            o.avg_abs_m = sum.offpath_sum / o.sample_count as f64;
            o.max_abs_m = o.max_abs_m.max(abs);
            o.severity_counts[offpath_severity(abs)] += 1;
        }

        let state = sample.motion_controller().unwrap_or(UNKNOWN_STATE);
        *shape_stats.state_durations_s.entry(state.to_string()).or_insert(0.0) += dt_s;

        if let Some(n) = next {
            if located[i + 1] == Some(k) {
                shape_stats.distance_m += haversine_m(
                    GeoPoint::new(sample.latitude, sample.longitude),
                    GeoPoint::new(n.latitude, n.longitude),
                );
            }
        }

        match open_visit {
            Some((open, ref mut seconds)) if open == k => *seconds += dt_s,
            _ => {
                close_visit(&mut open_visit, &mut stats);
                open_visit = Some((k, dt_s));
            }
        }
    }
    close_visit(&mut open_visit, &mut stats);

    let shapes: Vec<ShapeStats> = stats
        .into_iter()
        .flatten()
        .map(|mut s| {
            s.refresh_percentages();
            s
        })
        .collect();

    ShapeAnalyticsResult {
        shapes,
        unassigned_points: unassigned,
        total_points_processed: samples.len() as u64,
        ..Default::default()
    }
}

fn close_visit(visit: &mut Option<(usize, f64)>, stats: &mut [Option<ShapeStats>]) {
    if let Some((k, seconds)) = visit.take() {
        if let Some(shape_stats) = stats[k].as_mut() {
            shape_stats.dwell_time.record_visit(seconds);
        }
    }
}

#[derive(Default)]
struct MergeSums {
    speed_weighted: f64,
    speed_weight: f64,
    offpath_weighted: f64,
    offpath_weight: f64,
}

/// Merge per-vehicle results into one.
///
/// Means are weighted by each result's sample counts, optionally scaled by
/// `weights` (one per result). Counts, distances and durations are summed,
/// extrema are global and every percentage is recomputed from merged totals.
pub fn combine(results: &[ShapeAnalyticsResult], weights: Option<&[f64]>) -> ShapeAnalyticsResult {
    let mut merged: Vec<ShapeStats> = Vec::new();
    let mut sums: Vec<MergeSums> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut combined = ShapeAnalyticsResult::default();

    for (r, result) in results.iter().enumerate() {
        let w = weights
            .and_then(|w| w.get(r).copied())
            .filter(|w| w.is_finite() && *w >= 0.0)
            .unwrap_or(1.0);

        for vehicle in &result.vehicle_ids {
            if !combined.vehicle_ids.contains(vehicle) {
                combined.vehicle_ids.push(vehicle.clone());
            }
        }
        combined.unassigned_points += result.unassigned_points;
        combined.total_points_processed += result.total_points_processed;
        combined.original_point_count += result.original_point_count;
        combined.processing_time_ms += result.processing_time_ms;

        if let Some(plan) = &result.sampling {
            let entry = combined.sampling.get_or_insert(SamplingInfo {
                original_points: 0,
                retained_points: 0,
                step: 1,
                sample_rate: 1.0,
            });
            entry.original_points += plan.original_points;
            entry.retained_points += plan.retained_points;
            entry.step = entry.step.max(plan.step);
        }

        for shape in &result.shapes {
            let slot = *positions.entry(shape.shape_id.clone()).or_insert_with(|| {
                merged.push(ShapeStats::new(&shape.shape_id, &shape.shape_name));
                sums.push(MergeSums::default());
                merged.len() - 1
            });
            merge_shape(&mut merged[slot], &mut sums[slot], shape, w);
        }
    }

    for (stats, sum) in merged.iter_mut().zip(&sums) {
        if sum.speed_weight > 0.0 {
            stats.speed.avg_kmh = sum.speed_weighted / sum.speed_weight;
        }
        if sum.offpath_weight > 0.0 {
            stats.offpath.avg_abs_m = sum.offpath_weighted / sum.offpath_weight;
        }
        let dwell = &mut stats.dwell_time;
        dwell.average_visit_seconds = if dwell.entry_count > 0 {
            dwell.total_time_seconds / dwell.entry_count as f64
        } else {
            0.0
        };
        stats.refresh_percentages();
    }

    if let Some(plan) = combined.sampling.as_mut() {
        // Unsampled results still count toward the merged totals.
        let unsampled: u64 = results
            .iter()
            .filter(|r| r.sampling.is_none())
            .map(|r| r.total_points_processed)
            .sum();
        plan.original_points += unsampled as usize;
        plan.retained_points += unsampled as usize;
        plan.sample_rate = plan.retained_points as f64 / plan.original_points.max(1) as f64;
    }

    let first_window = results.first().and_then(|r| r.window);
    if results.iter().all(|r| r.window == first_window) {
        combined.window = first_window;
    }

    combined.shapes = merged;
    combined
}

fn merge_shape(into: &mut ShapeStats, sums: &mut MergeSums, from: &ShapeStats, weight: f64) {
    into.point_count += from.point_count;

    if from.speed.sample_count > 0 {
        if into.speed.sample_count == 0 {
            into.speed.min_kmh = from.speed.min_kmh;
            into.speed.max_kmh = from.speed.max_kmh;
        } else {
            into.speed.min_kmh = into.speed.min_kmh.min(from.speed.min_kmh);
            into.speed.max_kmh = into.speed.max_kmh.max(from.speed.max_kmh);
        }
        into.speed.sample_count += from.speed.sample_count;
        let w = from.speed.sample_count as f64 * weight;
        sums.speed_weighted += from.speed.avg_kmh * w;
        sums.speed_weight += w;
    }
    for (a, b) in into.speed.histogram.iter_mut().zip(&from.speed.histogram) {
        *a += b;
    }

    if from.offpath.sample_count > 0 {
        into.offpath.sample_count += from.offpath.sample_count;
        into.offpath.max_abs_m = into.offpath.max_abs_m.max(from.offpath.max_abs_m);
        let w = from.offpath.sample_count as f64 * weight;
        sums.offpath_weighted += from.offpath.avg_abs_m * w;
        sums.offpath_weight += w;
    }
    for (a, b) in into
        .offpath
        .severity_counts
        .iter_mut()
        .zip(&from.offpath.severity_counts)
    {
        *a += b;
    }

    for (state, seconds) in &from.state_durations_s {
        *into.state_durations_s.entry(state.clone()).or_insert(0.0) += seconds;
    }
    into.distance_m += from.distance_m;

    into.dwell_time = DwellStats {
        total_time_seconds: into.dwell_time.total_time_seconds + from.dwell_time.total_time_seconds,
        entry_count: into.dwell_time.entry_count + from.dwell_time.entry_count,
        average_visit_seconds: 0.0,
        max_continuous_seconds: into
            .dwell_time
            .max_continuous_seconds
            .max(from.dwell_time.max_continuous_seconds),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::VehicleStates;

    fn square_feature(id: &str, category: &str, min: f64, max: f64) -> serde_json::Value {
        serde_json::json!({
            "type": "Feature",
            "id": id,
            "properties": {"Name": id.to_uppercase(), "category": category},
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[min, min], [max, min], [max, max], [min, max], [min, min]]]
            }
        })
    }

    fn collection(features: Vec<serde_json::Value>) -> RegionCollection {
        let document = serde_json::json!({"type": "FeatureCollection", "features": features});
        serde_json::from_value(document).unwrap()
    }

    fn excluded() -> Vec<String> {
        AnalyticsConfig::default().excluded_categories
    }

    fn engine() -> ShapeAnalyticsEngine {
        ShapeAnalyticsEngine::new(AnalyticsConfig {
            chunk_size: 4,
            ..AnalyticsConfig::default()
        })
    }

    fn sample_at(t_s: f64, lat: f64, lon: f64, speed: f64, state: &str) -> Sample {
        let mut s = Sample::new("DT059", (t_s * 1000.0) as i64, lat, lon, speed);
        s.states = Some(VehicleStates {
            motion_controller: Some(state.to_string()),
            ..Default::default()
        });
        s
    }

    /// Region A spans lon 0..1, region B lon 2..3 (both lat 0..1).
    fn two_regions() -> Vec<RegionShape> {
        let features = vec![
            serde_json::json!({"id": "a", "properties": {"Name": "A"},
                "geometry": {"type": "Polygon",
                    "coordinates": [[
                        [0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]
                    ]]}}),
            serde_json::json!({"id": "b", "properties": {"Name": "B"},
                "geometry": {"type": "Polygon",
                    "coordinates": [[
                        [2.0, 0.0], [3.0, 0.0], [3.0, 1.0], [2.0, 1.0], [2.0, 0.0]
                    ]]}}),
        ];
        extract_shapes(&collection(features), &excluded())
    }

    /// 60 s in A (10 samples), then 40 s in B (10 samples).
    fn two_region_path() -> Vec<Sample> {
        let mut trace = Vec::new();
        for i in 0..10 {
            trace.push(sample_at(i as f64 * 6.0, 0.5, 0.1 + i as f64 * 0.05, 10.0, "Driving"));
        }
        for i in 0..10 {
            let (t_s, lon) = (60.0 + i as f64 * 4.0, 2.1 + i as f64 * 0.05);
            trace.push(sample_at(t_s, 0.5, lon, 30.0, "Driving"));
        }
        trace
    }

    #[test]
    fn test_extract_shapes_rules() {
        let features = vec![
            square_feature("pit", "Zone", 0.0, 1.0),
            square_feature("marker", "Pin", 0.0, 1.0),
            serde_json::json!({"id": "road", "properties": {"category": "Road"},
                "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 1.0]]}}),
            serde_json::json!({"id": "sliver", "properties": {},
                "geometry": {"type": "Polygon",
                    "coordinates": [[[0.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]}}),
            serde_json::json!({"id": "dumps", "properties": {"AsiName": "Dumps"},
                "geometry": {"type": "GeometryCollection", "geometries": [
                    {"type": "Point", "coordinates": [5.0, 5.0]},
                    {"type": "MultiPolygon", "coordinates": [
                        [[[4.0, 4.0], [5.0, 4.0], [5.0, 5.0], [4.0, 4.0]]],
                        [[[6.0, 6.0], [7.0, 6.0], [7.0, 7.0], [6.0, 6.0]]]
                    ]}
                ]}}),
        ];
        let shapes = extract_shapes(&collection(features), &excluded());
        let ids: Vec<&str> = shapes.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["pit", "dumps"]);
        assert_eq!(shapes[0].name, "PIT");
        assert_eq!(shapes[1].name, "Dumps");
        assert_eq!(shapes[1].polygons.len(), 2);
    }

    #[test]
    fn test_filter_is_idempotent() {
        let original = collection(vec![
            square_feature("pit", "Zone", 0.0, 1.0),
            square_feature("ref", "reference", 0.0, 5.0),
            square_feature("crusher", "Zone", 2.0, 3.0),
        ]);
        let shapes = extract_shapes(&original, &excluded());
        let filtered = filter_collection(&original, &excluded());
        assert_eq!(filtered.features.len(), 2);
        assert_eq!(extract_shapes(&filtered, &excluded()), shapes);
        assert_eq!(
            filter_collection(&filtered, &excluded()).features.len(),
            filtered.features.len()
        );
    }

    #[test]
    fn test_overlap_smallest_area_wins() {
        let shapes = extract_shapes(
            &collection(vec![
                square_feature("big", "Zone", 0.0, 10.0),
                square_feature("small", "Zone", 4.0, 6.0),
            ]),
            &excluded(),
        );
        let index = ShapeIndex::new(&shapes);
        assert_eq!(index.locate(GeoPoint::new(5.0, 5.0)), Some(1));
        assert_eq!(index.locate(GeoPoint::new(1.0, 1.0)), Some(0));
        assert_eq!(index.locate(GeoPoint::new(20.0, 20.0)), None);
    }

    #[test]
    fn test_overlap_equal_area_keeps_input_order() {
        let shapes = extract_shapes(
            &collection(vec![
                square_feature("first", "Zone", 0.0, 2.0),
                square_feature("second", "Zone", 0.0, 2.0),
            ]),
            &excluded(),
        );
        let index = ShapeIndex::new(&shapes);
        assert_eq!(index.locate(GeoPoint::new(1.0, 1.0)), Some(0));
    }

    #[test]
    fn test_locate_respects_holes_inside_envelope() {
        let donut = serde_json::json!({"id": "donut", "properties": {"Name": "Donut"},
            "geometry": {"type": "Polygon", "coordinates": [
                [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]],
                [[4.0, 4.0], [6.0, 4.0], [6.0, 6.0], [4.0, 6.0], [4.0, 4.0]]
            ]}});
        let shapes = extract_shapes(&collection(vec![donut]), &excluded());
        let index = ShapeIndex::new(&shapes);
        assert_eq!(index.locate(GeoPoint::new(2.0, 2.0)), Some(0));
        assert_eq!(index.locate(GeoPoint::new(5.0, 5.0)), None);
        assert_eq!(ShapeIndex::new(&[]).locate(GeoPoint::new(5.0, 5.0)), None);
    }

    #[test]
    fn test_sampling_rate_out_of_range_falls_back_to_threshold() {
        for sample_rate in [0.0, 1.5, f64::NAN, -0.2] {
            let engine = ShapeAnalyticsEngine::new(AnalyticsConfig {
                max_points_threshold: 10,
                sample_rate,
                ..AnalyticsConfig::default()
            });
            let plan = engine.sampling_plan(25).unwrap();
            assert_eq!(plan.step, 3, "rate {}", sample_rate);
            assert_eq!(plan.retained_points, 9);
            assert_eq!(plan.original_points, 25);
        }
        let engine = ShapeAnalyticsEngine::new(AnalyticsConfig {
            max_points_threshold: 10,
            ..AnalyticsConfig::default()
        });
        assert!(engine.sampling_plan(10).is_none());
    }

    #[tokio::test]
    async fn test_two_region_dwell_totals() {
        let shapes = two_regions();
        let trace = two_region_path();
        let result = engine()
            .compute_analytics("DT059", &trace, &shapes, None, &CancellationFlag::new(), |_| {})
            .await
            .unwrap();

        let a = result.shape("a").unwrap();
        let b = result.shape("b").unwrap();
        assert_eq!(a.point_count, 10);
        assert_eq!(b.point_count, 10);
        assert_eq!(a.dwell_time.entry_count, 1);
        assert_eq!(b.dwell_time.entry_count, 1);
        assert!((a.dwell_time.total_time_seconds - 60.0).abs() <= 6.0);
        assert!((b.dwell_time.total_time_seconds - 40.0).abs() <= 4.0);
        assert_eq!(a.state_durations_s["Driving"], a.dwell_time.total_time_seconds);
        assert_eq!(a.state_percentages["Driving"], 100.0);
        assert_eq!(result.total_points_processed, 20);
        assert_eq!(result.unassigned_points, 0);
    }

    #[tokio::test]
    async fn test_distance_excludes_transit_legs() {
        let shapes = two_regions();
        let trace = two_region_path();
        let result = engine()
            .compute_analytics("DT059", &trace, &shapes, None, &CancellationFlag::new(), |_| {})
            .await
            .unwrap();

        let a = result.shape("a").unwrap();
        let expected: f64 = (0..9)
            .map(|i| {
                haversine_m(
                    GeoPoint::new(0.5, 0.1 + i as f64 * 0.05),
                    GeoPoint::new(0.5, 0.1 + (i + 1) as f64 * 0.05),
                )
            })
            .sum();
        assert!((a.distance_m - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_speed_and_offpath_statistics() {
        let shapes = two_regions();
        let mut trace = vec![
            sample_at(0.0, 0.5, 0.5, 2.0, "Driving"),
            sample_at(10.0, 0.5, 0.5, 12.0, "Driving"),
            sample_at(20.0, 0.5, 0.5, -40.0, "Reversing"),
            sample_at(30.0, 0.5, 0.5, 22.0, "Stopped"),
        ];
        trace[0].offpath_deviation_m = Some(0.5);
        trace[1].offpath_deviation_m = Some(-1.0);
        trace[2].offpath_deviation_m = Some(1.5);

        let result = engine()
            .compute_analytics("DT059", &trace, &shapes, None, &CancellationFlag::new(), |_| {})
            .await
            .unwrap();
        let a = result.shape("a").unwrap();
        assert_eq!(a.speed.sample_count, 4);
        assert_eq!(a.speed.min_kmh, 2.0);
        assert_eq!(a.speed.max_kmh, 40.0);
        assert_eq!(a.speed.avg_kmh, 19.0);
        assert_eq!(a.speed.histogram, [1, 1, 1, 0, 1]);
        assert_eq!(a.speed.histogram_percentages[0], 25.0);

        assert_eq!(a.offpath.sample_count, 3);
        assert_eq!(a.offpath.max_abs_m, 1.5);
        assert!((a.offpath.avg_abs_m - 1.0).abs() < 1e-12);
        assert_eq!(a.offpath.severity_counts, [1, 1, 1]);

        assert_eq!(a.state_durations_s["Driving"], 20.0);
        assert_eq!(a.state_durations_s["Reversing"], 10.0);
        assert_eq!(a.state_durations_s["Stopped"], 0.0);
    }

    #[tokio::test]
    async fn test_visits_split_by_exit() {
        let shapes = two_regions();
        let trace = vec![
            sample_at(0.0, 0.5, 0.5, 10.0, "Driving"),
            sample_at(10.0, 0.5, 0.6, 10.0, "Driving"),
            sample_at(20.0, 0.5, 1.5, 10.0, "Driving"), // between regions
            sample_at(30.0, 0.5, 0.7, 10.0, "Driving"),
            sample_at(35.0, 0.5, 0.8, 10.0, "Driving"),
        ];
        let result = engine()
            .compute_analytics("DT059", &trace, &shapes, None, &CancellationFlag::new(), |_| {})
            .await
            .unwrap();
        let a = result.shape("a").unwrap();
        assert_eq!(a.dwell_time.entry_count, 2);
        assert_eq!(a.dwell_time.total_time_seconds, 25.0);
        assert_eq!(a.dwell_time.max_continuous_seconds, 20.0);
        assert_eq!(a.dwell_time.average_visit_seconds, 12.5);
        assert_eq!(result.unassigned_points, 1);
    }

    #[tokio::test]
    async fn test_window_restricts_trace() {
        let shapes = two_regions();
        let trace = two_region_path();
        let window = TimeRange::new(60_000, 200_000);
        let result = engine()
            .compute_analytics(
                "DT059",
                &trace,
                &shapes,
                Some(window),
                &CancellationFlag::new(),
                |_| {},
            )
            .await
            .unwrap();
        assert!(result.shape("a").is_none());
        assert_eq!(result.shape("b").unwrap().point_count, 10);
        assert_eq!(result.original_point_count, 10);
        assert_eq!(result.window, Some(window));
    }

    #[tokio::test]
    async fn test_sampling_above_threshold() {
        let shapes = two_regions();
        let trace = two_region_path();
        let engine = ShapeAnalyticsEngine::new(AnalyticsConfig {
            max_points_threshold: 10,
            sample_rate: 0.5,
            chunk_size: 4,
            ..AnalyticsConfig::default()
        });
        let mut phases = Vec::new();
        let result = engine
            .compute_analytics("DT059", &trace, &shapes, None, &CancellationFlag::new(), |p| {
                phases.push(p.phase)
            })
            .await
            .unwrap();
        let sampling = result.sampling.unwrap();
        assert_eq!(sampling.step, 2);
        assert_eq!(sampling.retained_points, 10);
        assert_eq!(result.total_points_processed, 10);
        assert_eq!(result.original_point_count, 20);
        assert_eq!(phases.first(), Some(&AnalyticsPhase::Sampling));
        assert_eq!(phases.last(), Some(&AnalyticsPhase::Finalizing));
    }

    #[tokio::test]
    async fn test_progress_is_reported_per_chunk() {
        let shapes = two_regions();
        let trace = two_region_path();
        let mut reports = Vec::new();
        engine()
            .compute_analytics("DT059", &trace, &shapes, None, &CancellationFlag::new(), |p| {
                reports.push(p)
            })
            .await
            .unwrap();
        let processing: Vec<&AnalyticsProgress> = reports
            .iter()
            .filter(|p| p.phase == AnalyticsPhase::Processing)
            .collect();
        // 20 samples in chunks of 4
        assert_eq!(processing.len(), 5);
        assert_eq!(processing.last().unwrap().percentage, 100.0);
        assert_eq!(processing.last().unwrap().estimated_remaining_ms, Some(0));
    }

    #[tokio::test]
    async fn test_cancellation_discards_results() {
        let shapes = two_regions();
        let trace = two_region_path();
        let cancel = CancellationFlag::new();
        let flag = cancel.clone();
        let outcome = engine()
            .compute_analytics("DT059", &trace, &shapes, None, &cancel, |p| {
                if p.percentage >= 40.0 {
                    flag.cancel();
                }
            })
            .await;
        assert_eq!(
            outcome,
            Err(AnalyticsError::Cancelled {
                processed: 8,
                total: 20
            })
        );
    }

    fn result_with(
        vehicle: &str,
        points: u64,
        avg_speed: f64,
        min: f64,
        max: f64,
    ) -> ShapeAnalyticsResult {
        let mut stats = ShapeStats::new("pit", "Pit");
        stats.point_count = points;
        stats.speed.sample_count = points;
        stats.speed.avg_kmh = avg_speed;
        stats.speed.min_kmh = min;
        stats.speed.max_kmh = max;
        stats.speed.histogram = [points, 0, 0, 0, 0];
        stats.state_durations_s.insert("Driving".to_string(), points as f64);
        stats.distance_m = 100.0;
        stats.dwell_time.record_visit(points as f64);
        ShapeAnalyticsResult {
            vehicle_ids: vec![vehicle.to_string()],
            shapes: vec![stats],
            total_points_processed: points,
            original_point_count: points,
            ..Default::default()
        }
    }

    #[test]
    fn test_combine_weighted_average() {
        let combined = combine(
            &[
                result_with("DT059", 100, 10.0, 2.0, 30.0),
                result_with("DT060", 300, 20.0, 1.0, 25.0),
            ],
            None,
        );
        let pit = combined.shape("pit").unwrap();
        assert_eq!(pit.point_count, 400);
        assert!((pit.speed.avg_kmh - 17.5).abs() < 1e-12);
        assert_eq!(pit.speed.min_kmh, 1.0);
        assert_eq!(pit.speed.max_kmh, 30.0);
        assert_eq!(pit.distance_m, 200.0);
        assert_eq!(pit.dwell_time.entry_count, 2);
        assert_eq!(pit.dwell_time.average_visit_seconds, 200.0);
        assert_eq!(pit.dwell_time.max_continuous_seconds, 300.0);
        assert_eq!(pit.speed.histogram_percentages[0], 100.0);
        assert_eq!(pit.state_percentages["Driving"], 100.0);
        assert_eq!(combined.vehicle_ids, vec!["DT059", "DT060"]);
        assert_eq!(combined.total_points_processed, 400);
    }

    #[test]
    fn test_combine_with_caller_weights() {
        let combined = combine(
            &[
                result_with("DT059", 100, 10.0, 2.0, 30.0),
                result_with("DT060", 100, 20.0, 1.0, 25.0),
            ],
            Some(&[3.0, 1.0]),
        );
        assert!((combined.shape("pit").unwrap().speed.avg_kmh - 12.5).abs() < 1e-12);
    }

    #[test]
    fn test_combine_empty() {
        let combined = combine(&[], None);
        assert!(combined.shapes.is_empty());
        assert_eq!(combined.total_points_processed, 0);
    }
}
