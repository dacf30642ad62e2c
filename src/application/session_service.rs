// Session service - loads a replay session and answers queries over it
use crate::application::alarm_clustering::{cluster_in_window, group_nearby};
use crate::application::playback_engine::PlaybackEngine;
use crate::application::shape_analytics::{extract_shapes, filter_collection, ShapeIndex};
use crate::application::trace_repository::TraceRepository;
use crate::application::trace_store::{LoadReport, TraceStore, VehicleSummary};
use crate::domain::alarm::{classify_alarm, AlarmCluster, AlarmEvent, AlarmSeverity};
use crate::domain::geometry::{simplify_polyline, GeoPoint};
use crate::domain::playback::PositionSnapshot;
use crate::domain::region::{RegionCollection, RegionShape};
use crate::domain::sample::{format_timestamp_ms, parse_timestamp_ms, TimeRange};
use crate::infrastructure::config::{AppConfig, ClusteringConfig, ExportConfig, PlaybackConfig};
use serde::Serialize;
use std::sync::Arc;

const DEFAULT_LOOKBACK_MS: i64 = 24 * 60 * 60 * 1000;

/// One alarm row for export, positioned at its vehicle's nearest sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmExportRow {
    pub timestamp: String,
    pub timestamp_ms: i64,
    pub vehicle: String,
    pub alarm_type: Option<String>,
    pub severity: AlarmSeverity,
    pub message: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_kmh: Option<f64>,
    pub off_path_error_m: Option<f64>,
    /// Peak absolute pitch around the alarm time
    pub pitch_deg: Option<f64>,
    pub pitch_min_deg: Option<f64>,
    pub pitch_max_deg: Option<f64>,
    /// Peak absolute roll around the alarm time
    pub roll_deg: Option<f64>,
    pub roll_min_deg: Option<f64>,
    pub roll_max_deg: Option<f64>,
    /// Name of the containing region, empty when outside every region
    pub shape_name: String,
}

/// `(peak |x|, min, max)` over the finite values.
fn extremes(values: impl Iterator<Item = f64>) -> Option<(f64, f64, f64)> {
    values
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| match acc {
            None => Some((v.abs(), v, v)),
            Some((peak, min, max)) => Some((peak.max(v.abs()), min.min(v), max.max(v))),
        })
}

/// The source's own type when it is still registered, else the message
/// classified against the registered types.
fn effective_type(alarm: &AlarmEvent, known_types: &[String]) -> Option<String> {
    alarm
        .alarm_type
        .as_ref()
        .and_then(|t| known_types.iter().find(|k| k.eq_ignore_ascii_case(t)))
        .cloned()
        .or_else(|| classify_alarm(&alarm.message, known_types))
}

#[derive(Clone)]
pub struct SessionService {
    store: Arc<TraceStore>,
    shapes: Arc<Vec<RegionShape>>,
    alarms: Arc<Vec<AlarmEvent>>,
    reports: Arc<Vec<LoadReport>>,
    regions: Arc<RegionCollection>,
    playback: PlaybackConfig,
    clustering: ClusteringConfig,
    export: ExportConfig,
}

/// Optional `start`/`end` bounds from configuration.
pub fn configured_range(config: &AppConfig) -> anyhow::Result<Option<TimeRange>> {
    let parse = |value: &Option<String>| -> anyhow::Result<Option<i64>> {
        value
            .as_deref()
            .map(|v| {
                parse_timestamp_ms(v)
                    .ok_or_else(|| anyhow::anyhow!("Invalid timestamp in config: {}", v))
            })
            .transpose()
    };
    Ok(match (parse(&config.source.start)?, parse(&config.source.end)?) {
        (Some(start), Some(end)) => Some(TimeRange::new(start, end)),
        (Some(start), None) => Some(TimeRange::new(start, chrono::Utc::now().timestamp_millis())),
        (None, Some(end)) => Some(TimeRange::new(end - DEFAULT_LOOKBACK_MS, end)),
        (None, None) => None,
    })
}

impl SessionService {
    pub fn new(
        store: TraceStore,
        shapes: Vec<RegionShape>,
        mut alarms: Vec<AlarmEvent>,
        reports: Vec<LoadReport>,
        config: &AppConfig,
    ) -> Self {
        alarms.sort_by_key(|a| a.timestamp_ms);
        Self {
            store: Arc::new(store),
            shapes: Arc::new(shapes),
            alarms: Arc::new(alarms),
            reports: Arc::new(reports),
            regions: Arc::new(RegionCollection::default()),
            playback: config.playback.clone(),
            clustering: config.clustering.clone(),
            export: config.export.clone(),
        }
    }

    /// Keep the source feature collection (excluded categories removed) for map display.
    pub fn with_regions(mut self, regions: RegionCollection) -> Self {
        self.regions = Arc::new(regions);
        self
    }

    /// Load every configured vehicle, the region file and alarms from `repository`.
    /// A vehicle whose samples fail to load is skipped; the session still starts.
    pub async fn load(
        repository: Arc<dyn TraceRepository>,
        config: &AppConfig,
    ) -> anyhow::Result<Self> {
        let range = configured_range(config)?;
        let vehicle_ids = if config.source.vehicles.is_empty() {
            repository.list_vehicle_ids(range).await?
        } else {
            config.source.vehicles.clone()
        };

        let mut store = TraceStore::new();
        let mut reports = Vec::with_capacity(vehicle_ids.len());
        for vehicle_id in &vehicle_ids {
            match repository.load_samples(vehicle_id, range).await {
                Ok(samples) => {
                    let report = store.load(vehicle_id, samples);
                    tracing::info!("Loaded {} samples for {}", report.accepted, vehicle_id);
                    reports.push(report);
                }
                Err(e) => tracing::error!("Failed to load trace for {}: {:#}", vehicle_id, e),
            }
        }

        if store.is_empty() {
            tracing::warn!("No usable samples loaded; playback will be static");
        }

        let excluded = &config.analytics.excluded_categories;
        let regions = match repository.load_regions().await {
            Ok(regions) => filter_collection(&regions, excluded),
            Err(e) => {
                tracing::error!("Failed to load regions: {:#}", e);
                RegionCollection::default()
            }
        };
        let shapes = extract_shapes(&regions, excluded);

        let alarms = repository
            .load_alarms(&vehicle_ids, range)
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Failed to load alarms: {:#}", e);
                Vec::new()
            });

        let range = store.global_range();
        tracing::info!(
            "Session ready: {} vehicles, {} samples, {} regions, {} alarms, {} - {}",
            store.vehicle_ids().len(),
            store.total_samples(),
            shapes.len(),
            alarms.len(),
            format_timestamp_ms(range.start_ms),
            format_timestamp_ms(range.end_ms)
        );
        Ok(Self::new(store, shapes, alarms, reports, config).with_regions(regions))
    }

    pub fn store(&self) -> Arc<TraceStore> {
        self.store.clone()
    }

    pub fn shapes(&self) -> Arc<Vec<RegionShape>> {
        self.shapes.clone()
    }

    pub fn regions(&self) -> Arc<RegionCollection> {
        self.regions.clone()
    }

    pub fn playback_config(&self) -> &PlaybackConfig {
        &self.playback
    }

    pub fn load_reports(&self) -> &[LoadReport] {
        &self.reports
    }

    pub fn vehicles(&self) -> Vec<VehicleSummary> {
        self.store.vehicle_summaries()
    }

    /// Simplified polyline of a vehicle's path, or None for an unknown vehicle
    pub fn vehicle_path(&self, vehicle_id: &str, tolerance_deg: f64) -> Option<Vec<GeoPoint>> {
        let trace = self.store.trace(vehicle_id)?;
        let points: Vec<GeoPoint> = trace
            .iter()
            .map(|s| GeoPoint::new(s.latitude, s.longitude))
            .collect();
        Some(simplify_polyline(&points, tolerance_deg.max(0.0)))
    }

    /// Fleet snapshot at `t_ms`, with seek semantics (clamped into the loaded range).
    pub fn positions_at(&self, t_ms: i64) -> Vec<PositionSnapshot> {
        let mut engine = PlaybackEngine::new(self.store.clone(), self.playback.clone());
        engine.seek(t_ms as f64);
        engine.current_positions()
    }

    pub fn alarm_clusters(
        &self,
        time_window_ms: Option<i64>,
        distance_threshold_deg: Option<f64>,
        window: Option<TimeRange>,
    ) -> Vec<AlarmCluster> {
        let time_window_ms = time_window_ms.unwrap_or(self.clustering.time_window_ms);
        let distance = distance_threshold_deg.unwrap_or(self.clustering.distance_threshold_deg);
        match window {
            Some(window) => {
                cluster_in_window(&self.alarms, &self.store, &window, time_window_ms, distance)
            }
            None => group_nearby(&self.alarms, &self.store, time_window_ms, distance),
        }
    }

    /// Alarms matching the vehicle and type filters (empty filter = everything), sorted by time.
    /// Types are resolved against `known_types`, the currently registered alarm types.
    pub fn export_alarms(
        &self,
        vehicle_ids: &[String],
        alarm_types: &[String],
        known_types: &[String],
    ) -> Vec<AlarmExportRow> {
        let index = ShapeIndex::new(&self.shapes);
        let half_window = self.export.telemetry_window_ms.max(0);
        self.alarms
            .iter()
            .filter(|a| vehicle_ids.is_empty() || vehicle_ids.contains(&a.vehicle_id))
            .filter_map(|a| {
                let alarm_type = effective_type(a, known_types);
                let wanted = alarm_type.as_ref().is_some_and(|t| alarm_types.contains(t));
                if !alarm_types.is_empty() && !wanted {
                    return None;
                }

                let nearest = self.store.nearest_sample(&a.vehicle_id, a.timestamp_ms);
                let location = nearest
                    .map(|s| GeoPoint::new(s.latitude, s.longitude))
                    .or(a.location);
                let shape_name = location
                    .and_then(|p| index.locate(p))
                    .map(|i| self.shapes[i].name.clone())
                    .unwrap_or_default();

                let around = self.store.window(
                    &a.vehicle_id,
                    &TimeRange::new(a.timestamp_ms - half_window, a.timestamp_ms + half_window),
                );
                let pitch = extremes(around.iter().filter_map(|s| s.pitch_deg));
                let roll = extremes(around.iter().filter_map(|s| s.roll_deg));

                Some(AlarmExportRow {
                    timestamp: format_timestamp_ms(a.timestamp_ms),
                    timestamp_ms: a.timestamp_ms,
                    vehicle: a.vehicle_id.clone(),
                    alarm_type,
                    severity: a.severity,
                    message: a.message.clone(),
                    latitude: location.map(|p| p.latitude),
                    longitude: location.map(|p| p.longitude),
                    speed_kmh: nearest.map(|s| s.speed_kmh),
                    off_path_error_m: nearest.and_then(|s| s.offpath_deviation_m),
                    pitch_deg: pitch.map(|p| p.0),
                    pitch_min_deg: pitch.map(|p| p.1),
                    pitch_max_deg: pitch.map(|p| p.2),
                    roll_deg: roll.map(|r| r.0),
                    roll_min_deg: roll.map(|r| r.1),
                    roll_max_deg: roll.map(|r| r.2),
                    shape_name,
                })
            })
            .collect()
    }
}
