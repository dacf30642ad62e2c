// Playback engine - time cursor state machine and interpolated positions
use crate::application::trace_store::TraceStore;
use crate::domain::error::PlaybackError;
use crate::domain::geometry::lerp;
use crate::domain::playback::{PlaybackState, PlaybackStatus, PositionSnapshot};
use crate::domain::sample::{Sample, TimeRange};
use crate::infrastructure::config::PlaybackConfig;
use std::sync::Arc;

/// Segment ends within this fraction of a sample are never reported as moving.
const MOVING_PROGRESS_MARGIN: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not playing; nothing changed.
    Idle,
    Advanced,
    /// The cursor hit the end of the window and playback paused.
    ReachedEnd,
}

pub struct PlaybackEngine {
    store: Arc<TraceStore>,
    config: PlaybackConfig,
    loaded_range: TimeRange,
    state: PlaybackState,
}

impl PlaybackEngine {
    pub fn new(store: Arc<TraceStore>, config: PlaybackConfig) -> Self {
        let loaded_range = store.global_range();
        Self {
            store,
            config,
            loaded_range,
            state: PlaybackState {
                current_ms: loaded_range.start_ms as f64,
                status: PlaybackStatus::Stopped,
                speed_multiplier: 1.0,
                start_ms: loaded_range.start_ms,
                end_ms: loaded_range.end_ms,
            },
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.state.start_ms, self.state.end_ms)
    }

    /// Empty or single-instant data: the engine shows one static frame.
    pub fn is_static(&self) -> bool {
        self.range().is_degenerate()
    }

    /// Stopped/Paused -> Playing. From Paused at the end of the window the
    /// engine stays Paused; seek back or stop first.
    pub fn play(&mut self) -> PlaybackStatus {
        if self.is_static() {
            tracing::debug!("Playback window has no duration; staying on a single frame");
            self.state.status = PlaybackStatus::Paused;
            return self.state.status;
        }
        if self.state.current_ms >= self.state.end_ms as f64 {
            tracing::debug!("Playback cursor is at the end of the window; play ignored");
            self.state.status = PlaybackStatus::Paused;
            return self.state.status;
        }
        self.state.status = PlaybackStatus::Playing;
        self.state.status
    }

    pub fn pause(&mut self) -> PlaybackStatus {
        if self.state.status == PlaybackStatus::Playing {
            self.state.status = PlaybackStatus::Paused;
        }
        self.state.status
    }

    pub fn stop(&mut self) {
        self.state.status = PlaybackStatus::Stopped;
        self.state.current_ms = self.state.start_ms as f64;
    }

    /// Move the cursor, clamped to the window. Playing stays playing and
    /// paused stays paused; a stopped engine becomes paused since Stopped
    /// pins the cursor to the start.
    pub fn seek(&mut self, t_ms: f64) {
        if !t_ms.is_finite() {
            tracing::warn!("Ignoring seek to non-finite time {}", t_ms);
            return;
        }
        self.state.current_ms = t_ms.clamp(self.state.start_ms as f64, self.state.end_ms as f64);
        if self.state.status == PlaybackStatus::Stopped {
            self.state.status = PlaybackStatus::Paused;
        }
    }

    /// Returns the multiplier actually applied after clamping to the configured range.
    pub fn set_speed(&mut self, multiplier: f64) -> Result<f64, PlaybackError> {
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(PlaybackError::InvalidSpeed(multiplier));
        }
        let clamped = multiplier.clamp(self.config.min_speed, self.config.max_speed);
        if clamped != multiplier {
            tracing::debug!("Clamped speed multiplier {} to {}", multiplier, clamped);
        }
        self.state.speed_multiplier = clamped;
        Ok(clamped)
    }

    /// Advance by a wall-clock delta scaled by the speed multiplier.
    pub fn tick(&mut self, dt_wall_ms: f64) -> TickOutcome {
        if !self.state.is_playing() || !dt_wall_ms.is_finite() || dt_wall_ms < 0.0 {
            return TickOutcome::Idle;
        }
        let end = self.state.end_ms as f64;
        self.state.current_ms += dt_wall_ms * self.state.speed_multiplier;
        if self.state.current_ms >= end {
            self.state.current_ms = end;
            self.state.status = PlaybackStatus::Paused;
            return TickOutcome::ReachedEnd;
        }
        TickOutcome::Advanced
    }

    /// Narrow the window to `range` intersected with the loaded data.
    /// Returns the effective window, or None when they do not overlap.
    pub fn restrict_range(&mut self, range: TimeRange) -> Option<TimeRange> {
        let Some(effective) = self.loaded_range.intersect(&range) else {
            tracing::warn!(
                "Requested range {}..{} lies outside loaded data {}..{}",
                range.start_ms,
                range.end_ms,
                self.loaded_range.start_ms,
                self.loaded_range.end_ms
            );
            return None;
        };
        self.apply_window(effective);
        Some(effective)
    }

    pub fn clear_restriction(&mut self) {
        self.apply_window(self.loaded_range);
    }

    /// Swap in a freshly loaded store. Only valid while nothing else reads the old one.
    pub fn reload(&mut self, store: Arc<TraceStore>) {
        self.loaded_range = store.global_range();
        self.store = store;
        self.apply_window(self.loaded_range);
        self.stop();
    }

    fn apply_window(&mut self, window: TimeRange) {
        self.state.start_ms = window.start_ms;
        self.state.end_ms = window.end_ms;
        if self.state.status == PlaybackStatus::Stopped {
            self.state.current_ms = window.start_ms as f64;
        } else {
            self.state.current_ms = self
                .state
                .current_ms
                .clamp(window.start_ms as f64, window.end_ms as f64);
        }
        if self.is_static() && self.state.status == PlaybackStatus::Playing {
            self.state.status = PlaybackStatus::Paused;
        }
    }

    pub fn current_positions(&self) -> Vec<PositionSnapshot> {
        compute_positions(&self.state, &self.store, &self.config)
    }
}

/// Positions of every vehicle at the state's cursor, ordered by vehicle id.
pub fn compute_positions(
    state: &PlaybackState,
    store: &TraceStore,
    config: &PlaybackConfig,
) -> Vec<PositionSnapshot> {
    store
        .traces()
        .filter_map(|(_, trace)| position_at(trace, state.current_ms, config))
        .collect()
}

fn frozen(sample: &Sample) -> PositionSnapshot {
    PositionSnapshot {
        vehicle_id: sample.vehicle_id.clone(),
        latitude: sample.latitude,
        longitude: sample.longitude,
        speed_kmh: sample.speed_kmh,
        offpath_deviation_m: sample.offpath_deviation_m,
        states: sample.states.clone(),
        timestamp_ms: sample.timestamp_ms,
        is_moving: false,
    }
}

/// Interpolated position of one trace at `t_ms`.
pub fn position_at(
    trace: &[Sample],
    t_ms: f64,
    config: &PlaybackConfig,
) -> Option<PositionSnapshot> {
    let first = trace.first()?;
    let last = trace.last()?;
    if trace.len() == 1 || t_ms <= first.timestamp_ms as f64 {
        return Some(frozen(first));
    }
    if t_ms >= last.timestamp_ms as f64 {
        return Some(frozen(last));
    }

    let idx = trace.partition_point(|s| s.timestamp_ms as f64 <= t_ms);
    let prev = &trace[idx - 1];
    let next = &trace[idx];
    let gap_ms = next.timestamp_ms - prev.timestamp_ms;
    if gap_ms > config.max_interpolation_gap_ms {
        // Data outage: hold the last known sample rather than sliding across the gap.
        return Some(frozen(prev));
    }

    let p = (t_ms - prev.timestamp_ms as f64) / gap_ms as f64;
    let speed_kmh = lerp(prev.speed_kmh, next.speed_kmh, p);
    let offpath_deviation_m = match (prev.offpath_deviation_m, next.offpath_deviation_m) {
        (Some(a), Some(b)) => Some(lerp(a, b, p)),
        (carried, _) => carried,
    };
    let is_moving = speed_kmh.abs() > config.moving_speed_threshold_kmh
        && p > MOVING_PROGRESS_MARGIN
        && p < 1.0 - MOVING_PROGRESS_MARGIN;

    Some(PositionSnapshot {
        vehicle_id: prev.vehicle_id.clone(),
        latitude: lerp(prev.latitude, next.latitude, p),
        longitude: lerp(prev.longitude, next.longitude, p),
        speed_kmh,
        offpath_deviation_m,
        states: prev.states.clone(),
        timestamp_ms: t_ms.round() as i64,
        is_moving,
    })
}

/// Deterministic rate limit applied at the tick boundary: a snapshot goes out
/// only when `min_interval_ms` of host time has passed since the previous one,
/// unless the caller forces it (status changes, seeks).
#[derive(Debug, Clone)]
pub struct SnapshotThrottle {
    min_interval_ms: u64,
    last_emit_ms: Option<u64>,
}

impl SnapshotThrottle {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms,
            last_emit_ms: None,
        }
    }

    pub fn should_emit(&mut self, now_ms: u64, forced: bool) -> bool {
        let due = match self.last_emit_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.min_interval_ms,
        };
        if due || forced {
            self.last_emit_ms = Some(now_ms);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sample::VehicleStates;

    const S: i64 = 1000;

    fn sample(vehicle: &str, t_s: i64, lat: f64, lon: f64, speed: f64) -> Sample {
        Sample::new(vehicle, t_s * S, lat, lon, speed)
    }

    fn engine_with(traces: Vec<(&str, Vec<Sample>)>) -> PlaybackEngine {
        let mut store = TraceStore::new();
        for (id, samples) in traces {
            store.load(id, samples);
        }
        PlaybackEngine::new(Arc::new(store), PlaybackConfig::default())
    }

    #[test]
    fn test_positions_at_start_are_first_samples() {
        let engine = engine_with(vec![
            ("A", vec![sample("A", 0, 1.0, 2.0, 10.0), sample("A", 10, 3.0, 4.0, 10.0)]),
            ("B", vec![sample("B", 5, 5.0, 6.0, 20.0), sample("B", 20, 7.0, 8.0, 20.0)]),
        ]);
        assert_eq!(engine.state().current_ms, 0.0);
        let positions = engine.current_positions();
        assert_eq!(positions.len(), 2);
        assert_eq!((positions[0].latitude, positions[0].longitude), (1.0, 2.0));
        assert_eq!((positions[1].latitude, positions[1].longitude), (5.0, 6.0));
        assert!(positions.iter().all(|p| !p.is_moving));
    }

    #[test]
    fn test_single_sample_vehicle_is_constant() {
        let mut engine = engine_with(vec![
            ("A", vec![sample("A", 0, 1.0, 1.0, 10.0), sample("A", 100, 2.0, 2.0, 10.0)]),
            ("B", vec![sample("B", 50, 9.0, 9.0, 30.0)]),
        ]);
        for t in [0, 25, 50, 75, 100] {
            engine.seek((t * S) as f64);
            let b = engine
                .current_positions()
                .into_iter()
                .find(|p| p.vehicle_id == "B")
                .unwrap();
            assert_eq!((b.latitude, b.longitude), (9.0, 9.0));
            assert!(!b.is_moving);
        }
    }

    #[test]
    fn test_linear_interpolation_and_state_carry_forward() {
        let mut prev = sample("A", 0, 0.0, 0.0, 10.0);
        prev.states = Some(VehicleStates {
            motion_controller: Some("Driving".to_string()),
            ..Default::default()
        });
        prev.offpath_deviation_m = Some(0.2);
        let mut next = sample("A", 10, 1.0, 2.0, 30.0);
        next.states = Some(VehicleStates {
            motion_controller: Some("Stopping".to_string()),
            ..Default::default()
        });
        next.offpath_deviation_m = Some(0.6);

        let mut engine = engine_with(vec![("A", vec![prev, next])]);
        engine.seek(2_500.0);
        let p = &engine.current_positions()[0];
        assert!((p.latitude - 0.25).abs() < 1e-12);
        assert!((p.longitude - 0.5).abs() < 1e-12);
        assert!((p.speed_kmh - 15.0).abs() < 1e-12);
        assert!((p.offpath_deviation_m.unwrap() - 0.3).abs() < 1e-12);
        assert_eq!(
            p.states.as_ref().unwrap().motion_controller.as_deref(),
            Some("Driving")
        );
        assert!(p.is_moving);
        assert_eq!(p.timestamp_ms, 2_500);
    }

    #[test]
    fn test_moving_flag_excludes_segment_ends() {
        let mut engine = engine_with(vec![(
            "A",
            vec![sample("A", 0, 0.0, 0.0, 20.0), sample("A", 100, 1.0, 1.0, 20.0)],
        )]);
        engine.seek(2_000.0); // p = 0.02
        assert!(!engine.current_positions()[0].is_moving);
        engine.seek(50_000.0);
        assert!(engine.current_positions()[0].is_moving);
        engine.seek(98_000.0); // p = 0.98
        assert!(!engine.current_positions()[0].is_moving);
    }

    #[test]
    fn test_slow_vehicle_is_not_moving() {
        let mut engine = engine_with(vec![(
            "A",
            vec![sample("A", 0, 0.0, 0.0, 0.5), sample("A", 10, 0.0, 0.0, 0.5)],
        )]);
        engine.seek(5_000.0);
        assert!(!engine.current_positions()[0].is_moving);
    }

    #[test]
    fn test_gap_policy_freezes_at_previous_sample() {
        let mut engine = engine_with(vec![(
            "A",
            vec![sample("A", 0, 0.0, 0.0, 25.0), sample("A", 400, 4.0, 4.0, 25.0)],
        )]);
        engine.seek(200_000.0);
        let p = &engine.current_positions()[0];
        assert_eq!((p.latitude, p.longitude), (0.0, 0.0));
        assert_eq!(p.timestamp_ms, 0);
        assert!(!p.is_moving);
    }

    #[test]
    fn test_gap_equal_to_limit_still_interpolates() {
        // 300 s apart, exactly the default limit
        let mut engine = engine_with(vec![(
            "A",
            vec![sample("A", 0, 0.0, 0.0, 25.0), sample("A", 300, 3.0, 3.0, 25.0)],
        )]);
        assert_eq!(PlaybackConfig::default().max_interpolation_gap_ms, 300_000);
        engine.seek(150_000.0);
        let p = &engine.current_positions()[0];
        assert!((p.latitude - 1.5).abs() < 1e-12);
        assert_eq!(p.timestamp_ms, 150_000);
        assert!(p.is_moving);
    }

    #[test]
    fn test_before_and_after_trace_bounds() {
        let mut engine = engine_with(vec![
            ("A", vec![sample("A", 0, 0.0, 0.0, 10.0), sample("A", 100, 9.0, 9.0, 10.0)]),
            ("B", vec![sample("B", 40, 4.0, 4.0, 10.0), sample("B", 60, 6.0, 6.0, 10.0)]),
        ]);
        engine.seek(10_000.0);
        let b = engine.current_positions()[1].clone();
        assert_eq!((b.latitude, b.longitude, b.is_moving), (4.0, 4.0, false));
        engine.seek(90_000.0);
        let b = engine.current_positions()[1].clone();
        assert_eq!((b.latitude, b.longitude, b.is_moving), (6.0, 6.0, false));
    }

    #[test]
    fn test_empty_trace_contributes_nothing() {
        let engine = engine_with(vec![
            ("A", vec![sample("A", 0, 0.0, 0.0, 10.0), sample("A", 10, 1.0, 1.0, 10.0)]),
            ("B", vec![]),
        ]);
        let positions = engine.current_positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].vehicle_id, "A");
    }

    #[test]
    fn test_reseek_is_idempotent() {
        let mut engine = engine_with(vec![(
            "A",
            vec![
                sample("A", 0, 0.0, 0.0, 10.0),
                sample("A", 7, 0.3, 0.1, 12.0),
                sample("A", 19, 0.9, 0.4, 8.0),
            ],
        )]);
        engine.seek(11_234.0);
        let first = engine.current_positions();
        let second = engine.current_positions();
        assert_eq!(first, second);
        engine.seek(11_234.0);
        assert_eq!(first, engine.current_positions());
    }

    #[test]
    fn test_tick_clamps_at_end_and_pauses() {
        let mut engine = engine_with(vec![(
            "A",
            vec![sample("A", 0, 0.0, 0.0, 10.0), sample("A", 1000, 1.0, 1.0, 10.0)],
        )]);
        engine.seek(900_000.0); // 100 s remaining
        engine.set_speed(4.0).unwrap();
        assert_eq!(engine.play(), PlaybackStatus::Playing);
        // 125 s of wall clock at 4x is a 500 s advance
        assert_eq!(engine.tick(125_000.0), TickOutcome::ReachedEnd);
        let state = engine.state();
        assert_eq!(state.current_ms, 1_000_000.0);
        assert_eq!(state.status, PlaybackStatus::Paused);
    }

    #[test]
    fn test_play_at_end_stays_paused() {
        let mut engine = engine_with(vec![(
            "A",
            vec![sample("A", 0, 0.0, 0.0, 10.0), sample("A", 10, 1.0, 1.0, 10.0)],
        )]);
        engine.play();
        assert_eq!(engine.tick(20_000.0), TickOutcome::ReachedEnd);
        assert_eq!(engine.play(), PlaybackStatus::Paused);
        assert_eq!(engine.state().current_ms, 10_000.0);

        engine.seek(4_000.0);
        assert_eq!(engine.play(), PlaybackStatus::Playing);
    }

    #[test]
    fn test_tick_is_noop_unless_playing() {
        let mut engine = engine_with(vec![(
            "A",
            vec![sample("A", 0, 0.0, 0.0, 10.0), sample("A", 100, 1.0, 1.0, 10.0)],
        )]);
        assert_eq!(engine.tick(1_000.0), TickOutcome::Idle);
        assert_eq!(engine.state().current_ms, 0.0);

        engine.play();
        assert_eq!(engine.tick(1_000.0), TickOutcome::Advanced);
        assert_eq!(engine.state().current_ms, 1_000.0);
        engine.pause();
        assert_eq!(engine.tick(1_000.0), TickOutcome::Idle);
        assert_eq!(engine.state().current_ms, 1_000.0);
    }

    #[test]
    fn test_state_transitions() {
        let mut engine = engine_with(vec![(
            "A",
            vec![sample("A", 10, 0.0, 0.0, 10.0), sample("A", 110, 1.0, 1.0, 10.0)],
        )]);
        assert_eq!(engine.state().status, PlaybackStatus::Stopped);

        engine.seek(50_000.0);
        assert_eq!(engine.state().status, PlaybackStatus::Paused);
        engine.play();
        engine.seek(-5.0);
        assert_eq!(engine.state().status, PlaybackStatus::Playing);
        assert_eq!(engine.state().current_ms, 10_000.0);

        engine.seek(1e12);
        assert_eq!(engine.state().current_ms, 110_000.0);

        engine.stop();
        assert_eq!(engine.state().status, PlaybackStatus::Stopped);
        assert_eq!(engine.state().current_ms, 10_000.0);
    }

    #[test]
    fn test_set_speed_clamps_and_rejects_invalid() {
        let mut engine = engine_with(vec![]);
        assert_eq!(engine.set_speed(2.0), Ok(2.0));
        assert_eq!(engine.set_speed(100.0), Ok(8.0));
        assert_eq!(engine.set_speed(0.01), Ok(0.25));
        assert!(engine.set_speed(f64::NAN).is_err());
        assert!(engine.set_speed(-1.0).is_err());
        assert_eq!(engine.state().speed_multiplier, 0.25);
        assert_eq!(engine.state().status, PlaybackStatus::Stopped);
    }

    #[test]
    fn test_degenerate_range_is_static() {
        let mut engine = engine_with(vec![("A", vec![sample("A", 42, 1.0, 1.0, 10.0)])]);
        assert!(engine.is_static());
        assert_eq!(engine.play(), PlaybackStatus::Paused);
        assert_eq!(engine.tick(10_000.0), TickOutcome::Idle);
        assert_eq!(engine.state().current_ms, 42_000.0);
        assert_eq!(engine.current_positions().len(), 1);

        let empty = engine_with(vec![]);
        assert!(empty.is_static());
        assert!(empty.current_positions().is_empty());
    }

    #[test]
    fn test_restrict_range() {
        let mut engine = engine_with(vec![(
            "A",
            vec![sample("A", 0, 0.0, 0.0, 10.0), sample("A", 100, 1.0, 1.0, 10.0)],
        )]);
        engine.seek(90_000.0);
        let window = engine.restrict_range(TimeRange::new(20_000, 60_000)).unwrap();
        assert_eq!(window, TimeRange::new(20_000, 60_000));
        assert_eq!(engine.state().current_ms, 60_000.0);

        assert!(engine.restrict_range(TimeRange::new(500_000, 600_000)).is_none());
        assert_eq!(engine.range(), TimeRange::new(20_000, 60_000));

        engine.clear_restriction();
        assert_eq!(engine.range(), TimeRange::new(0, 100_000));
    }

    #[test]
    fn test_reload_resets_to_stopped() {
        let mut engine = engine_with(vec![(
            "A",
            vec![sample("A", 0, 0.0, 0.0, 10.0), sample("A", 100, 1.0, 1.0, 10.0)],
        )]);
        engine.play();
        engine.tick(5_000.0);

        let mut store = TraceStore::new();
        store.load("B", vec![sample("B", 500, 0.0, 0.0, 1.0), sample("B", 600, 0.0, 0.0, 1.0)]);
        engine.reload(Arc::new(store));
        let state = engine.state();
        assert_eq!(state.status, PlaybackStatus::Stopped);
        assert_eq!(state.current_ms, 500_000.0);
        assert_eq!(engine.range(), TimeRange::new(500_000, 600_000));
    }

    #[test]
    fn test_snapshot_throttle() {
        let mut throttle = SnapshotThrottle::new(100);
        assert!(throttle.should_emit(0, false));
        assert!(!throttle.should_emit(50, false));
        assert!(throttle.should_emit(60, true));
        assert!(!throttle.should_emit(150, false));
        assert!(throttle.should_emit(160, false));
    }
}
