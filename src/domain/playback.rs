// Playback state and position snapshot models
use crate::domain::sample::VehicleStates;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Stopped,
    Paused,
    Playing,
}

/// Shared time cursor. `start_ms <= current_ms <= end_ms` holds at all times.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlaybackState {
    pub current_ms: f64,
    pub status: PlaybackStatus,
    pub speed_multiplier: f64,
    pub start_ms: i64,
    pub end_ms: i64,
}

impl PlaybackState {
    pub fn is_playing(&self) -> bool {
        self.status == PlaybackStatus::Playing
    }

    pub fn current_time_ms(&self) -> i64 {
        self.current_ms.round() as i64
    }

    /// Fraction of the window already played, 0.0 for a single-frame window.
    pub fn progress(&self) -> f64 {
        let span = (self.end_ms - self.start_ms) as f64;
        if span <= 0.0 {
            return 0.0;
        }
        (self.current_ms - self.start_ms as f64) / span
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSnapshot {
    pub vehicle_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed_kmh: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offpath_deviation_m: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub states: Option<VehicleStates>,
    pub timestamp_ms: i64,
    pub is_moving: bool,
}
