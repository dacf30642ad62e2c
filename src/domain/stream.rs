// Stream message envelope for chunked playback/analytics responses
use crate::domain::analytics::{AnalyticsProgress, ShapeAnalyticsResult};
use crate::domain::playback::{PlaybackState, PositionSnapshot};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// First message of a playback stream; commands address this id.
    Session {
        session_id: u64,
    },
    /// One snapshot per emitted tick or seek, with the playback context it was computed for.
    Frame {
        state: PlaybackState,
        positions: Vec<PositionSnapshot>,
    },
    Progress(AnalyticsProgress),
    Analytics(ShapeAnalyticsResult),
    Error {
        message: String,
    },
    Complete {
        items: u64,
        duration_ms: u64,
    },
}
