// Typed failures surfaced by the core engines and data sources
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaybackError {
    #[error("Invalid speed multiplier: {0}")]
    InvalidSpeed(f64),

    #[error("Unknown playback session: {0}")]
    UnknownSession(u64),

    #[error("Playback session {0} has ended")]
    SessionEnded(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalyticsError {
    #[error("Analytics run cancelled after {processed} of {total} points")]
    Cancelled { processed: usize, total: usize },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unexpected document shape in {path}: {reason}")]
    Format { path: String, reason: String },

    #[error("Query failed: {0}")]
    Query(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlarmTypeError {
    #[error("No valid alarm types provided")]
    Empty,

    #[error("Alarm type '{0}' already exists")]
    Duplicate(String),

    #[error("Alarm type '{0}' not found")]
    NotFound(String),
}
