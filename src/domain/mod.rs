// Domain layer - Replay models, geometry and wire messages
pub mod alarm;
pub mod analytics;
pub mod error;
pub mod geometry;
pub mod playback;
pub mod region;
pub mod sample;
pub mod stream;
