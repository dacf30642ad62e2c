// Application layer - Use cases and engines
pub mod alarm_clustering;
pub mod alarm_types;
pub mod analytics_service;
pub mod playback_engine;
pub mod playback_stream;
pub mod session_service;
pub mod shape_analytics;
pub mod trace_repository;
pub mod trace_store;
