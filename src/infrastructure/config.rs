// Configuration loading - file and environment layered settings
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Files,
    Influx,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Region geometry file; defaults to `<data_dir>/regions.geojson`.
    #[serde(default)]
    pub regions_file: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub vehicles: Vec<String>,
    #[serde(default = "default_alarm_types")]
    pub alarm_types: Vec<String>,
    #[serde(default)]
    pub influx: Option<InfluxSettings>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            data_dir: default_data_dir(),
            regions_file: None,
            start: None,
            end: None,
            vehicles: Vec::new(),
            alarm_types: default_alarm_types(),
            influx: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InfluxSettings {
    pub host: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_retention_policy")]
    pub retention_policy: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PlaybackConfig {
    #[serde(default = "default_max_gap_ms")]
    pub max_interpolation_gap_ms: i64,
    #[serde(default = "default_moving_threshold")]
    pub moving_speed_threshold_kmh: f64,
    #[serde(default = "default_min_speed")]
    pub min_speed: f64,
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_min_emit_interval_ms")]
    pub min_emit_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_interpolation_gap_ms: default_max_gap_ms(),
            moving_speed_threshold_kmh: default_moving_threshold(),
            min_speed: default_min_speed(),
            max_speed: default_max_speed(),
            tick_interval_ms: default_tick_interval_ms(),
            min_emit_interval_ms: default_min_emit_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AnalyticsConfig {
    #[serde(default = "default_max_points")]
    pub max_points_threshold: usize,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_excluded_categories")]
    pub excluded_categories: Vec<String>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            max_points_threshold: default_max_points(),
            sample_rate: default_sample_rate(),
            chunk_size: default_chunk_size(),
            excluded_categories: default_excluded_categories(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClusteringConfig {
    #[serde(default = "default_time_window_ms")]
    pub time_window_ms: i64,
    #[serde(default = "default_distance_threshold_deg")]
    pub distance_threshold_deg: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            time_window_ms: default_time_window_ms(),
            distance_threshold_deg: default_distance_threshold_deg(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ExportConfig {
    /// Half-width of the attitude window around each exported alarm.
    #[serde(default = "default_telemetry_window_ms")]
    pub telemetry_window_ms: i64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            telemetry_window_ms: default_telemetry_window_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9501
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_database() -> String {
    "MobiusLog".to_string()
}

fn default_retention_policy() -> String {
    "defaultMobiusPolicy".to_string()
}

fn default_alarm_types() -> Vec<String> {
    [
        "Dump Bed Cannot Be Raised While Vehicle Tilted",
        "Tilt exceeded with dump bed raised",
        "Off Path",
        "Steering Restricted",
        "Bump Detected: Dump",
        "Bump Detected: Close",
        "Failed to Drive When Commanded",
        "Slippery Conditions Caused Vehicle To Stop",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_gap_ms() -> i64 {
    5 * 60 * 1000
}

fn default_moving_threshold() -> f64 {
    1.0
}

fn default_min_speed() -> f64 {
    0.25
}

fn default_max_speed() -> f64 {
    8.0
}

fn default_tick_interval_ms() -> u64 {
    50
}

fn default_min_emit_interval_ms() -> u64 {
    100
}

fn default_max_points() -> usize {
    50_000
}

fn default_sample_rate() -> f64 {
    0.2
}

fn default_chunk_size() -> usize {
    2_000
}

fn default_excluded_categories() -> Vec<String> {
    ["pin", "reference", "overlay", "image", "line"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_time_window_ms() -> i64 {
    60_000
}

fn default_distance_threshold_deg() -> f64 {
    0.0005
}

fn default_telemetry_window_ms() -> i64 {
    500
}

/// Loads `config/haul_replay.*` (optional) overlaid with `HAUL_REPLAY__SECTION__KEY` variables.
pub fn load_app_config() -> anyhow::Result<AppConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name("config/haul_replay").required(false))
        .add_source(
            config::Environment::with_prefix("HAUL_REPLAY")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

/// Replace template variables in a query string
pub fn prepare_query(query: &str, vars: &HashMap<String, String>) -> String {
    let mut result = query.to_string();
    for (key, value) in vars {
        let placeholder = format!("${{{}}}", key);
        result = result.replace(&placeholder, value);
    }
    result
}
