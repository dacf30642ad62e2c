// HTTP request handlers
use crate::application::analytics_service::AnalyticsRequest;
use crate::application::playback_stream::{PlaybackCommand, PlaybackRequest, PlaybackSessionId};
use crate::domain::error::{AlarmTypeError, PlaybackError};
use crate::domain::sample::TimeRange;
use crate::infrastructure::chunked_json::stream_from_receiver;
use crate::infrastructure::http_response::{accepts_brotli, json_response};
use crate::presentation::app_state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_PATH_TOLERANCE_DEG: f64 = 0.00001;
const SESSION_HEADER: &str = "x-playback-session";

#[derive(Deserialize)]
pub struct PathQuery {
    pub tolerance_deg: Option<f64>,
}

#[derive(Deserialize)]
pub struct PositionsQuery {
    pub t: i64,
}

#[derive(Deserialize, Default)]
pub struct PlaybackQuery {
    pub speed: Option<f64>,
    pub from: Option<i64>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct ClusterQuery {
    pub window_ms: Option<i64>,
    pub distance_deg: Option<f64>,
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct ExportQuery {
    pub vehicle_ids: Option<String>,
    pub alarm_types: Option<String>,
}

#[derive(Deserialize)]
pub struct AlarmTypesBody {
    pub alarm_types: Vec<String>,
}

#[derive(Deserialize)]
pub struct AlarmTypeBody {
    pub alarm_type: String,
}

#[derive(Serialize)]
struct AlarmTypesUpdate {
    message: String,
    alarm_types: Vec<String>,
    total_count: usize,
}

impl AlarmTypesUpdate {
    fn new(message: String, alarm_types: Vec<String>) -> Self {
        Self {
            message,
            total_count: alarm_types.len(),
            alarm_types,
        }
    }
}

#[derive(Serialize)]
struct VehiclePath {
    vehicle_id: String,
    tolerance_deg: f64,
    points: Vec<[f64; 2]>,
}

fn split_list(value: &Option<String>) -> Vec<String> {
    value
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn range_from(start: Option<i64>, end: Option<i64>, loaded: TimeRange) -> Option<TimeRange> {
    match (start, end) {
        (None, None) => None,
        (start, end) => Some(TimeRange::new(
            start.unwrap_or(loaded.start_ms),
            end.unwrap_or(loaded.end_ms),
        )),
    }
}

async fn respond<T: Serialize>(data: &T, headers: &HeaderMap) -> Response {
    match json_response(data, accepts_brotli(headers)).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

fn playback_error(e: PlaybackError) -> Response {
    let status = match e {
        PlaybackError::InvalidSpeed(_) => StatusCode::BAD_REQUEST,
        PlaybackError::UnknownSession(_) => StatusCode::NOT_FOUND,
        PlaybackError::SessionEnded(_) => StatusCode::GONE,
    };
    (status, e.to_string()).into_response()
}

fn alarm_type_error(e: AlarmTypeError) -> Response {
    let status = match e {
        AlarmTypeError::Empty => StatusCode::BAD_REQUEST,
        AlarmTypeError::Duplicate(_) => StatusCode::CONFLICT,
        AlarmTypeError::NotFound(_) => StatusCode::NOT_FOUND,
    };
    (status, e.to_string()).into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/session/reports", get(load_reports))
        .route("/vehicles", get(list_vehicles))
        .route("/vehicles/:id/path", get(vehicle_path))
        .route("/regions", get(list_regions))
        .route("/regions/geojson", get(regions_geojson))
        .route("/positions", get(positions))
        .route("/playback/stream", get(stream_playback))
        .route("/playback/sessions", get(playback_sessions))
        .route("/playback/:session/command", post(playback_command))
        .route("/analytics", post(run_analytics))
        .route("/alarms/clusters", get(alarm_clusters))
        .route("/alarms/export", get(export_alarms))
        .route("/alarm-types", get(list_alarm_types).post(replace_alarm_types))
        .route("/alarm-types/defaults", get(default_alarm_types))
        .route("/alarm-types/add", post(add_alarm_type))
        .route("/alarm-types/reset", post(reset_alarm_types))
        .route("/alarm-types/:alarm_type", delete(remove_alarm_type))
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Per-vehicle outcome of the startup load
pub async fn load_reports(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    respond(&state.session.load_reports(), &headers).await
}

pub async fn list_vehicles(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    respond(&state.session.vehicles(), &headers).await
}

/// Simplified path for one vehicle
pub async fn vehicle_path(
    Path(id): Path<String>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let tolerance_deg = query.tolerance_deg.unwrap_or(DEFAULT_PATH_TOLERANCE_DEG);
    match state.session.vehicle_path(&id, tolerance_deg) {
        Some(points) => {
            let path = VehiclePath {
                vehicle_id: id,
                tolerance_deg,
                points: points.iter().map(|p| [p.latitude, p.longitude]).collect(),
            };
            respond(&path, &headers).await
        }
        None => (StatusCode::NOT_FOUND, format!("Unknown vehicle: {}", id)).into_response(),
    }
}

pub async fn list_regions(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    let shapes = state.session.shapes();
    respond(&*shapes, &headers).await
}

/// Source feature collection with excluded categories removed
pub async fn regions_geojson(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    let regions = state.session.regions();
    respond(&*regions, &headers).await
}

/// Fleet snapshot at a single instant
pub async fn positions(
    Query(query): Query<PositionsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    respond(&state.session.positions_at(query.t), &headers).await
}

/// Stream playback frames (progressive). The session id is returned in the
/// first message and in the `x-playback-session` header.
pub async fn stream_playback(
    Query(query): Query<PlaybackQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let request = PlaybackRequest {
        speed: query.speed,
        from_ms: query.from,
        range: range_from(query.start, query.end, state.session.store().global_range()),
    };
    match state.playback_service.stream_playback(request).await {
        Ok((session_id, rx)) => {
            let mut response = stream_from_receiver(rx, accepts_brotli(&headers)).into_response();
            response
                .headers_mut()
                .insert(SESSION_HEADER, HeaderValue::from(session_id));
            response
        }
        Err(e) => playback_error(e),
    }
}

pub async fn playback_sessions(headers: HeaderMap, State(state): State<Arc<AppState>>) -> Response {
    respond(&state.playback_service.active_sessions().await, &headers).await
}

/// Pause, seek, change speed or stop a running playback session
pub async fn playback_command(
    Path(session_id): Path<PlaybackSessionId>,
    State(state): State<Arc<AppState>>,
    Json(command): Json<PlaybackCommand>,
) -> Response {
    match state.playback_service.send_command(session_id, command).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => playback_error(e),
    }
}

/// Stream shape analytics progress followed by the combined result
pub async fn run_analytics(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    body: Option<Json<AnalyticsRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let rx = state.analytics_service.stream_analytics(request);
    stream_from_receiver(rx, accepts_brotli(&headers)).into_response()
}

pub async fn alarm_clusters(
    Query(query): Query<ClusterQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let window = range_from(query.start_ms, query.end_ms, state.session.store().global_range());
    let clusters = state
        .session
        .alarm_clusters(query.window_ms, query.distance_deg, window);
    respond(&clusters, &headers).await
}

/// Filtered alarm rows for export
pub async fn export_alarms(
    Query(query): Query<ExportQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let vehicle_ids = split_list(&query.vehicle_ids);
    let alarm_types = split_list(&query.alarm_types);
    let known_types = state.alarm_types.current().await;
    let rows = state
        .session
        .export_alarms(&vehicle_ids, &alarm_types, &known_types);
    tracing::info!(
        "Export request: {} vehicles, {} alarm types, {} rows",
        vehicle_ids.len(),
        alarm_types.len(),
        rows.len()
    );
    respond(&rows, &headers).await
}

pub async fn list_alarm_types(State(state): State<Arc<AppState>>) -> Response {
    Json(state.alarm_types.listing().await).into_response()
}

pub async fn default_alarm_types(State(state): State<Arc<AppState>>) -> Response {
    let defaults = state.alarm_types.defaults();
    Json(AlarmTypesUpdate::new("Default alarm types".to_string(), defaults)).into_response()
}

pub async fn replace_alarm_types(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AlarmTypesBody>,
) -> Response {
    match state.alarm_types.replace(&body.alarm_types).await {
        Ok(types) => {
            let message = format!("Updated alarm types ({} total)", types.len());
            Json(AlarmTypesUpdate::new(message, types)).into_response()
        }
        Err(e) => alarm_type_error(e),
    }
}

pub async fn add_alarm_type(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AlarmTypeBody>,
) -> Response {
    match state.alarm_types.add(&body.alarm_type).await {
        Ok(types) => {
            let message = format!("Added alarm type '{}'", body.alarm_type.trim());
            Json(AlarmTypesUpdate::new(message, types)).into_response()
        }
        Err(e) => alarm_type_error(e),
    }
}

pub async fn remove_alarm_type(
    Path(alarm_type): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.alarm_types.remove(&alarm_type).await {
        Ok(types) => {
            let message = format!("Removed alarm type '{}'", alarm_type);
            Json(AlarmTypesUpdate::new(message, types)).into_response()
        }
        Err(e) => alarm_type_error(e),
    }
}

pub async fn reset_alarm_types(State(state): State<Arc<AppState>>) -> Response {
    let types = state.alarm_types.reset().await;
    Json(AlarmTypesUpdate::new("Reset to default alarm types".to_string(), types)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::alarm_types::AlarmTypeRegistry;
    use crate::application::analytics_service::AnalyticsService;
    use crate::application::playback_stream::PlaybackStreamService;
    use crate::application::session_service::SessionService;
    use crate::application::trace_store::TraceStore;
    use crate::domain::sample::Sample;
    use crate::infrastructure::config::AppConfig;

    fn state() -> Arc<AppState> {
        let config = AppConfig::default();
        let mut store = TraceStore::new();
        let samples = (0..10)
            .map(|i| Sample::new("DT059", i * 1_000, 0.0, i as f64, 5.0))
            .collect();
        store.load("DT059", samples);
        let session = SessionService::new(store, vec![], vec![], vec![], &config);
        Arc::new(AppState {
            playback_service: PlaybackStreamService::new(session.clone()),
            analytics_service: AnalyticsService::new(session.clone(), config.analytics.clone()),
            alarm_types: AlarmTypeRegistry::new(config.source.alarm_types.clone()),
            session,
        })
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(&Some(" DT059, ,DT060 ".to_string())), vec!["DT059", "DT060"]);
        assert!(split_list(&None).is_empty());
    }

    #[test]
    fn test_range_from_fills_missing_bound() {
        let loaded = TimeRange::new(0, 10_000);
        assert_eq!(range_from(None, None, loaded), None);
        assert_eq!(range_from(Some(2_000), None, loaded), Some(TimeRange::new(2_000, 10_000)));
    }

    #[tokio::test]
    async fn test_unknown_vehicle_path_is_404() {
        let response = vehicle_path(
            Path("DT404".to_string()),
            Query(PathQuery { tolerance_deg: None }),
            HeaderMap::new(),
            State(state()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_playback_speed_is_400() {
        let response = stream_playback(
            Query(PlaybackQuery {
                speed: Some(0.0),
                ..Default::default()
            }),
            HeaderMap::new(),
            State(state()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_playback_stream_carries_session_header() {
        let response = stream_playback(
            Query(PlaybackQuery::default()),
            HeaderMap::new(),
            State(state()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[SESSION_HEADER], "1");
    }

    #[tokio::test]
    async fn test_command_for_unknown_session_is_404() {
        let response =
            playback_command(Path(7), State(state()), Json(PlaybackCommand::Pause)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_positions_ok() {
        let response = positions(
            Query(PositionsQuery { t: 4_500 }),
            HeaderMap::new(),
            State(state()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_alarm_type_routes() {
        let state = state();
        let add = |name: &str| AlarmTypeBody {
            alarm_type: name.to_string(),
        };

        let response = add_alarm_type(State(state.clone()), Json(add("Overspeed"))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = add_alarm_type(State(state.clone()), Json(add("overspeed"))).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let response = add_alarm_type(State(state.clone()), Json(add(" "))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = remove_alarm_type(Path("Overspeed".to_string()), State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = remove_alarm_type(Path("Overspeed".to_string()), State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let empty = AlarmTypesBody {
            alarm_types: vec!["".to_string()],
        };
        let response = replace_alarm_types(State(state.clone()), Json(empty)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let replace = AlarmTypesBody {
            alarm_types: vec!["Tyre".to_string()],
        };
        let response = replace_alarm_types(State(state.clone()), Json(replace)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.alarm_types.current().await, vec!["Tyre"]);

        assert_eq!(reset_alarm_types(State(state.clone())).await.status(), StatusCode::OK);
        assert!(state.alarm_types.listing().await.is_using_defaults);
        assert_eq!(default_alarm_types(State(state.clone())).await.status(), StatusCode::OK);
        assert_eq!(list_alarm_types(State(state)).await.status(), StatusCode::OK);
    }
}
