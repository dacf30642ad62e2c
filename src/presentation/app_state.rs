// Application state for HTTP handlers
use crate::application::alarm_types::AlarmTypeRegistry;
use crate::application::analytics_service::AnalyticsService;
use crate::application::playback_stream::PlaybackStreamService;
use crate::application::session_service::SessionService;

#[derive(Clone)]
pub struct AppState {
    pub session: SessionService,
    pub playback_service: PlaybackStreamService,
    pub analytics_service: AnalyticsService,
    pub alarm_types: AlarmTypeRegistry,
}
