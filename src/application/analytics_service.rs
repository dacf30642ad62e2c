// Analytics service - runs per-vehicle shape analytics and streams progress
use crate::application::session_service::SessionService;
use crate::application::shape_analytics::{combine, CancellationFlag, ShapeAnalyticsEngine};
use crate::domain::analytics::{AnalyticsPhase, AnalyticsProgress};
use crate::domain::error::AnalyticsError;
use crate::domain::sample::TimeRange;
use crate::domain::stream::StreamMessage;
use crate::infrastructure::config::AnalyticsConfig;
use serde::Deserialize;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyticsRequest {
    #[serde(default)]
    pub vehicle_ids: Option<Vec<String>>,
    #[serde(default)]
    pub start_ms: Option<i64>,
    #[serde(default)]
    pub end_ms: Option<i64>,
}

#[derive(Clone)]
pub struct AnalyticsService {
    session: SessionService,
    engine: ShapeAnalyticsEngine,
}

/// Progress is lossy when the client lags; a closed channel cancels the run.
fn report(
    tx: &mpsc::Sender<StreamMessage>,
    cancel: &CancellationFlag,
    progress: AnalyticsProgress,
) {
    if let Err(TrySendError::Closed(_)) = tx.try_send(StreamMessage::Progress(progress)) {
        cancel.cancel();
    }
}

impl AnalyticsService {
    pub fn new(session: SessionService, config: AnalyticsConfig) -> Self {
        Self {
            session,
            engine: ShapeAnalyticsEngine::new(config),
        }
    }

    fn resolve_window(&self, request: &AnalyticsRequest) -> Option<TimeRange> {
        if request.start_ms.is_none() && request.end_ms.is_none() {
            return None;
        }
        let loaded = self.session.store().global_range();
        Some(TimeRange::new(
            request.start_ms.unwrap_or(loaded.start_ms),
            request.end_ms.unwrap_or(loaded.end_ms),
        ))
    }

    fn resolve_vehicles(&self, request: &AnalyticsRequest) -> Vec<String> {
        let loaded = self.session.store().vehicle_ids();
        match &request.vehicle_ids {
            Some(ids) if !ids.is_empty() => {
                let (known, unknown): (Vec<String>, Vec<String>) =
                    ids.iter().cloned().partition(|id| loaded.contains(id));
                if !unknown.is_empty() {
                    tracing::warn!("Ignoring unknown vehicles in analytics request: {:?}", unknown);
                }
                known
            }
            _ => loaded,
        }
    }

    /// Analyze the requested vehicles one after another in a single task, then
    /// merge the results. Streams `progress` messages, one `analytics` result
    /// and `complete`. The first cancelled vehicle stops the run.
    pub fn stream_analytics(&self, request: AnalyticsRequest) -> mpsc::Receiver<StreamMessage> {
        let (tx, rx) = mpsc::channel(100);
        let vehicles = self.resolve_vehicles(&request);
        let window = self.resolve_window(&request);
        let store = self.session.store();
        let shapes = self.session.shapes();
        let engine = self.engine.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let cancel = CancellationFlag::new();

            if vehicles.is_empty() {
                let _ = tx
                    .send(StreamMessage::Error {
                        message: "No vehicles to analyze".to_string(),
                    })
                    .await;
                let _ = tx
                    .send(StreamMessage::Complete {
                        items: 0,
                        duration_ms: started.elapsed().as_millis() as u64,
                    })
                    .await;
                return;
            }

            let mut results = Vec::with_capacity(vehicles.len());
            let mut failure = None;
            for vehicle_id in &vehicles {
                let trace = match &window {
                    Some(range) => store.window(vehicle_id, range),
                    None => store.trace(vehicle_id).unwrap_or_default(),
                };
                let outcome = engine
                    .compute_analytics(vehicle_id, trace, &shapes, window, &cancel, |p| {
                        report(&tx, &cancel, p)
                    })
                    .await;
                match outcome {
                    Ok(result) => results.push(result),
                    Err(AnalyticsError::Cancelled { processed, total }) => {
                        failure = Some(format!(
                            "{}: cancelled after {} of {} points",
                            vehicle_id, processed, total
                        ));
                        break;
                    }
                }
            }

            if cancel.is_cancelled() {
                tracing::info!("Analytics stream cancelled by client");
                return;
            }
            if let Some(message) = failure {
                let _ = tx.send(StreamMessage::Error { message }).await;
                return;
            }

            report(
                &tx,
                &cancel,
                AnalyticsProgress {
                    phase: AnalyticsPhase::Combining,
                    vehicle_id: None,
                    current_shape: None,
                    percentage: 100.0,
                    estimated_remaining_ms: Some(0),
                },
            );
            let mut combined = combine(&results, None);
            combined.processing_time_ms = started.elapsed().as_millis() as u64;
            tracing::info!(
                "Analytics for {} vehicles: {} points, {} shapes in {} ms",
                vehicles.len(),
                combined.total_points_processed,
                combined.shapes.len(),
                combined.processing_time_ms
            );

            if tx.send(StreamMessage::Analytics(combined)).await.is_err() {
                return;
            }
            let _ = tx
                .send(StreamMessage::Complete {
                    items: vehicles.len() as u64,
                    duration_ms: started.elapsed().as_millis() as u64,
                })
                .await;
        });

        rx
    }
}
