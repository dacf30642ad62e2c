// Playback streaming service - drives a playback engine per session and streams position frames
use crate::application::playback_engine::{PlaybackEngine, SnapshotThrottle, TickOutcome};
use crate::application::session_service::SessionService;
use crate::application::trace_store::TraceStore;
use crate::domain::error::PlaybackError;
use crate::domain::sample::TimeRange;
use crate::domain::stream::StreamMessage;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

pub type PlaybackSessionId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackRequest {
    pub speed: Option<f64>,
    pub from_ms: Option<i64>,
    pub range: Option<TimeRange>,
}

/// Control message for a running playback session.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlaybackCommand {
    Play,
    Pause,
    /// Rewind to the start and end the session.
    Stop,
    Seek { t_ms: f64 },
    Speed { multiplier: f64 },
    Range { start_ms: i64, end_ms: i64 },
    ClearRange,
    /// Reset the window to the loaded data and rewind.
    Reload,
}

impl PlaybackCommand {
    fn validate(&self) -> Result<(), PlaybackError> {
        match *self {
            PlaybackCommand::Speed { multiplier }
                if !multiplier.is_finite() || multiplier <= 0.0 =>
            {
                Err(PlaybackError::InvalidSpeed(multiplier))
            }
            _ => Ok(()),
        }
    }
}

type ControlRegistry = Arc<Mutex<HashMap<PlaybackSessionId, mpsc::Sender<PlaybackCommand>>>>;

#[derive(Clone)]
pub struct PlaybackStreamService {
    session: SessionService,
    controls: ControlRegistry,
    next_id: Arc<AtomicU64>,
}

fn frame(engine: &PlaybackEngine) -> StreamMessage {
    StreamMessage::Frame {
        state: engine.state(),
        positions: engine.current_positions(),
    }
}

/// Apply one command. Returns true when the session should end.
fn apply(engine: &mut PlaybackEngine, command: PlaybackCommand, store: &Arc<TraceStore>) -> bool {
    tracing::debug!("Playback command: {:?}", command);
    match command {
        PlaybackCommand::Play => {
            engine.play();
        }
        PlaybackCommand::Pause => {
            engine.pause();
        }
        PlaybackCommand::Stop => {
            engine.stop();
            return true;
        }
        PlaybackCommand::Seek { t_ms } => engine.seek(t_ms),
        PlaybackCommand::Speed { multiplier } => {
            if let Err(e) = engine.set_speed(multiplier) {
                tracing::warn!("{}", e);
            }
        }
        PlaybackCommand::Range { start_ms, end_ms } => {
            engine.restrict_range(TimeRange::new(start_ms, end_ms));
        }
        PlaybackCommand::ClearRange => engine.clear_restriction(),
        PlaybackCommand::Reload => engine.reload(store.clone()),
    }
    false
}

impl PlaybackStreamService {
    pub fn new(session: SessionService) -> Self {
        Self {
            session,
            controls: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Start a playback session in its own task. Invalid speeds are rejected
    /// before anything is spawned. The stream opens with a `session` message
    /// naming the id that `send_command` accepts; it ends at the end of the
    /// window, on a `stop` command, or when the receiver is dropped.
    pub async fn stream_playback(
        &self,
        request: PlaybackRequest,
    ) -> Result<(PlaybackSessionId, mpsc::Receiver<StreamMessage>), PlaybackError> {
        let config = self.session.playback_config().clone();
        let store = self.session.store();
        let mut engine = PlaybackEngine::new(store.clone(), config.clone());
        if let Some(speed) = request.speed {
            engine.set_speed(speed)?;
        }
        if let Some(range) = request.range {
            if engine.restrict_range(range).is_none() {
                tracing::debug!("Requested range {:?} is outside the loaded data", range);
            }
        }
        if let Some(from) = request.from_ms {
            engine.seek(from as f64);
        }

        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);
        let (command_tx, mut commands) = mpsc::channel(16);
        self.controls.lock().await.insert(session_id, command_tx);

        let controls = self.controls.clone();
        let tick = Duration::from_millis(config.tick_interval_ms.max(1));
        let mut throttle = SnapshotThrottle::new(config.min_emit_interval_ms);

        tokio::spawn(async move {
            let started = Instant::now();
            let mut frames = 0u64;
            let mut connected = tx.send(StreamMessage::Session { session_id }).await.is_ok();

            engine.play();
            if connected {
                connected = tx.send(frame(&engine)).await.is_ok();
                frames += 1;
                throttle.should_emit(0, true);
            }

            if connected && !engine.is_static() {
                let mut interval = tokio::time::interval(tick);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;
                let mut last = Instant::now();

                loop {
                    let (emit, finished) = tokio::select! {
                        _ = interval.tick() => {
                            let now = Instant::now();
                            let dt_ms = now.duration_since(last).as_secs_f64() * 1000.0;
                            last = now;

                            let elapsed_ms = started.elapsed().as_millis() as u64;
                            match engine.tick(dt_ms) {
                                TickOutcome::Advanced => {
                                    (throttle.should_emit(elapsed_ms, false), false)
                                }
                                TickOutcome::ReachedEnd => {
                                    (throttle.should_emit(elapsed_ms, true), true)
                                }
                                TickOutcome::Idle => (false, false),
                            }
                        }
                        command = commands.recv() => match command {
                            Some(command) => {
                                let finished = apply(&mut engine, command, &store);
                                let elapsed_ms = started.elapsed().as_millis() as u64;
                                (throttle.should_emit(elapsed_ms, true), finished)
                            }
                            None => (false, true),
                        },
                        _ = tx.closed() => {
                            connected = false;
                            (false, true)
                        }
                    };

                    if emit {
                        if tx.send(frame(&engine)).await.is_err() {
                            connected = false;
                            break;
                        }
                        frames += 1;
                    }
                    if finished {
                        break;
                    }
                }
            }

            controls.lock().await.remove(&session_id);
            let duration_ms = started.elapsed().as_millis() as u64;
            if !connected {
                tracing::debug!(
                    "Playback client {} disconnected after {} frames",
                    session_id,
                    frames
                );
                return;
            }
            let state = engine.state();
            tracing::info!(
                "Playback session {} finished at t={} ({:.0}%): {} frames in {} ms",
                session_id,
                state.current_time_ms(),
                state.progress() * 100.0,
                frames,
                duration_ms
            );
            let _ = tx
                .send(StreamMessage::Complete {
                    items: frames,
                    duration_ms,
                })
                .await;
        });

        Ok((session_id, rx))
    }

    /// Forward a command to a running session.
    pub async fn send_command(
        &self,
        session_id: PlaybackSessionId,
        command: PlaybackCommand,
    ) -> Result<(), PlaybackError> {
        command.validate()?;
        let sender = self
            .controls
            .lock()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(PlaybackError::UnknownSession(session_id))?;
        sender
            .send(command)
            .await
            .map_err(|_| PlaybackError::SessionEnded(session_id))
    }

    pub async fn active_sessions(&self) -> Vec<PlaybackSessionId> {
        let mut ids: Vec<PlaybackSessionId> = self.controls.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
