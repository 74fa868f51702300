//! The daemon's single-flight synthesis pipeline: a context struct
//! carrying all shared state, ticked on a timer, with a diagnostics
//! snapshot for observability. Each tick pops the next queued utterance,
//! drives the engine, and routes its chunks into the client's
//! `audio_queue` — the `Player` is what turns queued chunks into
//! utterance-started/completed events, not this tick.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error, warn};
use ttsd_core::engine::{EngineHandle, ResultEvent};
use ttsd_core::protocol::ClientState;
use ttsd_core::voice::Voice;

use crate::client::{ClientRegistry, InFlightUtterance};

/// Tracks whether a synthesis is currently outstanding with the engine.
/// Enforces at-most-one concurrent synthesis across all clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthControl {
    Idle,
    InProgress { uid: u32, utt_id: u32 },
    Aborted,
}

impl SynthControl {
    pub fn is_idle(&self) -> bool {
        matches!(self, SynthControl::Idle)
    }
}

/// How often the pipeline polls the engine for new results and considers
/// starting the next queued utterance.
pub const PIPELINE_TICK: Duration = Duration::from_millis(100);

/// Snapshot-able, lock-free counters for observability without touching
/// the hot path's locks.
#[derive(Debug, Default)]
pub struct PipelineDiagnostics {
    pub utterances_started: AtomicU64,
    pub utterances_completed: AtomicU64,
    pub utterances_failed: AtomicU64,
    pub chunks_dropped_stale: AtomicU64,
}

impl PipelineDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            utterances_started: self.utterances_started.load(Ordering::Relaxed),
            utterances_completed: self.utterances_completed.load(Ordering::Relaxed),
            utterances_failed: self.utterances_failed.load(Ordering::Relaxed),
            chunks_dropped_stale: self.chunks_dropped_stale.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub utterances_started: u64,
    pub utterances_completed: u64,
    pub utterances_failed: u64,
    pub chunks_dropped_stale: u64,
}

/// Everything the pipeline needs that isn't per-call state: the
/// diagnostics counters, where to persist engine-failure records, and the
/// engine id those records are tagged with.
pub struct PipelineEnv<'a> {
    pub diagnostics: &'a PipelineDiagnostics,
    pub error_log_path: &'a Path,
    pub engine_id: &'a str,
}

/// Advances the pipeline by one tick: if idle, tries to start the next
/// queued utterance for whichever client is Playing; if a synthesis is
/// outstanding, drains any engine results produced since the last tick.
///
/// Returns the (possibly unchanged) `SynthControl` for the caller to store.
pub fn tick(
    control: SynthControl,
    registry: &mut ClientRegistry,
    engine: &EngineHandle,
    env: &PipelineEnv,
    on_error: &mut dyn FnMut(u32, u32, Option<u32>, i32),
) -> SynthControl {
    match control {
        SynthControl::Idle => try_start_next(registry, engine, env.diagnostics),
        SynthControl::InProgress { uid, utt_id } => {
            drain_results(uid, utt_id, registry, engine, env, on_error)
        }
        SynthControl::Aborted => SynthControl::Idle,
    }
}

fn try_start_next(
    registry: &mut ClientRegistry,
    engine: &EngineHandle,
    diagnostics: &PipelineDiagnostics,
) -> SynthControl {
    let Some(playing_uid) = registry.current_playing() else {
        return SynthControl::Idle;
    };
    let Some(client) = registry.get_mut(playing_uid) else {
        return SynthControl::Idle;
    };
    let Some(request) = client.pending_utterances.pop_front() else {
        return SynthControl::Idle;
    };

    let language = request.language.clone().unwrap_or_else(|| "en_US".into());
    let voice_type = request
        .voice_type
        .unwrap_or(ttsd_core::config::DEFAULT_VOICE_TYPE);
    let speed = request.speed.unwrap_or(ttsd_core::config::DEFAULT_SPEED);

    let requested_voice = match Voice::new(language, voice_type) {
        Ok(v) => v,
        Err(e) => {
            warn!("invalid voice in queued request: {e}");
            return SynthControl::Idle;
        }
    };

    let mut agent = engine.0.lock();
    let selected = match agent.select_valid_voice(&requested_voice) {
        Ok(v) => v,
        Err(e) => {
            error!("no compatible voice found: {e}");
            return SynthControl::Aborted;
        }
    };
    if let Err(e) = agent.load_voice(&selected) {
        error!("load_voice failed: {e}");
        return SynthControl::Aborted;
    }
    client
        .used_voices
        .insert((selected.language.clone(), selected.voice_type));

    if let Err(e) = agent.start_synthesis(&selected, &request.text, speed, playing_uid, request.utt_id) {
        error!("start_synthesis failed: {e}");
        return SynthControl::Aborted;
    }

    client.in_flight = Some(InFlightUtterance {
        utt_id: request.utt_id,
        text: request.text.clone(),
        language: selected.language.clone(),
        voice_type: selected.voice_type,
    });

    debug!(uid = playing_uid, utt_id = request.utt_id, "synthesis started");
    SynthControl::InProgress {
        uid: playing_uid,
        utt_id: request.utt_id,
    }
}

fn drain_results(
    uid: u32,
    utt_id: u32,
    registry: &mut ClientRegistry,
    engine: &EngineHandle,
    env: &PipelineEnv,
    on_error: &mut dyn FnMut(u32, u32, Option<u32>, i32),
) -> SynthControl {
    let results = engine.0.lock().poll_results();
    if results.is_empty() {
        return SynthControl::InProgress { uid, utt_id };
    }

    let mut next = SynthControl::InProgress { uid, utt_id };

    for result in results {
        let Some(client) = registry.get_mut(result.ctx_uid) else {
            continue;
        };

        if result.chunk.utt_id <= client.last_stopped_utt_id {
            env.diagnostics
                .chunks_dropped_stale
                .fetch_add(1, Ordering::Relaxed);
            next = SynthControl::Idle;
            continue;
        }

        let event = result.chunk.event;
        let pid = client.pid;
        client.push_chunk_if_fresh(result.chunk);

        match event {
            ResultEvent::Start | ResultEvent::Continue => {}
            ResultEvent::Finish => {
                client.in_flight = None;
                next = SynthControl::Idle;
            }
            ResultEvent::Fail => {
                env.diagnostics
                    .utterances_failed
                    .fetch_add(1, Ordering::Relaxed);
                if let Some(info) = client.in_flight.take() {
                    let record = ttsd_core::error_record!(
                        "engine reported synthesis failure",
                        result.ctx_uid,
                        result.ctx_utt_id,
                        info.language,
                        info.voice_type,
                        info.text,
                        env.engine_id.to_string()
                    );
                    if let Err(e) = ttsd_core::errorlog::append_error_record(env.error_log_path, &record) {
                        warn!("failed to persist error record: {e}");
                    }
                }
                on_error(
                    result.ctx_uid,
                    pid,
                    Some(result.ctx_utt_id),
                    ttsd_core::error::TtsError::OperationFailed("engine reported failure".into())
                        .code(),
                );
                next = SynthControl::Aborted;
            }
        }
    }

    next
}

/// Whether the given client is eligible to have its queue drained: it must
/// exist and be Playing.
pub fn client_is_playing(registry: &ClientRegistry, uid: u32) -> bool {
    registry
        .get(uid)
        .map(|c| c.state == ClientState::Playing)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DaemonClient;
    use tempfile::tempdir;
    use ttsd_core::engine::StubEngine;
    use ttsd_core::voice::VoiceType;

    fn setup() -> (ClientRegistry, EngineHandle, PipelineDiagnostics) {
        let mut registry = ClientRegistry::new();
        let mut client = DaemonClient::new(100, 1);
        client.state = ClientState::Playing;
        client.pending_utterances.push_back(ttsd_core::SpeakRequest {
            utt_id: 1,
            text: "hello".into(),
            language: Some("en_US".into()),
            voice_type: Some(VoiceType::Female),
            speed: None,
        });
        registry.insert(client);
        (
            registry,
            EngineHandle::new(StubEngine::new()),
            PipelineDiagnostics::default(),
        )
    }

    #[test]
    fn idle_tick_starts_next_queued_utterance() {
        let (mut registry, engine, diagnostics) = setup();
        let dir = tempdir().unwrap();
        let error_log_path = dir.path().join("err.log");
        let env = PipelineEnv {
            diagnostics: &diagnostics,
            error_log_path: &error_log_path,
            engine_id: "default",
        };
        let next = tick(SynthControl::Idle, &mut registry, &engine, &env, &mut |_, _, _, _| {});
        assert!(matches!(next, SynthControl::InProgress { uid: 1, utt_id: 1 }));
        assert_eq!(registry.get(1).unwrap().in_flight.as_ref().unwrap().utt_id, 1);
    }

    #[test]
    fn full_cycle_pushes_chunks_and_clears_in_flight_on_finish() {
        let (mut registry, engine, diagnostics) = setup();
        let dir = tempdir().unwrap();
        let error_log_path = dir.path().join("err.log");
        let env = PipelineEnv {
            diagnostics: &diagnostics,
            error_log_path: &error_log_path,
            engine_id: "default",
        };

        let mut control = tick(SynthControl::Idle, &mut registry, &engine, &env, &mut |_, _, _, _| {});
        control = tick(control, &mut registry, &engine, &env, &mut |_, _, _, _| {});

        assert_eq!(control, SynthControl::Idle);
        assert!(registry.get(1).unwrap().in_flight.is_none());
        assert_eq!(registry.get(1).unwrap().audio_queue.len(), 3);
    }

    #[test]
    fn stale_chunk_is_dropped_and_generates_no_events() {
        let (mut registry, engine, diagnostics) = setup();
        registry.get_mut(1).unwrap().last_stopped_utt_id = 1;
        let dir = tempdir().unwrap();
        let error_log_path = dir.path().join("err.log");
        let env = PipelineEnv {
            diagnostics: &diagnostics,
            error_log_path: &error_log_path,
            engine_id: "default",
        };

        let control = tick(SynthControl::Idle, &mut registry, &engine, &env, &mut |_, _, _, _| {});
        let control = tick(control, &mut registry, &engine, &env, &mut |_, _, _, _| {});

        assert_eq!(control, SynthControl::Idle);
        assert!(registry.get(1).unwrap().audio_queue.is_empty());
        assert_eq!(diagnostics.snapshot().chunks_dropped_stale, 3);
    }

    #[test]
    fn engine_failure_is_persisted_to_the_error_log() {
        #[derive(Default)]
        struct FailingEngine {
            inner: StubEngine,
            pending: Vec<ttsd_core::engine::SynthResult>,
        }
        impl ttsd_core::engine::EngineAgent for FailingEngine {
            fn initialize(&mut self) -> ttsd_core::error::Result<()> {
                self.inner.initialize()
            }
            fn deinitialize(&mut self) -> ttsd_core::error::Result<()> {
                self.inner.deinitialize()
            }
            fn foreach_voices(&self) -> Vec<Voice> {
                self.inner.foreach_voices()
            }
            fn is_valid_voice(&self, voice: &Voice) -> bool {
                self.inner.is_valid_voice(voice)
            }
            fn load_voice(&mut self, voice: &Voice) -> ttsd_core::error::Result<()> {
                self.inner.load_voice(voice)
            }
            fn unload_voice(&mut self, voice: &Voice) -> ttsd_core::error::Result<()> {
                self.inner.unload_voice(voice)
            }
            fn select_valid_voice(&self, requested: &Voice) -> ttsd_core::error::Result<Voice> {
                self.inner.select_valid_voice(requested)
            }
            fn set_pitch(&mut self, pitch: u32) -> ttsd_core::error::Result<()> {
                self.inner.set_pitch(pitch)
            }
            fn start_synthesis(
                &mut self,
                _voice: &Voice,
                _text: &str,
                _speed: u32,
                ctx_uid: u32,
                ctx_utt_id: u32,
            ) -> ttsd_core::error::Result<()> {
                self.pending.push(ttsd_core::engine::SynthResult {
                    ctx_uid,
                    ctx_utt_id,
                    chunk: ttsd_core::engine::AudioChunk {
                        utt_id: ctx_utt_id,
                        data: Vec::new(),
                        event: ttsd_core::engine::ResultEvent::Fail,
                        audio_type: ttsd_core::engine::AudioType::S16Pcm,
                        sample_rate: 16_000,
                        channels: 1,
                    },
                });
                Ok(())
            }
            fn cancel_synthesis(&mut self) -> ttsd_core::error::Result<()> {
                self.inner.cancel_synthesis()
            }
            fn poll_results(&mut self) -> Vec<ttsd_core::engine::SynthResult> {
                std::mem::take(&mut self.pending)
            }
        }

        let mut registry = ClientRegistry::new();
        let mut client = DaemonClient::new(100, 1);
        client.state = ClientState::Playing;
        client.pending_utterances.push_back(ttsd_core::SpeakRequest {
            utt_id: 1,
            text: "hello".into(),
            language: Some("en_US".into()),
            voice_type: Some(VoiceType::Female),
            speed: None,
        });
        registry.insert(client);

        let engine = EngineHandle::new(FailingEngine::default());
        let diagnostics = PipelineDiagnostics::default();
        let dir = tempdir().unwrap();
        let error_log_path = dir.path().join("err.log");
        let env = PipelineEnv {
            diagnostics: &diagnostics,
            error_log_path: &error_log_path,
            engine_id: "default",
        };

        let mut errors = Vec::new();
        let control = tick(SynthControl::Idle, &mut registry, &engine, &env, &mut |_, _, _, _| {});
        let control = tick(control, &mut registry, &engine, &env, &mut |uid, _pid, utt_id, code| {
            errors.push((uid, utt_id, code));
        });

        assert_eq!(control, SynthControl::Aborted);
        assert_eq!(errors.len(), 1);
        assert_eq!(diagnostics.snapshot().utterances_failed, 1);
        let contents = std::fs::read_to_string(&error_log_path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("\"uid\":1"));
    }
}
