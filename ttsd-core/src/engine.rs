//! Engine agent abstraction: loading a synthesis backend, driving it
//! with streamed result chunks, voice selection.
//!
//! `EngineAgent` is the pluggable backend contract; `EngineHandle` is the
//! `Send + Sync` wrapper the daemon shares across its single-flight
//! pipeline.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TtsError};
use crate::voice::{Voice, VoiceType};

/// Valid range for `EngineAgent::set_pitch`, inclusive.
pub const PITCH_MIN: u32 = 1;
pub const PITCH_MAX: u32 = 15;
/// Pitch value meaning "unmodified".
pub const PITCH_NORMAL: u32 = 8;

/// Audio sample encoding delivered by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioType {
    S16Pcm,
    U8Pcm,
}

/// One chunk of synthesized audio, queued on a `DaemonClient::audio_queue`
/// and consumed by the `Player`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioChunk {
    pub utt_id: u32,
    pub data: Vec<u8>,
    pub event: ResultEvent,
    pub audio_type: AudioType,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Engine result-callback event kind. Exactly one `Start`, zero
/// or more `Continue`, exactly one of {`Finish`, `Fail`} per (uid, utt_id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultEvent {
    Start,
    Continue,
    Finish,
    Fail,
}

/// A single delivered result, as the daemon's pipeline receives it from the
/// engine's result callback.
#[derive(Debug, Clone)]
pub struct SynthResult {
    pub ctx_uid: u32,
    pub ctx_utt_id: u32,
    pub chunk: AudioChunk,
}

/// Contract for a synthesis backend plugin.
///
/// Implementations are driven by a single caller (the daemon's synthesis
/// pipeline) that never issues a second `start_synthesis` while one is
/// outstanding — enforced by the pipeline's `synth_control` flag, not by
/// this trait, so implementors may assume single-flight usage.
pub trait EngineAgent: Send + 'static {
    /// One-time setup. Called once when the engine is selected.
    fn initialize(&mut self) -> Result<()>;

    /// Teardown. Called when the engine is replaced or the daemon exits.
    fn deinitialize(&mut self) -> Result<()>;

    /// All (language, type) pairs this backend supports.
    fn foreach_voices(&self) -> Vec<Voice>;

    fn is_valid_voice(&self, voice: &Voice) -> bool;

    /// Reference-counted load; actual backend load happens on first
    /// reference.
    fn load_voice(&mut self, voice: &Voice) -> Result<()>;

    /// Reference-counted unload; backend unload happens when the refcount
    /// returns to zero.
    fn unload_voice(&mut self, voice: &Voice) -> Result<()>;

    /// Fallback voice selection. Returns the actual (language, type)
    /// the engine will speak with, which may differ from the request.
    fn select_valid_voice(&self, requested: &Voice) -> Result<Voice>;

    /// Sets synthesis pitch on the engine's 1..15 scale, normal = 8.
    fn set_pitch(&mut self, pitch: u32) -> Result<()>;

    /// Non-blocking: results arrive via the pipeline's polling of
    /// `poll_results`, mirroring the ABI's `result_cb` without requiring a
    /// callback trait object crossing an `unsafe` FFI boundary.
    fn start_synthesis(
        &mut self,
        voice: &Voice,
        text: &str,
        speed: u32,
        ctx_uid: u32,
        ctx_utt_id: u32,
    ) -> Result<()>;

    /// Requests the engine to abort. The engine must still eventually
    /// deliver a `Fail` or `Finish` result to close the stream.
    fn cancel_synthesis(&mut self) -> Result<()>;

    /// Drains any results produced since the last poll. The daemon's
    /// pipeline calls this on its 100 ms tick.
    fn poll_results(&mut self) -> Vec<SynthResult>;
}

/// Thread-safe reference-counted handle to any `EngineAgent` implementor.
///
/// Uses `parking_lot::Mutex`: non-poisoning on panic, and the daemon only
/// ever holds it briefly per pipeline tick.
#[derive(Clone)]
pub struct EngineHandle(pub Arc<Mutex<dyn EngineAgent>>);

impl EngineHandle {
    pub fn new<E: EngineAgent>(engine: E) -> Self {
        Self(Arc::new(Mutex::new(engine)))
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle").finish_non_exhaustive()
    }
}

/// Deterministic reference engine used in tests and as the default backend
/// when no real plugin is configured.
pub struct StubEngine {
    loaded: std::collections::HashMap<(String, VoiceType), u32>,
    pending: Vec<SynthResult>,
    cancel_requested: bool,
    pitch: u32,
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            loaded: std::collections::HashMap::new(),
            pending: Vec::new(),
            cancel_requested: false,
            pitch: PITCH_NORMAL,
        }
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineAgent for StubEngine {
    fn initialize(&mut self) -> Result<()> {
        tracing::debug!("StubEngine::initialize — no-op");
        Ok(())
    }

    fn deinitialize(&mut self) -> Result<()> {
        tracing::debug!("StubEngine::deinitialize — no-op");
        Ok(())
    }

    fn foreach_voices(&self) -> Vec<Voice> {
        vec![
            Voice::new("en_US", VoiceType::Female).expect("static locale is valid"),
            Voice::new("en_US", VoiceType::Male).expect("static locale is valid"),
            Voice::new("ko_KR", VoiceType::Female).expect("static locale is valid"),
        ]
    }

    fn is_valid_voice(&self, voice: &Voice) -> bool {
        self.foreach_voices().contains(voice)
    }

    fn load_voice(&mut self, voice: &Voice) -> Result<()> {
        *self
            .loaded
            .entry((voice.language.clone(), voice.voice_type))
            .or_insert(0) += 1;
        Ok(())
    }

    fn unload_voice(&mut self, voice: &Voice) -> Result<()> {
        let key = (voice.language.clone(), voice.voice_type);
        if let Some(count) = self.loaded.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.loaded.remove(&key);
            }
        }
        Ok(())
    }

    fn select_valid_voice(&self, requested: &Voice) -> Result<Voice> {
        if self.is_valid_voice(requested) {
            return Ok(requested.clone());
        }
        self.foreach_voices()
            .into_iter()
            .find(|v| v.language == requested.language)
            .or_else(|| self.foreach_voices().into_iter().next())
            .ok_or(crate::error::TtsError::InvalidVoice)
    }

    fn set_pitch(&mut self, pitch: u32) -> Result<()> {
        if !(PITCH_MIN..=PITCH_MAX).contains(&pitch) {
            return Err(TtsError::InvalidParameter(format!(
                "pitch {pitch} out of range {PITCH_MIN}..={PITCH_MAX}"
            )));
        }
        self.pitch = pitch;
        Ok(())
    }

    fn start_synthesis(
        &mut self,
        _voice: &Voice,
        text: &str,
        _speed: u32,
        ctx_uid: u32,
        ctx_utt_id: u32,
    ) -> Result<()> {
        self.cancel_requested = false;
        self.pending.push(SynthResult {
            ctx_uid,
            ctx_utt_id,
            chunk: AudioChunk {
                utt_id: ctx_utt_id,
                data: Vec::new(),
                event: ResultEvent::Start,
                audio_type: AudioType::S16Pcm,
                sample_rate: 16_000,
                channels: 1,
            },
        });
        self.pending.push(SynthResult {
            ctx_uid,
            ctx_utt_id,
            chunk: AudioChunk {
                utt_id: ctx_utt_id,
                data: vec![0u8; text.len().max(1) * 2],
                event: ResultEvent::Continue,
                audio_type: AudioType::S16Pcm,
                sample_rate: 16_000,
                channels: 1,
            },
        });
        self.pending.push(SynthResult {
            ctx_uid,
            ctx_utt_id,
            chunk: AudioChunk {
                utt_id: ctx_utt_id,
                data: Vec::new(),
                event: ResultEvent::Finish,
                audio_type: AudioType::S16Pcm,
                sample_rate: 16_000,
                channels: 1,
            },
        });
        Ok(())
    }

    fn cancel_synthesis(&mut self) -> Result<()> {
        self.cancel_requested = true;
        Ok(())
    }

    fn poll_results(&mut self) -> Vec<SynthResult> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_engine_emits_start_continue_finish_in_order() {
        let mut engine = StubEngine::new();
        let voice = Voice::new("en_US", VoiceType::Female).unwrap();
        engine.start_synthesis(&voice, "hi", 8, 1, 1).unwrap();
        let results = engine.poll_results();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].chunk.event, ResultEvent::Start);
        assert_eq!(results[1].chunk.event, ResultEvent::Continue);
        assert_eq!(results[2].chunk.event, ResultEvent::Finish);
        for r in &results {
            assert_eq!(r.ctx_uid, 1);
            assert_eq!(r.ctx_utt_id, 1);
        }
    }

    #[test]
    fn voice_refcount_returns_to_zero() {
        let mut engine = StubEngine::new();
        let voice = Voice::new("en_US", VoiceType::Female).unwrap();
        engine.load_voice(&voice).unwrap();
        engine.load_voice(&voice).unwrap();
        assert_eq!(engine.loaded.len(), 1);
        engine.unload_voice(&voice).unwrap();
        assert_eq!(engine.loaded.len(), 1);
        engine.unload_voice(&voice).unwrap();
        assert!(engine.loaded.is_empty());
    }

    #[test]
    fn select_valid_voice_falls_back_by_language() {
        let engine = StubEngine::new();
        let requested = Voice::new("en_US", VoiceType::Child).unwrap();
        let selected = engine.select_valid_voice(&requested).unwrap();
        assert_eq!(selected.language, "en_US");
    }

    #[test]
    fn set_pitch_rejects_out_of_range() {
        let mut engine = StubEngine::new();
        assert!(engine.set_pitch(8).is_ok());
        assert!(engine.set_pitch(0).is_err());
        assert!(engine.set_pitch(16).is_err());
        assert_eq!(engine.pitch, 8);
    }

    #[test]
    fn poll_results_drains_exactly_once() {
        let mut engine = StubEngine::new();
        let voice = Voice::new("en_US", VoiceType::Female).unwrap();
        engine.start_synthesis(&voice, "hi", 8, 1, 1).unwrap();
        assert_eq!(engine.poll_results().len(), 3);
        assert!(engine.poll_results().is_empty());
    }
}
