//! Player: consumes a client's `audio_queue`, emits
//! utterance-started/completed, honors `sound_type` routing.
//!
//! The cpal output stream is opened inside `spawn_blocking` since
//! `cpal::Stream` is `!Send`; `crate::resample` handles output-side rate
//! matching when the engine's sample rate doesn't match the output
//! device's native rate.

use std::collections::HashMap;

use tracing::{info, warn};
use ttsd_core::engine::{AudioChunk, ResultEvent};
use ttsd_core::protocol::SoundType;

/// The narrow interface to the audio output hardware driver. `NullSink`
/// backs tests and environments without a sound card; `CpalSink` (behind
/// `audio-cpal`) is the reference implementation.
pub trait AudioSink: Send {
    fn write(&mut self, chunk: &AudioChunk) -> ttsd_core::error::Result<()>;
}

/// Discards audio, used in tests and as the default when no real output
/// device is configured.
#[derive(Debug, Default)]
pub struct NullSink {
    pub bytes_written: usize,
}

impl AudioSink for NullSink {
    fn write(&mut self, chunk: &AudioChunk) -> ttsd_core::error::Result<()> {
        self.bytes_written += chunk.data.len();
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayerState {
    Idle,
    Playing,
    Paused,
}

struct PerClientPlayer {
    state: PlayerState,
    sound_type: SoundType,
}

/// Owns per-client playback state and routes queued `AudioChunk`s to a
/// sink. One `Player` per daemon process; `create`/`destroy` scope state
/// per-uid the way the original scopes per-client sound data.
pub struct Player<S: AudioSink> {
    sink: S,
    clients: HashMap<u32, PerClientPlayer>,
}

impl<S: AudioSink> Player<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            clients: HashMap::new(),
        }
    }

    pub fn create(&mut self, uid: u32) {
        self.clients.insert(
            uid,
            PerClientPlayer {
                state: PlayerState::Idle,
                sound_type: SoundType::Normal,
            },
        );
    }

    pub fn destroy(&mut self, uid: u32) {
        self.clients.remove(&uid);
    }

    pub fn set_sound_type(&mut self, uid: u32, sound_type: SoundType) {
        if let Some(c) = self.clients.get_mut(&uid) {
            c.sound_type = sound_type;
        }
    }

    pub fn play(&mut self, uid: u32) {
        if let Some(c) = self.clients.get_mut(&uid) {
            c.state = PlayerState::Playing;
        }
    }

    pub fn pause(&mut self, uid: u32) {
        if let Some(c) = self.clients.get_mut(&uid) {
            c.state = PlayerState::Paused;
        }
    }

    pub fn stop(&mut self, uid: u32) {
        if let Some(c) = self.clients.get_mut(&uid) {
            c.state = PlayerState::Idle;
        }
    }

    pub fn all_stop(&mut self) {
        for c in self.clients.values_mut() {
            c.state = PlayerState::Idle;
        }
    }

    /// Drains as much of `audio_queue` as the player is Playing for,
    /// writing each chunk to the sink. Returns `(started, completed)` utt_ids
    /// observed, for the caller to translate into bulk events.
    pub fn drain(
        &mut self,
        uid: u32,
        audio_queue: &mut std::collections::VecDeque<AudioChunk>,
    ) -> (Vec<u32>, Vec<u32>) {
        let mut started = Vec::new();
        let mut completed = Vec::new();

        let Some(client) = self.clients.get(&uid) else {
            return (started, completed);
        };
        if client.state != PlayerState::Playing {
            return (started, completed);
        }

        while let Some(chunk) = audio_queue.pop_front() {
            match chunk.event {
                ResultEvent::Start => started.push(chunk.utt_id),
                ResultEvent::Finish => completed.push(chunk.utt_id),
                ResultEvent::Fail => {}
                ResultEvent::Continue => {}
            }
            if let Err(e) = self.sink.write(&chunk) {
                warn!("player sink write failed for uid={uid}: {e}");
            }
        }

        info!(uid, "player drained queue");
        (started, completed)
    }
}

#[cfg(feature = "audio-cpal")]
pub mod cpal_sink {
    //! `CpalSink` — concrete audio-output backend. Opened inside
    //! `spawn_blocking` by the caller since `cpal::Stream` is `!Send`.

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use ttsd_core::engine::AudioChunk;
    use ttsd_core::error::{Result, TtsError};

    use crate::resample::RateConverter;

    use super::AudioSink;

    pub struct CpalSink {
        _stream: cpal::Stream,
        tx: std::sync::mpsc::Sender<Vec<f32>>,
        device_rate: u32,
        /// Keyed by the chunk's own sample rate — an engine may change
        /// voices mid-session and shift rates between utterances.
        converters: std::collections::HashMap<u32, RateConverter>,
    }

    impl CpalSink {
        pub fn open_default() -> Result<Self> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| TtsError::OperationFailed("no default output device".into()))?;
            let config = device
                .default_output_config()
                .map_err(|e| TtsError::OperationFailed(e.to_string()))?;
            let device_rate = config.sample_rate().0;

            let (tx, rx) = std::sync::mpsc::channel::<Vec<f32>>();
            let mut backlog: Vec<f32> = Vec::new();

            let stream = device
                .build_output_stream(
                    &config.into(),
                    move |out: &mut [f32], _| {
                        while backlog.len() < out.len() {
                            match rx.try_recv() {
                                Ok(samples) => backlog.extend(samples),
                                Err(_) => break,
                            }
                        }
                        let n = out.len().min(backlog.len());
                        out[..n].copy_from_slice(&backlog[..n]);
                        for s in &mut out[n..] {
                            *s = 0.0;
                        }
                        backlog.drain(..n);
                    },
                    |err| tracing::error!("output stream error: {err}"),
                    None,
                )
                .map_err(|e| TtsError::OperationFailed(e.to_string()))?;

            stream
                .play()
                .map_err(|e| TtsError::OperationFailed(e.to_string()))?;

            Ok(Self {
                _stream: stream,
                tx,
                device_rate,
                converters: std::collections::HashMap::new(),
            })
        }
    }

    impl AudioSink for CpalSink {
        fn write(&mut self, chunk: &AudioChunk) -> Result<()> {
            let samples: Vec<f32> = chunk
                .data
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
                .collect();

            let device_rate = self.device_rate;
            let converter = self
                .converters
                .entry(chunk.sample_rate)
                .or_insert_with(|| RateConverter::new(chunk.sample_rate, device_rate, 960));
            let converted = converter.process(&samples);

            self.tx
                .send(converted)
                .map_err(|e| TtsError::OperationFailed(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ttsd_core::engine::AudioType;

    fn chunk(utt_id: u32, event: ResultEvent) -> AudioChunk {
        AudioChunk {
            utt_id,
            data: vec![0u8; 4],
            event,
            audio_type: AudioType::S16Pcm,
            sample_rate: 16_000,
            channels: 1,
        }
    }

    #[test]
    fn drain_only_happens_while_playing() {
        let mut player = Player::new(NullSink::default());
        player.create(1);
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(chunk(1, ResultEvent::Start));
        let (started, _) = player.drain(1, &mut queue);
        assert!(started.is_empty());
        assert_eq!(queue.len(), 1, "queue untouched while not playing");
    }

    #[test]
    fn drain_emits_started_and_completed_from_chunk_events() {
        let mut player = Player::new(NullSink::default());
        player.create(1);
        player.play(1);
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(chunk(5, ResultEvent::Start));
        queue.push_back(chunk(5, ResultEvent::Continue));
        queue.push_back(chunk(5, ResultEvent::Finish));

        let (started, completed) = player.drain(1, &mut queue);
        assert_eq!(started, vec![5]);
        assert_eq!(completed, vec![5]);
        assert!(queue.is_empty());
        assert_eq!(player.sink.bytes_written, 12);
    }

    #[test]
    fn paused_player_does_not_drain() {
        let mut player = Player::new(NullSink::default());
        player.create(1);
        player.play(1);
        player.pause(1);
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(chunk(1, ResultEvent::Start));
        let (started, _) = player.drain(1, &mut queue);
        assert!(started.is_empty());
    }
}
