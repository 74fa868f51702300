//! `DaemonClient` and the registry that owns it, keyed by `uid`.
//!
//! Grounded on `ttsd_data.h`'s `app_data_s` (pid, uid, utt_id_stopped,
//! state, per-client speak/sound-data vectors) — translated from a global
//! C array with accessor functions into an owned Rust collection.

use std::collections::{HashMap, HashSet, VecDeque};

use ttsd_core::protocol::ClientState;
use ttsd_core::voice::VoiceType;
use ttsd_core::{AudioChunk, SoundType, SpeakRequest};

/// The utterance currently outstanding with the engine for this client,
/// kept around only so a `Fail` result can be turned into an `ErrorRecord`
/// without re-reading data already consumed off `pending_utterances`.
#[derive(Debug, Clone)]
pub struct InFlightUtterance {
    pub utt_id: u32,
    pub text: String,
    pub language: String,
    pub voice_type: VoiceType,
}

/// Per-(pid, mode) daemon-side client record.
#[derive(Debug)]
pub struct DaemonClient {
    pub pid: u32,
    pub uid: u32,
    pub state: ClientState,
    /// Utterances with id <= this were cancelled; chunks/events referencing
    /// them must never be delivered.
    pub last_stopped_utt_id: u32,
    pub sound_type: SoundType,
    pub pending_utterances: VecDeque<SpeakRequest>,
    pub audio_queue: VecDeque<AudioChunk>,
    pub used_voices: HashSet<(String, VoiceType)>,
    pub in_flight: Option<InFlightUtterance>,
}

impl DaemonClient {
    pub fn new(pid: u32, uid: u32) -> Self {
        Self {
            pid,
            uid,
            state: ClientState::Created,
            last_stopped_utt_id: 0,
            sound_type: SoundType::Normal,
            pending_utterances: VecDeque::new(),
            audio_queue: VecDeque::new(),
            used_voices: HashSet::new(),
            in_flight: None,
        }
    }

    /// Appends a chunk, dropping it silently if it is stale.
    pub fn push_chunk_if_fresh(&mut self, chunk: AudioChunk) {
        if chunk.utt_id > self.last_stopped_utt_id {
            self.audio_queue.push_back(chunk);
        }
    }

    /// Clears all pending data and records the high-water `last_stopped_utt_id`
    /// over everything discarded, per the stop semantics.
    pub fn clear_pending_and_record_stopped(&mut self) {
        let mut max_seen = self.last_stopped_utt_id;
        for req in &self.pending_utterances {
            max_seen = max_seen.max(req.utt_id);
        }
        for chunk in &self.audio_queue {
            max_seen = max_seen.max(chunk.utt_id);
        }
        self.pending_utterances.clear();
        self.audio_queue.clear();
        self.last_stopped_utt_id = max_seen;
    }
}

/// Keyed by `uid`. Owns the daemon-wide invariant "at most one client is
/// Playing".
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<u32, DaemonClient>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, client: DaemonClient) {
        self.clients.insert(client.uid, client);
    }

    pub fn remove(&mut self, uid: u32) -> Option<DaemonClient> {
        self.clients.remove(&uid)
    }

    pub fn get(&self, uid: u32) -> Option<&DaemonClient> {
        self.clients.get(&uid)
    }

    pub fn get_mut(&mut self, uid: u32) -> Option<&mut DaemonClient> {
        self.clients.get_mut(&uid)
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.clients.contains_key(&uid)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// The uid of whichever client is currently Playing, if any. At most
    /// one client is ever Playing at a time.
    pub fn current_playing(&self) -> Option<u32> {
        self.clients
            .values()
            .find(|c| c.state == ClientState::Playing)
            .map(|c| c.uid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DaemonClient> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DaemonClient> {
        self.clients.values_mut()
    }

    /// Whether any other client than `uid` still references `voice`,
    /// used to decide when to call `EngineAgent::unload_voice`.
    pub fn any_other_client_uses(&self, exclude_uid: u32, voice: &(String, VoiceType)) -> bool {
        self.clients
            .values()
            .any(|c| c.uid != exclude_uid && c.used_voices.contains(voice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_most_one_playing_is_enforced_by_caller_not_registry() {
        let mut reg = ClientRegistry::new();
        let mut c1 = DaemonClient::new(100, 1);
        c1.state = ClientState::Playing;
        reg.insert(c1);
        assert_eq!(reg.current_playing(), Some(1));
    }

    #[test]
    fn stale_chunk_is_dropped_on_arrival() {
        let mut client = DaemonClient::new(1, 1);
        client.last_stopped_utt_id = 5;
        client.push_chunk_if_fresh(AudioChunk {
            utt_id: 5,
            data: vec![],
            event: ttsd_core::engine::ResultEvent::Continue,
            audio_type: ttsd_core::engine::AudioType::S16Pcm,
            sample_rate: 16_000,
            channels: 1,
        });
        assert!(client.audio_queue.is_empty());
    }

    #[test]
    fn fresh_chunk_is_queued() {
        let mut client = DaemonClient::new(1, 1);
        client.last_stopped_utt_id = 5;
        client.push_chunk_if_fresh(AudioChunk {
            utt_id: 6,
            data: vec![],
            event: ttsd_core::engine::ResultEvent::Continue,
            audio_type: ttsd_core::engine::AudioType::S16Pcm,
            sample_rate: 16_000,
            channels: 1,
        });
        assert_eq!(client.audio_queue.len(), 1);
    }

    #[test]
    fn clear_pending_records_max_utt_id_seen() {
        let mut client = DaemonClient::new(1, 1);
        client.pending_utterances.push_back(SpeakRequest {
            utt_id: 3,
            text: "a".into(),
            language: None,
            voice_type: None,
            speed: None,
        });
        client.audio_queue.push_back(AudioChunk {
            utt_id: 7,
            data: vec![],
            event: ttsd_core::engine::ResultEvent::Start,
            audio_type: ttsd_core::engine::AudioType::S16Pcm,
            sample_rate: 16_000,
            channels: 1,
        });
        client.clear_pending_and_record_stopped();
        assert_eq!(client.last_stopped_utt_id, 7);
        assert!(client.pending_utterances.is_empty());
        assert!(client.audio_queue.is_empty());
    }
}
