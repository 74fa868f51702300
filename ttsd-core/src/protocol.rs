//! Wire protocol exchanged between a `ClientHandle` and the daemon over the
//! control channel and the bulk/file message channel.

use serde::{Deserialize, Serialize};

use crate::voice::{Voice, VoiceType};

/// Selects which of the three parallel daemon instances a client binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Default,
    Notification,
    ScreenReader,
}

impl Mode {
    /// The logical IPC service name for this mode.
    pub fn service_name(&self) -> &'static str {
        match self {
            Mode::Default => "ttsd",
            Mode::Notification => "ttsdnoti",
            Mode::ScreenReader => "ttsdsr",
        }
    }

    /// The bulk/file-channel filename prefix for this mode, carried over
    /// verbatim from the original `MESSAGE_FILE_PREFIX_*` constants.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            Mode::Default => "ttsd_msg",
            Mode::Notification => "ttsdnoti_msg",
            Mode::ScreenReader => "ttsdsr_msg",
        }
    }
}

/// Root directory under which every mode's control and bulk sockets are
/// bound. Shared by
/// `ttsd-daemon` (binds here) and `ttsd-client` (connects here) so the two
/// never drift on socket layout.
pub fn default_socket_root() -> std::path::PathBuf {
    std::env::temp_dir().join("ttsd")
}

pub fn control_socket_path(root: &std::path::Path, mode: Mode) -> std::path::PathBuf {
    root.join(format!("{}.sock", mode.service_name()))
}

pub fn bulk_socket_path(root: &std::path::Path, mode: Mode) -> std::path::PathBuf {
    root.join(format!("{}.bulk", mode.file_prefix()))
}

/// Routing for the player's output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundType {
    /// Standard system-sounds stream, affected by system volume.
    Normal,
    /// Stream type whose volume is unaffected by system volume controls.
    FixedMax,
}

/// A pending utterance queued on a `DaemonClient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakRequest {
    pub utt_id: u32,
    pub text: String,
    pub language: Option<String>,
    pub voice_type: Option<VoiceType>,
    pub speed: Option<u32>,
}

/// Control-channel request. All carry the client's `uid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Hello {
        uid: u32,
    },
    Initialize {
        uid: u32,
        pid: u32,
    },
    Finalize {
        uid: u32,
    },
    GetSupportVoices {
        uid: u32,
    },
    GetCurrentVoice {
        uid: u32,
    },
    SetSoundType {
        uid: u32,
        sound_type: SoundType,
    },
    AddQueue {
        uid: u32,
        request: SpeakRequest,
    },
    Play {
        uid: u32,
    },
    Stop {
        uid: u32,
    },
    Pause {
        uid: u32,
    },
}

impl Request {
    pub fn uid(&self) -> u32 {
        match self {
            Request::Hello { uid }
            | Request::Initialize { uid, .. }
            | Request::Finalize { uid }
            | Request::GetSupportVoices { uid }
            | Request::GetCurrentVoice { uid }
            | Request::SetSoundType { uid, .. }
            | Request::AddQueue { uid, .. }
            | Request::Play { uid }
            | Request::Stop { uid }
            | Request::Pause { uid } => *uid,
        }
    }

    /// Only these five methods participate in the 10×/10µs retry policy on
    /// a timed-out status. `hello`/`initialize`/the voice getters are not
    /// retried by the transport layer itself.
    pub fn is_retryable_method(&self) -> bool {
        matches!(
            self,
            Request::Finalize { .. }
                | Request::AddQueue { .. }
                | Request::Play { .. }
                | Request::Stop { .. }
                | Request::Pause { .. }
        )
    }
}

/// Control-channel response: a status code plus an operation-specific
/// payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voices: Option<Vec<Voice>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_voice: Option<Voice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utt_id: Option<u32>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: 0,
            voices: None,
            current_voice: None,
            utt_id: None,
        }
    }

    pub fn error(status: i32) -> Self {
        Self {
            status,
            voices: None,
            current_voice: None,
            utt_id: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Event delivered over the bulk/file message channel, never over the
/// control channel, to avoid clogging it with streamed events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BulkEvent {
    StateChanged {
        uid: u32,
        before: ClientState,
        after: ClientState,
    },
    UtteranceStarted {
        uid: u32,
        utt_id: u32,
    },
    UtteranceCompleted {
        uid: u32,
        utt_id: u32,
    },
    Error {
        uid: u32,
        utt_id: Option<u32>,
        code: i32,
    },
    DefaultVoiceChanged {
        voice: Voice,
    },
}

/// Frame carried on the bulk/file channel's persistent connection: either a
/// streamed event, or the daemon's liveness `hello` probe and the client's
/// reply. The connection is opened once per (pid, mode) and stays open, so
/// it doubles as the duplex path the liveness sweep uses instead of
/// `/proc` scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum BulkFrame {
    Event(BulkEvent),
    Hello,
    HelloAck,
}

/// The four reachable client states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientState {
    Created,
    Ready,
    Playing,
    Paused,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_with_snake_case_method_tag() {
        let req = Request::AddQueue {
            uid: 7,
            request: SpeakRequest {
                utt_id: 1,
                text: "Hello".into(),
                language: None,
                voice_type: None,
                speed: None,
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["method"], "add_queue");
        assert_eq!(json["uid"], 7);

        let back: Request = serde_json::from_value(json).unwrap();
        assert_eq!(back.uid(), 7);
        assert!(back.is_retryable_method());
    }

    #[test]
    fn hello_and_initialize_are_not_retryable() {
        assert!(!Request::Hello { uid: 1 }.is_retryable_method());
        assert!(!Request::Initialize { uid: 1, pid: 2 }.is_retryable_method());
        assert!(!Request::GetSupportVoices { uid: 1 }.is_retryable_method());
    }

    #[test]
    fn response_ok_has_zero_status() {
        let r = Response::ok();
        assert!(r.is_ok());
        assert_eq!(r.status, 0);
    }

    #[test]
    fn bulk_event_serializes_with_tag() {
        let ev = BulkEvent::UtteranceStarted { uid: 1, utt_id: 5 };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "utterance_started");
        assert_eq!(json["utt_id"], 5);

        let back: BulkEvent = serde_json::from_value(json).unwrap();
        match back {
            BulkEvent::UtteranceStarted { uid, utt_id } => {
                assert_eq!(uid, 1);
                assert_eq!(utt_id, 5);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn mode_maps_to_stable_service_names_and_prefixes() {
        assert_eq!(Mode::Default.service_name(), "ttsd");
        assert_eq!(Mode::Notification.file_prefix(), "ttsdnoti_msg");
        assert_eq!(Mode::ScreenReader.file_prefix(), "ttsdsr_msg");
    }
}
