#![forbid(unsafe_code)]
#![warn(clippy::all)]

//! Shared types for the TTS daemon system: the wire protocol exchanged
//! between client handles and the daemon, the domain model (voices, audio
//! chunks, utterance ids), the error taxonomy, the engine-agent trait, and
//! the on-disk config/error-log persistence formats.
//!
//! This crate has no daemon- or client-side behavior of its own; it is
//! linked by both `ttsd-daemon` and `ttsd-client` so the two never drift on
//! wire shape or error codes.

pub mod config;
pub mod engine;
pub mod error;
pub mod errorlog;
pub mod protocol;
pub mod transport;
pub mod voice;

pub use engine::{AudioChunk, AudioType, EngineAgent, EngineHandle, ResultEvent, StubEngine};
pub use error::{Result, TtsError};
pub use protocol::{
    bulk_socket_path, control_socket_path, default_socket_root, BulkEvent, Mode, Request,
    Response, SoundType, SpeakRequest,
};
pub use voice::{Voice, VoiceType};
