#![forbid(unsafe_code)]
#![warn(clippy::all)]

//! Client library: the `ClientHandle` state machine applications use to
//! talk to a `ttsd` instance, plus the daemon prepare/handshake and
//! callback-dispatch machinery behind it.

mod bulk;
pub mod callbacks;
mod prepare;

pub mod handle;

pub use callbacks::{
    CallbackSet, DefaultVoiceChangedCb, ErrorCb, StateChangedCb, SupportedVoiceCb, UserData,
    UtteranceCb,
};
pub use handle::ClientHandle;
pub use ttsd_core::error::{Result, TtsError};
pub use ttsd_core::protocol::{ClientState, Mode, SoundType};
pub use ttsd_core::voice::{Voice, VoiceType};
