//! Registered callback set with opaque user data. The original API passes
//! a function pointer plus a `void*` user_data; the idiomatic Rust
//! equivalent is an `Arc<dyn Fn>` paired with an `Arc<dyn Any + Send + Sync>`
//! the caller can downcast.
//!
//! Callbacks are cloned out of the handle's lock and invoked outside it —
//! a callback that calls back into the handle must not deadlock against
//! the very lock that is dispatching it.

use std::any::Any;
use std::sync::Arc;

use ttsd_core::protocol::ClientState;
use ttsd_core::voice::Voice;

pub type UserData = Arc<dyn Any + Send + Sync>;

pub type StateChangedCb = Arc<dyn Fn(ClientState, ClientState, Option<&UserData>) + Send + Sync>;
pub type UtteranceCb = Arc<dyn Fn(u32, Option<&UserData>) + Send + Sync>;
pub type ErrorCb = Arc<dyn Fn(Option<u32>, i32, Option<&UserData>) + Send + Sync>;
pub type DefaultVoiceChangedCb = Arc<dyn Fn(&Voice, Option<&UserData>) + Send + Sync>;
/// Fired once per voice by `foreach_supported_voices`. Unlike the other
/// four callback kinds, this one is never persistently registered with
/// `set_*_cb` — it is supplied directly to each call, matching the
/// "(transient)" entry in the registered callback set.
pub type SupportedVoiceCb = Arc<dyn Fn(&Voice, Option<&UserData>) + Send + Sync>;

#[derive(Default, Clone)]
pub struct CallbackSet {
    pub state_changed: Option<(StateChangedCb, Option<UserData>)>,
    pub utterance_started: Option<(UtteranceCb, Option<UserData>)>,
    pub utterance_completed: Option<(UtteranceCb, Option<UserData>)>,
    pub error: Option<(ErrorCb, Option<UserData>)>,
    pub default_voice_changed: Option<(DefaultVoiceChangedCb, Option<UserData>)>,
}

impl CallbackSet {
    pub fn fire_state_changed(&self, before: ClientState, after: ClientState) {
        if let Some((cb, data)) = self.state_changed.clone() {
            cb(before, after, data.as_ref());
        }
    }

    pub fn fire_utterance_started(&self, utt_id: u32) {
        if let Some((cb, data)) = self.utterance_started.clone() {
            cb(utt_id, data.as_ref());
        }
    }

    pub fn fire_utterance_completed(&self, utt_id: u32) {
        if let Some((cb, data)) = self.utterance_completed.clone() {
            cb(utt_id, data.as_ref());
        }
    }

    pub fn fire_error(&self, utt_id: Option<u32>, code: i32) {
        if let Some((cb, data)) = self.error.clone() {
            cb(utt_id, code, data.as_ref());
        }
    }

    pub fn fire_default_voice_changed(&self, voice: &Voice) {
        if let Some((cb, data)) = self.default_voice_changed.clone() {
            cb(voice, data.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn state_changed_callback_receives_before_and_after() {
        let seen = Arc::new(AtomicU32::new(0));
        let seen_for_cb = Arc::clone(&seen);
        let mut set = CallbackSet::default();
        set.state_changed = Some((
            Arc::new(move |_before, after: ClientState, _data| {
                seen_for_cb.store(after as u32, Ordering::SeqCst);
            }),
            None,
        ));
        set.fire_state_changed(ClientState::Created, ClientState::Ready);
        assert_eq!(seen.load(Ordering::SeqCst), ClientState::Ready as u32);
    }

    #[test]
    fn unregistered_callback_is_a_silent_no_op() {
        let set = CallbackSet::default();
        set.fire_utterance_started(1);
        set.fire_error(None, -1);
    }
}
