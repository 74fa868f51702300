//! `ClientHandle`: the per-client state machine an application holds.
//! Wraps a connected control-channel socket, the registered callbacks, and
//! the client-side `utt_id` counter.
//!
//! The struct shape (config fields plus atomic/cell flags plus
//! subscribe/callback methods) follows the same pattern used elsewhere in
//! this codebase for long-lived handle types, adapted here to the
//! four-state machine (`Created` → `Ready` → `Playing`/`Paused`) instead of
//! a continuous session lifecycle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::net::UnixStream;

use ttsd_core::error::{Result, TtsError};
use ttsd_core::protocol::{ClientState, Mode, Request, SoundType, SpeakRequest};
use ttsd_core::voice::{Voice, VoiceType};

use crate::callbacks::{
    CallbackSet, DefaultVoiceChangedCb, ErrorCb, StateChangedCb, SupportedVoiceCb, UserData,
    UtteranceCb,
};
use crate::prepare;

/// Process-wide uid source.
static NEXT_UID: AtomicU32 = AtomicU32::new(1);

/// `utt_id` is reserved client-side before the request is ever sent, and
/// wraps from 9999 back to 1.
const MAX_UTT_ID: u32 = 9999;

struct Connection {
    stream: UnixStream,
}

pub struct ClientHandle {
    uid: u32,
    mode: Mutex<Mode>,
    state: Mutex<ClientState>,
    next_utt_id: Mutex<u32>,
    callbacks: Arc<RwLock<CallbackSet>>,
    /// Set for the duration of a callback invocation driven from this
    /// handle's own methods; `destroy` refuses to run while it's held, so
    /// a callback can't tear down the handle it's executing under.
    callback_in_use: std::sync::atomic::AtomicBool,
    connection: Mutex<Option<Connection>>,
}

impl ClientHandle {
    /// Allocates a uid and returns a handle in the `Created` state. No IPC
    /// happens until `prepare` is called.
    pub fn create(mode: Mode) -> Arc<Self> {
        let uid = NEXT_UID.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            uid,
            mode: Mutex::new(mode),
            state: Mutex::new(ClientState::Created),
            next_utt_id: Mutex::new(1),
            callbacks: Arc::new(RwLock::new(CallbackSet::default())),
            callback_in_use: std::sync::atomic::AtomicBool::new(false),
            connection: Mutex::new(None),
        })
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn mode(&self) -> Mode {
        *self.mode.lock()
    }

    /// Changes which daemon instance future `prepare` calls bind to. Only
    /// valid while `Created`.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        let state = *self.state.lock();
        if state != ClientState::Created {
            return Err(TtsError::InvalidState);
        }
        *self.mode.lock() = mode;
        Ok(())
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    pub fn set_state_changed_cb(&self, cb: StateChangedCb, user_data: Option<UserData>) {
        self.callbacks.write().state_changed = Some((cb, user_data));
    }

    pub fn unset_state_changed_cb(&self) {
        self.callbacks.write().state_changed = None;
    }

    pub fn set_utterance_started_cb(&self, cb: UtteranceCb, user_data: Option<UserData>) {
        self.callbacks.write().utterance_started = Some((cb, user_data));
    }

    pub fn unset_utterance_started_cb(&self) {
        self.callbacks.write().utterance_started = None;
    }

    pub fn set_utterance_completed_cb(&self, cb: UtteranceCb, user_data: Option<UserData>) {
        self.callbacks.write().utterance_completed = Some((cb, user_data));
    }

    pub fn unset_utterance_completed_cb(&self) {
        self.callbacks.write().utterance_completed = None;
    }

    pub fn set_error_cb(&self, cb: ErrorCb, user_data: Option<UserData>) {
        self.callbacks.write().error = Some((cb, user_data));
    }

    pub fn unset_error_cb(&self) {
        self.callbacks.write().error = None;
    }

    pub fn set_default_voice_changed_cb(
        &self,
        cb: DefaultVoiceChangedCb,
        user_data: Option<UserData>,
    ) {
        self.callbacks.write().default_voice_changed = Some((cb, user_data));
    }

    pub fn unset_default_voice_changed_cb(&self) {
        self.callbacks.write().default_voice_changed = None;
    }

    /// Performs the hello handshake (spawning the daemon if needed),
    /// initializes this uid with the daemon, registers the bulk/file
    /// channel, and transitions `Created` → `Ready`. On failure the handle
    /// stays `Created` and the error callback fires instead.
    pub async fn prepare(self: &Arc<Self>) -> Result<()> {
        if self.state() != ClientState::Created {
            return Err(TtsError::InvalidState);
        }

        let mode = self.mode();
        let result = self.do_prepare(mode).await;

        match &result {
            Ok(()) => self.transition(ClientState::Ready),
            Err(e) => self.fire_error(None, e.code()),
        }
        result
    }

    async fn do_prepare(self: &Arc<Self>, mode: Mode) -> Result<()> {
        let mut stream = prepare::hello_handshake(mode, self.uid).await?;

        let pid = std::process::id();
        let response =
            prepare::send_request(&mut stream, &Request::Initialize { uid: self.uid, pid })
                .await?;
        if !response.is_ok() {
            return Err(TtsError::from_code(response.status));
        }

        crate::bulk::spawn_bulk_listener(mode, pid, Arc::clone(self))
            .await
            .map_err(TtsError::Io)?;

        *self.connection.lock() = Some(Connection { stream });
        Ok(())
    }

    /// Reverses `prepare`: tells the daemon to drop this uid and returns to
    /// `Created`. Refuses while a callback registered on this handle is
    /// executing.
    pub async fn unprepare(self: &Arc<Self>) -> Result<()> {
        if self.callback_in_use.load(Ordering::SeqCst) {
            return Err(TtsError::InvalidState);
        }
        if self.state() != ClientState::Ready {
            return Err(TtsError::InvalidState);
        }
        self.do_finalize().await
    }

    /// Sends `Finalize` and returns to `Created` regardless of which of
    /// `Ready`/`Playing`/`Paused` the handle is currently in — used by
    /// `destroy`, which (unlike the public `unprepare` operation) tears a
    /// handle down from any prepared state.
    async fn do_finalize(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.connection.lock();
        let Some(conn) = guard.as_mut() else {
            return Err(TtsError::InvalidState);
        };
        let response =
            prepare::send_request(&mut conn.stream, &Request::Finalize { uid: self.uid }).await?;
        drop(guard);
        *self.connection.lock() = None;

        if !response.is_ok() {
            return Err(TtsError::from_code(response.status));
        }
        self.transition(ClientState::Created);
        Ok(())
    }

    /// Validates and queues an utterance, reserving its `utt_id`
    /// client-side before any IPC happens (validation-before-IPC is
    /// required so a too-long or non-UTF-8 string never reaches the wire).
    pub async fn add_text(
        &self,
        text: String,
        language: Option<String>,
        voice_type: Option<VoiceType>,
        speed: Option<u32>,
    ) -> Result<u32> {
        if text.len() > 2000 {
            return Err(TtsError::InvalidParameter("text too long".into()));
        }
        if std::str::from_utf8(text.as_bytes()).is_err() {
            return Err(TtsError::InvalidParameter("invalid utf-8".into()));
        }
        if self.state() == ClientState::Created {
            return Err(TtsError::InvalidState);
        }

        let utt_id = self.next_utt_id();
        let request = SpeakRequest {
            utt_id,
            text,
            language,
            voice_type,
            speed,
        };

        let response = self
            .send(&Request::AddQueue {
                uid: self.uid,
                request,
            })
            .await?;
        if !response.is_ok() {
            return Err(TtsError::from_code(response.status));
        }
        Ok(utt_id)
    }

    fn next_utt_id(&self) -> u32 {
        let mut next = self.next_utt_id.lock();
        let id = *next;
        *next = if id >= MAX_UTT_ID { 1 } else { id + 1 };
        id
    }

    /// Valid from `Ready`/`Paused`; rejected synchronously from `Created` or
    /// `Playing` rather than forwarded to the daemon, which would otherwise
    /// treat a repeat `play` from `Playing` as a no-op success.
    pub async fn play(&self) -> Result<()> {
        if !matches!(self.state(), ClientState::Ready | ClientState::Paused) {
            return Err(TtsError::InvalidState);
        }
        let response = self.send(&Request::Play { uid: self.uid }).await?;
        if !response.is_ok() {
            return Err(TtsError::from_code(response.status));
        }
        self.transition(ClientState::Playing);
        Ok(())
    }

    /// Valid from `Playing`/`Paused`.
    pub async fn stop(&self) -> Result<()> {
        if !matches!(self.state(), ClientState::Playing | ClientState::Paused) {
            return Err(TtsError::InvalidState);
        }
        let response = self.send(&Request::Stop { uid: self.uid }).await?;
        if !response.is_ok() {
            return Err(TtsError::from_code(response.status));
        }
        self.transition(ClientState::Ready);
        Ok(())
    }

    /// Valid only from `Playing`.
    pub async fn pause(&self) -> Result<()> {
        if self.state() != ClientState::Playing {
            return Err(TtsError::InvalidState);
        }
        let response = self.send(&Request::Pause { uid: self.uid }).await?;
        if !response.is_ok() {
            return Err(TtsError::from_code(response.status));
        }
        self.transition(ClientState::Paused);
        Ok(())
    }

    pub async fn set_sound_type(&self, sound_type: SoundType) -> Result<()> {
        let response = self
            .send(&Request::SetSoundType {
                uid: self.uid,
                sound_type,
            })
            .await?;
        if !response.is_ok() {
            return Err(TtsError::from_code(response.status));
        }
        Ok(())
    }

    /// Fires `cb` once per supported voice rather than returning a
    /// materialized list, matching the transient (unregistered)
    /// supported-voice callback kind.
    pub async fn foreach_supported_voices(
        &self,
        cb: SupportedVoiceCb,
        user_data: Option<UserData>,
    ) -> Result<()> {
        let response = self
            .send(&Request::GetSupportVoices { uid: self.uid })
            .await?;
        if !response.is_ok() {
            return Err(TtsError::from_code(response.status));
        }
        self.callback_in_use.store(true, Ordering::SeqCst);
        for voice in response.voices.unwrap_or_default() {
            cb(&voice, user_data.as_ref());
        }
        self.callback_in_use.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn get_current_voice(&self) -> Result<Voice> {
        let response = self
            .send(&Request::GetCurrentVoice { uid: self.uid })
            .await?;
        if !response.is_ok() {
            return Err(TtsError::from_code(response.status));
        }
        response
            .current_voice
            .ok_or(TtsError::OperationFailed("no current voice returned".into()))
    }

    /// Tears down the handle. Refuses while a callback is mid-flight;
    /// otherwise runs `unprepare` first if still connected.
    pub async fn destroy(self: &Arc<Self>) -> Result<()> {
        if self.callback_in_use.load(Ordering::SeqCst) {
            return Err(TtsError::InvalidState);
        }
        if self.state() != ClientState::Created {
            self.do_finalize().await?;
        }
        Ok(())
    }

    async fn send(&self, request: &Request) -> Result<ttsd_core::protocol::Response> {
        let mut guard = self.connection.lock();
        let Some(conn) = guard.as_mut() else {
            return Err(TtsError::InvalidState);
        };
        prepare::send_request(&mut conn.stream, request).await
    }

    fn transition(&self, new_state: ClientState) {
        let before = {
            let mut state = self.state.lock();
            let before = *state;
            *state = new_state;
            before
        };
        if before != new_state {
            self.fire_state_changed(before, new_state);
        }
    }

    fn fire_state_changed(&self, before: ClientState, after: ClientState) {
        self.callback_in_use.store(true, Ordering::SeqCst);
        self.callbacks.read().clone().fire_state_changed(before, after);
        self.callback_in_use.store(false, Ordering::SeqCst);
    }

    fn fire_error(&self, utt_id: Option<u32>, code: i32) {
        self.callback_in_use.store(true, Ordering::SeqCst);
        self.callbacks.read().clone().fire_error(utt_id, code);
        self.callback_in_use.store(false, Ordering::SeqCst);
    }

    fn fire_utterance_started(&self, utt_id: u32) {
        self.callback_in_use.store(true, Ordering::SeqCst);
        self.callbacks.read().clone().fire_utterance_started(utt_id);
        self.callback_in_use.store(false, Ordering::SeqCst);
    }

    fn fire_utterance_completed(&self, utt_id: u32) {
        self.callback_in_use.store(true, Ordering::SeqCst);
        self.callbacks.read().clone().fire_utterance_completed(utt_id);
        self.callback_in_use.store(false, Ordering::SeqCst);
    }

    fn fire_default_voice_changed(&self, voice: &Voice) {
        self.callback_in_use.store(true, Ordering::SeqCst);
        self.callbacks.read().clone().fire_default_voice_changed(voice);
        self.callback_in_use.store(false, Ordering::SeqCst);
    }

    /// Applies an event delivered over the bulk/file channel: updates local
    /// state (for `StateChanged`, the only variant that mutates it) and
    /// fires the matching callback under `callback_in_use`, the same
    /// reentrancy guard the handle's own synchronous methods use. Called
    /// from the bulk listener spawned in `do_prepare`, never directly from
    /// `CallbackSet`.
    pub(crate) fn apply_remote_event(&self, event: ttsd_core::protocol::BulkEvent) {
        use ttsd_core::protocol::BulkEvent;
        match event {
            BulkEvent::StateChanged { after, .. } => {
                let before = {
                    let mut state = self.state.lock();
                    let before = *state;
                    *state = after;
                    before
                };
                if before != after {
                    self.fire_state_changed(before, after);
                }
            }
            BulkEvent::UtteranceStarted { utt_id, .. } => self.fire_utterance_started(utt_id),
            BulkEvent::UtteranceCompleted { utt_id, .. } => self.fire_utterance_completed(utt_id),
            BulkEvent::Error { utt_id, code, .. } => self.fire_error(utt_id, code),
            BulkEvent::DefaultVoiceChanged { voice } => self.fire_default_voice_changed(&voice),
        }
    }
}
