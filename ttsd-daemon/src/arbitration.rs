//! Multi-client arbitration & state policy: who gets to play, who gets
//! preempted, and what happens to everyone else's queue when they are.

use tracing::info;
use ttsd_core::engine::EngineHandle;
use ttsd_core::protocol::{ClientState, Mode};

use crate::client::ClientRegistry;
use crate::pipeline::SynthControl;

/// Outcome of a `play` request, used by the IPC server to decide which
/// bulk events to emit and which client to kick the pipeline for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// Already playing; no-op success.
    NoOp,
    /// Now playing; previously Paused (no pipeline kick needed — already
    /// mid-utterance) or previously Ready (pipeline kick needed).
    Started { resumed: bool },
    InvalidState,
}

/// `ttsd_server_play`. `mode` governs how the preempted client (if
/// any) is treated.
pub fn play(
    registry: &mut ClientRegistry,
    engine: &EngineHandle,
    control: &mut SynthControl,
    mode: Mode,
    requesting_uid: u32,
    mut on_preempted: impl FnMut(u32, u32, ClientState, ClientState),
) -> PlayOutcome {
    let requesting_state = match registry.get(requesting_uid) {
        Some(c) => c.state,
        None => return PlayOutcome::InvalidState,
    };

    if requesting_state == ClientState::Created {
        return PlayOutcome::InvalidState;
    }
    if requesting_state == ClientState::Playing {
        return PlayOutcome::NoOp;
    }

    if let Some(current_uid) = registry.current_playing() {
        if current_uid != requesting_uid {
            match mode {
                Mode::Default => {
                    if let Some(c) = registry.get_mut(current_uid) {
                        let before = c.state;
                        let pid = c.pid;
                        c.state = ClientState::Paused;
                        on_preempted(current_uid, pid, before, ClientState::Paused);
                    }
                }
                Mode::Notification | Mode::ScreenReader => {
                    if let Some(c) = registry.get_mut(current_uid) {
                        let before = c.state;
                        let pid = c.pid;
                        c.state = ClientState::Ready;
                        on_preempted(current_uid, pid, before, ClientState::Ready);
                    }
                    if matches!(control, SynthControl::InProgress { uid, .. } if *uid == current_uid)
                    {
                        let _ = engine.0.lock().cancel_synthesis();
                        *control = SynthControl::Aborted;
                    }
                    if let Some(c) = registry.get_mut(current_uid) {
                        c.audio_queue.clear();
                    }
                }
            }
        }
    }

    let resumed = requesting_state == ClientState::Paused;
    if let Some(c) = registry.get_mut(requesting_uid) {
        c.state = ClientState::Playing;
    }
    info!(uid = requesting_uid, resumed, "client playing");
    PlayOutcome::Started { resumed }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// Already Ready — idempotent no-op success.
    NoOp,
    InvalidState,
}

/// `ttsd_server_stop`: valid from {Playing, Paused}; a repeated stop
/// while already Ready is a no-op success rather than invalid-state.
pub fn stop(
    registry: &mut ClientRegistry,
    engine: &EngineHandle,
    control: &mut SynthControl,
    uid: u32,
) -> StopOutcome {
    let Some(client) = registry.get_mut(uid) else {
        return StopOutcome::InvalidState;
    };
    if client.state == ClientState::Ready {
        return StopOutcome::NoOp;
    }
    if !matches!(client.state, ClientState::Playing | ClientState::Paused) {
        return StopOutcome::InvalidState;
    }

    if matches!(control, SynthControl::InProgress { uid: u, .. } if *u == uid) {
        let _ = engine.0.lock().cancel_synthesis();
    }
    *control = SynthControl::Aborted;

    client.state = ClientState::Ready;
    client.clear_pending_and_record_stopped();
    StopOutcome::Stopped
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseOutcome {
    Paused,
    InvalidState,
}

/// `ttsd_server_pause`: only valid from Playing. Synthesis of the
/// already-queued utterance may continue to completion.
pub fn pause(registry: &mut ClientRegistry, uid: u32) -> PauseOutcome {
    let Some(client) = registry.get_mut(uid) else {
        return PauseOutcome::InvalidState;
    };
    if client.state != ClientState::Playing {
        return PauseOutcome::InvalidState;
    }
    client.state = ClientState::Paused;
    PauseOutcome::Paused
}

/// Configuration-change callback: stop all players, notify every
/// client Ready, cancel synthesis, then the caller installs the new engine.
pub fn stop_all_for_engine_change(
    registry: &mut ClientRegistry,
    engine: &EngineHandle,
    control: &mut SynthControl,
    mut on_state_changed: impl FnMut(u32, u32, ClientState, ClientState),
) {
    if !matches!(control, SynthControl::Idle) {
        let _ = engine.0.lock().cancel_synthesis();
        *control = SynthControl::Aborted;
    }
    for client in registry.iter_mut() {
        if client.state != ClientState::Ready {
            let before = client.state;
            client.state = ClientState::Ready;
            client.clear_pending_and_record_stopped();
            on_state_changed(client.uid, client.pid, before, ClientState::Ready);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DaemonClient;
    use ttsd_core::engine::StubEngine;

    fn registry_with(states: &[(u32, ClientState)]) -> ClientRegistry {
        let mut reg = ClientRegistry::new();
        for (uid, state) in states {
            let mut c = DaemonClient::new(*uid + 100, *uid);
            c.state = *state;
            reg.insert(c);
        }
        reg
    }

    #[test]
    fn play_on_already_playing_is_noop() {
        let mut reg = registry_with(&[(1, ClientState::Playing)]);
        let engine = EngineHandle::new(StubEngine::new());
        let mut control = SynthControl::Idle;
        let outcome = play(&mut reg, &engine, &mut control, Mode::Default, 1, |_, _, _, _| {});
        assert_eq!(outcome, PlayOutcome::NoOp);
    }

    #[test]
    fn default_mode_preemption_pauses_current_player() {
        let mut reg = registry_with(&[(1, ClientState::Playing), (2, ClientState::Ready)]);
        let engine = EngineHandle::new(StubEngine::new());
        let mut control = SynthControl::Idle;
        let mut preempted = None;
        let outcome = play(&mut reg, &engine, &mut control, Mode::Default, 2, |uid, pid, before, after| {
            preempted = Some((uid, pid, before, after));
        });
        assert_eq!(outcome, PlayOutcome::Started { resumed: false });
        assert_eq!(reg.get(1).unwrap().state, ClientState::Paused);
        assert_eq!(reg.get(2).unwrap().state, ClientState::Playing);
        assert_eq!(preempted, Some((1, 101, ClientState::Playing, ClientState::Paused)));
    }

    #[test]
    fn notification_mode_preemption_stops_current_player_and_drains_queue() {
        let mut reg = registry_with(&[(1, ClientState::Playing), (2, ClientState::Ready)]);
        reg.get_mut(1).unwrap().audio_queue.push_back(ttsd_core::AudioChunk {
            utt_id: 1,
            data: vec![],
            event: ttsd_core::engine::ResultEvent::Continue,
            audio_type: ttsd_core::engine::AudioType::S16Pcm,
            sample_rate: 16_000,
            channels: 1,
        });
        let engine = EngineHandle::new(StubEngine::new());
        let mut control = SynthControl::InProgress { uid: 1, utt_id: 1 };
        let outcome = play(
            &mut reg,
            &engine,
            &mut control,
            Mode::Notification,
            2,
            |_, _, _, _| {},
        );
        assert_eq!(outcome, PlayOutcome::Started { resumed: false });
        assert_eq!(reg.get(1).unwrap().state, ClientState::Ready);
        assert!(reg.get(1).unwrap().audio_queue.is_empty());
        assert_eq!(control, SynthControl::Aborted);
    }

    #[test]
    fn stop_from_created_is_invalid() {
        let mut reg = registry_with(&[(1, ClientState::Created)]);
        let engine = EngineHandle::new(StubEngine::new());
        let mut control = SynthControl::Idle;
        assert_eq!(stop(&mut reg, &engine, &mut control, 1), StopOutcome::InvalidState);
    }

    #[test]
    fn stop_records_last_stopped_utt_id() {
        let mut reg = registry_with(&[(1, ClientState::Playing)]);
        reg.get_mut(1).unwrap().pending_utterances.push_back(ttsd_core::SpeakRequest {
            utt_id: 9,
            text: "x".into(),
            language: None,
            voice_type: None,
            speed: None,
        });
        let engine = EngineHandle::new(StubEngine::new());
        let mut control = SynthControl::Idle;
        assert_eq!(stop(&mut reg, &engine, &mut control, 1), StopOutcome::Stopped);
        assert_eq!(reg.get(1).unwrap().state, ClientState::Ready);
        assert_eq!(reg.get(1).unwrap().last_stopped_utt_id, 9);
    }

    #[test]
    fn double_stop_from_ready_is_noop_success() {
        let mut reg = registry_with(&[(1, ClientState::Playing)]);
        let engine = EngineHandle::new(StubEngine::new());
        let mut control = SynthControl::Idle;
        assert_eq!(stop(&mut reg, &engine, &mut control, 1), StopOutcome::Stopped);
        assert_eq!(stop(&mut reg, &engine, &mut control, 1), StopOutcome::NoOp);
    }

    #[test]
    fn pause_only_valid_from_playing() {
        let mut reg = registry_with(&[(1, ClientState::Paused)]);
        assert_eq!(pause(&mut reg, 1), PauseOutcome::InvalidState);
        reg.get_mut(1).unwrap().state = ClientState::Playing;
        assert_eq!(pause(&mut reg, 1), PauseOutcome::Paused);
    }

    #[test]
    fn engine_change_stops_everyone_and_cancels_in_flight_synthesis() {
        let mut reg = registry_with(&[
            (1, ClientState::Playing),
            (2, ClientState::Paused),
            (3, ClientState::Ready),
        ]);
        let engine = EngineHandle::new(StubEngine::new());
        let mut control = SynthControl::InProgress { uid: 1, utt_id: 1 };
        let mut notified = Vec::new();
        stop_all_for_engine_change(&mut reg, &engine, &mut control, |uid, pid, before, after| {
            notified.push((uid, pid, before, after));
        });

        assert_eq!(control, SynthControl::Aborted);
        assert_eq!(reg.get(1).unwrap().state, ClientState::Ready);
        assert_eq!(reg.get(2).unwrap().state, ClientState::Ready);
        assert_eq!(reg.get(3).unwrap().state, ClientState::Ready);
        assert_eq!(notified.len(), 2, "only clients not already Ready are notified");
    }
}
