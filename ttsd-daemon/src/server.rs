//! IPC server: binds the control channel and bulk/file channel for one
//! mode, dispatches requests, and drives the pipeline/liveness ticks.
//!
//! Events fan out over a broadcast channel per pid; a "subscribe and
//! forward" task per bulk connection relays them onto its Unix-socket
//! writer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, oneshot, Mutex as AsyncMutex};
use tracing::{error, info, warn};

use ttsd_core::config::DaemonConfig;
use ttsd_core::engine::EngineHandle;
use ttsd_core::error::TtsError;
use ttsd_core::protocol::{BulkEvent, BulkFrame, ClientState, Mode, Request, Response};
use ttsd_core::voice::Voice;

use crate::arbitration::{self, PauseOutcome, PlayOutcome, StopOutcome};
use crate::client::{ClientRegistry, DaemonClient};
use crate::pipeline::{self, PipelineDiagnostics, PipelineEnv, SynthControl, PIPELINE_TICK};
use crate::player::{NullSink, Player};
use ttsd_core::transport::{read_framed, write_framed};

/// How long the daemon waits for a `hello_ack` before declaring a client
/// dead.
const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

/// How often the daemon re-reads its config file looking for a changed
/// `engine_id`. There is no IPC path for a runtime engine change — it is
/// driven entirely by editing the config file on disk.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);

struct BulkSession {
    writer: AsyncMutex<tokio::net::unix::OwnedWriteHalf>,
    pending_ack: SyncMutex<Option<oneshot::Sender<()>>>,
}

/// All shared daemon state for one mode.
pub struct DaemonState {
    pub mode: Mode,
    pub registry: SyncMutex<ClientRegistry>,
    pub engine: EngineHandle,
    pub control: SyncMutex<SynthControl>,
    pub player: SyncMutex<Player<NullSink>>,
    pub config: SyncMutex<DaemonConfig>,
    pub diagnostics: PipelineDiagnostics,
    pub error_log_path: PathBuf,
    bulk_senders: SyncMutex<HashMap<u32, broadcast::Sender<BulkEvent>>>,
    bulk_sessions: SyncMutex<HashMap<u32, Arc<BulkSession>>>,
}

impl DaemonState {
    pub fn new(
        mode: Mode,
        config: DaemonConfig,
        engine: EngineHandle,
        error_log_path: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            mode,
            registry: SyncMutex::new(ClientRegistry::new()),
            engine,
            control: SyncMutex::new(SynthControl::Idle),
            player: SyncMutex::new(Player::new(NullSink::default())),
            config: SyncMutex::new(config),
            diagnostics: PipelineDiagnostics::default(),
            error_log_path,
            bulk_senders: SyncMutex::new(HashMap::new()),
            bulk_sessions: SyncMutex::new(HashMap::new()),
        })
    }

    fn bulk_sender_for(&self, pid: u32) -> broadcast::Sender<BulkEvent> {
        self.bulk_senders
            .lock()
            .entry(pid)
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    fn publish_bulk(&self, pid: u32, event: BulkEvent) {
        if let Some(tx) = self.bulk_senders.lock().get(&pid) {
            let _ = tx.send(event);
        }
    }

    fn pid_for_uid(&self, uid: u32) -> Option<u32> {
        self.registry.lock().get(uid).map(|c| c.pid)
    }
}

/// Binds and serves the control socket and bulk socket for `state.mode`
/// under `socket_root`, and spawns the pipeline-tick, liveness-sweep, and
/// config-watch background tasks. Runs until the control listener errors.
pub async fn run(
    state: Arc<DaemonState>,
    socket_root: PathBuf,
    config_path: PathBuf,
) -> std::io::Result<()> {
    std::fs::create_dir_all(&socket_root)?;
    let control_path = ttsd_core::control_socket_path(&socket_root, state.mode);
    let bulk_path = ttsd_core::bulk_socket_path(&socket_root, state.mode);
    let _ = std::fs::remove_file(&control_path);
    let _ = std::fs::remove_file(&bulk_path);

    let control_listener = UnixListener::bind(&control_path)?;
    let bulk_listener = UnixListener::bind(&bulk_path)?;
    info!(?control_path, ?bulk_path, "daemon listening");

    tokio::spawn(pipeline_tick_loop(Arc::clone(&state)));
    tokio::spawn(liveness_sweep_loop(Arc::clone(&state)));
    tokio::spawn(bulk_accept_loop(Arc::clone(&state), bulk_listener));
    tokio::spawn(config_watch_loop(Arc::clone(&state), config_path));

    loop {
        let (stream, _addr) = control_listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = serve_control_connection(state, stream).await {
                warn!("control connection error: {e}");
            }
        });
    }
}

async fn serve_control_connection(
    state: Arc<DaemonState>,
    mut stream: UnixStream,
) -> std::io::Result<()> {
    while let Some(request) = read_framed::<_, Request>(&mut stream).await? {
        let response = dispatch(&state, request).await;
        write_framed(&mut stream, &response).await?;
    }
    Ok(())
}

async fn dispatch(state: &Arc<DaemonState>, request: Request) -> Response {
    match request {
        Request::Hello { .. } => Response::ok(),
        Request::Initialize { uid, pid } => handle_initialize(state, uid, pid),
        Request::Finalize { uid } => handle_finalize(state, uid),
        Request::GetSupportVoices { .. } => {
            let voices = state.engine.0.lock().foreach_voices();
            let mut r = Response::ok();
            r.voices = Some(voices);
            r
        }
        Request::GetCurrentVoice { .. } => {
            let cfg = state.config.lock().clone();
            let mut r = Response::ok();
            r.current_voice = Voice::new(cfg.default_language, cfg.default_voice_type).ok();
            r
        }
        Request::SetSoundType { uid, sound_type } => {
            if let Some(c) = state.registry.lock().get_mut(uid) {
                c.sound_type = sound_type;
                state.player.lock().set_sound_type(uid, sound_type);
                Response::ok()
            } else {
                Response::error(TtsError::InvalidState.code())
            }
        }
        Request::AddQueue { uid, request } => handle_add_queue(state, uid, request),
        Request::Play { uid } => handle_play(state, uid),
        Request::Stop { uid } => handle_stop(state, uid),
        Request::Pause { uid } => handle_pause(state, uid),
    }
}

fn handle_initialize(state: &Arc<DaemonState>, uid: u32, pid: u32) -> Response {
    let mut registry = state.registry.lock();
    if registry.contains(uid) {
        return Response::error(TtsError::InvalidState.code());
    }
    registry.insert(DaemonClient::new(pid, uid));
    drop(registry);
    state.player.lock().create(uid);
    state.bulk_sender_for(pid);
    emit_state_changed(state, pid, uid, ClientState::Created, ClientState::Ready);
    if let Some(c) = state.registry.lock().get_mut(uid) {
        c.state = ClientState::Ready;
    }
    Response::ok()
}

fn handle_finalize(state: &Arc<DaemonState>, uid: u32) -> Response {
    let mut registry = state.registry.lock();
    let removed = registry.remove(uid);
    let Some(client) = removed else {
        return Response::error(TtsError::InvalidState.code());
    };

    let mut agent = state.engine.0.lock();
    for voice in &client.used_voices {
        if !registry.any_other_client_uses(uid, voice) {
            let Ok(v) = Voice::new(voice.0.clone(), voice.1) else {
                continue;
            };
            if let Err(e) = agent.unload_voice(&v) {
                warn!("unload_voice failed for {:?}: {e}", voice);
            }
        }
    }
    drop(agent);

    let still_has_clients_for_pid = registry.iter().any(|c| c.pid == client.pid);
    drop(registry);

    state.player.lock().destroy(uid);
    if !still_has_clients_for_pid {
        state.bulk_senders.lock().remove(&client.pid);
        state.bulk_sessions.lock().remove(&client.pid);
    }
    Response::ok()
}

/// `utt_id` is assigned by the `ClientHandle` before this request is ever
/// sent — the daemon trusts and echoes it back, it does not mint
/// its own.
fn handle_add_queue(
    state: &Arc<DaemonState>,
    uid: u32,
    request: ttsd_core::SpeakRequest,
) -> Response {
    if request.text.len() > 2000 {
        return Response::error(TtsError::InvalidParameter("text too long".into()).code());
    }
    if std::str::from_utf8(request.text.as_bytes()).is_err() {
        return Response::error(TtsError::InvalidParameter("invalid utf-8".into()).code());
    }
    let mut registry = state.registry.lock();
    let Some(client) = registry.get_mut(uid) else {
        return Response::error(TtsError::InvalidState.code());
    };
    if client.state == ClientState::Created {
        return Response::error(TtsError::InvalidState.code());
    }

    let utt_id = request.utt_id;
    client.pending_utterances.push_back(request);

    let mut r = Response::ok();
    r.utt_id = Some(utt_id);
    r
}

fn handle_play(state: &Arc<DaemonState>, uid: u32) -> Response {
    let mut registry = state.registry.lock();
    let mut control = state.control.lock();
    let mode = state.mode;
    let outcome = arbitration::play(
        &mut registry,
        &state.engine,
        &mut control,
        mode,
        uid,
        |preempted_uid, pid, before, after| {
            state.publish_bulk(
                pid,
                BulkEvent::StateChanged {
                    uid: preempted_uid,
                    before,
                    after,
                },
            );
        },
    );
    drop(control);
    match outcome {
        PlayOutcome::InvalidState => Response::error(TtsError::InvalidState.code()),
        PlayOutcome::NoOp => Response::ok(),
        PlayOutcome::Started { .. } => {
            state.player.lock().play(uid);
            drop(registry);
            emit_state_changed_for_uid(state, uid, ClientState::Ready, ClientState::Playing);
            Response::ok()
        }
    }
}

fn handle_stop(state: &Arc<DaemonState>, uid: u32) -> Response {
    let before = state.registry.lock().get(uid).map(|c| c.state);
    let mut registry = state.registry.lock();
    let mut control = state.control.lock();
    let outcome = arbitration::stop(&mut registry, &state.engine, &mut control, uid);
    drop(control);
    drop(registry);
    match outcome {
        StopOutcome::InvalidState => Response::error(TtsError::InvalidState.code()),
        StopOutcome::NoOp => Response::ok(),
        StopOutcome::Stopped => {
            state.player.lock().stop(uid);
            if let Some(before) = before {
                emit_state_changed_for_uid(state, uid, before, ClientState::Ready);
            }
            Response::ok()
        }
    }
}

fn handle_pause(state: &Arc<DaemonState>, uid: u32) -> Response {
    let mut registry = state.registry.lock();
    let outcome = arbitration::pause(&mut registry, uid);
    drop(registry);
    match outcome {
        PauseOutcome::InvalidState => Response::error(TtsError::InvalidState.code()),
        PauseOutcome::Paused => {
            state.player.lock().pause(uid);
            emit_state_changed_for_uid(state, uid, ClientState::Playing, ClientState::Paused);
            Response::ok()
        }
    }
}

fn emit_state_changed(
    state: &Arc<DaemonState>,
    pid: u32,
    uid: u32,
    before: ClientState,
    after: ClientState,
) {
    state.publish_bulk(pid, BulkEvent::StateChanged { uid, before, after });
}

fn emit_state_changed_for_uid(
    state: &Arc<DaemonState>,
    uid: u32,
    before: ClientState,
    after: ClientState,
) {
    if let Some(pid) = state.pid_for_uid(uid) {
        emit_state_changed(state, pid, uid, before, after);
    }
}

/// Drives the synthesis pipeline on a fixed tick, then drains the
/// player's queue for the playing client. `utterance-started` and
/// `utterance-completed` are fired off the player's drain result — i.e.
/// when a chunk is actually consumed for playback — not off the engine
/// producing it, so a paused/queued client is never told its utterance
/// "completed" before it has played.
async fn pipeline_tick_loop(state: Arc<DaemonState>) {
    let mut interval = tokio::time::interval(PIPELINE_TICK);
    loop {
        interval.tick().await;

        let mut registry = state.registry.lock();
        let mut control = state.control.lock();
        let engine_id = state.config.lock().engine_id.clone();
        let env = PipelineEnv {
            diagnostics: &state.diagnostics,
            error_log_path: &state.error_log_path,
            engine_id: &engine_id,
        };

        *control = pipeline::tick(
            *control,
            &mut registry,
            &state.engine,
            &env,
            &mut |uid, pid, utt_id, code| {
                state.publish_bulk(pid, BulkEvent::Error { uid, utt_id, code });
            },
        );
        drop(control);

        if let Some(playing_uid) = registry.current_playing() {
            if let Some(client) = registry.get_mut(playing_uid) {
                let pid = client.pid;
                let (started, completed) = state
                    .player
                    .lock()
                    .drain(playing_uid, &mut client.audio_queue);
                drop(registry);

                for utt_id in started {
                    state
                        .diagnostics
                        .utterances_started
                        .fetch_add(1, Ordering::Relaxed);
                    state.publish_bulk(pid, BulkEvent::UtteranceStarted { uid: playing_uid, utt_id });
                }
                for utt_id in completed {
                    state
                        .diagnostics
                        .utterances_completed
                        .fetch_add(1, Ordering::Relaxed);
                    state.publish_bulk(pid, BulkEvent::UtteranceCompleted { uid: playing_uid, utt_id });
                }
            }
        }
    }
}

/// Polls the config file for a changed `engine_id` and, on change, runs
/// the configuration-change sequence: stop all players, tell every
/// non-Ready client it is now Ready, cancel any in-flight synthesis, then
/// apply the new config. There is exactly one compiled-in engine backend,
/// so "installing the new engine" here means re-initializing it against
/// the new config rather than swapping the trait object.
async fn config_watch_loop(state: Arc<DaemonState>, config_path: PathBuf) {
    let mut interval = tokio::time::interval(CONFIG_POLL_INTERVAL);
    loop {
        interval.tick().await;

        let Some(new_config) = DaemonConfig::reload(&config_path) else {
            continue;
        };
        let changed = state.config.lock().engine_id != new_config.engine_id;
        if !changed {
            continue;
        }

        info!(engine_id = %new_config.engine_id, "engine id changed, applying");
        apply_engine_change(&state, new_config);
    }
}

fn apply_engine_change(state: &Arc<DaemonState>, new_config: DaemonConfig) {
    let mut registry = state.registry.lock();
    let mut control = state.control.lock();
    let mut notify = Vec::new();
    arbitration::stop_all_for_engine_change(
        &mut registry,
        &state.engine,
        &mut control,
        |uid, pid, before, after| notify.push((uid, pid, before, after)),
    );
    drop(control);
    drop(registry);
    state.player.lock().all_stop();

    for (uid, pid, before, after) in notify {
        emit_state_changed(state, pid, uid, before, after);
    }

    let mut agent = state.engine.0.lock();
    if let Err(e) = agent.deinitialize() {
        error!("engine deinitialize failed during config change: {e}");
    }
    if let Err(e) = agent.initialize() {
        error!("engine re-initialize failed during config change: {e}");
    }
    drop(agent);

    *state.config.lock() = new_config;
}

/// Liveness sweep: probes every (pid, mode) with an open bulk session by
/// writing a `Hello` frame and awaiting `HelloAck` within
/// `LIVENESS_PROBE_TIMEOUT`. A failed probe finalizes every uid for that pid.
async fn liveness_sweep_loop(state: Arc<DaemonState>) {
    let mut interval = tokio::time::interval(crate::liveness::LIVENESS_SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let pids: Vec<u32> = state.bulk_sessions.lock().keys().copied().collect();

        let mut pid_alive = HashMap::with_capacity(pids.len());
        for pid in pids {
            pid_alive.insert(pid, probe_pid(&state, pid).await);
        }

        let dead_uids = crate::liveness::dead_uids_for(&state.registry.lock(), &pid_alive);
        for uid in dead_uids {
            handle_finalize(&state, uid);
        }
    }
}

async fn probe_pid(state: &Arc<DaemonState>, pid: u32) -> bool {
    let Some(session) = state.bulk_sessions.lock().get(&pid).cloned() else {
        return true; // no open session yet — nothing to probe
    };
    let (tx, rx) = oneshot::channel();
    *session.pending_ack.lock() = Some(tx);

    {
        let mut writer = session.writer.lock().await;
        if write_framed(&mut *writer, &BulkFrame::Hello).await.is_err() {
            return false;
        }
    }

    matches!(
        tokio::time::timeout(LIVENESS_PROBE_TIMEOUT, rx).await,
        Ok(Ok(()))
    )
}

async fn bulk_accept_loop(state: Arc<DaemonState>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = serve_bulk_connection(state, stream).await {
                        warn!("bulk connection error: {e}");
                    }
                });
            }
            Err(e) => {
                error!("bulk listener accept failed: {e}");
                return;
            }
        }
    }
}

/// First frame on a new bulk connection is always an `Initialize`-time
/// registration: the client reports its `pid` so the daemon can route
/// events and probes to the right session. Everything after that is either
/// a streamed `BulkEvent` (daemon → client) or a `HelloAck` (client →
/// daemon, in reply to a liveness probe).
async fn serve_bulk_connection(
    state: Arc<DaemonState>,
    stream: UnixStream,
) -> std::io::Result<()> {
    let (mut read_half, write_half) = stream.into_split();
    let pid: u32 = match read_framed(&mut read_half).await? {
        Some(pid) => pid,
        None => return Ok(()),
    };

    let session = Arc::new(BulkSession {
        writer: AsyncMutex::new(write_half),
        pending_ack: SyncMutex::new(None),
    });
    state.bulk_sessions.lock().insert(pid, Arc::clone(&session));

    let mut rx = state.bulk_sender_for(pid).subscribe();
    let forward_session = Arc::clone(&session);
    let forward_task = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            let mut writer = forward_session.writer.lock().await;
            if write_framed(&mut *writer, &BulkFrame::Event(event)).await.is_err() {
                break;
            }
        }
    });

    loop {
        match read_framed::<_, BulkFrame>(&mut read_half).await {
            Ok(Some(BulkFrame::HelloAck)) => {
                if let Some(tx) = session.pending_ack.lock().take() {
                    let _ = tx.send(());
                }
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }

    forward_task.abort();
    state.bulk_sessions.lock().remove(&pid);
    Ok(())
}

pub fn default_socket_root() -> PathBuf {
    ttsd_core::default_socket_root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_socket_root_is_under_temp_dir() {
        let root = default_socket_root();
        assert!(root.ends_with("ttsd"));
    }
}
