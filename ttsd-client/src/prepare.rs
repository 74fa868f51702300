//! Daemon connection bring-up: hello handshake, on-demand daemon spawn, and
//! the IPC retry policy.
//!
//! Spawning the daemon uses `tokio::process::Command::spawn` directly, a
//! plain non-blocking async call — no dedicated spawn thread is needed
//! here the way one is for opening a `!Send` audio stream.

use std::collections::HashMap;
use std::sync::{Mutex as SyncMutex, OnceLock};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::time::sleep;
use tracing::{info, warn};

use ttsd_core::error::{Result, TtsError};
use ttsd_core::protocol::{Mode, Request, Response};
use ttsd_core::transport::{read_framed, write_framed};

/// Interval between reconnect attempts while waiting for a freshly spawned
/// daemon to bind its socket.
const HELLO_RETRY_INTERVAL: Duration = Duration::from_millis(20);
/// How many reconnect attempts `hello_handshake` makes after spawning.
const HELLO_RETRY_ATTEMPTS: u32 = 25;

/// Retry count/backoff for the five retryable methods: 10 attempts,
/// 10 microseconds apart, only on a `TimedOut` status.
const REQUEST_RETRY_ATTEMPTS: u32 = 10;
const REQUEST_RETRY_DELAY: Duration = Duration::from_micros(10);

/// Per-mode single-flight flag so two racing `prepare` calls in the same
/// process don't both spawn a daemon.
fn spawn_flags() -> &'static SyncMutex<HashMap<Mode, bool>> {
    static FLAGS: OnceLock<SyncMutex<HashMap<Mode, bool>>> = OnceLock::new();
    FLAGS.get_or_init(|| SyncMutex::new(HashMap::new()))
}

fn spawn_in_flight(mode: Mode) -> bool {
    let mut flags = spawn_flags().lock().unwrap();
    if *flags.get(&mode).unwrap_or(&false) {
        true
    } else {
        flags.insert(mode, true);
        false
    }
}

fn clear_spawn_flag(mode: Mode) {
    spawn_flags().lock().unwrap().insert(mode, false);
}

async fn try_connect(mode: Mode) -> Option<UnixStream> {
    let root = ttsd_core::default_socket_root();
    let path = ttsd_core::control_socket_path(&root, mode);
    UnixStream::connect(&path).await.ok()
}

fn spawn_daemon() -> std::io::Result<()> {
    tokio::process::Command::new("ttsd")
        .kill_on_drop(false)
        .spawn()?;
    Ok(())
}

/// Connects to the mode's control socket, spawning the daemon if nobody is
/// listening yet. Returns the connected stream once a `hello` round-trips
/// successfully.
pub async fn hello_handshake(mode: Mode, uid: u32) -> Result<UnixStream> {
    if let Some(mut stream) = try_connect(mode).await {
        if send_hello(&mut stream, uid).await.is_ok() {
            return Ok(stream);
        }
    }

    if spawn_in_flight(mode) {
        // Another task in this process is already spawning; just poll.
    } else {
        info!(?mode, "no daemon listening, spawning one");
        let spawn_result = spawn_daemon();
        clear_spawn_flag(mode);
        if let Err(e) = spawn_result {
            warn!(?mode, "failed to spawn daemon: {e}");
            return Err(TtsError::Io(e));
        }
    }

    for attempt in 0..HELLO_RETRY_ATTEMPTS {
        sleep(HELLO_RETRY_INTERVAL).await;
        if let Some(mut stream) = try_connect(mode).await {
            if send_hello(&mut stream, uid).await.is_ok() {
                return Ok(stream);
            }
        }
        warn!(?mode, attempt, "daemon not ready yet, retrying");
    }

    Err(TtsError::TimedOut)
}

async fn send_hello(stream: &mut UnixStream, uid: u32) -> Result<()> {
    write_framed(stream, &Request::Hello { uid }).await?;
    let response: Option<Response> = read_framed(stream).await?;
    match response {
        Some(r) if r.is_ok() => Ok(()),
        Some(r) => Err(TtsError::from_code(r.status)),
        None => Err(TtsError::NetworkDown),
    }
}

/// Sends `request` over `stream` and returns its response, retrying when
/// the method is retryable and the daemon reports a timeout.
pub async fn send_request(stream: &mut UnixStream, request: &Request) -> Result<Response> {
    let retryable = request.is_retryable_method();
    let mut attempt = 0;

    loop {
        write_framed(stream, request).await?;
        let response: Response = match read_framed(stream).await? {
            Some(r) => r,
            None => return Err(TtsError::NetworkDown),
        };

        if response.is_ok() || !retryable || !TtsError::from_code(response.status).is_timed_out()
        {
            return Ok(response);
        }

        attempt += 1;
        if attempt >= REQUEST_RETRY_ATTEMPTS {
            return Ok(response);
        }
        sleep(REQUEST_RETRY_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_flag_is_single_flight_until_cleared() {
        let mode = Mode::Notification;
        clear_spawn_flag(mode);
        assert!(!spawn_in_flight(mode));
        assert!(spawn_in_flight(mode));
        clear_spawn_flag(mode);
        assert!(!spawn_in_flight(mode));
    }
}
