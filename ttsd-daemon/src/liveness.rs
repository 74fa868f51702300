//! Liveness sweep: periodically probes each registered client's pid
//! with a `hello`; a failed probe triggers `finalize` for every uid sharing
//! that pid.
//!
//! `/proc` scanning is explicitly out of scope — probing
//! is the only liveness mechanism. Pid-level probe results (gathered by
//! `server.rs`'s async `probe_pid`, since the actual probe is IPC over the
//! bulk channel) are translated into the uids to finalize by the pure,
//! synchronously-testable `dead_uids_for` below.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{info, warn};

use crate::client::ClientRegistry;

/// How often the daemon sweeps its registry (independent of the 100 ms
/// pipeline tick — liveness checks are comparatively expensive IPC probes).
pub const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Given the alive/dead result of probing each pid, returns every uid whose
/// pid probe failed. Does not mutate the registry — finalize is a
/// daemon-server-level operation with its own side effects (closing the
/// bulk channel, voice unload) that belongs in `server.rs`.
pub fn dead_uids_for(registry: &ClientRegistry, pid_alive: &HashMap<u32, bool>) -> Vec<u32> {
    let mut dead = Vec::new();
    for client in registry.iter() {
        if !pid_alive.get(&client.pid).copied().unwrap_or(true) {
            warn!(uid = client.uid, pid = client.pid, "liveness probe failed");
            dead.push(client.uid);
        }
    }
    if dead.is_empty() {
        info!(count = registry.len(), "liveness sweep: all clients responsive");
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DaemonClient;

    #[test]
    fn dead_uids_identifies_only_clients_on_unresponsive_pids() {
        let mut registry = ClientRegistry::new();
        registry.insert(DaemonClient::new(100, 1));
        registry.insert(DaemonClient::new(101, 2));
        registry.insert(DaemonClient::new(101, 3));

        let pid_alive = HashMap::from([(100, true), (101, false)]);
        let mut dead = dead_uids_for(&registry, &pid_alive);
        dead.sort();
        assert_eq!(dead, vec![2, 3]);
    }

    #[test]
    fn dead_uids_with_all_responsive_returns_empty() {
        let mut registry = ClientRegistry::new();
        registry.insert(DaemonClient::new(100, 1));
        let pid_alive = HashMap::from([(100, true)]);
        assert!(dead_uids_for(&registry, &pid_alive).is_empty());
    }
}
