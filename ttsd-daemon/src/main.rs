//! `ttsd` daemon entry point. Each {Default, Notification, ScreenReader}
//! mode runs as its own independent `server::run` task, with its own
//! `ClientRegistry`, engine, and pipeline, bound under a shared socket root.

mod arbitration;
mod client;
mod liveness;
mod pipeline;
mod player;
mod resample;
mod server;

use tracing::{error, info};
use ttsd_core::config::DaemonConfig;
use ttsd_core::engine::{EngineHandle, StubEngine};
use ttsd_core::protocol::Mode;

use server::DaemonState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ttsd=info".parse().unwrap()),
        )
        .init();

    info!("ttsd starting");

    let config_dir = std::env::var_os("TTSD_CONFIG_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    let config_path = ttsd_core::config::default_config_path(&config_dir);
    let config = match DaemonConfig::load_or_init(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load config at {:?}: {e}", config_path);
            DaemonConfig::default()
        }
    };
    info!(
        engine_id = %config.engine_id,
        default_language = %config.default_language,
        "runtime config loaded"
    );

    let socket_root = server::default_socket_root();
    let error_log_path = ttsd_core::errorlog::default_error_log_path(&config_dir);

    let mut tasks = Vec::new();
    for mode in [Mode::Default, Mode::Notification, Mode::ScreenReader] {
        let engine = EngineHandle::new(StubEngine::new());
        let state = DaemonState::new(mode, config.clone(), engine, error_log_path.clone());
        let socket_root = socket_root.clone();
        let config_path = config_path.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::run(state, socket_root, config_path).await {
                error!(?mode, "daemon instance exited: {e}");
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }
}
