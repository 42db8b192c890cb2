use std::sync::Arc;
use std::time::Duration;

use theme_daemon::backend::{BackendClient, MusicBackend};
use theme_daemon::core::{CoreEvent, CoreHandle, CoreSettings, ThemeCore};
use theme_daemon::focus::{FocusHub, HostView};
use theme_daemon::mpv::MpvOutput;
use theme_daemon::resolver::SourceResolver;
use theme_daemon::{logging, socket, BroadcastMessage};
use theme_proto::config::Config;
use theme_proto::store::{IdentifierStore, JsonFileStore};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so the log layer can use it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let log_path = logging::init(&theme_proto::platform::data_dir(), broadcast_tx.clone())?;
    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    if let Err(e) = std::fs::write(&config.daemon.pid_file, std::process::id().to_string()) {
        warn!("Could not write pid file {:?}: {}", config.daemon.pid_file, e);
    }

    let store = JsonFileStore::new(config.store.path.clone());
    info!("Identifier cache at {:?}", store.path());
    let store: Arc<dyn IdentifierStore> = Arc::new(store);

    let backend: Arc<dyn MusicBackend> = Arc::new(BackendClient::new(
        config.backend.address.clone(),
        Duration::from_millis(config.backend.command_timeout_ms),
    ));
    let resolver = Arc::new(SourceResolver::new(
        store,
        backend.clone(),
        Duration::from_millis(config.backend.resolve_timeout_ms),
    ));

    let host = Arc::new(HostView::new(config.ui.tile_attribute.clone()));
    let hub = FocusHub::new();

    // Event channel: host controls and resolution results funnel into ThemeCore
    let (event_tx, event_rx) = mpsc::channel::<CoreEvent>(256);
    let core_handle = CoreHandle::new(event_tx.clone());

    let core = ThemeCore::new(
        CoreSettings::from_config(&config),
        host.clone(),
        hub.clone(),
        resolver,
        Box::new(MpvOutput::new()),
        event_tx,
        broadcast_tx.clone(),
    )
    .await;

    let _socket_handle = socket::start_server(
        config.host.bind_address.clone(),
        config.host.port,
        socket::HostContext {
            core: core_handle.clone(),
            hub,
            host,
            backend,
        },
        broadcast_tx,
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            core_handle.shutdown().await;
        }
    });

    info!("Daemon initialised, running event loop");
    core.run(event_rx).await?;

    let _ = std::fs::remove_file(&config.daemon.pid_file);
    Ok(())
}
