use std::sync::Arc;

use fleet_core::{config::Config, fleet::Fleet};
use fleet_loopback::{FileDeviceStore, LoopbackConnector};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod console;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fleet_core::logging::init("fleet")?;

    let cfg = Config::load()?;
    info!(data_dir = %cfg.data_dir.display(), "starting fleet");

    let store = Arc::new(FileDeviceStore::new(&cfg.device_dir));
    let connector = Arc::new(LoopbackConnector::new(store.clone()));
    let fleet = Arc::new(Fleet::builder(cfg).start(connector.clone(), store).await?);
    info!(sessions = fleet.sessions().await.len(), "fleet ready");

    let cancel = CancellationToken::new();
    let observer = console::spawn_observer(fleet.clone(), cancel.clone()).await;
    let console = tokio::spawn(console::run(fleet.clone(), connector, cancel.clone()));

    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => info!("interrupt received"),
            Err(e) => {
                warn!(error = %e, "failed to listen for ctrl-c; use `quit`");
                cancel.cancelled().await;
            }
        },
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
    console.abort();
    fleet.shutdown().await;
    let _ = observer.await;
    Ok(())
}
