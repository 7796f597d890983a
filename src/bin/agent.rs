use std::path::Path;
use tokio::sync::broadcast;

use syncbox::client::{ApiClient, FolderWatcher, SyncEngine};
use syncbox::{init_tracing, load_config};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = load_config()?;
    let client_config = config.client.clone();

    let folder = Path::new(&client_config.sync_folder);
    std::fs::create_dir_all(folder)?;

    let transport = ApiClient::new(&client_config.server_url)?;
    let watcher = FolderWatcher::new(folder)?;
    let engine = SyncEngine::new(client_config, transport, watcher.control());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        tracing::info!("Shutdown signal received");
        shutdown_tx.send(()).ok();
    });

    engine.run(watcher, shutdown_rx).await;

    Ok(())
}
