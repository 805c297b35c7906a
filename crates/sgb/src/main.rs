use std::sync::Arc;

use anyhow::Context;
use sgb_blaze::BlazeConnector;
use sgb_core::{
    config::Config,
    service::Service,
    store::{MemoryStore, Store},
};
use sgb_transfer::TransferClient;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sgb_core::logging::init("sgb")?;

    let cfg = Arc::new(Config::load().context("loading config")?);

    let store: Arc<dyn Store> = match &cfg.store_snapshot_path {
        Some(path) => Arc::new(
            MemoryStore::open(path)
                .with_context(|| format!("opening store snapshot {}", path.display()))?,
        ),
        None => {
            tracing::warn!("STORE_SNAPSHOT_PATH not set, state is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };
    let transfers = Arc::new(TransferClient::new(
        cfg.api_roots.clone(),
        cfg.access_token.clone(),
    )?);
    let connector = Arc::new(BlazeConnector::new(&cfg));

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("ctrl-c received, shutting down");
            }
            shutdown.cancel();
        }
    });

    let service = Service::new(cfg.clone(), store, transfers);
    let workers = service.spawn_workers(&shutdown);
    tracing::info!(
        client_id = %cfg.client_id,
        shards = cfg.shard_size,
        "bot started"
    );

    service.run(connector, shutdown.clone()).await?;

    for w in workers {
        let _ = w.await;
    }
    tracing::info!("bot stopped");
    Ok(())
}
