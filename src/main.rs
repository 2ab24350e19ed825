use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use strand::{
    broker::Broker,
    config::{ServerConfig, StorageBackend},
    http,
    storage::{Storage, make_memory_store, make_rocksdb_store},
    util::init_tracing,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ServerConfig::parse();
    init_tracing(cfg.log_json);

    let storage: Arc<dyn Storage> = match cfg.storage {
        StorageBackend::Rocksdb => {
            std::fs::create_dir_all(&cfg.data_dir)
                .with_context(|| format!("creating {}", cfg.data_dir.display()))?;
            let path = cfg.data_dir.to_string_lossy();
            Arc::new(make_rocksdb_store(&path).context("opening rocksdb store")?)
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage, nothing survives a restart");
            Arc::new(make_memory_store())
        }
    };

    let broker = Broker::new(storage, cfg.broker_config());
    broker.spawn_retry_scheduler();

    let listener = TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;

    http::serve(listener, broker.clone(), async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {err}");
        }
        tracing::info!("shutdown requested");
    })
    .await
    .context("http server")?;

    broker.shutdown().await;
    tracing::info!("bye");

    Ok(())
}
