//! Relais Server binary.

use std::{path::PathBuf, sync::Arc};

use relais_core::{Engine, HttpDeliveryClient, MemoryStorage, Storage};
use relais_server::{serve, AppState, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relais_server=info,relais_core=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Relais Server v{}", env!("CARGO_PKG_VERSION"));

    let config = match std::env::var("RELAIS_CONFIG") {
        Ok(path) => ServerConfig::from_file(&PathBuf::from(path))?,
        Err(_) => ServerConfig::default(),
    }
    .apply_env()?;

    let storage: Arc<dyn Storage> = match config.database_url.as_deref() {
        #[cfg(feature = "postgres")]
        Some(url) => {
            tracing::info!("using PostgreSQL storage");
            Arc::new(relais_core::store::postgres::PostgresStorage::connect(url).await?)
        },
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            anyhow::bail!("database_url set but the 'postgres' feature is disabled");
        },
        None => {
            tracing::warn!("no database_url configured, events will not survive a restart");
            Arc::new(MemoryStorage::new())
        },
    };

    let transport = Arc::new(HttpDeliveryClient::new()?);
    let engine = Engine::new(config.engine.clone(), storage, transport);
    engine.start_workers();

    let state = AppState::new(Arc::clone(&engine), config.api_key.clone());

    let shutdown_engine = Arc::clone(&engine);
    serve(config.bind_addr, state, async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, draining");
        shutdown_engine.shutdown().await;
    })
    .await
}
