// # EventFlow Server
//
// Main entry point. Wires configuration, logging, the warehouse and
// coordination backends, the background cache janitor, and the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use eventflow::coordination::{CoordinationStore, MemoryStore, RedisStore};
use eventflow::server::{build_router, ServerContext};
use eventflow::warehouse::{MemoryWarehouse, PgWarehouse, Warehouse};
use eventflow::{Result, ServerConfig, VERSION};

/// How often the janitor shrinks the cache back under its configured size.
const JANITOR_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let config = ServerConfig::from_env();
    info!("EventFlow server v{VERSION}");

    let warehouse: Arc<dyn Warehouse> = match &config.warehouse_url {
        Some(url) => {
            info!("connecting to warehouse");
            Arc::new(PgWarehouse::connect(url, config.pool_size, config.fetch_batch_size).await?)
        }
        None => {
            warn!("EVENTFLOW_WAREHOUSE_URL unset; using the in-memory warehouse");
            Arc::new(MemoryWarehouse::new())
        }
    };

    let coordination: Arc<dyn CoordinationStore> = match &config.coordination_url {
        Some(url) => {
            info!("connecting to coordination store");
            Arc::new(RedisStore::connect(url).await?)
        }
        None => {
            warn!("EVENTFLOW_COORDINATION_URL unset; using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let context = ServerContext::new(config.clone(), warehouse, coordination);

    // Janitor: keep the cache under its configured size budget.
    let janitor = context.cache.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match janitor.get_cache_size().await {
                Ok(budget) => {
                    if let Err(err) = janitor.shrink_below_size(budget, false).await {
                        warn!(error = %err, "cache shrink pass failed");
                    }
                }
                Err(err) => warn!(error = %err, "could not read cache size budget"),
            }
        }
    });

    let addr = format!("{}:{}", config.listen_addr, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| eventflow::FlowError::Configuration(format!("cannot bind {addr}: {e}")))?;
    info!("listening on {addr}");

    let router = build_router(context);
    axum::serve(listener, router)
        .await
        .map_err(|e| eventflow::FlowError::Configuration(e.to_string()))?;
    Ok(())
}
