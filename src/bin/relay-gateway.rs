use std::sync::Arc;

use relay_llm::catalog::Catalog;
use relay_llm::config::{Environment, ProviderEnv, RuntimeConfig};
use relay_llm::memory_store::{MemoryQueue, MemoryStore};
use relay_llm::sqlite_store::SqliteStore;
use relay_llm::store::{Datastore, LogQueue};
use relay_llm::worker::LogWorker;
use relay_llm::GatewayState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let mut args = std::env::args().skip(1);
    let mut listen = "127.0.0.1:8080".to_string();
    let mut sqlite_path: Option<String> = None;
    let mut environment: Option<Environment> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--sqlite" => {
                sqlite_path = Some(args.next().ok_or("missing value for --sqlite")?);
            }
            "--env" => {
                let value = args.next().ok_or("missing value for --env")?;
                environment = Some(Environment::from_env_var(Some(&value)));
            }
            other => {
                return Err(format!(
                    "unknown arg: {other}\nusage: relay-gateway [--listen HOST:PORT] [--sqlite PATH] [--env production|development]"
                )
                .into())
            }
        }
    }

    let environment = environment.unwrap_or_else(|| {
        Environment::from_env_var(std::env::var("RELAY_ENV").ok().as_deref())
    });
    let config = RuntimeConfig::new(environment);

    let (store, queue): (Arc<dyn Datastore>, Arc<dyn LogQueue>) = match sqlite_path {
        Some(path) => {
            let sqlite = SqliteStore::new(path);
            sqlite.init().await?;
            (Arc::new(sqlite.clone()), Arc::new(sqlite))
        }
        None => {
            tracing::warn!("no --sqlite path given; state is in-memory and lost on exit");
            (Arc::new(MemoryStore::new()), Arc::new(MemoryQueue::new()))
        }
    };

    let worker = LogWorker::new(store.clone(), queue.clone(), config.clone()).spawn();

    let state = GatewayState::new(
        Catalog::builtin(),
        store,
        queue,
        ProviderEnv::from_process_env(),
        config,
    );
    let app = relay_llm::http_router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "relay-gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    worker.stop().await;
    Ok(())
}
