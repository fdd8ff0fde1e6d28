//! Server entry point.

use std::sync::Arc;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use relay::InMemoryBroker;
use server::config::{Config, LogFormat};
use server::error::ServerError;
use server::{AppState, ChatRuntime};
use store::{
    InMemoryMessageStore, InMemoryRelationalStore, OutboxReader, PostgresRelationalStore,
    RelationalStore,
};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    // 1. Configuration and tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Prometheus metrics recorder
    let metrics_handle = PrometheusBuilder::new().install_recorder()?;

    // 3. Stores, broker and sagas
    let broker = Arc::new(InMemoryBroker::new());
    match config.database_url.as_deref() {
        Some(url) => {
            let store =
                PostgresRelationalStore::connect(url, config.database_max_connections).await?;
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL stores");
            let messages = Arc::new(store.message_store());
            let runtime = ChatRuntime::new(&config, messages, Arc::new(store), broker)?;
            serve(&config, metrics_handle, runtime).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            let runtime = ChatRuntime::new(
                &config,
                Arc::new(InMemoryMessageStore::new()),
                Arc::new(InMemoryRelationalStore::new()),
                broker,
            )?;
            serve(&config, metrics_handle, runtime).await
        }
    }
}

/// Runs the relays and the HTTP server until a shutdown signal arrives.
async fn serve<S>(
    config: &Config,
    metrics_handle: PrometheusHandle,
    runtime: ChatRuntime<S>,
) -> Result<(), ServerError>
where
    S: RelationalStore + OutboxReader + 'static,
{
    // 4. Relay tasks
    let (stop_tx, stop_rx) = watch::channel(false);
    let relays = runtime.spawn_relays(&stop_rx);

    // 5. HTTP server
    let state = Arc::new(AppState {
        outbox: runtime.outbox(),
    });
    let app = server::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. Drain relays
    let _ = stop_tx.send(true);
    for relay in relays {
        if let Err(e) = relay.await {
            tracing::error!(error = %e, "relay task ended abnormally");
        }
    }

    tracing::info!("server shut down gracefully");
    Ok(())
}
