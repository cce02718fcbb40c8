//! API server entry point.

use std::time::Duration;

use engine::{InMemoryGateway, InMemoryMailer, Sweeper};
use store::{MemoryStore, PostgresStore, Store};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
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

async fn serve<S>(store: S, config: api::Config)
where
    S: Store + Clone + 'static,
{
    // The in-memory gateway and mailer stand in for the hosted
    // provider and the mail service; production adapters implement
    // the same traits.
    let gateway = InMemoryGateway::new(&config.webhook_secret);
    let mailer = InMemoryMailer::new();

    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // Expired cart holds are reclaimed only by this task.
    let sweeper = Sweeper::spawn(
        store.clone(),
        Duration::from_secs(config.sweep_interval_secs),
    );

    let addr = config.addr();
    let state = api::create_state(store, gateway, mailer, config);
    let app = api::create_app(state, metrics_handle);

    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    sweeper.abort();
    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = api::Config::from_env();

    match config.database_url.clone() {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to database");
            let store = PostgresStore::new(pool);
            store.run_migrations().await.expect("migrations failed");
            serve(store, config).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            serve(MemoryStore::new(), config).await;
        }
    }
}
