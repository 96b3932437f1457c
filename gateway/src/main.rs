use std::net::SocketAddr;
use std::sync::Arc;

use axum_extra::extract::cookie::Key;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gateway::config::GatewayConfig;
use gateway::http::{self, AppState};
use gateway::loader::{self, PortAllocator};
use gateway::store::StateStore;
use gateway::{frontdoor, lifecycle};

/// How often the idle/expiry sweeper wakes, matching `craft.go`'s single
/// ten-minute timer task.
const SWEEP_PERIOD: std::time::Duration = std::time::Duration::from_secs(600);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=trace", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let config = match GatewayConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };
    tracing::info!(?config, "configuration loaded");

    let store = Arc::new(StateStore::new());
    let ports = Arc::new(PortAllocator::new());

    let (backends, errors) =
        loader::load_backends_lenient(&config.install_dir, config.public_port, &ports);
    if !errors.0.is_empty() {
        tracing::warn!(%errors, "some backends failed to load at startup");
    }
    tracing::info!(count = backends.len(), "backends loaded");
    store.replace_backends(backends).await;

    let sweeper_store = store.clone();
    tokio::spawn(lifecycle::run_sweeper(sweeper_store, SWEEP_PERIOD));

    let public_addr: SocketAddr = ([0, 0, 0, 0], config.public_port).into();
    let frontdoor_store = store.clone();
    tokio::spawn(async move {
        if let Err(e) = frontdoor::run(frontdoor_store, public_addr).await {
            tracing::error!(error = %e, "front door listener exited");
        }
    });

    let cookie_key = Key::derive_from(config.cookie_key.as_bytes());
    let app_state = AppState {
        store,
        config: Arc::new(config.clone()),
        ports,
        cookie_key,
        http_client: reqwest::Client::new(),
    };

    let app = http::router(app_state);

    let http_addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();
    let listener = tokio::net::TcpListener::bind(http_addr).await.unwrap();
    tracing::info!(%http_addr, "http server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap();
}
