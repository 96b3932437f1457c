//! Lifecycle operations (C5): `Start`, `Stop`, `StopAll`, `Reload`, and the
//! background sweeper that unifies the inactivity shutdown and operator
//! expiry into the single periodic task the original runs as one timer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;

use crate::error::GatewayError;
use crate::loader::{self, PortAllocator};
use crate::store::{StateStore, signal_state_update};
use crate::supervisor::Supervisor;

/// Idle backends (no players, no operator bound) are stopped after this long
/// without activity — the other half of the unified 600s sweep.
pub const IDLE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(600);

/// Starts the named backend if it is not already running.
pub async fn start_backend(store: &StateStore, name: &str) -> Result<(), GatewayError> {
    let backend = store
        .backend(name)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("unknown backend {name}")))?;

    if backend.is_running() {
        return Ok(());
    }

    let supervisor = Supervisor::spawn(
        &backend.name,
        &backend.working_dir,
        &backend.executable,
        &backend.args,
    )
    .map_err(GatewayError::Process)?;

    {
        let mut runtime = backend.runtime.write();
        runtime.process = Some(supervisor);
        runtime.last_disconnect = None;
    }

    tracing::info!(backend = name, "backend started");
    signal_state_update(store).await;
    Ok(())
}

/// Gracefully stops the named backend, running the in-game countdown only if
/// players are currently connected.
pub async fn stop_backend(store: &StateStore, name: &str) -> Result<(), GatewayError> {
    let backend = store
        .backend(name)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("unknown backend {name}")))?;

    let supervisor = backend.runtime.read().process.clone();
    let Some(supervisor) = supervisor else {
        return Ok(());
    };
    if !supervisor.is_running() {
        return Ok(());
    }

    let has_players = !backend.players_snapshot().is_empty();
    supervisor
        .stop_gracefully(has_players)
        .await
        .map_err(|e| GatewayError::Conflict(e.to_string()))?;

    backend.runtime.write().players.clear();
    tracing::info!(backend = name, "backend stopped");
    signal_state_update(store).await;
    Ok(())
}

/// Force-terminates the named backend without the shutdown countdown.
pub async fn kill_backend(store: &StateStore, name: &str) -> Result<(), GatewayError> {
    let backend = store
        .backend(name)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("unknown backend {name}")))?;

    let supervisor = backend.runtime.read().process.clone();
    if let Some(supervisor) = supervisor {
        supervisor
            .kill()
            .await
            .map_err(|e| GatewayError::Conflict(e.to_string()))?;
    }

    backend.runtime.write().players.clear();
    tracing::info!(backend = name, "backend killed");
    signal_state_update(store).await;
    Ok(())
}

/// Stops every running backend concurrently, collecting any failures rather
/// than aborting at the first one.
pub async fn stop_all(store: &StateStore) -> Result<(), GatewayError> {
    let names = store.backend_names().await;
    let results = join_all(names.iter().map(|name| stop_backend(store, name))).await;

    let failures: Vec<String> = results
        .into_iter()
        .zip(names)
        .filter_map(|(r, name)| r.err().map(|e| format!("{name}: {e}")))
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::Conflict(failures.join("; ")))
    }
}

/// Reloads the backend registry from disk. Running backends are stopped
/// concurrently first (spec section 9's Open Question: favoring a fast
/// reload over in-place process handoff, since the descriptor format gives
/// no way to tell whether a running process matches a changed descriptor),
/// then the install directory is rescanned and the store is re-homed onto
/// the freshly loaded set.
pub async fn reload(
    store: &StateStore,
    install_dir: &PathBuf,
    public_port: u16,
    ports: &PortAllocator,
) -> Result<(), GatewayError> {
    stop_all(store).await?;

    let (backends, errors) = loader::load_backends_lenient(install_dir, public_port, ports);
    if !errors.0.is_empty() {
        tracing::warn!(%errors, "some backends failed to load during reload");
    }

    store.replace_backends(backends).await;
    tracing::info!("backend registry reloaded");
    signal_state_update(store).await;
    Ok(())
}

/// Runs forever, waking every `period` to expire stale operators and stop
/// backends that have sat idle (no players, nobody bound) past
/// [`IDLE_SHUTDOWN_TIMEOUT`]. Mirrors the original's single ten-minute timer
/// task rather than running two independent intervals.
pub async fn run_sweeper(store: Arc<StateStore>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        sweep_once(&store).await;
    }
}

async fn sweep_once(store: &StateStore) {
    let expired = store.expire_stale_operators().await;
    for op in &expired {
        tracing::info!(username = %op.username, "operator session expired");
    }

    let names = store.backend_names().await;
    for name in names {
        let Some(backend) = store.backend(&name).await else {
            continue;
        };
        if !backend.is_running() {
            continue;
        }
        if !backend.players_snapshot().is_empty() {
            continue;
        }
        let idle_since = backend.runtime.read().last_disconnect;
        let Some(idle_since) = idle_since else {
            continue;
        };
        if Instant::now().duration_since(idle_since) >= IDLE_SHUTDOWN_TIMEOUT {
            tracing::info!(backend = %name, "stopping idle backend");
            if let Err(e) = stop_backend(store, &name).await {
                tracing::warn!(backend = %name, error = %e, "idle stop failed");
            }
        }
    }
}

/// Records a player joining `backend_name`, clearing any idle timer.
pub async fn player_connected(store: &StateStore, backend_name: &str, username: &str) {
    if let Some(backend) = store.backend(backend_name).await {
        backend.player_connected(username);
        signal_state_update(store).await;
    }
}

/// Records a player leaving, starting the idle timer if they were last.
pub async fn player_disconnected(store: &StateStore, backend_name: &str, username: &str) {
    if let Some(backend) = store.backend(backend_name).await {
        backend.player_disconnected(username);
        signal_state_update(store).await;
    }
}
