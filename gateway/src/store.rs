//! The state store (C3): the in-memory registry of backends and operators,
//! the `ping-origin` map, and the single reader/writer lock that guards the
//! three of them together. Per-backend and per-operator fields get their own
//! finer-grained lock so a reader of one backend never blocks a writer of
//! another, or of the store's top-level maps.
//!
//! Cross-references (`Operator::bound_backend`, `Backend::players`) are
//! names, not `Arc` pointers — this is the "lookup by stable name" resolution
//! of the weak-reference design note: it sidesteps the `Operator <-> Backend`
//! cycle entirely and makes `Reload` able to re-home every reference just by
//! reinserting backends under the same names.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock as SyncRwLock;
use serde::Serialize;
use tokio::sync::{RwLock, broadcast, oneshot};

use crate::supervisor::Supervisor;

/// Per-subscriber queue depth for both the global and per-operator event
/// buses. A receiver that falls this far behind starts missing the oldest
/// still-buffered updates instead of stalling the publisher.
pub const EVENT_BUS_CAPACITY: usize = 64;

/// Operators and idle backends are reaped after this much inactivity.
pub const EXPIRY_TIMEOUT: Duration = Duration::from_secs(600);

pub struct Backend {
    pub name: String,
    pub kind: String,
    pub version: String,
    pub working_dir: PathBuf,
    pub executable: String,
    pub args: Vec<String>,
    pub private_port: u16,
    pub runtime: SyncRwLock<BackendRuntime>,
}

#[derive(Default)]
pub struct BackendRuntime {
    /// Non-null iff the backend has been started at least once since the
    /// last reload.
    pub process: Option<Arc<Supervisor>>,
    pub last_disconnect: Option<Instant>,
    pub players: HashSet<String>,
}

impl Backend {
    pub fn is_running(&self) -> bool {
        self.runtime
            .read()
            .process
            .as_ref()
            .is_some_and(|p| p.is_running())
    }

    pub fn players_snapshot(&self) -> Vec<String> {
        let mut v: Vec<_> = self.runtime.read().players.iter().cloned().collect();
        v.sort();
        v
    }

    pub fn player_connected(&self, username: &str) {
        self.runtime.write().players.insert(username.to_owned());
    }

    pub fn player_disconnected(&self, username: &str) {
        let mut rt = self.runtime.write();
        rt.players.remove(username);
        rt.last_disconnect = Some(Instant::now());
    }

    pub fn public_view(&self) -> BackendPublicView {
        BackendPublicView {
            name: self.name.clone(),
            kind: self.kind.clone(),
            version: self.version.clone(),
            running: self.is_running(),
            players: self.runtime.read().players.len(),
        }
    }

    pub fn private_view(&self) -> BackendPrivateView {
        BackendPrivateView {
            name: self.name.clone(),
            kind: self.kind.clone(),
            version: self.version.clone(),
            running: self.is_running(),
            players: self.players_snapshot(),
        }
    }
}

#[derive(Serialize, Clone)]
pub struct BackendPublicView {
    pub name: String,
    pub kind: String,
    pub version: String,
    pub running: bool,
    pub players: usize,
}

#[derive(Serialize, Clone)]
pub struct BackendPrivateView {
    pub name: String,
    pub kind: String,
    pub version: String,
    pub running: bool,
    pub players: Vec<String>,
}

/// A player's game-connection pointer, held on the operator while a splice
/// is live so a later `ConnectToServer` to a different backend can tear it
/// down.
pub struct LiveConnection {
    pub backend_name: String,
    pub close: oneshot::Sender<()>,
}

pub struct Operator {
    pub username: String,
    pub state: SyncRwLock<OperatorState>,
    /// Per-operator WS view (`GET /ws/user`), created on first successful
    /// auth and torn down when the operator expires.
    pub events: broadcast::Sender<Bytes>,
}

pub struct OperatorState {
    pub source_ip: IpAddr,
    pub last_auth_check: Instant,
    pub live_connection: Option<LiveConnection>,
    pub bound_backend: Option<String>,
}

impl Operator {
    pub fn private_view(&self, store: &StoreSnapshot) -> OperatorView {
        let state = self.state.read();
        let server = state
            .bound_backend
            .as_ref()
            .and_then(|name| store.backends.get(name))
            .map(|b| b.private_view());
        OperatorView {
            username: self.username.clone(),
            source_ip: state.source_ip.to_string(),
            connected: state.live_connection.is_some(),
            server,
        }
    }
}

#[derive(Serialize, Clone)]
pub struct OperatorView {
    pub username: String,
    pub source_ip: String,
    pub connected: bool,
    pub server: Option<BackendPrivateView>,
}

#[derive(Serialize)]
pub struct GlobalView {
    pub servers: HashMap<String, BackendPublicView>,
}

#[derive(Default)]
struct StoreInner {
    backends: HashMap<String, Arc<Backend>>,
    operators: HashMap<String, Arc<Operator>>,
    ping_origin: HashMap<IpAddr, String>,
}

/// A read-locked, cloned-out view of the store used while building JSON
/// snapshots, so serialization never happens while the lock is held longer
/// than the copy itself takes.
pub struct StoreSnapshot {
    pub backends: HashMap<String, Arc<Backend>>,
}

pub struct StateStore {
    inner: RwLock<StoreInner>,
    pub global_events: broadcast::Sender<Bytes>,
}

impl Default for StateStore {
    fn default() -> Self {
        let (global_events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: RwLock::new(StoreInner::default()),
            global_events,
        }
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn backend(&self, name: &str) -> Option<Arc<Backend>> {
        self.inner.read().await.backends.get(name).cloned()
    }

    pub async fn backend_names(&self) -> Vec<String> {
        self.inner.read().await.backends.keys().cloned().collect()
    }

    pub async fn operator(&self, username: &str) -> Option<Arc<Operator>> {
        self.inner.read().await.operators.get(username).cloned()
    }

    /// Returns the operator for `username`, creating one bound to `ip` if
    /// this is its first successful auth.
    pub async fn operator_or_create(&self, username: &str, ip: IpAddr) -> Arc<Operator> {
        let mut inner = self.inner.write().await;
        inner
            .operators
            .entry(username.to_owned())
            .or_insert_with(|| {
                let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
                Arc::new(Operator {
                    username: username.to_owned(),
                    state: SyncRwLock::new(OperatorState {
                        source_ip: ip,
                        last_auth_check: Instant::now(),
                        live_connection: None,
                        bound_backend: None,
                    }),
                    events,
                })
            })
            .clone()
    }

    pub async fn set_ping_origin(&self, ip: IpAddr, backend_name: &str) {
        self.inner
            .write()
            .await
            .ping_origin
            .insert(ip, backend_name.to_owned());
    }

    /// The ping target for a status request seen from `ip`: the backend most
    /// recently selected by any operator connecting from that address.
    pub async fn ping_target(&self, ip: IpAddr) -> Option<Arc<Backend>> {
        let inner = self.inner.read().await;
        let name = inner.ping_origin.get(&ip)?;
        inner.backends.get(name).cloned()
    }

    /// Replaces the backend registry wholesale (used by the loader on
    /// startup and reload), re-homing every `bound_backend`/`ping-origin`
    /// reference to point at the freshly loaded `Backend` with the same
    /// name, and dropping references whose backend no longer exists.
    pub async fn replace_backends(&self, new_backends: HashMap<String, Arc<Backend>>) {
        let mut inner = self.inner.write().await;
        inner.backends = new_backends;

        for op in inner.operators.values() {
            let mut state = op.state.write();
            if let Some(name) = state.bound_backend.clone() {
                if !inner.backends.contains_key(&name) {
                    state.bound_backend = None;
                }
            }
        }

        inner
            .ping_origin
            .retain(|_, name| inner.backends.contains_key(name));
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let inner = self.inner.read().await;
        StoreSnapshot {
            backends: inner.backends.clone(),
        }
    }

    pub async fn global_view(&self) -> GlobalView {
        let inner = self.inner.read().await;
        GlobalView {
            servers: inner
                .backends
                .iter()
                .map(|(name, b)| (name.clone(), b.public_view()))
                .collect(),
        }
    }

    /// Removes operators whose last auth check is older than
    /// [`EXPIRY_TIMEOUT`], returning the expired ones so the caller can close
    /// any connection they still hold.
    pub async fn expire_stale_operators(&self) -> Vec<Arc<Operator>> {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let stale: Vec<String> = inner
            .operators
            .iter()
            .filter(|(_, op)| now.duration_since(op.state.read().last_auth_check) >= EXPIRY_TIMEOUT)
            .map(|(name, _)| name.clone())
            .collect();

        let mut expired = Vec::with_capacity(stale.len());
        for name in stale {
            if let Some(op) = inner.operators.remove(&name) {
                expired.push(op);
            }
        }
        expired
    }
}

/// Serializes and publishes the current global snapshot. Called exactly once
/// at the end of every state-mutating operation (Start, Stop,
/// playerConnected, playerDisconnected, ConnectToServer, Reload) per spec
/// section 8 — the bus itself applies no batching or debouncing.
pub async fn signal_state_update(store: &StateStore) {
    let view = store.global_view().await;
    if let Ok(bytes) = serde_json::to_vec(&view) {
        let _ = store.global_events.send(Bytes::from(bytes));
    }
}

/// Publishes the per-operator view to that operator's own WS subscribers.
pub async fn signal_operator_update(store: &StateStore, operator: &Operator) {
    let snapshot = store.snapshot().await;
    let view = operator.private_view(&snapshot);
    if let Ok(bytes) = serde_json::to_vec(&view) {
        let _ = operator.events.send(Bytes::from(bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_backend(name: &str) -> Arc<Backend> {
        Arc::new(Backend {
            name: name.to_owned(),
            kind: "vanilla".to_owned(),
            version: "1.20.1".to_owned(),
            working_dir: std::env::temp_dir(),
            executable: "cat".to_owned(),
            args: vec![],
            private_port: 30000,
            runtime: SyncRwLock::new(BackendRuntime::default()),
        })
    }

    #[tokio::test]
    async fn operator_or_create_returns_the_same_operator_on_repeat_calls() {
        let store = StateStore::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let first = store.operator_or_create("alice", ip).await;
        let second = store.operator_or_create("alice", ip).await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn replace_backends_clears_bindings_to_backends_that_disappeared() {
        let store = StateStore::new();
        let mut backends = HashMap::new();
        backends.insert("alpha".to_owned(), fixture_backend("alpha"));
        store.replace_backends(backends).await;

        let operator = store
            .operator_or_create("alice", "127.0.0.1".parse().unwrap())
            .await;
        operator.state.write().bound_backend = Some("alpha".to_owned());
        store.set_ping_origin("127.0.0.1".parse().unwrap(), "alpha").await;

        store.replace_backends(HashMap::new()).await;

        assert!(operator.state.read().bound_backend.is_none());
        assert!(
            store
                .ping_target("127.0.0.1".parse().unwrap())
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn expire_stale_operators_removes_only_past_the_timeout() {
        let store = StateStore::new();
        let fresh = store
            .operator_or_create("fresh", "127.0.0.1".parse().unwrap())
            .await;
        let stale = store
            .operator_or_create("stale", "127.0.0.2".parse().unwrap())
            .await;
        stale.state.write().last_auth_check = Instant::now() - EXPIRY_TIMEOUT - Duration::from_secs(1);

        let expired = store.expire_stale_operators().await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].username, "stale");
        assert!(store.operator("fresh").await.is_some());
        assert!(store.operator("stale").await.is_none());
        let _ = fresh;
    }

    #[tokio::test]
    async fn ping_target_follows_the_most_recently_set_origin() {
        let store = StateStore::new();
        let mut backends = HashMap::new();
        backends.insert("alpha".to_owned(), fixture_backend("alpha"));
        backends.insert("beta".to_owned(), fixture_backend("beta"));
        store.replace_backends(backends).await;

        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        store.set_ping_origin(ip, "alpha").await;
        assert_eq!(store.ping_target(ip).await.unwrap().name, "alpha");

        store.set_ping_origin(ip, "beta").await;
        assert_eq!(store.ping_target(ip).await.unwrap().name, "beta");
    }
}
