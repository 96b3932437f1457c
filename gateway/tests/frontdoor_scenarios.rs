//! End-to-end scenarios from spec section 8: a real TCP client talks to the
//! front door, which splices to an in-process stub backend standing in for
//! the JVM.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock as SyncRwLock;
use protocol::VarInt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use gateway::session;
use gateway::store::{Backend, BackendRuntime, StateStore};

fn encode_string(out: &mut Vec<u8>, s: &str) {
    VarInt(s.len() as i32).encode(out);
    out.extend_from_slice(s.as_bytes());
}

/// Builds a length-prefixed handshake packet with the given `next_state`
/// byte (`0x01` status, `0x02` login).
fn build_handshake(server_address: &str, port: u16, next_state: u8) -> Vec<u8> {
    let mut payload = vec![0x00u8, 47, 0x00];
    encode_string(&mut payload, server_address);
    payload.extend_from_slice(&port.to_be_bytes());
    payload.push(next_state);

    let mut packet = Vec::new();
    VarInt(payload.len() as i32).encode(&mut packet);
    packet.extend_from_slice(&payload);
    packet
}

fn build_login_start(username: &str) -> Vec<u8> {
    let mut payload = vec![0x00u8];
    encode_string(&mut payload, username);

    let mut packet = Vec::new();
    VarInt(payload.len() as i32).encode(&mut packet);
    packet.extend_from_slice(&payload);
    packet
}

/// A stub backend: accepts one connection, records every byte it received,
/// then echoes everything back so the test client can observe what arrived.
async fn spawn_stub_backend() -> (u16, tokio::sync::oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 256];
        // Read whatever arrives within a short window, then report it back.
        let _ = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                }
            }
        })
        .await;
        let _ = tx.send(received);
    });

    (port, rx)
}

fn fixture_backend(name: &str, private_port: u16) -> Arc<Backend> {
    Arc::new(Backend {
        name: name.to_owned(),
        kind: "vanilla".to_owned(),
        version: "1.20.1".to_owned(),
        working_dir: std::env::temp_dir(),
        executable: "true".to_owned(),
        args: vec![],
        private_port,
        runtime: SyncRwLock::new(BackendRuntime::default()),
    })
}

#[tokio::test]
async fn happy_splice_replays_exact_bytes_and_records_player() {
    let (stub_port, stub_received) = spawn_stub_backend().await;

    let store = Arc::new(StateStore::new());
    let mut backends = HashMap::new();
    backends.insert("alpha".to_owned(), fixture_backend("alpha", stub_port));
    store.replace_backends(backends).await;

    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let operator = store.operator_or_create("alice", loopback).await;
    // Mark the backend as running so authorization passes — happy_splice
    // assumes a started backend per spec scenario 1.
    store
        .backend("alpha")
        .await
        .unwrap()
        .runtime
        .write()
        .process = Some(make_always_running_supervisor());
    session::connect_to_server(&store, &operator, "alpha")
        .await
        .unwrap();

    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();
    let front_store = store.clone();
    tokio::spawn(async move {
        let (socket, peer) = front_listener.accept().await.unwrap();
        let _ = gateway::frontdoor::handle_connection(front_store, socket, peer).await;
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    let handshake = build_handshake("play.example.com", front_addr.port(), 0x02);
    let login = build_login_start("alice");

    client.write_all(&handshake).await.unwrap();
    client.write_all(&login).await.unwrap();

    let mut expected = handshake.clone();
    expected.extend_from_slice(&login);

    let received = stub_received.await.unwrap();
    assert_eq!(received, expected);

    let backend = store.backend("alpha").await.unwrap();
    assert!(backend.players_snapshot().contains(&"alice".to_string()));
}

#[tokio::test]
async fn wrong_ip_is_dropped_before_ever_dialing_the_backend() {
    let (stub_port, stub_received) = spawn_stub_backend().await;

    let store = Arc::new(StateStore::new());
    let mut backends = HashMap::new();
    backends.insert("alpha".to_owned(), fixture_backend("alpha", stub_port));
    store.replace_backends(backends).await;

    // Operator was authorized from a different address than the one the
    // game client will connect from, so the login must be rejected even
    // though the username and binding are both otherwise valid.
    let operator = store
        .operator_or_create("alice", "10.0.0.1".parse().unwrap())
        .await;
    store
        .backend("alpha")
        .await
        .unwrap()
        .runtime
        .write()
        .process = Some(make_always_running_supervisor());
    session::connect_to_server(&store, &operator, "alpha")
        .await
        .unwrap();

    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();
    let front_store = store.clone();
    tokio::spawn(async move {
        let (socket, peer) = front_listener.accept().await.unwrap();
        let _ = gateway::frontdoor::handle_connection(front_store, socket, peer).await;
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    let handshake = build_handshake("play.example.com", front_addr.port(), 0x02);
    let login = build_login_start("alice");
    client.write_all(&handshake).await.unwrap();
    client.write_all(&login).await.unwrap();

    // The gateway should close the socket without forwarding anything.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);

    // The stub backend's listener never accepts a connection in this
    // scenario, so its oneshot is never sent; a bounded wait confirms that
    // rather than hanging the test forever.
    let outcome = tokio::time::timeout(Duration::from_millis(200), stub_received).await;
    assert!(outcome.is_err(), "backend should never have been dialed");

    let backend = store.backend("alpha").await.unwrap();
    assert!(backend.players_snapshot().is_empty());
}

#[tokio::test]
async fn modern_status_ping_is_forwarded_to_the_peers_ping_origin() {
    let (stub_port, stub_received) = spawn_stub_backend().await;

    let store = Arc::new(StateStore::new());
    let mut backends = HashMap::new();
    backends.insert("alpha".to_owned(), fixture_backend("alpha", stub_port));
    store.replace_backends(backends).await;

    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    store.set_ping_origin(loopback, "alpha").await;

    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();
    let front_store = store.clone();
    tokio::spawn(async move {
        let (socket, peer) = front_listener.accept().await.unwrap();
        let _ = gateway::frontdoor::handle_connection(front_store, socket, peer).await;
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    let handshake = build_handshake("play.example.com", front_addr.port(), 0x01);
    client.write_all(&handshake).await.unwrap();

    let received = stub_received.await.unwrap();
    assert_eq!(received, handshake);
}

#[tokio::test]
async fn legacy_ping_is_forwarded_to_the_peers_ping_origin() {
    let (stub_port, stub_received) = spawn_stub_backend().await;

    let store = Arc::new(StateStore::new());
    let mut backends = HashMap::new();
    backends.insert("alpha".to_owned(), fixture_backend("alpha", stub_port));
    store.replace_backends(backends).await;

    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    store.set_ping_origin(loopback, "alpha").await;

    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();
    let front_store = store.clone();
    tokio::spawn(async move {
        let (socket, peer) = front_listener.accept().await.unwrap();
        let _ = gateway::frontdoor::handle_connection(front_store, socket, peer).await;
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client.write_all(&[0xFE, 0x01]).await.unwrap();

    let received = stub_received.await.unwrap();
    assert_eq!(received, vec![0xFE, 0x01]);
}

#[tokio::test]
async fn legacy_ping_with_unrecognized_second_byte_is_dropped() {
    let (stub_port, stub_received) = spawn_stub_backend().await;

    let store = Arc::new(StateStore::new());
    let mut backends = HashMap::new();
    backends.insert("alpha".to_owned(), fixture_backend("alpha", stub_port));
    store.replace_backends(backends).await;

    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    store.set_ping_origin(loopback, "alpha").await;

    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();
    let front_store = store.clone();
    tokio::spawn(async move {
        let (socket, peer) = front_listener.accept().await.unwrap();
        let _ = gateway::frontdoor::handle_connection(front_store, socket, peer).await;
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    client.write_all(&[0xFE, 0x99]).await.unwrap();

    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);

    let outcome = tokio::time::timeout(Duration::from_millis(200), stub_received).await;
    assert!(outcome.is_err(), "backend should never have been dialed");
}

#[tokio::test]
async fn second_login_while_already_spliced_is_rejected() {
    let (stub_port, _stub_received) = spawn_stub_backend().await;

    let store = Arc::new(StateStore::new());
    let mut backends = HashMap::new();
    backends.insert("alpha".to_owned(), fixture_backend("alpha", stub_port));
    store.replace_backends(backends).await;

    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let operator = store.operator_or_create("alice", loopback).await;
    store
        .backend("alpha")
        .await
        .unwrap()
        .runtime
        .write()
        .process = Some(make_always_running_supervisor());
    session::connect_to_server(&store, &operator, "alpha")
        .await
        .unwrap();

    // Simulate a connection already spliced for this operator, the way a
    // real first login would leave things while the game session is live.
    let (close_tx, _close_rx) = tokio::sync::oneshot::channel();
    operator.state.write().live_connection = Some(gateway::store::LiveConnection {
        backend_name: "alpha".to_owned(),
        close: close_tx,
    });

    let front_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let front_addr = front_listener.local_addr().unwrap();
    let front_store = store.clone();
    tokio::spawn(async move {
        let (socket, peer) = front_listener.accept().await.unwrap();
        let _ = gateway::frontdoor::handle_connection(front_store, socket, peer).await;
    });

    let mut client = TcpStream::connect(front_addr).await.unwrap();
    let handshake = build_handshake("play.example.com", front_addr.port(), 0x02);
    let login = build_login_start("alice");
    client.write_all(&handshake).await.unwrap();
    client.write_all(&login).await.unwrap();

    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);

    // The prior live connection is untouched by the rejected second login.
    assert!(operator.state.read().live_connection.is_some());
}

fn make_always_running_supervisor() -> Arc<gateway::supervisor::Supervisor> {
    gateway::supervisor::Supervisor::spawn("alpha", &std::env::temp_dir(), "cat", &[])
        .expect("spawn stand-in process")
}
