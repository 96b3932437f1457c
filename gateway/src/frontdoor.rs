//! The front door (C4): the public TCP listener Minecraft clients connect
//! to. Classifies the first bytes of a connection, answers legacy/modern
//! status pings directly, and authorizes+splices real play connections
//! through to the bound backend's private port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;

use protocol::{LEGACY_PING_FIRST_BYTE, LEGACY_PING_SECOND_BYTE, NextState, decode_handshake};

use crate::lifecycle;
use crate::store::{LiveConnection, StateStore};

/// A connection that sends nothing recognizable within this long is dropped.
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads one length-prefixed packet: a single raw length byte, then that
/// many payload bytes. The outer length is a raw byte, not a VarInt — only
/// the server-address/username strings *inside* the payload are VarInt
/// length-prefixed, which `protocol::decode_handshake`/`decode_login_start`
/// handle on their own. Returns both the exact bytes consumed (length byte +
/// payload, for verbatim replay to the backend) and the payload alone (for
/// decoding).
async fn read_length_prefixed_packet(socket: &mut TcpStream) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let mut len_byte = [0u8; 1];
    timeout(HANDSHAKE_READ_TIMEOUT, socket.read_exact(&mut len_byte)).await??;
    let len = len_byte[0] as usize;

    let mut payload = vec![0u8; len];
    timeout(HANDSHAKE_READ_TIMEOUT, socket.read_exact(&mut payload)).await??;

    let mut raw = Vec::with_capacity(1 + len);
    raw.push(len_byte[0]);
    raw.extend_from_slice(&payload);
    Ok((raw, payload))
}

/// Binds the public port and serves connections until the process exits.
/// Every accepted connection runs in its own task, so a panic handling one
/// client cannot bring down the listener or any other connection — Tokio's
/// task boundary does the isolation the spec's "panic boundary" calls for.
pub async fn run(store: Arc<StateStore>, bind_addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "front door listening");

    loop {
        let (socket, peer_addr) = listener.accept().await?;
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(store, socket, peer_addr).await {
                tracing::debug!(%peer_addr, error = %e, "front-door connection ended");
            }
        });
    }
}

/// Exposed at crate-visibility so integration tests can drive a single
/// accepted connection directly without standing up the whole listener loop.
pub async fn handle_connection(
    store: Arc<StateStore>,
    mut socket: TcpStream,
    peer_addr: SocketAddr,
) -> anyhow::Result<()> {
    let mut first_byte = [0u8; 1];
    timeout(HANDSHAKE_READ_TIMEOUT, socket.read_exact(&mut first_byte)).await??;

    if first_byte[0] == LEGACY_PING_FIRST_BYTE {
        return handle_legacy_ping(store, socket, peer_addr).await;
    }

    // Not a legacy ping: the first byte read above *is* the outer packet
    // length (a single raw byte, per the handshake wire format), not the
    // start of a multi-byte VarInt.
    let len = first_byte[0] as usize;
    let mut payload = vec![0u8; len];
    timeout(HANDSHAKE_READ_TIMEOUT, socket.read_exact(&mut payload)).await??;

    let mut raw = Vec::with_capacity(1 + len);
    raw.push(first_byte[0]);
    raw.extend_from_slice(&payload);

    let handshake = decode_handshake(&payload)?;

    match handshake.next_state {
        NextState::Status => handle_status_ping(store, socket, peer_addr, raw).await,
        NextState::Login => handle_login(store, socket, peer_addr, raw).await,
    }
}

/// The legacy (pre-1.7) ping: `0xFE` followed by a confirming `0x01`.
/// Forwarded to whichever backend is this peer's ping origin, exactly like
/// a modern status ping — old launchers still need a live player count.
async fn handle_legacy_ping(
    store: Arc<StateStore>,
    mut socket: TcpStream,
    peer_addr: SocketAddr,
) -> anyhow::Result<()> {
    let mut second_byte = [0u8; 1];
    timeout(HANDSHAKE_READ_TIMEOUT, socket.read_exact(&mut second_byte)).await??;

    if second_byte[0] != LEGACY_PING_SECOND_BYTE {
        tracing::debug!(%peer_addr, "unrecognized legacy ping, closing");
        socket.shutdown().await?;
        return Ok(());
    }

    let Some(backend) = store.ping_target(peer_addr.ip()).await else {
        tracing::debug!(%peer_addr, "legacy ping from unknown origin, closing");
        socket.shutdown().await?;
        return Ok(());
    };

    let target_addr: SocketAddr = ([127, 0, 0, 1], backend.private_port).into();
    let mut upstream = TcpStream::connect(target_addr).await?;
    upstream
        .write_all(&[LEGACY_PING_FIRST_BYTE, LEGACY_PING_SECOND_BYTE])
        .await?;
    splice(socket, upstream).await
}

/// A modern status ping: forward to whichever backend this peer's IP was
/// last routed to for a real connection (the "ping origin" of spec section
/// 4.4), so the server list shows accurate MOTD/player-count for the server
/// the player actually plays on.
async fn handle_status_ping(
    store: Arc<StateStore>,
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    replay: Vec<u8>,
) -> anyhow::Result<()> {
    let Some(backend) = store.ping_target(peer_addr.ip()).await else {
        tracing::debug!(%peer_addr, "status ping from unknown origin, closing");
        socket.shutdown().await?;
        return Ok(());
    };

    let target_addr: SocketAddr = ([127, 0, 0, 1], backend.private_port).into();
    let mut upstream = TcpStream::connect(target_addr).await?;
    upstream.write_all(&replay).await?;
    splice(socket, upstream).await
}

/// A login attempt: read the login-start packet to get the claimed
/// username, check authorization (bound operator, matching source IP, a
/// bound-and-running backend, and no connection already spliced for this
/// operator), then splice to the bound backend.
async fn handle_login(
    store: Arc<StateStore>,
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    mut replay: Vec<u8>,
) -> anyhow::Result<()> {
    let (login_raw, login_payload) = read_length_prefixed_packet(&mut socket).await?;
    let login_prefix = protocol::decode_login_start(&login_payload)?;
    replay.extend_from_slice(&login_raw);

    let username = login_prefix.username.clone();

    let operator = store.operator(&username).await;
    let Some(operator) = operator else {
        tracing::info!(%peer_addr, username, "login rejected: no bound operator session");
        socket.shutdown().await?;
        return Ok(());
    };

    let (backend_name, allowed_ip, already_connected) = {
        let state = operator.state.read();
        (
            state.bound_backend.clone(),
            state.source_ip,
            state.live_connection.is_some(),
        )
    };

    if allowed_ip != peer_addr.ip() {
        tracing::warn!(%peer_addr, username, expected = %allowed_ip, "login rejected: source ip mismatch");
        socket.shutdown().await?;
        return Ok(());
    }

    if already_connected {
        tracing::info!(%peer_addr, username, "login rejected: a connection is already spliced for this operator");
        socket.shutdown().await?;
        return Ok(());
    }

    let Some(backend_name) = backend_name else {
        tracing::info!(%peer_addr, username, "login rejected: operator not bound to a server");
        socket.shutdown().await?;
        return Ok(());
    };

    let Some(backend) = store.backend(&backend_name).await else {
        tracing::warn!(%peer_addr, username, backend_name, "bound backend no longer exists");
        socket.shutdown().await?;
        return Ok(());
    };

    if !backend.is_running() {
        tracing::info!(%peer_addr, username, backend_name, "login rejected: backend not running");
        socket.shutdown().await?;
        return Ok(());
    }

    let (close_tx, close_rx) = oneshot::channel();
    {
        let mut state = operator.state.write();
        // Re-check under the write lock: another login could have raced us
        // between the read above and here.
        if state.live_connection.is_some() {
            drop(state);
            tracing::info!(%peer_addr, username, "login rejected: a connection is already spliced for this operator");
            socket.shutdown().await?;
            return Ok(());
        }
        state.live_connection = Some(LiveConnection {
            backend_name: backend_name.clone(),
            close: close_tx,
        });
    }

    store.set_ping_origin(peer_addr.ip(), &backend_name).await;
    lifecycle::player_connected(&store, &backend_name, &username).await;

    let target_addr: SocketAddr = ([127, 0, 0, 1], backend.private_port).into();
    let upstream = match TcpStream::connect(target_addr).await {
        Ok(s) => s,
        Err(e) => {
            operator.state.write().live_connection = None;
            lifecycle::player_disconnected(&store, &backend_name, &username).await;
            return Err(e.into());
        }
    };

    let mut upstream = upstream;
    upstream.write_all(&replay).await?;
    let result = splice_cancelable(socket, upstream, Some(close_rx)).await;

    operator.state.write().live_connection = None;
    lifecycle::player_disconnected(&store, &backend_name, &username).await;
    result
}

/// Pipes bytes bidirectionally until either side closes. Used for the
/// status-ping forward (short-lived) and, through [`splice_cancelable`], the
/// real play connection (long-lived).
async fn splice(client: TcpStream, upstream: TcpStream) -> anyhow::Result<()> {
    splice_cancelable(client, upstream, None).await
}

/// Like [`splice`], but also exits early if `close` fires — used to tear
/// down a player's live connection when `ConnectToServer` re-homes their
/// operator session onto a different backend.
async fn splice_cancelable(
    client: TcpStream,
    upstream: TcpStream,
    close: Option<oneshot::Receiver<()>>,
) -> anyhow::Result<()> {
    let (mut client_r, mut client_w) = client.into_split();
    let (mut upstream_r, mut upstream_w) = upstream.into_split();

    let client_to_upstream = tokio::io::copy(&mut client_r, &mut upstream_w);
    let upstream_to_client = tokio::io::copy(&mut upstream_r, &mut client_w);

    match close {
        Some(close_rx) => {
            tokio::select! {
                r = client_to_upstream => { r?; }
                r = upstream_to_client => { r?; }
                _ = close_rx => {}
            }
        }
        None => {
            tokio::select! {
                r = client_to_upstream => { r?; }
                r = upstream_to_client => { r?; }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splice_forwards_bytes_both_ways() {
        // An echo server stands in for the backend: whatever the "client"
        // sends through the splice should come straight back.
        let echo_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let echo_addr = echo_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = echo_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            if conn.read_exact(&mut buf).await.is_ok() {
                let _ = conn.write_all(&buf).await;
            }
        });

        let relay_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let relay_addr = relay_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (client_side, _) = relay_listener.accept().await.unwrap();
            let upstream = TcpStream::connect(echo_addr).await.unwrap();
            let _ = splice(client_side, upstream).await;
        });

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn splice_cancelable_exits_when_close_fires_even_with_no_traffic() {
        let a_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let a_addr = a_listener.local_addr().unwrap();
        let b_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let b_addr = b_listener.local_addr().unwrap();

        let _client_a = TcpStream::connect(a_addr).await.unwrap();
        let (side_a, _) = a_listener.accept().await.unwrap();
        let _client_b = TcpStream::connect(b_addr).await.unwrap();
        let (side_b, _) = b_listener.accept().await.unwrap();

        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(splice_cancelable(side_a, side_b, Some(rx)));
        tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("splice_cancelable should exit promptly once closed")
            .unwrap();
        assert!(result.is_ok());
    }
}
