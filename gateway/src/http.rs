//! The HTTP/WebSocket surface (axum): operator login, backend control
//! actions, the three WebSocket views, and the ambient static/proxy
//! endpoints spec section 6 lists as external collaborators.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, Key, PrivateCookieJar};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tower_http::services::{ServeDir, ServeFile};

use crate::config::GatewayConfig;
use crate::lifecycle;
use crate::loader::PortAllocator;
use crate::session::{self, LoginRequest, SessionClaims};
use crate::store::{Operator, StateStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub config: Arc<GatewayConfig>,
    pub ports: Arc<PortAllocator>,
    pub cookie_key: Key,
    pub http_client: reqwest::Client,
}

impl axum::extract::FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.cookie_key.clone()
    }
}

pub fn router(state: AppState) -> Router {
    let static_service = ServeDir::new(&state.config.static_dir)
        .not_found_service(ServeFile::new(state.config.static_dir.join("index.html")));

    Router::new()
        .route("/", get(index_handler))
        .route("/login", post(login_handler))
        .route("/logout", get(logout_handler))
        .route("/servers", get(list_servers_handler))
        .route("/{server}/status", get(server_status_handler))
        .route("/{server}/logs", get(server_logs_handler))
        .route("/reload", post(reload_handler))
        .route("/{server}/start", post(start_handler))
        .route("/{server}/stop", post(stop_handler))
        .route("/{server}/kill", post(kill_handler))
        .route("/{server}/connect", post(connect_handler))
        .route("/{server}/message", post(message_handler))
        .route("/{server}/send", post(send_handler))
        .route("/{server}/broadcast", post(broadcast_handler))
        .route("/ws/servers", get(ws_servers_handler))
        .route("/ws/user", get(ws_user_handler))
        .route("/ws/{server}/console", get(ws_console_handler))
        .route("/profile/{username}", get(profile_handler))
        .route("/map/{server}/{*path}", get(map_handler))
        .fallback_service(static_service)
        .with_state(state)
}

async fn authorize(
    state: &AppState,
    jar: &PrivateCookieJar,
    addr: SocketAddr,
) -> Result<Arc<Operator>, Response> {
    let claims = jar
        .get(&state.config.cookie_name)
        .and_then(|c| serde_json::from_str::<SessionClaims>(c.value()).ok());

    let Some(claims) = claims else {
        return Err(StatusCode::UNAUTHORIZED.into_response());
    };

    session::trust_request(&state.store, &state.config.passcode, &claims, addr.ip())
        .await
        .map_err(IntoResponse::into_response)
}

async fn index_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if authorize(&state, &jar, addr).await.is_err() {
        return Redirect::to("/login").into_response();
    }
    if let Some(dev_url) = &state.config.dev_forward_url {
        match state.http_client.get(dev_url).send().await {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                (status, body).into_response()
            }
            Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
        }
    } else {
        match tokio::fs::read(state.config.static_dir.join("index.html")).await {
            Ok(bytes) => bytes.into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }
}

async fn login_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<LoginRequest>,
) -> Response {
    if body.passcode != state.config.passcode {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let claims = SessionClaims {
        username: body.username.clone(),
        passcode: body.passcode,
    };

    match session::trust_request(&state.store, &state.config.passcode, &claims, addr.ip()).await {
        Ok(_) => {
            let cookie = match session::issue_cookie(&state.config.cookie_name, &claims) {
                Ok(c) => c,
                Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
            };
            (jar.add(cookie), StatusCode::OK).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn logout_handler(jar: PrivateCookieJar, State(state): State<AppState>) -> impl IntoResponse {
    (jar.remove(Cookie::from(state.config.cookie_name.clone())), StatusCode::OK)
}

async fn list_servers_handler(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.store.backend_names().await)
}

async fn server_status_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(server): Path<String>,
) -> Response {
    if let Err(resp) = authorize(&state, &jar, addr).await {
        return resp;
    }
    match state.store.backend(&server).await {
        Some(backend) => Json(backend.public_view()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    n: Option<usize>,
}

async fn server_logs_handler(
    State(state): State<AppState>,
    Path(server): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let Some(backend) = state.store.backend(&server).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(process) = backend.runtime.read().process.clone() else {
        return Json(Vec::<crate::supervisor::LogLine>::new()).into_response();
    };
    let n = query.n.unwrap_or(crate::supervisor::CONSOLE_REPLAY_LINES);
    Json(process.log.last_n(n)).into_response()
}

async fn reload_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if let Err(resp) = authorize(&state, &jar, addr).await {
        return resp;
    }
    match lifecycle::reload(
        &state.store,
        &state.config.install_dir,
        state.config.public_port,
        &state.ports,
    )
    .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn kill_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(server): Path<String>,
) -> Response {
    if let Err(resp) = authorize(&state, &jar, addr).await {
        return resp;
    }
    match lifecycle::kill_backend(&state.store, &server).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn start_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(server): Path<String>,
) -> Response {
    if let Err(resp) = authorize(&state, &jar, addr).await {
        return resp;
    }
    match lifecycle::start_backend(&state.store, &server).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn stop_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(server): Path<String>,
) -> Response {
    if let Err(resp) = authorize(&state, &jar, addr).await {
        return resp;
    }
    match lifecycle::stop_backend(&state.store, &server).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn connect_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(server): Path<String>,
) -> Response {
    let operator = match authorize(&state, &jar, addr).await {
        Ok(op) => op,
        Err(resp) => return resp,
    };
    match session::connect_to_server(&state.store, &operator, &server).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn message_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(server): Path<String>,
    body: String,
) -> Response {
    let operator = match authorize(&state, &jar, addr).await {
        Ok(op) => op,
        Err(resp) => return resp,
    };
    let Some(backend) = state.store.backend(&server).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(process) = backend.runtime.read().process.clone() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let line = format!(
        "/tellraw @p {{\"text\": \"<{} (Web)> {}\"}}",
        operator.username, body
    );
    match process.send_line(&line).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn send_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(server): Path<String>,
    body: String,
) -> Response {
    if let Err(resp) = authorize(&state, &jar, addr).await {
        return resp;
    }
    let Some(backend) = state.store.backend(&server).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(process) = backend.runtime.read().process.clone() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match process.send_line(&body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn broadcast_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(server): Path<String>,
    body: String,
) -> Response {
    let operator = match authorize(&state, &jar, addr).await {
        Ok(op) => op,
        Err(resp) => return resp,
    };
    let Some(backend) = state.store.backend(&server).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(process) = backend.runtime.read().process.clone() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let line = format!(
        "/title @a title {{\"text\": \"<{} (Web)> {}\"}}",
        operator.username, body
    );
    match process.send_line(&line).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn ws_servers_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| servers_socket(socket, state))
}

async fn servers_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.store.global_events.subscribe();

    if let Ok(view) = serde_json::to_vec(&state.store.global_view().await) {
        if sender.send(Message::Binary(view.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Ok(bytes) => {
                        if sender.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = receiver.next() => {
                if msg.is_none() {
                    break;
                }
            }
        }
    }
}

async fn ws_user_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let operator = match authorize(&state, &jar, addr).await {
        Ok(op) => op,
        Err(resp) => return resp,
    };
    ws.on_upgrade(move |socket| user_socket(socket, state, operator))
}

async fn user_socket(socket: WebSocket, state: AppState, operator: Arc<Operator>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = operator.events.subscribe();

    let snapshot = state.store.snapshot().await;
    if let Ok(view) = serde_json::to_vec(&operator.private_view(&snapshot)) {
        if sender.send(Message::Binary(view.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Ok(bytes) => {
                        if sender.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = receiver.next() => {
                if msg.is_none() {
                    break;
                }
            }
        }
    }
}

async fn ws_console_handler(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(server): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let operator = match authorize(&state, &jar, addr).await {
        Ok(op) => op,
        Err(resp) => return resp,
    };
    let Some(backend) = state.store.backend(&server).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |socket| console_socket(socket, backend, operator))
}

async fn console_socket(
    socket: WebSocket,
    backend: Arc<crate::store::Backend>,
    operator: Arc<Operator>,
) {
    let (mut sender, mut receiver) = socket.split();

    let Some(process) = backend.runtime.read().process.clone() else {
        let _ = sender.close().await;
        return;
    };

    for line in process.log.last_n(crate::supervisor::CONSOLE_REPLAY_LINES) {
        if let Ok(encoded) = serde_json::to_vec(&line) {
            if sender.send(Message::Binary(encoded.into())).await.is_err() {
                return;
            }
        }
    }

    let mut rx = process.log.subscribe();
    loop {
        tokio::select! {
            line = rx.recv() => {
                match line {
                    Ok(line) => {
                        if let Ok(encoded) = serde_json::to_vec(&line) {
                            if sender.send(Message::Binary(encoded.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::info!(username = %operator.username, backend = %backend.name, "console command");
                        if process.send_line(&text).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct ProfileQuery {
    #[serde(rename = "type")]
    kind: String,
}

async fn profile_handler(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<ProfileQuery>,
) -> Response {
    let kind = match query.kind.as_str() {
        "armor_bust" | "headhelm" => query.kind,
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };
    let url = format!("https://mineskin.eu/{kind}/{username}");
    match state.http_client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            let bytes = resp.bytes().await.unwrap_or_default();
            (status, bytes).into_response()
        }
        Err(e) => (StatusCode::BAD_GATEWAY, e.to_string()).into_response(),
    }
}

async fn map_handler(
    State(state): State<AppState>,
    Path((server, path)): Path<(String, String)>,
) -> Response {
    if path.split('/').any(|segment| segment == "..") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Some(backend) = state.store.backend(&server).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let base = backend.working_dir.join("bluemap").join("web");
    let gz_path = base.join(format!("{path}.gz"));
    if gz_path.is_file() {
        match tokio::fs::read(&gz_path).await {
            Ok(bytes) => {
                return (
                    [(axum::http::header::CONTENT_ENCODING, "gzip")],
                    bytes,
                )
                    .into_response();
            }
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }
    let plain_path = base.join(&path);
    match tokio::fs::read(&plain_path).await {
        Ok(bytes) => bytes.into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
