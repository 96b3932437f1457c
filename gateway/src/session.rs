//! The operator-session layer (C7): cookie-based trust, source-IP pinning,
//! and the bind-to-backend operation.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum_extra::extract::cookie::{Cookie, SameSite};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::store::{StateStore, signal_operator_update, signal_state_update};

/// Cookie lifetime, per spec section 6 ("30-day TTL").
pub const SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub passcode: String,
}

/// The value stored inside the encrypted+authenticated cookie.
#[derive(Serialize, Deserialize, Clone)]
pub struct SessionClaims {
    pub username: String,
    pub passcode: String,
}

/// Normalizes an IPv6-mapped loopback (`::1` seen through a dual-stack
/// listener) down to the IPv4 loopback address, so a client that happens to
/// connect over v6 doesn't get treated as a different source than one over
/// v4 — spec section 3's "source IP normalized" note.
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) if v6.is_loopback() => IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        other => other,
    }
}

/// Validates `claims` against the configured passcode and builds the cookie
/// to hand back to the client. Does not touch the store — call
/// [`trust_request`] afterward (or directly) to materialize the Operator.
pub fn issue_cookie(cookie_name: &str, claims: &SessionClaims) -> anyhow::Result<Cookie<'static>> {
    let payload = serde_json::to_string(claims)?;
    let mut cookie = Cookie::new(cookie_name.to_owned(), payload);
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    cookie.set_max_age(Some(
        time::Duration::try_from(SESSION_TTL).unwrap_or(time::Duration::days(30)),
    ));
    Ok(cookie)
}

/// Trusts a decoded cookie: checks the passcode, then either creates the
/// Operator (first acceptance) or validates the existing (username,
/// source-IP) binding. Returns the error kind for an HTTP 401 on mismatch —
/// per spec section 7, the caller is also expected to clear the cookie.
pub async fn trust_request(
    store: &StateStore,
    configured_passcode: &str,
    claims: &SessionClaims,
    source_ip: IpAddr,
) -> Result<Arc<crate::store::Operator>, GatewayError> {
    if claims.passcode != configured_passcode {
        return Err(GatewayError::Auth);
    }
    let source_ip = normalize_ip(source_ip);

    if let Some(existing) = store.operator(&claims.username).await {
        let recorded_ip = existing.state.read().source_ip;
        if recorded_ip != source_ip {
            return Err(GatewayError::Auth);
        }
        existing.state.write().last_auth_check = Instant::now();
        return Ok(existing);
    }

    Ok(store.operator_or_create(&claims.username, source_ip).await)
}

/// Binds `operator` to `backend_name`. Idempotent: binding to the backend
/// the operator is already bound to is a no-op on the connection side. If
/// the operator currently holds a live connection to a *different* backend,
/// that connection is torn down first (spec section 7's `ConnectToServer`).
pub async fn connect_to_server(
    store: &StateStore,
    operator: &crate::store::Operator,
    backend_name: &str,
) -> Result<(), GatewayError> {
    let backend = store
        .backend(backend_name)
        .await
        .ok_or_else(|| GatewayError::NotFound(format!("unknown backend {backend_name}")))?;

    let source_ip = operator.state.read().source_ip;
    store.set_ping_origin(source_ip, backend_name).await;

    {
        let mut state = operator.state.write();
        if let Some(live) = &state.live_connection {
            if live.backend_name != backend_name {
                if let Some(live) = state.live_connection.take() {
                    let _ = live.close.send(());
                }
            }
        }
        state.bound_backend = Some(backend_name.to_owned());
    }

    let _ = backend;
    signal_operator_update(store, operator).await;
    signal_state_update(store).await;
    Ok(())
}
