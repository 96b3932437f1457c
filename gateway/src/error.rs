//! The gateway's error taxonomy, following spec section 7's seven kinds.
//!
//! Front-door (ping/splice path) failures never reach this type — they are
//! recovered locally (drop the peer, keep listening) per the propagation
//! rules, so `GatewayError` only covers the Start/Stop/Reload/HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unauthorized")]
    Auth,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("process error: {0}")]
    Process(#[from] std::io::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Auth => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::BAD_REQUEST,
            GatewayError::Conflict(_) => StatusCode::BAD_REQUEST,
            GatewayError::Process(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Aggregates per-backend descriptor load failures, mirroring Go's
/// `errors.Join` used by the original loader.
#[derive(Debug, Default)]
pub struct LoadErrors(pub Vec<anyhow::Error>);

impl std::fmt::Display for LoadErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{e:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LoadErrors {}
