//! # Error Types
//!
//! Failures are scoped to the tunnel they happen on: registration errors
//! close one agent connection, session errors fail one public request,
//! gateway errors become one HTTP error response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Why an agent's registration was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("no public endpoint available")]
    NoPublicEndpoint,
    #[error("tunnel id must not be empty")]
    EmptyTunnelId,
}

/// Why a relayed request produced no response.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("agent did not respond in time")]
    Timeout,
    #[error("tunnel session closed")]
    Closed,
}

/// Failures of the public HTTP surface, each mapped to a status code.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid tunnel URL")]
    MalformedPublicPath,
    #[error("tunnel not active")]
    TunnelNotActive,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("gateway timeout")]
    UpstreamTimeout,
    #[error("tunnel closed")]
    SessionClosed,
    #[error("invalid response from tunnel: {0}")]
    InvalidUpstreamResponse(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MalformedPublicPath => StatusCode::BAD_REQUEST,
            GatewayError::TunnelNotActive => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::SessionClosed => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidUpstreamResponse(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<SessionError> for GatewayError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Timeout => GatewayError::UpstreamTimeout,
            SessionError::Closed => GatewayError::SessionClosed,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
