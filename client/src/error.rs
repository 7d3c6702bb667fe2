//! # Agent Error Types

use tokio_tungstenite::tungstenite;
use tunnel_protocol::ProtocolError;

/// Connection-level failures. Each one ends the current session; the
/// agent loop reconnects afterwards.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no registration acknowledgement within {0:?}")]
    RegisterTimeout(std::time::Duration),
    #[error("server closed the connection: {0}")]
    ClosedByServer(String),
    #[error("acknowledged tunnel id {got:?} does not match {expected:?}")]
    TunnelIdMismatch { expected: String, got: String },
    #[error("unexpected {0} message from server")]
    UnexpectedMessage(&'static str),
    #[error("connection closed")]
    Closed,
}

/// Why a local call produced no response. Never sent over the wire as
/// is; the forwarder turns it into a 502 response.
#[derive(Debug, thiserror::Error)]
pub enum LocalCallError {
    #[error("invalid method {0:?}")]
    InvalidMethod(String),
    #[error("local service timed out")]
    Timeout,
    #[error("local service unreachable: {0}")]
    Connect(String),
    #[error("local call failed: {0}")]
    Http(#[source] reqwest::Error),
}

impl From<reqwest::Error> for LocalCallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LocalCallError::Timeout
        } else if err.is_connect() {
            LocalCallError::Connect(err.to_string())
        } else {
            LocalCallError::Http(err)
        }
    }
}
