//! # Server Configuration
//!
//! Command-line flags with environment-variable fallbacks.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use crate::session::SessionSettings;

/// Tunnel relay server.
///
/// Accepts agent connections on `/ws` and relays public HTTP requests
/// addressed to `/<share-prefix>/<tunnel-id>/...` to the matching agent.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address to listen on for both agents and public traffic
    #[arg(long, env = "TUNNEL_SERVER_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Fixed public base URL (e.g. https://tunnel.example.com).
    /// When omitted, a cloudflared quick tunnel is supervised instead.
    #[arg(long, env = "TUNNEL_SERVER_PUBLIC_BASE")]
    pub public_base: Option<String>,

    /// cloudflared executable used when no public base is configured
    #[arg(long, env = "TUNNEL_SERVER_CLOUDFLARED_BIN", default_value = "cloudflared")]
    pub cloudflared_bin: String,

    /// First path segment of every public tunnel URL
    #[arg(long, env = "TUNNEL_SERVER_SHARE_PREFIX", default_value = "share")]
    pub share_prefix: String,

    /// Seconds to wait for an agent's response before answering 504
    #[arg(long, env = "TUNNEL_SERVER_REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Seconds a new connection has to send its registration
    #[arg(long, env = "TUNNEL_SERVER_REGISTER_TIMEOUT", default_value_t = 10)]
    pub register_timeout_secs: u64,

    /// Outbound frames buffered per session before senders wait
    #[arg(long, env = "TUNNEL_SERVER_SEND_QUEUE", default_value_t = 32)]
    pub send_queue_capacity: usize,

    /// Largest public request body accepted, in bytes
    #[arg(long, env = "TUNNEL_SERVER_MAX_BODY_BYTES", default_value_t = 64 * 1024 * 1024)]
    pub max_body_bytes: usize,
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            send_queue_capacity: self.send_queue_capacity,
            request_timeout: self.request_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            public_base: None,
            cloudflared_bin: "cloudflared".to_string(),
            share_prefix: "share".to_string(),
            request_timeout_secs: 30,
            register_timeout_secs: 10,
            send_queue_capacity: 32,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}
