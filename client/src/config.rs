//! # Agent Configuration

use std::time::Duration;

use clap::Parser;

/// Expose a local HTTP service through a tunnel server.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Tunnel server WebSocket URL
    #[arg(long, env = "TUNNEL_SERVER", default_value = "ws://127.0.0.1:8080/ws")]
    pub server: String,

    /// Host of the local service
    #[arg(long, env = "TUNNEL_LOCAL_HOST", default_value = "localhost")]
    pub local_host: String,

    /// Port of the local service
    #[arg(
        env = "TUNNEL_LOCAL_PORT",
        required_unless_present = "port",
        conflicts_with = "port"
    )]
    pub local_port: Option<u16>,

    /// Port of the local service (alternative to the positional argument)
    #[arg(long)]
    pub port: Option<u16>,

    /// Tunnel id to register; a random one is generated when omitted
    #[arg(long, env = "TUNNEL_ID")]
    pub tunnel_id: Option<String>,

    /// Seconds allowed for one local call
    #[arg(long, env = "TUNNEL_LOCAL_TIMEOUT", default_value_t = 30)]
    pub local_timeout_secs: u64,

    /// Seconds to wait before reconnecting
    #[arg(long, env = "TUNNEL_RECONNECT_DELAY", default_value_t = 3)]
    pub reconnect_delay_secs: u64,

    /// Seconds between WebSocket pings
    #[arg(long, env = "TUNNEL_HEARTBEAT", default_value_t = 30)]
    pub heartbeat_secs: u64,
}

/// How long the server has to acknowledge a registration.
pub const REGISTER_ACK_TIMEOUT: Duration = Duration::from_secs(10);

impl Config {
    /// Convenience constructor with every default filled in.
    pub fn new(server: impl Into<String>, local_host: impl Into<String>, local_port: u16) -> Self {
        Self {
            server: server.into(),
            local_host: local_host.into(),
            local_port: Some(local_port),
            port: None,
            tunnel_id: None,
            local_timeout_secs: 30,
            reconnect_delay_secs: 3,
            heartbeat_secs: 30,
        }
    }

    pub fn port(&self) -> u16 {
        self.local_port.or(self.port).unwrap_or_default()
    }

    pub fn local_base_url(&self) -> String {
        format!("http://{}:{}", self.local_host, self.port())
    }

    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_port() {
        let config = Config::try_parse_from(["tunnel", "3000"]).unwrap();
        assert_eq!(config.port(), 3000);
        assert_eq!(config.local_base_url(), "http://localhost:3000");
        assert_eq!(config.server, "ws://127.0.0.1:8080/ws");
        assert_eq!(config.local_timeout(), Duration::from_secs(30));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(3));
        assert!(config.tunnel_id.is_none());
    }

    #[test]
    fn test_port_flag_and_overrides() {
        let config = Config::try_parse_from([
            "tunnel",
            "--port",
            "8000",
            "--local-host",
            "127.0.0.1",
            "--tunnel-id",
            "abc",
            "--server",
            "wss://t.example/ws",
        ])
        .unwrap();
        assert_eq!(config.local_base_url(), "http://127.0.0.1:8000");
        assert_eq!(config.tunnel_id.as_deref(), Some("abc"));
        assert_eq!(config.server, "wss://t.example/ws");
    }

    #[test]
    fn test_port_is_required() {
        assert!(Config::try_parse_from(["tunnel"]).is_err());
        assert!(Config::try_parse_from(["tunnel", "3000", "--port", "4000"]).is_err());
    }
}
