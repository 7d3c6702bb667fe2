//! # Tunnel Agent
//!
//! Connects to a tunnel server, registers a tunnel id and replays every
//! relayed HTTP request against a local service.

pub mod agent;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod writer;

use uuid::Uuid;

/// Generate a short, human-readable tunnel id (e.g. `A1B2-C3D4`).
pub fn generate_tunnel_id() -> String {
    let uuid = Uuid::new_v4().to_string();
    let short = &uuid[..8];
    format!(
        "{}-{}",
        short[..4].to_uppercase(),
        short[4..8].to_uppercase()
    )
}
