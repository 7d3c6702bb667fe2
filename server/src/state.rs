//! # Server State
//!
//! Holds the shared application state handed to every request handler:
//! - **Session registry**: maps tunnel ids to their live sessions
//! - **Configuration**: timeouts, path prefix and body limits
//!
//! Both are constructed once in `main` and shared behind `Arc`s, so the
//! state itself is cheap to clone into each handler.

use std::sync::Arc;

use crate::config::Config;
use crate::registry::SessionRegistry;

/// Shared application state, cloned and passed to each request handler.
#[derive(Clone)]
pub struct AppState {
    /// Registry of currently connected tunnels, keyed by tunnel id.
    pub registry: Arc<SessionRegistry>,

    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, config: Arc<Config>) -> Self {
        Self { registry, config }
    }
}
