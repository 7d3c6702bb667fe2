//! # Session Registry
//!
//! Maps tunnel ids to their live [`Session`]. Backed by a [`DashMap`] so
//! lookups for one tunnel never wait on registrations of another.
//!
//! At most one session per tunnel id is live at any time. A registration
//! for an id that is already taken evicts the old session (closing it)
//! and takes its place, so an agent reconnecting after a network blip
//! with the same id simply replaces its stale connection.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::RegisterError;
use crate::provisioner::PublicEndpoint;
use crate::session::{Session, SessionSettings};

/// Snapshot of one active tunnel, as reported by the admin API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TunnelSummary {
    pub tunnel_id: String,
    pub public_url: String,
    pub in_flight: usize,
}

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    endpoint: Arc<dyn PublicEndpoint>,
    share_prefix: String,
    settings: SessionSettings,
}

impl SessionRegistry {
    pub fn new(
        endpoint: Arc<dyn PublicEndpoint>,
        share_prefix: impl Into<String>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            endpoint,
            share_prefix: share_prefix.into().trim_matches('/').to_string(),
            settings,
        }
    }

    pub fn share_prefix(&self) -> &str {
        &self.share_prefix
    }

    /// Create and publish the session for `tunnel_id`.
    ///
    /// Fails closed when no public endpoint is available. An existing
    /// session under the same id is closed and replaced.
    pub fn register(&self, tunnel_id: &str) -> Result<Arc<Session>, RegisterError> {
        if tunnel_id.is_empty() {
            return Err(RegisterError::EmptyTunnelId);
        }
        let base = self
            .endpoint
            .current_public_base()
            .ok_or(RegisterError::NoPublicEndpoint)?;
        let public_url = format!(
            "{}/{}/{}",
            base.trim_end_matches('/'),
            self.share_prefix,
            tunnel_id
        );

        let session = Session::new(tunnel_id, public_url, self.settings);
        match self.sessions.entry(tunnel_id.to_string()) {
            Entry::Occupied(mut entry) => {
                warn!(tunnel_id, "tunnel id already registered, evicting previous session");
                entry.get().close();
                entry.insert(Arc::clone(&session));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
            }
        }

        info!(tunnel_id, public_url = %session.public_url(), "tunnel registered");
        Ok(session)
    }

    pub fn lookup(&self, tunnel_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(tunnel_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Remove `session` from the registry.
    ///
    /// Idempotent, and only removes the entry while it still points at this
    /// very session: cleanup of an evicted session leaves its replacement
    /// alone.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let removed = self
            .sessions
            .remove_if(session.tunnel_id(), |_, current| Arc::ptr_eq(current, session))
            .is_some();
        if removed {
            info!(tunnel_id = %session.tunnel_id(), "tunnel removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn list(&self) -> Vec<TunnelSummary> {
        let mut tunnels: Vec<TunnelSummary> = self
            .sessions
            .iter()
            .map(|entry| TunnelSummary {
                tunnel_id: entry.key().clone(),
                public_url: entry.public_url().to_string(),
                in_flight: entry.in_flight(),
            })
            .collect();
        tunnels.sort_by(|a, b| a.tunnel_id.cmp(&b.tunnel_id));
        tunnels
    }

    /// Close every session and empty the registry.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!(count = sessions.len(), "closing all tunnels");
        for session in sessions {
            session.close();
            self.remove(&session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::StaticEndpoint;
    use crate::session::SessionState;

    struct NoEndpoint;

    impl PublicEndpoint for NoEndpoint {
        fn current_public_base(&self) -> Option<String> {
            None
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            Arc::new(StaticEndpoint::new("https://x.example")),
            "share",
            SessionSettings::default(),
        )
    }

    #[test]
    fn test_register_builds_public_url() {
        let registry = registry();
        let session = registry.register("abc").unwrap();
        assert_eq!(session.public_url(), "https://x.example/share/abc");
        assert!(Arc::ptr_eq(&registry.lookup("abc").unwrap(), &session));
        assert!(registry.lookup("other").is_none());
    }

    #[test]
    fn test_trailing_slash_in_base() {
        let registry = SessionRegistry::new(
            Arc::new(StaticEndpoint::new("https://x.example/")),
            "/share/",
            SessionSettings::default(),
        );
        let session = registry.register("abc").unwrap();
        assert_eq!(session.public_url(), "https://x.example/share/abc");
    }

    #[test]
    fn test_register_fails_closed_without_endpoint() {
        let registry = SessionRegistry::new(Arc::new(NoEndpoint), "share", SessionSettings::default());
        assert_eq!(
            registry.register("abc").unwrap_err(),
            RegisterError::NoPublicEndpoint
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_empty_tunnel_id_rejected() {
        let registry = registry();
        assert_eq!(registry.register("").unwrap_err(), RegisterError::EmptyTunnelId);
    }

    #[test]
    fn test_duplicate_registration_evicts_previous() {
        let registry = registry();
        let old = registry.register("abc").unwrap();
        let new = registry.register("abc").unwrap();

        assert_eq!(old.state(), SessionState::Closed);
        assert_eq!(new.state(), SessionState::Registering);
        assert!(Arc::ptr_eq(&registry.lookup("abc").unwrap(), &new));
        assert_eq!(registry.len(), 1);

        // The evicted session's cleanup must not remove its replacement.
        assert!(!registry.remove(&old));
        assert!(registry.lookup("abc").is_some());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = registry();
        let session = registry.register("abc").unwrap();
        assert!(registry.remove(&session));
        assert!(!registry.remove(&session));
        assert!(registry.lookup("abc").is_none());
    }

    #[test]
    fn test_list_and_shutdown() {
        let registry = registry();
        let b = registry.register("b").unwrap();
        let a = registry.register("a").unwrap();

        let listed = registry.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].tunnel_id, "a");
        assert_eq!(listed[1].public_url, "https://x.example/share/b");

        registry.shutdown();
        assert!(registry.is_empty());
        assert!(a.is_closed());
        assert!(b.is_closed());
    }
}
