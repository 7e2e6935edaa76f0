//! The server's session registry.
//!
//! Per-endpoint auxiliary maps, each behind its own async lock: connected
//! sessions, last-seen timestamps, kick and timeout marks, and the set of
//! sessions still gated behind authentication. Invariants: every client has
//! a last-seen entry; every unauthenticated endpoint is a client; a session
//! is never both kicked and timed out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::DisconnectReason;
use crate::session::Session;

#[derive(Default)]
pub(crate) struct SessionRegistry {
    clients: RwLock<HashMap<String, Arc<Session>>>,
    last_seen: RwLock<HashMap<String, DateTime<Utc>>>,
    kicked: RwLock<HashMap<String, DateTime<Utc>>>,
    timed_out: RwLock<HashMap<String, DateTime<Utc>>>,
    unauthenticated: RwLock<HashSet<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted session. `authenticated` is false only
    /// when the server has a preshared key configured.
    pub async fn insert(&self, session: Arc<Session>, authenticated: bool) {
        let endpoint = session.endpoint().to_string();
        self.clients
            .write()
            .await
            .insert(endpoint.clone(), session);
        self.last_seen
            .write()
            .await
            .insert(endpoint.clone(), Utc::now());
        if !authenticated {
            self.unauthenticated.write().await.insert(endpoint);
        }
    }

    /// Remove a session from every map, resolving the disconnect reason
    /// from the kick/timeout marks (kicked wins, then timed out).
    pub async fn remove(&self, endpoint: &str) -> Option<(Arc<Session>, DisconnectReason)> {
        let session = self.clients.write().await.remove(endpoint)?;
        self.last_seen.write().await.remove(endpoint);
        self.unauthenticated.write().await.remove(endpoint);

        let kicked = self.kicked.write().await.remove(endpoint).is_some();
        let timed_out = self.timed_out.write().await.remove(endpoint).is_some();

        let reason = if kicked {
            DisconnectReason::Kicked
        } else if timed_out {
            DisconnectReason::Timeout
        } else {
            DisconnectReason::Normal
        };
        Some((session, reason))
    }

    pub async fn get(&self, endpoint: &str) -> Option<Arc<Session>> {
        self.clients.read().await.get(endpoint).cloned()
    }

    pub async fn contains(&self, endpoint: &str) -> bool {
        self.clients.read().await.contains_key(endpoint)
    }

    pub async fn endpoints(&self) -> Vec<String> {
        self.clients.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Update an endpoint's last-seen timestamp. Never moves backwards.
    pub async fn touch(&self, endpoint: &str) {
        let now = Utc::now();
        let mut last_seen = self.last_seen.write().await;
        if let Some(entry) = last_seen.get_mut(endpoint) {
            if now > *entry {
                *entry = now;
            }
        }
    }

    pub async fn last_seen(&self, endpoint: &str) -> Option<DateTime<Utc>> {
        self.last_seen.read().await.get(endpoint).copied()
    }

    /// Endpoints whose last activity predates `cutoff`.
    pub async fn idle_endpoints(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.last_seen
            .read()
            .await
            .iter()
            .filter(|(_, seen)| **seen < cutoff)
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }

    /// Mark an operator-initiated removal. A session already marked timed
    /// out keeps that attribution; an endpoint no longer registered is
    /// ignored so the marks cannot outlive their session.
    pub async fn mark_kicked(&self, endpoint: &str, at: DateTime<Utc>) {
        if !self.clients.read().await.contains_key(endpoint) {
            return;
        }
        if self.timed_out.read().await.contains_key(endpoint) {
            return;
        }
        self.kicked.write().await.insert(endpoint.to_string(), at);
    }

    /// Mark an idle-reaper eviction. A session already marked kicked keeps
    /// that attribution; an unregistered endpoint is ignored.
    pub async fn mark_timed_out(&self, endpoint: &str, at: DateTime<Utc>) {
        if !self.clients.read().await.contains_key(endpoint) {
            return;
        }
        if self.kicked.read().await.contains_key(endpoint) {
            return;
        }
        self.timed_out
            .write()
            .await
            .insert(endpoint.to_string(), at);
    }

    pub async fn is_authenticated(&self, endpoint: &str) -> bool {
        !self.unauthenticated.read().await.contains(endpoint)
    }

    /// Lift the auth gate for an endpoint after a successful key exchange.
    pub async fn set_authenticated(&self, endpoint: &str) {
        if !self.unauthenticated.write().await.remove(endpoint) {
            warn!(endpoint, "set_authenticated on endpoint not gated");
        }
    }

    /// Cancel every session; used during server shutdown.
    pub async fn cancel_all(&self) {
        for session in self.clients.read().await.values() {
            session.cancel_token().cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
