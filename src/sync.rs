//! Synchronous request/response correlation on top of the asynchronous
//! message stream.
//!
//! Each in-flight exchange is keyed by its conversation GUID. The receiver
//! inserts matching responses into the map and wakes the waiter through a
//! per-conversation [`Notify`]; a 50 ms poll is kept as a fallback so a lost
//! wakeup can never strand a caller. A background reaper sweeps entries whose
//! expiration has passed.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::SyncError;
use crate::message::Metadata;

/// Fallback polling interval while waiting for a response.
pub const SYNC_POLL_INTERVAL_MS: u64 = 50;

/// How often the reaper sweeps the response map.
pub const SYNC_REAPER_INTERVAL_MS: u64 = 1000;

/// Lower bound on a caller-supplied synchronous timeout.
pub const MIN_SYNC_TIMEOUT_MS: u64 = 1000;

// ---------------------------------------------------------------------------
// PendingResponse
// ---------------------------------------------------------------------------

/// A response that arrived before its waiter collected it.
#[derive(Debug, Clone)]
pub struct PendingResponse {
    /// Deadline echoed from the originating request.
    pub expiration: DateTime<Utc>,
    /// Metadata carried by the response frame.
    pub metadata: Metadata,
    /// The response payload.
    pub payload: Bytes,
}

// ---------------------------------------------------------------------------
// SyncCorrelator
// ---------------------------------------------------------------------------

/// Maps conversation GUIDs to pending responses and their waiters.
#[derive(Default)]
pub struct SyncCorrelator {
    responses: RwLock<HashMap<String, PendingResponse>>,
    waiters: RwLock<HashMap<String, Arc<Notify>>>,
}

impl SyncCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the intent to wait on `guid` and return the wakeup handle.
    ///
    /// Must be called before the request is sent, so a response racing ahead
    /// of the waiter still finds a notifier to signal.
    pub async fn register_request(&self, guid: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.waiters
            .write()
            .await
            .insert(guid.to_string(), Arc::clone(&notify));
        notify
    }

    /// Drop the waiter registration and any uncollected response for `guid`.
    pub async fn unregister(&self, guid: &str) {
        self.waiters.write().await.remove(guid);
        self.responses.write().await.remove(guid);
    }

    /// Called by the receiver when a frame with `SyncResponse` arrives.
    ///
    /// Responses that are already past their expiration are dropped here;
    /// the waiter has either timed out or is about to.
    pub async fn deliver_response(&self, guid: String, response: PendingResponse) {
        if response.expiration <= Utc::now() {
            debug!(conversation = %guid, "dropping expired sync response");
            return;
        }

        trace!(conversation = %guid, bytes = response.payload.len(), "sync response delivered");
        self.responses.write().await.insert(guid.clone(), response);

        if let Some(notify) = self.waiters.read().await.get(&guid) {
            notify.notify_one();
        }
    }

    /// Atomically consume the response for `guid`, if present.
    pub async fn take(&self, guid: &str) -> Option<PendingResponse> {
        self.responses.write().await.remove(guid)
    }

    /// Block until the response for `guid` arrives or `expiration` passes.
    ///
    /// The caller must have called [`register_request`](Self::register_request)
    /// first and must call [`unregister`](Self::unregister) afterwards.
    pub async fn await_response(
        &self,
        guid: &str,
        expiration: DateTime<Utc>,
        notify: &Notify,
    ) -> Result<PendingResponse, SyncError> {
        loop {
            if let Some(response) = self.take(guid).await {
                return Ok(response);
            }

            let now = Utc::now();
            if now >= expiration {
                return Err(SyncError::Timeout);
            }

            let remaining = (expiration - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            let poll = std::time::Duration::from_millis(SYNC_POLL_INTERVAL_MS).min(remaining);

            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Remove every entry whose expiration is in the past. Returns the
    /// number removed.
    pub async fn reap_expired(&self) -> usize {
        let now = Utc::now();
        let mut responses = self.responses.write().await;
        let before = responses.len();
        responses.retain(|guid, resp| {
            let keep = resp.expiration > now;
            if !keep {
                debug!(conversation = %guid, "reaping expired sync response");
            }
            keep
        });
        before - responses.len()
    }

    /// Number of uncollected responses.
    pub async fn pending_count(&self) -> usize {
        self.responses.read().await.len()
    }

    /// Spawn the background reaper. Runs until `cancel` fires.
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(
                SYNC_REAPER_INTERVAL_MS,
            ));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        correlator.reap_expired().await;
                    }
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Clock-skew compensation
// ---------------------------------------------------------------------------

/// Adjust an inbound request's expiration by the signed difference between
/// this endpoint's clock and the sender's.
///
/// A sender whose clock runs behind the receiver extends the deadline by the
/// lag; a sender running ahead shortens it. Applied only to inbound sync
/// requests; responses echo the originating request's deadline untouched.
pub fn effective_expiration(
    stated: DateTime<Utc>,
    sender_timestamp: Option<DateTime<Utc>>,
    receiver_now: DateTime<Utc>,
) -> DateTime<Utc> {
    match sender_timestamp {
        Some(sent_at) => stated + (receiver_now - sent_at),
        None => stated,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
