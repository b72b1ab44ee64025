//! Pending-call correlation table.
//!
//! Every CALL a session sends registers a `uniqueId -> oneshot::Sender`
//! entry here before the frame hits the wire. The session's read loop
//! resolves entries when a CALLRESULT/CALLERROR with a matching id
//! arrives; a background sweep expires entries whose deadline has
//! passed. Registering an id that is already pending is a programming
//! error, not a runtime one — callers generate ids from a monotonic
//! counter so collisions only happen from a bug.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::errors::{SimError, SimResult};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const BOOT_NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum CallOutcome {
    Result(Value),
    Error {
        error_code: String,
        error_description: String,
        error_details: Value,
    },
    /// The call's deadline elapsed before a CALLRESULT/CALLERROR arrived.
    Timeout,
    /// The transport dropped while the call was in flight, or the
    /// session was deleted.
    Cancelled(SimError),
}

struct PendingEntry {
    reply: oneshot::Sender<CallOutcome>,
    action: String,
    deadline: Instant,
}

/// Tracks in-flight CALLs for a single session. One instance lives per
/// session actor; the table is cheap to clone (an `Arc<DashMap<..>>`
/// inside) so the read loop and the send path can share it without a
/// lock around the whole table.
#[derive(Clone)]
pub struct PendingCalls {
    inner: Arc<DashMap<String, PendingEntry>>,
    next_id: Arc<AtomicU64>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Allocate the next monotonically increasing `uniqueId`. Collisions
    /// with the OCPP-J 36-char limit are not possible this side of
    /// `u64::MAX` calls in one process lifetime.
    pub fn next_unique_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Register a new pending call and return the receiver half. Returns
    /// `SimError::Protocol` if `unique_id` is already registered — this
    /// should never happen when ids come from `next_unique_id`.
    pub fn register(
        &self,
        unique_id: String,
        action: impl Into<String>,
        timeout: Duration,
    ) -> SimResult<oneshot::Receiver<CallOutcome>> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            reply: tx,
            action: action.into(),
            deadline: Instant::now() + timeout,
        };
        match self.inner.entry(unique_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(SimError::Protocol(format!(
                "duplicate pending call id: {unique_id}"
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(rx)
            }
        }
    }

    /// The action name a pending `uniqueId` was registered under,
    /// without consuming the entry. Used by the recorder to label a
    /// CALLRESULT/CALLERROR event by the CALL it answers.
    pub fn peek_action(&self, unique_id: &str) -> Option<String> {
        self.inner.get(unique_id).map(|e| e.action.clone())
    }

    /// Resolve a pending CALLRESULT. Returns `false` (and logs nothing
    /// itself — the caller logs) if no entry matched, which happens for
    /// late responses that already expired.
    pub fn resolve(&self, unique_id: &str, payload: Value) -> bool {
        match self.inner.remove(unique_id) {
            Some((_, entry)) => entry.reply.send(CallOutcome::Result(payload)).is_ok(),
            None => false,
        }
    }

    /// Resolve a pending CALLERROR.
    pub fn fail(
        &self,
        unique_id: &str,
        error_code: String,
        error_description: String,
        error_details: Value,
    ) -> bool {
        match self.inner.remove(unique_id) {
            Some((_, entry)) => entry
                .reply
                .send(CallOutcome::Error {
                    error_code,
                    error_description,
                    error_details,
                })
                .is_ok(),
            None => false,
        }
    }

    /// Drop every entry whose deadline has passed, returning the action
    /// names of expired calls for logging.
    pub fn expire_due(&self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .inner
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| e.key().clone())
            .collect();

        let mut actions = Vec::with_capacity(expired.len());
        for unique_id in expired {
            if let Some((_, entry)) = self.inner.remove(&unique_id) {
                actions.push(entry.action.clone());
                let _ = entry.reply.send(CallOutcome::Timeout);
            }
        }
        actions
    }

    /// Fail every outstanding call with `TransportClosed`, used when a
    /// session's transport drops and in-flight calls can never resolve.
    pub fn cancel_all_transport_closed(&self) {
        self.cancel_all_with(SimError::TransportClosed);
    }

    /// Fail every outstanding call with `Cancelled`, used on session
    /// deletion/shutdown.
    pub fn cancel_all_shutdown(&self) {
        self.cancel_all_with(SimError::Cancelled);
    }

    fn cancel_all_with(&self, reason: SimError) {
        let ids: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        for unique_id in ids {
            if let Some((_, entry)) = self.inner.remove(&unique_id) {
                let _ = entry.reply.send(CallOutcome::Cancelled(reason.clone()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[cfg(test)]
    pub fn actions_snapshot(&self) -> HashMap<String, String> {
        self.inner
            .iter()
            .map(|e| (e.key().clone(), e.value().action.clone()))
            .collect()
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolve_delivers_to_receiver() {
        let table = PendingCalls::new();
        let id = table.next_unique_id();
        let rx = table
            .register(id.clone(), "Heartbeat", DEFAULT_CALL_TIMEOUT)
            .unwrap();
        assert!(table.resolve(&id, json!({"currentTime": "2024-01-01T00:00:00Z"})));
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, CallOutcome::Result(_)));
    }

    #[test]
    fn duplicate_id_rejected() {
        let table = PendingCalls::new();
        let _rx = table
            .register("1".into(), "Heartbeat", DEFAULT_CALL_TIMEOUT)
            .unwrap();
        assert!(table
            .register("1".into(), "Heartbeat", DEFAULT_CALL_TIMEOUT)
            .is_err());
    }

    #[test]
    fn late_resolve_returns_false() {
        let table = PendingCalls::new();
        assert!(!table.resolve("missing", json!({})));
    }

    #[tokio::test]
    async fn cancel_all_fails_every_entry() {
        let table = PendingCalls::new();
        let rx1 = table
            .register("1".into(), "Heartbeat", DEFAULT_CALL_TIMEOUT)
            .unwrap();
        let rx2 = table
            .register("2".into(), "MeterValues", DEFAULT_CALL_TIMEOUT)
            .unwrap();
        table.cancel_all_shutdown();
        assert!(matches!(
            rx1.await.unwrap(),
            CallOutcome::Cancelled(SimError::Cancelled)
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            CallOutcome::Cancelled(SimError::Cancelled)
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn transport_closed_uses_transport_closed_reason() {
        let table = PendingCalls::new();
        let rx = table
            .register("1".into(), "MeterValues", DEFAULT_CALL_TIMEOUT)
            .unwrap();
        table.cancel_all_transport_closed();
        assert!(matches!(
            rx.await.unwrap(),
            CallOutcome::Cancelled(SimError::TransportClosed)
        ));
    }
}
