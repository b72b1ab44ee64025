//! Session registry: owns the fleet's set of running sessions
//! and provides batch fan-out operations over them. Each fan-out
//! isolates per-session failures — one session erroring never aborts
//! the rest of the batch.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::warn;

use crate::errors::{SimError, SimResult};
use crate::session::{SessionActor, SessionHandle, SessionIdentity, SessionState};
use crate::tnr::Recorder;
use crate::transport::Endpoint;

/// Summary of a fan-out operation across many sessions: which charge
/// point ids succeeded and which failed, with the failure reason.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchSummary {
    fn record(&mut self, charge_point_id: String, result: SimResult<()>) {
        match result {
            Ok(()) => self.succeeded.push(charge_point_id),
            Err(e) => self.failed.push((charge_point_id, e.to_string())),
        }
    }
}

pub struct SessionRegistry {
    sessions: DashMap<String, SessionHandle>,
    recorder: Arc<dyn Recorder>,
}

impl SessionRegistry {
    pub fn new(recorder: Arc<dyn Recorder>) -> Self {
        Self {
            sessions: DashMap::new(),
            recorder,
        }
    }

    /// Create and spawn one session. Returns `SimError::Validation` if
    /// a session with the same charge point id already exists — the
    /// registry never silently replaces a running session.
    pub fn create(
        &self,
        identity: SessionIdentity,
        connector_count: u32,
        endpoint: Endpoint,
    ) -> SimResult<SessionHandle> {
        let charge_point_id = identity.charge_point_id.clone();
        if self.sessions.contains_key(&charge_point_id) {
            return Err(SimError::Validation(format!(
                "session already exists: {charge_point_id}"
            )));
        }
        let handle = SessionActor::spawn(identity, connector_count, endpoint, self.recorder.clone());
        self.sessions.insert(charge_point_id, handle.clone());
        Ok(handle)
    }

    /// Create a batch of sessions sharing one endpoint base URL, each
    /// with a distinct charge point id. Per-session creation failures
    /// are collected rather than aborting the whole batch.
    pub fn create_batch(
        &self,
        identities: Vec<(SessionIdentity, u32)>,
        endpoint_for: impl Fn(&str) -> Endpoint,
    ) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for (identity, connector_count) in identities {
            let charge_point_id = identity.charge_point_id.clone();
            let endpoint = endpoint_for(&charge_point_id);
            let result = self.create(identity, connector_count, endpoint).map(|_| ());
            summary.record(charge_point_id, result);
        }
        summary
    }

    pub fn get(&self, charge_point_id: &str) -> Option<SessionHandle> {
        self.sessions.get(charge_point_id).map(|e| e.value().clone())
    }

    pub fn list(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn list_by_state(&self, state: SessionState) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .filter(|e| e.value().current_state() == state)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn list_charging(&self) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .filter(|e| e.value().current_state().is_transacting())
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn list_connected(&self) -> Vec<SessionHandle> {
        self.sessions
            .iter()
            .filter(|e| e.value().current_state().is_connected())
            .map(|e| e.value().clone())
            .collect()
    }

    pub async fn delete(&self, charge_point_id: &str) -> SimResult<()> {
        match self.sessions.remove(charge_point_id) {
            Some((_, handle)) => {
                handle.shutdown().await;
                Ok(())
            }
            None => Err(SimError::Validation(format!(
                "no such session: {charge_point_id}"
            ))),
        }
    }

    /// Remove every session that's currently disconnected, without
    /// waiting for any of them to reconnect.
    pub async fn delete_disconnected(&self) -> BatchSummary {
        let targets: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().current_state() == SessionState::Disconnected)
            .map(|e| e.key().clone())
            .collect();
        self.fan_out(targets, |handle| async move {
            handle.shutdown().await;
            Ok(())
        })
        .await
    }

    /// Send `BootNotification` on every session in the fleet.
    pub async fn boot_all(&self) -> BatchSummary {
        self.fan_out_all(|handle| async move { handle.send_boot_notification().await })
            .await
    }

    /// Force an immediate (re)connect attempt on every session.
    pub async fn connect_all(&self) -> BatchSummary {
        self.fan_out_all(|handle| async move { handle.connect().await }).await
    }

    /// Force-close every session's transport and let it reconnect on
    /// its own.
    pub async fn disconnect_all(&self) -> BatchSummary {
        self.fan_out_all(|handle| async move { handle.disconnect().await }).await
    }

    /// Authorize a default id tag and start a transaction on the first
    /// free connector of every session.
    pub async fn start_all(&self, id_tag: &str) -> BatchSummary {
        let id_tag = id_tag.to_string();
        self.fan_out_all(move |handle| {
            let id_tag = id_tag.clone();
            async move { handle.start_transaction(id_tag, None).await }
        })
        .await
    }

    /// Stop the active transaction, if any, on every session.
    pub async fn stop_all(&self) -> BatchSummary {
        self.fan_out_all(|handle| async move { handle.stop_transaction(None).await }).await
    }

    async fn fan_out_all<F, Fut>(&self, op: F) -> BatchSummary
    where
        F: Fn(SessionHandle) -> Fut,
        Fut: std::future::Future<Output = SimResult<()>>,
    {
        let targets: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        self.fan_out(targets, op).await
    }

    async fn fan_out<F, Fut>(&self, charge_point_ids: Vec<String>, op: F) -> BatchSummary
    where
        F: Fn(SessionHandle) -> Fut,
        Fut: std::future::Future<Output = SimResult<()>>,
    {
        let tasks = charge_point_ids.into_iter().filter_map(|id| {
            self.get(&id).map(|handle| {
                let op = &op;
                async move {
                    let result = op(handle).await;
                    (id, result)
                }
            })
        });

        let results = join_all(tasks).await;
        let mut summary = BatchSummary::default();
        for (charge_point_id, result) in results {
            if let Err(e) = &result {
                warn!(%charge_point_id, error = %e, "batch operation failed for session");
            }
            summary.record(charge_point_id, result);
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(charge_point_id: &str) -> Endpoint {
        Endpoint {
            url: "ws://localhost:9000".into(),
            charge_point_id: charge_point_id.to_string(),
            auth_token: None,
        }
    }

    fn identity(charge_point_id: &str) -> SessionIdentity {
        SessionIdentity {
            charge_point_id: charge_point_id.to_string(),
            vendor: "Acme".into(),
            model: "X1".into(),
            serial_number: None,
            firmware_version: None,
        }
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let registry = SessionRegistry::new(Arc::new(crate::tnr::NoopRecorder));
        registry
            .create(identity("CP-1"), 1, endpoint("CP-1"))
            .unwrap();
        let result = registry.create(identity("CP-1"), 1, endpoint("CP-1"));
        assert!(result.is_err());
        registry.delete("CP-1").await.unwrap();
    }

    #[tokio::test]
    async fn delete_missing_session_is_an_error() {
        let registry = SessionRegistry::new(Arc::new(crate::tnr::NoopRecorder));
        assert!(registry.delete("ghost").await.is_err());
    }

    #[tokio::test]
    async fn create_batch_isolates_per_session_failure() {
        let registry = SessionRegistry::new(Arc::new(crate::tnr::NoopRecorder));
        registry
            .create(identity("CP-1"), 1, endpoint("CP-1"))
            .unwrap();

        let summary = registry.create_batch(
            vec![(identity("CP-1"), 1), (identity("CP-2"), 1)],
            |id| endpoint(id),
        );
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.succeeded, vec!["CP-2".to_string()]);

        registry.delete("CP-1").await.unwrap();
        registry.delete("CP-2").await.unwrap();
    }
}
