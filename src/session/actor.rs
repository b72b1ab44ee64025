//! The session actor: a single task that owns one [`Session`] and its
//! transport. All state mutation happens inside this task's mailbox
//! loop, so nothing outside it ever touches `Session` directly — the
//! rest of the crate talks to a session only through [`SessionHandle`].

use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration};
use tracing::warn;

use crate::backoff::Backoff;
use crate::dispatch;
use crate::errors::{SimError, SimResult};
use crate::frame::{DecodeError, OcppFrame};
use crate::messages::{InboundAction, OutboundAction};
use crate::pending::{PendingCalls, DEFAULT_CALL_TIMEOUT};
use crate::session::buffers::RingBuffer;
use crate::session::model::{Session, SessionIdentity};
use crate::session::outbound_queue::{FrameKind, OutboundQueue};
use crate::session::state::SessionState;
use crate::tnr::Recorder;
use crate::transport::{connect_with_backoff, ConnectCancel, Endpoint, TransportWriter};

/// Commands the rest of the crate sends into a session's mailbox.
/// Every variant that can produce a reply carries a `oneshot` sender so
/// callers await the outcome without blocking the mailbox itself.
pub enum SessionCommand {
    /// A fresh write half is ready after a (re)connect.
    TransportConnected(TransportWriter),
    /// Raw text received from the transport's read loop.
    InboundText(String),
    /// Transport dropped; the actor starts reconnecting.
    TransportClosed,
    /// Send a CALL the session originates (an outbound action) and wait
    /// for the CALLRESULT/CALLERROR.
    SendCall {
        action: OutboundAction,
        payload: Value,
        reply: oneshot::Sender<SimResult<Value>>,
    },
    /// Run one physics/heartbeat/meter-values scheduler tick.
    Tick { elapsed_secs: f64 },
    /// Force an immediate (re)connect attempt, bypassing whatever
    /// backoff delay the reconnect loop is currently sleeping through.
    /// A no-op if the transport is already up.
    Connect { reply: oneshot::Sender<SimResult<()>> },
    /// Force-close the current transport, if any, and let the normal
    /// reconnect loop bring it back. Distinct from `Shutdown`: the
    /// session keeps running.
    Disconnect { reply: oneshot::Sender<SimResult<()>> },
    /// Re-run the `BootNotification` sequence on demand (the registry's
    /// `bootAll`/a session's own `sendBootNotification` control command),
    /// built from the session's own identity the same way the automatic
    /// post-connect boot is.
    SendBootNotification { reply: oneshot::Sender<SimResult<()>> },
    /// Authorize `id_tag` and start a transaction on the first free
    /// connector, or `connector_id` if given.
    StartTransaction {
        id_tag: String,
        connector_id: Option<u32>,
        reply: oneshot::Sender<SimResult<()>>,
    },
    /// Stop the transaction on `connector_id`, or the first active
    /// transaction if not given.
    StopTransaction {
        connector_id: Option<u32>,
        reply: oneshot::Sender<SimResult<()>>,
    },
    /// `BootNotification`'s CALLRESULT landed: adopt the interval and
    /// move to `Available`, or stay in `Booting` if refused.
    BootResult { accepted: bool, interval: u32 },
    /// The `Authorize -> StartTransaction` sequence spawned by
    /// `handle_start_transaction` finished successfully; apply the
    /// CSMS-assigned transaction id to the connector.
    ApplyStartTransaction {
        connector_id: u32,
        id_tag: String,
        meter_start: i64,
        transaction_id: i32,
        reply: oneshot::Sender<SimResult<()>>,
    },
    Shutdown,
}

/// A cheap, cloneable reference to a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    pub charge_point_id: String,
    sender: mpsc::Sender<SessionCommand>,
    state_mirror: Arc<RwLock<SessionState>>,
}

impl SessionHandle {
    /// The session's last-known state, read without going through the
    /// mailbox. Used by the registry for `listByState`-style queries
    /// that shouldn't have to wait behind a busy actor.
    pub fn current_state(&self) -> SessionState {
        *self.state_mirror.read().expect("state mirror poisoned")
    }

    pub async fn send_call(&self, action: OutboundAction, payload: Value) -> SimResult<Value> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::SendCall {
                action,
                payload,
                reply,
            })
            .await
            .map_err(|_| SimError::State("session actor has shut down".into()))?;
        rx.await
            .map_err(|_| SimError::State("session actor dropped the reply".into()))?
    }

    pub async fn tick(&self, elapsed_secs: f64) -> SimResult<()> {
        self.sender
            .send(SessionCommand::Tick { elapsed_secs })
            .await
            .map_err(|_| SimError::State("session actor has shut down".into()))
    }

    pub async fn shutdown(&self) {
        let _ = self.sender.send(SessionCommand::Shutdown).await;
    }

    pub async fn connect(&self) -> SimResult<()> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Connect { reply })
            .await
            .map_err(|_| SimError::State("session actor has shut down".into()))?;
        rx.await
            .map_err(|_| SimError::State("session actor dropped the reply".into()))?
    }

    pub async fn disconnect(&self) -> SimResult<()> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Disconnect { reply })
            .await
            .map_err(|_| SimError::State("session actor has shut down".into()))?;
        rx.await
            .map_err(|_| SimError::State("session actor dropped the reply".into()))?
    }

    pub async fn send_boot_notification(&self) -> SimResult<()> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::SendBootNotification { reply })
            .await
            .map_err(|_| SimError::State("session actor has shut down".into()))?;
        rx.await
            .map_err(|_| SimError::State("session actor dropped the reply".into()))?
    }

    pub async fn start_transaction(&self, id_tag: String, connector_id: Option<u32>) -> SimResult<()> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::StartTransaction {
                id_tag,
                connector_id,
                reply,
            })
            .await
            .map_err(|_| SimError::State("session actor has shut down".into()))?;
        rx.await
            .map_err(|_| SimError::State("session actor dropped the reply".into()))?
    }

    pub async fn stop_transaction(&self, connector_id: Option<u32>) -> SimResult<()> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::StopTransaction { connector_id, reply })
            .await
            .map_err(|_| SimError::State("session actor has shut down".into()))?;
        rx.await
            .map_err(|_| SimError::State("session actor dropped the reply".into()))?
    }

    pub(crate) fn raw_sender(&self) -> mpsc::Sender<SessionCommand> {
        self.sender.clone()
    }
}

const MAILBOX_CAPACITY: usize = 256;

pub struct SessionActor {
    session: Session,
    endpoint: Endpoint,
    pending: PendingCalls,
    /// Bounded backpressure queue a dedicated writer task drains;
    /// cleared on every reconnect so stale frames never carry over to a
    /// fresh connection.
    outbound: OutboundQueue,
    /// Signals the writer task to close its socket and stop. `Some` iff
    /// a transport is currently up — this, not `outbound`, is the
    /// "are we connected" check, since the queue itself outlives any
    /// one connection.
    writer_cancel: Option<oneshot::Sender<()>>,
    recorder: Arc<dyn Recorder>,
    message_log: RingBuffer<String>,
    event_log: RingBuffer<String>,
    mailbox: mpsc::Receiver<SessionCommand>,
    state_mirror: Arc<RwLock<SessionState>>,
    /// Cancels the in-flight reconnect loop, if any, on shutdown or a
    /// fresh reconnect request.
    connect_cancel: Option<ConnectCancel>,
    /// Set once `run` starts; lets handlers that don't otherwise receive
    /// a `SessionHandle` (e.g. `perform_reset`) still kick off a fresh
    /// reconnect.
    self_handle: Option<SessionHandle>,
}

impl SessionActor {
    pub fn spawn(
        identity: SessionIdentity,
        connector_count: u32,
        endpoint: Endpoint,
        recorder: Arc<dyn Recorder>,
    ) -> SessionHandle {
        let charge_point_id = identity.charge_point_id.clone();
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let state_mirror = Arc::new(RwLock::new(SessionState::Disconnected));
        let actor = SessionActor {
            session: Session::new(identity, connector_count),
            endpoint,
            pending: PendingCalls::new(),
            outbound: OutboundQueue::new(charge_point_id.clone()),
            writer_cancel: None,
            recorder,
            message_log: RingBuffer::default(),
            event_log: RingBuffer::default(),
            mailbox: rx,
            state_mirror: state_mirror.clone(),
            connect_cancel: None,
            self_handle: None,
        };
        let handle = SessionHandle {
            charge_point_id,
            sender: tx,
            state_mirror,
        };
        tokio::spawn(actor.run(handle.clone()));
        handle
    }

    /// Returns `self` once the mailbox closes, purely so tests can
    /// recover final state after a `Shutdown`; production `spawn`
    /// discards it.
    async fn run(mut self, handle: SessionHandle) -> Self {
        self.self_handle = Some(handle.clone());
        self.transition(SessionState::Connecting);
        self.spawn_connect(handle.clone());

        let mut expiry_sweep = interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                cmd = self.mailbox.recv() => {
                    match cmd {
                        Some(SessionCommand::TransportConnected(writer)) => {
                            self.spawn_writer(writer, &handle);
                            self.transition(SessionState::Booting);
                            self.spawn_boot_sequence(&handle);
                        }
                        Some(SessionCommand::InboundText(text)) => self.handle_inbound_text(&text).await,
                        Some(SessionCommand::TransportClosed) => self.handle_transport_closed(&handle),
                        Some(SessionCommand::SendCall { action, payload, reply }) => {
                            match self.begin_call(action, payload).await {
                                Ok(rx) => {
                                    tokio::spawn(async move {
                                        let _ = reply.send(outcome_to_result(rx.await));
                                    });
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(e));
                                }
                            }
                        }
                        Some(SessionCommand::Tick { elapsed_secs }) => self.handle_tick(elapsed_secs).await,
                        Some(SessionCommand::Connect { reply }) => {
                            self.handle_connect(&handle);
                            let _ = reply.send(Ok(()));
                        }
                        Some(SessionCommand::Disconnect { reply }) => {
                            if let Some(cancel) = self.writer_cancel.take() {
                                let _ = cancel.send(());
                            }
                            self.handle_transport_closed(&handle);
                            let _ = reply.send(Ok(()));
                        }
                        Some(SessionCommand::SendBootNotification { reply }) => {
                            self.spawn_boot_sequence(&handle);
                            let _ = reply.send(Ok(()));
                        }
                        Some(SessionCommand::StartTransaction { id_tag, connector_id, reply }) => {
                            self.handle_start_transaction(id_tag, connector_id, reply, &handle);
                        }
                        Some(SessionCommand::StopTransaction { connector_id, reply }) => {
                            let result = self.handle_stop_transaction(connector_id).await;
                            let _ = reply.send(result);
                        }
                        Some(SessionCommand::BootResult { accepted, interval }) => {
                            self.apply_boot_result(accepted, interval).await;
                        }
                        Some(SessionCommand::ApplyStartTransaction {
                            connector_id,
                            id_tag,
                            meter_start,
                            transaction_id,
                            reply,
                        }) => {
                            self.apply_start_transaction(connector_id, id_tag, meter_start, transaction_id)
                                .await;
                            let _ = reply.send(Ok(()));
                        }
                        Some(SessionCommand::Shutdown) | None => break,
                    }
                }
                _ = expiry_sweep.tick() => {
                    for action in self.pending.expire_due() {
                        warn!(charge_point_id = %self.session.identity.charge_point_id, %action, "pending call expired");
                    }
                }
            }
        }

        if let Some(cancel) = self.connect_cancel.take() {
            cancel.cancel();
        }
        if let Some(cancel) = self.writer_cancel.take() {
            let _ = cancel.send(());
        }
        self.pending.cancel_all_shutdown();
        self
    }

    /// Force a fresh (re)connect attempt. A no-op if a transport is
    /// already up; otherwise cancels whatever backoff sleep the current
    /// reconnect loop is in and starts a new one immediately.
    fn handle_connect(&mut self, handle: &SessionHandle) {
        if self.writer_cancel.is_some() {
            return;
        }
        if let Some(cancel) = self.connect_cancel.take() {
            cancel.cancel();
        }
        self.transition(SessionState::Connecting);
        self.spawn_connect(handle.clone());
    }

    fn spawn_connect(&mut self, handle: SessionHandle) {
        let (cancel, mut cancel_source) = ConnectCancel::new();
        self.connect_cancel = Some(cancel);
        let endpoint = self.endpoint.clone();
        let sender = handle.raw_sender();
        tokio::spawn(async move {
            let mut backoff = Backoff::new();
            let Some((writer, mut reader)) =
                connect_with_backoff(&endpoint, &mut backoff, &mut cancel_source).await
            else {
                return;
            };
            if sender
                .send(SessionCommand::TransportConnected(writer))
                .await
                .is_err()
            {
                return;
            }
            loop {
                match reader.recv_text().await {
                    Ok(Some(text)) => {
                        if sender.send(SessionCommand::InboundText(text)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => {
                        let _ = sender.send(SessionCommand::TransportClosed).await;
                        break;
                    }
                }
            }
        });
    }

    /// Hand a freshly-connected write half to a dedicated task that
    /// drains [`Self::outbound`], so a stalled socket write can never
    /// block the mailbox loop itself. The task stops either when told
    /// to via `writer_cancel`, or on its own write error — in which
    /// case it reports `TransportClosed` the same way the reader task
    /// does on a read error.
    fn spawn_writer(&mut self, writer: TransportWriter, handle: &SessionHandle) {
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.writer_cancel = Some(cancel_tx);
        let outbound = self.outbound.clone();
        let sender = handle.raw_sender();
        let charge_point_id = self.session.identity.charge_point_id.clone();
        tokio::spawn(async move {
            let mut writer = writer;
            loop {
                tokio::select! {
                    text = outbound.pop() => {
                        if let Err(e) = writer.send_text(text).await {
                            warn!(%charge_point_id, error = %e, "send failed, dropping transport");
                            let _ = sender.send(SessionCommand::TransportClosed).await;
                            return;
                        }
                    }
                    _ = &mut cancel_rx => {
                        writer.close().await;
                        return;
                    }
                }
            }
        });
    }

    fn transition(&mut self, next: SessionState) {
        if !self.session.state.can_transition_to(next) {
            warn!(
                charge_point_id = %self.session.identity.charge_point_id,
                from = ?self.session.state,
                to = ?next,
                "illegal state transition suppressed"
            );
            return;
        }
        self.event_log.push(format!("{:?} -> {:?}", self.session.state, next));
        self.recorder.emit(crate::tnr::RecorderEvent {
            timestamp: chrono::Utc::now(),
            charge_point_id: self.session.identity.charge_point_id.clone(),
            kind: crate::tnr::EventKind::Session,
            action: format!("{:?}", next),
            direction: None,
            payload: serde_json::json!({ "from": format!("{:?}", self.session.state) }),
        });
        self.session.state = next;
        *self.state_mirror.write().expect("state mirror poisoned") = next;
    }

    fn handle_transport_closed(&mut self, handle: &SessionHandle) {
        if let Some(cancel) = self.writer_cancel.take() {
            let _ = cancel.send(());
        }
        self.outbound.clear();
        self.transition(SessionState::Disconnected);
        self.pending.cancel_all_transport_closed();
        self.transition(SessionState::Connecting);
        self.spawn_connect(handle.clone());
    }

    async fn handle_inbound_text(&mut self, text: &str) {
        self.message_log.push(text.to_string());

        let frame = match OcppFrame::decode(text) {
            Ok(frame) => frame,
            Err(DecodeError::MalformedFrame(msg)) => {
                warn!(error = %msg, "dropped malformed frame");
                return;
            }
            Err(DecodeError::UnknownAction { unique_id, action }) => {
                warn!(%action, "rejected CALL with unregistered action");
                self.send_frame(OcppFrame::error_response(
                    unique_id,
                    crate::errors::OcppErrorCode::NotImplemented.as_str(),
                    format!("unsupported action: {action}"),
                ))
                .await;
                return;
            }
        };

        self.emit_ocpp_event(&frame, crate::tnr::FrameDirection::Received);

        match frame {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => self.handle_inbound_call(unique_id, action, payload).await,
            OcppFrame::CallResult { unique_id, payload } => {
                if !self.pending.resolve(&unique_id, payload) {
                    warn!(%unique_id, "CALLRESULT for unknown or expired call");
                }
            }
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => {
                if !self
                    .pending
                    .fail(&unique_id, error_code, error_description, error_details)
                {
                    warn!(%unique_id, "CALLERROR for unknown or expired call");
                }
            }
        }
    }

    async fn handle_inbound_call(&mut self, unique_id: String, action: String, payload: Value) {
        let before: Vec<_> = self.session.connectors.iter().map(|c| c.status).collect();
        // The codec already rejected any action outside InboundAction's
        // registered set before this frame reached the mailbox.
        let resolved = InboundAction::from_wire(&action)
            .expect("decoder rejects unregistered actions before dispatch");
        let reset_kind = if resolved == InboundAction::Reset {
            serde_json::from_value::<crate::messages::commands::ResetRequest>(payload.clone())
                .ok()
                .map(|r| r.kind)
        } else {
            None
        };
        let remote_start = if resolved == InboundAction::RemoteStartTransaction {
            serde_json::from_value::<crate::messages::commands::RemoteStartTransactionRequest>(payload.clone())
                .ok()
        } else {
            None
        };
        let remote_stop = if resolved == InboundAction::RemoteStopTransaction {
            serde_json::from_value::<crate::messages::commands::RemoteStopTransactionRequest>(payload.clone())
                .ok()
        } else {
            None
        };
        let response_frame = match dispatch::handle(&mut self.session, resolved, payload) {
            Ok(response) => OcppFrame::CallResult {
                unique_id,
                payload: response,
            },
            Err(e) => OcppFrame::error_response(
                unique_id,
                crate::errors::OcppErrorCode::InternalError.as_str(),
                e.to_string(),
            ),
        };
        let accepted = matches!(&response_frame, OcppFrame::CallResult { .. });
        self.send_frame(response_frame).await;
        self.sync_session_state(&before).await;

        if let (true, Some(kind)) = (accepted, reset_kind) {
            self.perform_reset(kind).await;
        }
        if let (true, Some(request)) = (accepted, remote_start) {
            self.perform_remote_start(request).await;
        }
        if let (true, Some(request)) = (accepted, remote_stop) {
            self.perform_remote_stop(request).await;
        }
    }

    /// Carry out the real `Authorize -> StartTransaction` CALL sequence
    /// after a `RemoteStartTransaction` CALLRESULT of `Accepted` is on
    /// the wire, triggering the local Authorize -> StartTransaction
    /// sequence asynchronously. Failure here
    /// (authorization refused, CSMS error) is logged, not surfaced —
    /// the CSMS already has its `Accepted` answer to the remote-start
    /// request itself.
    async fn perform_remote_start(&mut self, request: crate::messages::commands::RemoteStartTransactionRequest) {
        let connector_id = match request.connector_id {
            Some(id) => id,
            None => match self.session.connectors.iter().find(|c| c.transaction.is_none()) {
                Some(c) => c.connector_id,
                None => return,
            },
        };
        let handle = self
            .self_handle
            .clone()
            .expect("self_handle is set before any command is processed");
        let (reply, rx) = oneshot::channel();
        self.handle_start_transaction(request.id_tag, Some(connector_id), reply, &handle);
        let charge_point_id = self.session.identity.charge_point_id.clone();
        tokio::spawn(async move {
            if let Ok(Err(e)) = rx.await {
                warn!(%charge_point_id, error = %e, "RemoteStartTransaction follow-up failed");
            }
        });
    }

    /// Carry out the real `StopTransaction` CALL after a
    /// `RemoteStopTransaction` CALLRESULT of `Accepted` is on the wire.
    async fn perform_remote_stop(&mut self, request: crate::messages::commands::RemoteStopTransactionRequest) {
        let connector_id = self.session.connectors.iter().find_map(|c| {
            c.transaction
                .as_ref()
                .filter(|t| t.transaction_id == request.transaction_id)
                .map(|_| c.connector_id)
        });
        let Some(connector_id) = connector_id else {
            return;
        };
        if let Err(e) = self.handle_stop_transaction(Some(connector_id)).await {
            warn!(
                charge_point_id = %self.session.identity.charge_point_id,
                error = %e,
                "RemoteStopTransaction follow-up failed"
            );
        }
    }

    /// Carry out a `Reset` CALL's side effects once the CALLRESULT is on
    /// the wire: any state transitions through UNAVAILABLE ->
    /// DISCONNECTED -> BOOTING. `Soft` lets an in-flight transaction
    /// finish with a proper `StopTransaction`; `Hard` abandons it
    /// without one.
    async fn perform_reset(&mut self, kind: crate::messages::enums::ResetType) {
        use crate::messages::enums::ResetType;

        let before: Vec<_> = self.session.connectors.iter().map(|c| c.status).collect();
        let active: Vec<(u32, crate::session::model::Transaction)> = self
            .session
            .connectors
            .iter_mut()
            .filter_map(|c| c.transaction.take().map(|t| (c.connector_id, t)))
            .collect();

        for (connector_id, transaction) in active {
            let connector = self.session.connector_mut(connector_id);
            let meter_stop = connector.as_ref().map(|c| c.meter_wh).unwrap_or(transaction.meter_start_wh);
            if let Some(connector) = connector {
                connector.vehicle = None;
                connector.status = crate::messages::enums::ChargePointStatus::Available;
            }
            if kind == ResetType::Soft {
                let (action, payload) = crate::outbound::stop_transaction(
                    Some(transaction.id_tag),
                    meter_stop,
                    transaction.transaction_id,
                    crate::messages::enums::StopTransactionReason::SoftReset,
                );
                self.fire_and_forget_call(action, payload).await;
            }
        }
        self.sync_session_state(&before).await;

        self.transition(SessionState::Unavailable);
        let handle = self
            .self_handle
            .clone()
            .expect("self_handle is set before any command is processed");
        self.handle_transport_closed(&handle);
    }

    /// Reconcile the session-level state machine against per-connector
    /// status after a dispatcher handler or a physics tick has mutated
    /// connectors, and emit a `StatusNotification` for every connector
    /// whose status actually changed. Every transition emits one, and
    /// it is enqueued before anything that depends on the new state.
    async fn sync_session_state(&mut self, before: &[crate::messages::enums::ChargePointStatus]) {
        use crate::messages::enums::ChargePointStatus as C;

        let mut changed: Vec<(u32, C)> = self
            .session
            .connectors
            .iter()
            .zip(before)
            .filter(|(c, prev)| c.status != **prev)
            .map(|(c, _)| (c.connector_id, c.status))
            .collect();

        // `Finishing` is transient and always settles to Available:
        // settle straight back to Available and report both statuses,
        // rather than leaving the connector parked mid-transition
        // until some unrelated later event nudges it along.
        for connector in self.session.connectors.iter_mut() {
            if connector.status == C::Finishing {
                connector.status = C::Available;
                changed.push((connector.connector_id, C::Available));
            }
        }

        let derived = self.derive_session_state();
        if derived != self.session.state {
            self.step_toward(derived);
        }

        for (connector_id, status) in changed {
            let (action, payload) = crate::outbound::status_notification(connector_id, status);
            self.fire_and_forget_call(action, payload).await;
        }
    }

    /// Drive the session state machine toward `target`, routing through
    /// a known intermediate when the direct edge isn't legal (e.g.
    /// `Available -> Charging` must pass through `Preparing`). Falls
    /// back to a suppressed-transition warning (via `transition`) if no
    /// known hop applies.
    fn step_toward(&mut self, target: SessionState) {
        if self.session.state == target {
            return;
        }
        if self.session.state.can_transition_to(target) {
            self.transition(target);
            return;
        }
        for hop in [SessionState::Preparing, SessionState::Finishing] {
            if self.session.state.can_transition_to(hop) && hop.can_transition_to(target) {
                self.transition(hop);
                self.transition(target);
                return;
            }
        }
        self.transition(target);
    }

    /// Map the aggregate of per-connector `ChargePointStatus` onto the
    /// single session-level `SessionState`, in order of the most
    /// attention-worthy connector state first: a session with any
    /// connector actively charging is reported as `Charging` even if
    /// others are idle.
    fn derive_session_state(&self) -> SessionState {
        use crate::messages::enums::ChargePointStatus as C;

        if !matches!(
            self.session.state,
            SessionState::Available
                | SessionState::Preparing
                | SessionState::Charging
                | SessionState::SuspendedEv
                | SessionState::SuspendedEvse
                | SessionState::Finishing
                | SessionState::Reserved
                | SessionState::Unavailable
        ) {
            // Boot/connect/fault lifecycle states aren't driven by
            // connector status reconciliation.
            return self.session.state;
        }

        let statuses: Vec<C> = self.session.connectors.iter().map(|c| c.status).collect();
        if statuses.iter().any(|s| *s == C::Charging) {
            SessionState::Charging
        } else if statuses.iter().any(|s| *s == C::SuspendedEVSE) {
            SessionState::SuspendedEvse
        } else if statuses.iter().any(|s| *s == C::SuspendedEV) {
            SessionState::SuspendedEv
        } else if statuses.iter().any(|s| *s == C::Finishing) {
            SessionState::Finishing
        } else if statuses.iter().any(|s| *s == C::Preparing) {
            SessionState::Preparing
        } else if statuses.iter().any(|s| *s == C::Reserved) {
            SessionState::Reserved
        } else if statuses.iter().any(|s| *s == C::Unavailable) {
            SessionState::Unavailable
        } else {
            SessionState::Available
        }
    }

    /// Register a pending call and push its frame onto the wire, but
    /// never await the reply here: resolving it requires this same
    /// actor to process the matching `InboundText` command, which can't
    /// happen while this mailbox iteration is still stuck awaiting it.
    /// Callers that need the response either hand the receiver to a
    /// task spawned outside this actor ([`Self::spawn_boot_sequence`],
    /// [`Self::spawn_start_transaction`]) or ignore it entirely
    /// ([`Self::fire_and_forget_call`]).
    async fn begin_call(
        &mut self,
        action: OutboundAction,
        payload: Value,
    ) -> SimResult<oneshot::Receiver<crate::pending::CallOutcome>> {
        let unique_id = self.pending.next_unique_id();
        let timeout = if action == OutboundAction::BootNotification {
            crate::pending::BOOT_NOTIFICATION_TIMEOUT
        } else {
            DEFAULT_CALL_TIMEOUT
        };
        let rx = self.pending.register(unique_id.clone(), action.as_wire(), timeout)?;
        self.send_frame(OcppFrame::Call {
            unique_id,
            action: action.as_wire().to_string(),
            payload,
        })
        .await;
        Ok(rx)
    }

    /// Send a CALL whose response carries nothing this session needs to
    /// act on (`Heartbeat`, `MeterValues`, `StatusNotification`, a
    /// `StopTransaction` the session already applied locally). Logs a
    /// rejection or timeout instead of blocking on it.
    async fn fire_and_forget_call(&mut self, action: OutboundAction, payload: Value) {
        let charge_point_id = self.session.identity.charge_point_id.clone();
        match self.begin_call(action, payload).await {
            Ok(rx) => {
                tokio::spawn(async move {
                    match rx.await {
                        Ok(crate::pending::CallOutcome::Error {
                            error_code,
                            error_description,
                            ..
                        }) => warn!(%charge_point_id, %error_code, %error_description, "call rejected by CSMS"),
                        Ok(crate::pending::CallOutcome::Timeout) => {
                            warn!(%charge_point_id, "call timed out waiting for CSMS reply")
                        }
                        _ => {}
                    }
                });
            }
            Err(e) => warn!(error = %e, "failed to send call"),
        }
    }

    async fn send_frame(&mut self, frame: OcppFrame) {
        self.emit_ocpp_event(&frame, crate::tnr::FrameDirection::Sent);
        let text = frame.encode();
        self.message_log.push(text.clone());
        if self.writer_cancel.is_some() {
            let kind = FrameKind::classify(&frame);
            self.outbound.push(text, kind);
        } else {
            warn!("dropped frame: no transport connected");
        }
    }

    /// Forward one decoded/encoded frame to the recorder, if one is
    /// attached and actively recording. CALLRESULT/CALLERROR
    /// frames are labeled with the action of the CALL they answer,
    /// looked up from the pending-call table before it's consumed.
    fn emit_ocpp_event(&self, frame: &OcppFrame, direction: crate::tnr::FrameDirection) {
        if !self.recorder.is_active() {
            return;
        }
        let (action, payload) = match frame {
            OcppFrame::Call { action, payload, .. } => (action.clone(), payload.clone()),
            OcppFrame::CallResult { unique_id, payload } => (
                self.pending.peek_action(unique_id).unwrap_or_else(|| "CallResult".into()),
                payload.clone(),
            ),
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                ..
            } => (
                self.pending.peek_action(unique_id).unwrap_or_else(|| "CallError".into()),
                serde_json::json!({ "errorCode": error_code, "errorDescription": error_description }),
            ),
        };
        self.recorder.emit(crate::tnr::RecorderEvent {
            timestamp: chrono::Utc::now(),
            charge_point_id: self.session.identity.charge_point_id.clone(),
            kind: crate::tnr::EventKind::Ocpp,
            action,
            direction: Some(direction),
            payload,
        });
    }

    /// Send `BootNotification` from a task outside this actor's own
    /// mailbox loop, so awaiting its CALLRESULT can never deadlock the
    /// loop that alone can deliver that CALLRESULT. The outcome comes
    /// back as a `BootResult` command.
    fn spawn_boot_sequence(&mut self, handle: &SessionHandle) {
        let (action, payload) = crate::outbound::boot_notification(&self.session);
        let handle = handle.clone();
        let charge_point_id = self.session.identity.charge_point_id.clone();
        tokio::spawn(async move {
            match handle.send_call(action, payload).await {
                Ok(response) => {
                    match serde_json::from_value::<crate::messages::core::BootNotificationResponse>(response) {
                        Ok(parsed) => {
                            let accepted =
                                parsed.status == crate::messages::enums::RegistrationStatus::Accepted;
                            let _ = handle
                                .raw_sender()
                                .send(SessionCommand::BootResult {
                                    accepted,
                                    interval: parsed.interval,
                                })
                                .await;
                        }
                        Err(e) => warn!(error = %e, "malformed BootNotification response"),
                    }
                }
                Err(e) => warn!(%charge_point_id, error = %e, "BootNotification call failed"),
            }
        });
    }

    /// Apply a `BootResult`: adopt the interval and move to `Available`
    /// on acceptance, or log and stay in `Booting` on refusal — the
    /// scheduler's tick loop doesn't retry boot itself, matching a real
    /// charge point waiting for the next reconnect to try again.
    async fn apply_boot_result(&mut self, accepted: bool, interval: u32) {
        if !accepted {
            warn!(
                charge_point_id = %self.session.identity.charge_point_id,
                "BootNotification not accepted"
            );
            return;
        }
        self.session.heartbeat_interval_secs = interval;
        self.session.heartbeat_due_in_secs = interval as f64;
        self.transition(SessionState::Available);
        for connector in self.session.connectors.iter().map(|c| c.connector_id).collect::<Vec<_>>() {
            let (action, payload) = crate::outbound::status_notification(
                connector,
                crate::messages::enums::ChargePointStatus::Available,
            );
            self.fire_and_forget_call(action, payload).await;
        }
    }

    async fn handle_tick(&mut self, elapsed_secs: f64) {
        let before: Vec<_> = self.session.connectors.iter().map(|c| c.status).collect();
        let actions = crate::outbound::tick(&mut self.session, elapsed_secs);
        for (action, payload) in actions {
            self.fire_and_forget_call(action, payload).await;
        }
        self.emit_physics_events();
        self.sync_session_state(&before).await;
    }

    /// Emit one physics event per connector with an active vehicle,
    /// snapshotting SoC/power/energy for the recorder.
    fn emit_physics_events(&self) {
        if !self.recorder.is_active() {
            return;
        }
        for connector in &self.session.connectors {
            let Some(vehicle) = &connector.vehicle else { continue };
            self.recorder.emit(crate::tnr::RecorderEvent {
                timestamp: chrono::Utc::now(),
                charge_point_id: self.session.identity.charge_point_id.clone(),
                kind: crate::tnr::EventKind::Physics,
                action: format!("connector/{}", connector.connector_id),
                direction: None,
                payload: serde_json::json!({
                    "soc": vehicle.soc,
                    "powerW": vehicle.last_power_w,
                    "meterWh": connector.meter_wh,
                }),
            });
        }
    }

    /// Validate eligibility for `startAll`/single-session start (first
    /// free connector when `connector_id` isn't given, or an explicit
    /// one), then hand the real `Authorize -> StartTransaction` CALL
    /// sequence to a task spawned outside this actor's mailbox loop —
    /// awaiting those CALLRESULTs here would deadlock against the very
    /// loop that has to deliver them. `reply` is fulfilled once that
    /// sequence lands (or fails) via `ApplyStartTransaction`.
    fn handle_start_transaction(
        &mut self,
        id_tag: String,
        connector_id: Option<u32>,
        reply: oneshot::Sender<SimResult<()>>,
        handle: &SessionHandle,
    ) {
        let connector_id = match connector_id {
            Some(id) => id,
            None => match self.session.connectors.iter().find(|c| c.transaction.is_none()) {
                Some(c) => c.connector_id,
                None => {
                    let _ = reply.send(Err(SimError::Validation("no free connector".into())));
                    return;
                }
            },
        };
        match self.session.connector(connector_id) {
            Some(connector) if connector.transaction.is_none() => {}
            Some(_) => {
                let _ = reply.send(Err(SimError::Validation(format!(
                    "connector {connector_id} already has an active transaction"
                ))));
                return;
            }
            None => {
                let _ = reply.send(Err(SimError::Validation(format!("no such connector: {connector_id}"))));
                return;
            }
        }
        let meter_start = self.session.connector(connector_id).map(|c| c.meter_wh).unwrap_or(0);
        self.spawn_start_transaction(handle, connector_id, id_tag, meter_start, reply);
    }

    /// Run `Authorize -> StartTransaction` against the CSMS from a task
    /// independent of this actor's own mailbox loop, then feed the
    /// result back in as `ApplyStartTransaction`.
    fn spawn_start_transaction(
        &mut self,
        handle: &SessionHandle,
        connector_id: u32,
        id_tag: String,
        meter_start: i64,
        reply: oneshot::Sender<SimResult<()>>,
    ) {
        let handle = handle.clone();
        tokio::spawn(async move {
            let result: SimResult<i32> = async {
                let (action, payload) = crate::outbound::authorize(&id_tag);
                let response = handle.send_call(action, payload).await?;
                let auth_status = serde_json::from_value::<crate::messages::core::AuthorizeResponse>(response)
                    .map_err(|e| SimError::Protocol(e.to_string()))?
                    .id_tag_info
                    .status;
                if auth_status != crate::messages::enums::AuthorizationStatus::Accepted {
                    return Err(SimError::Validation(format!(
                        "id tag {id_tag} was not accepted: {auth_status:?}"
                    )));
                }
                let (action, payload) = crate::outbound::start_transaction(connector_id, &id_tag, meter_start);
                let response = handle.send_call(action, payload).await?;
                serde_json::from_value::<crate::messages::core::StartTransactionResponse>(response)
                    .map_err(|e| SimError::Protocol(e.to_string()))
                    .map(|r| r.transaction_id)
            }
            .await;

            match result {
                Ok(transaction_id) => {
                    let _ = handle
                        .raw_sender()
                        .send(SessionCommand::ApplyStartTransaction {
                            connector_id,
                            id_tag,
                            meter_start,
                            transaction_id,
                            reply,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    /// Write the CSMS-assigned transaction onto the connector once the
    /// `StartTransaction` CALLRESULT is in hand.
    async fn apply_start_transaction(
        &mut self,
        connector_id: u32,
        id_tag: String,
        meter_start: i64,
        transaction_id: i32,
    ) {
        let before: Vec<_> = self.session.connectors.iter().map(|c| c.status).collect();
        if let Some(connector) = self.session.connector_mut(connector_id) {
            connector.transaction = Some(crate::session::model::Transaction {
                transaction_id,
                connector_id,
                id_tag,
                meter_start_wh: meter_start,
                started_at: chrono::Utc::now(),
                reservation_id: None,
            });
            connector.status = crate::messages::enums::ChargePointStatus::Charging;
            connector.vehicle = Some(crate::physics::vehicle::VehicleState::new(
                60_000.0, 0.3, 0.8, 11_000.0,
            ));
        }
        self.sync_session_state(&before).await;
    }

    /// Stop the transaction on `connector_id`, or the first active
    /// transaction if not given (used by `stopAll`).
    async fn handle_stop_transaction(&mut self, connector_id: Option<u32>) -> SimResult<()> {
        let connector_id = match connector_id {
            Some(id) => id,
            None => self
                .session
                .connectors
                .iter()
                .find(|c| c.transaction.is_some())
                .map(|c| c.connector_id)
                .ok_or_else(|| SimError::Validation("no active transaction".into()))?,
        };

        let before: Vec<_> = self.session.connectors.iter().map(|c| c.status).collect();

        let Some(connector) = self.session.connector_mut(connector_id) else {
            return Err(SimError::Validation(format!("no such connector: {connector_id}")));
        };
        let Some(transaction) = connector.transaction.take() else {
            return Err(SimError::Validation(format!(
                "connector {connector_id} has no active transaction"
            )));
        };
        connector.vehicle = None;
        connector.status = crate::messages::enums::ChargePointStatus::Finishing;
        let meter_stop = connector.meter_wh;

        let (action, payload) = crate::outbound::stop_transaction(
            Some(transaction.id_tag),
            meter_stop,
            transaction.transaction_id,
            crate::messages::enums::StopTransactionReason::Remote,
        );
        self.fire_and_forget_call(action, payload).await;
        self.sync_session_state(&before).await;
        Ok(())
    }
}

/// Translate a resolved (or dropped) pending-call receiver into the
/// `SimResult` callers of [`SessionHandle::send_call`] see.
fn outcome_to_result(
    outcome: Result<crate::pending::CallOutcome, oneshot::error::RecvError>,
) -> SimResult<Value> {
    match outcome {
        Ok(crate::pending::CallOutcome::Result(value)) => Ok(value),
        Ok(crate::pending::CallOutcome::Error {
            error_code,
            error_description,
            ..
        }) => Err(SimError::Protocol(format!("{error_code}: {error_description}"))),
        Ok(crate::pending::CallOutcome::Timeout) => Err(SimError::Timeout),
        Ok(crate::pending::CallOutcome::Cancelled(reason)) => Err(reason),
        Err(_) => Err(SimError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::{SessionIdentity, Transaction};

    /// Build an actor without spawning `run`, so tests can drive its
    /// private methods directly. `self_handle` is wired up the same way
    /// `run` does, minus the reconnect task that `run` itself kicks off.
    fn new_actor() -> (SessionActor, SessionHandle) {
        let identity = SessionIdentity {
            charge_point_id: "CP-1".into(),
            vendor: "Acme".into(),
            model: "X1".into(),
            serial_number: None,
            firmware_version: None,
        };
        let endpoint = Endpoint {
            url: "ws://localhost:9".into(),
            charge_point_id: "CP-1".into(),
            auth_token: None,
        };
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let state_mirror = Arc::new(RwLock::new(SessionState::Disconnected));
        let handle = SessionHandle {
            charge_point_id: "CP-1".into(),
            sender: tx,
            state_mirror: state_mirror.clone(),
        };
        let mut actor = SessionActor {
            session: Session::new(identity, 1),
            endpoint,
            pending: PendingCalls::new(),
            outbound: OutboundQueue::new("CP-1"),
            writer_cancel: None,
            recorder: Arc::new(crate::tnr::NoopRecorder),
            message_log: RingBuffer::default(),
            event_log: RingBuffer::default(),
            mailbox: rx,
            state_mirror: state_mirror.clone(),
            connect_cancel: None,
            self_handle: Some(handle.clone()),
        };
        actor.session.state = SessionState::Charging;
        (actor, handle)
    }

    #[tokio::test]
    async fn hard_reset_aborts_transaction_and_heads_back_to_connecting() {
        let (mut actor, _handle) = new_actor();
        let connector = actor.session.connector_mut(1).unwrap();
        connector.transaction = Some(Transaction {
            transaction_id: 9,
            connector_id: 1,
            id_tag: "TAG1".into(),
            meter_start_wh: 0,
            started_at: chrono::Utc::now(),
            reservation_id: None,
        });
        connector.vehicle = Some(crate::physics::vehicle::VehicleState::new(
            60_000.0, 0.3, 0.8, 11_000.0,
        ));

        actor.perform_reset(crate::messages::enums::ResetType::Hard).await;

        assert!(actor.session.connector(1).unwrap().transaction.is_none());
        assert!(actor.session.connector(1).unwrap().vehicle.is_none());
        assert_eq!(actor.session.state, SessionState::Connecting);
    }

    #[test]
    fn derive_session_state_prefers_charging_over_idle_connectors() {
        let (mut actor, _handle) = new_actor();
        actor.session.state = SessionState::Preparing;
        actor.session.connectors.push(crate::session::model::Connector::new(2));
        actor.session.connector_mut(1).unwrap().status = crate::messages::enums::ChargePointStatus::Charging;
        actor.session.connector_mut(2).unwrap().status = crate::messages::enums::ChargePointStatus::Available;
        assert_eq!(actor.derive_session_state(), SessionState::Charging);
    }

    #[test]
    fn step_toward_hops_through_preparing_to_reach_charging() {
        let (mut actor, _handle) = new_actor();
        actor.session.state = SessionState::Available;
        actor.step_toward(SessionState::Charging);
        assert_eq!(actor.session.state, SessionState::Charging);
    }

    /// A `RemoteStartTransaction` CALLRESULT of `Accepted` doesn't by
    /// itself create a transaction — the actor runs a real
    /// `Authorize`/`StartTransaction` round trip against the CSMS, and
    /// only that CSMS-assigned transaction id lands on the connector.
    /// Driven through the real mailbox loop (`run`), since the
    /// follow-up sequence talks back to the actor over its own handle
    /// and needs that loop actually running to resolve — `Shutdown`
    /// afterwards hands the actor back so the test can inspect it.
    #[tokio::test]
    async fn remote_start_follow_up_runs_authorize_then_start_transaction() {
        let (mut actor, handle) = new_actor();
        actor.session.state = SessionState::Available;
        actor.session.connector_mut(1).unwrap().status = crate::messages::enums::ChargePointStatus::Available;
        let pending = actor.pending.clone();
        let task = tokio::spawn(actor.run(handle.clone()));

        let call = OcppFrame::Call {
            unique_id: "rst-1".into(),
            action: "RemoteStartTransaction".into(),
            payload: serde_json::json!({"connectorId": 1, "idTag": "TAG-OK"}),
        };
        handle
            .raw_sender()
            .send(SessionCommand::InboundText(call.encode()))
            .await
            .unwrap();

        // First call out is Authorize (uniqueId "1"): accept the id tag.
        while !pending.resolve("1", serde_json::json!({"idTagInfo": {"status": "Accepted"}})) {
            tokio::task::yield_now().await;
        }
        // Second call out is StartTransaction (uniqueId "2"): the CSMS
        // assigns transaction id 4242.
        while !pending.resolve(
            "2",
            serde_json::json!({"idTagInfo": {"status": "Accepted"}, "transactionId": 4242}),
        ) {
            tokio::task::yield_now().await;
        }
        // Let the `ApplyStartTransaction` command that the follow-up task
        // sends once it has the CSMS's transaction id work its way
        // through the mailbox before shutting down. Everything here is
        // in-process cooperative scheduling with no real I/O wait, so a
        // generous fixed number of yields reliably drains it.
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }

        handle.shutdown().await;
        let actor = task.await.unwrap();
        let connector = actor.session.connector(1).unwrap();
        let transaction = connector.transaction.as_ref().expect("transaction started");
        assert_eq!(transaction.transaction_id, 4242);
        assert_eq!(connector.status, crate::messages::enums::ChargePointStatus::Charging);
    }

    /// A refused `Authorize` (e.g. `Blocked`) must not start a
    /// transaction even though the `RemoteStartTransaction` itself was
    /// already accepted.
    #[tokio::test]
    async fn remote_start_follow_up_does_not_start_when_authorize_is_refused() {
        let (mut actor, handle) = new_actor();
        actor.session.state = SessionState::Available;
        let pending = actor.pending.clone();
        let task = tokio::spawn(actor.run(handle.clone()));

        let call = OcppFrame::Call {
            unique_id: "rst-1".into(),
            action: "RemoteStartTransaction".into(),
            payload: serde_json::json!({"connectorId": 1, "idTag": "TAG-BLOCKED"}),
        };
        handle
            .raw_sender()
            .send(SessionCommand::InboundText(call.encode()))
            .await
            .unwrap();

        while !pending.resolve("1", serde_json::json!({"idTagInfo": {"status": "Blocked"}})) {
            tokio::task::yield_now().await;
        }
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }

        handle.shutdown().await;
        let actor = task.await.unwrap();
        assert!(actor.session.connector(1).unwrap().transaction.is_none());
    }

    /// A `RemoteStopTransaction` CALLRESULT of `Accepted` runs the real
    /// `StopTransaction` round trip; the connector clears locally as
    /// soon as the CALL is dispatched, without waiting on the CSMS's ack.
    #[tokio::test]
    async fn remote_stop_follow_up_runs_stop_transaction() {
        let (mut actor, handle) = new_actor();
        actor.session.connector_mut(1).unwrap().transaction = Some(Transaction {
            transaction_id: 4242,
            connector_id: 1,
            id_tag: "TAG-OK".into(),
            meter_start_wh: 0,
            started_at: chrono::Utc::now(),
            reservation_id: None,
        });
        actor.session.connector_mut(1).unwrap().status = crate::messages::enums::ChargePointStatus::Charging;
        let task = tokio::spawn(actor.run(handle.clone()));

        let call = OcppFrame::Call {
            unique_id: "rsp-1".into(),
            action: "RemoteStopTransaction".into(),
            payload: serde_json::json!({"transactionId": 4242}),
        };
        handle
            .raw_sender()
            .send(SessionCommand::InboundText(call.encode()))
            .await
            .unwrap();

        handle.shutdown().await;
        let actor = task.await.unwrap();
        assert!(actor.session.connector(1).unwrap().transaction.is_none());
    }

    /// `SendBootNotification` (the registry's `bootAll`/a single session's
    /// manual reboot command) drives the same `spawn_boot_sequence` the
    /// automatic post-connect boot uses: the interval lands on the
    /// session and it moves to `Available` once the CALLRESULT resolves.
    #[tokio::test]
    async fn send_boot_notification_applies_interval_and_moves_to_available() {
        let (mut actor, handle) = new_actor();
        actor.session.state = SessionState::Booting;
        let pending = actor.pending.clone();
        let task = tokio::spawn(actor.run(handle.clone()));

        let (reply, rx) = oneshot::channel();
        handle
            .raw_sender()
            .send(SessionCommand::SendBootNotification { reply })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();

        while !pending.resolve(
            "1",
            serde_json::json!({"status": "Accepted", "currentTime": "2026-01-01T00:00:00Z", "interval": 45}),
        ) {
            tokio::task::yield_now().await;
        }
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }

        handle.shutdown().await;
        let actor = task.await.unwrap();
        assert_eq!(actor.session.state, SessionState::Available);
        assert_eq!(actor.session.heartbeat_interval_secs, 45);
    }
}
