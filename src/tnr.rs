//! Non-regression recording hook: an observer interface the session
//! actor calls after committing every decoded/encoded OCPP frame and
//! every state transition, forwarding a timestamped event to whatever
//! external sink is attached. Buffering, persistence, signature
//! computation, and scenario comparison live outside this crate — the
//! core only owns start/stop/isActive and the `emit` hook itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;

/// The three event families a recording window observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A decoded/encoded OCPP-J frame.
    Ocpp,
    /// A session-level state transition.
    Session,
    /// A physics tick outcome for one connector.
    Physics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Sent,
    Received,
}

/// One timestamped event forwarded to the attached recorder while a
/// recording window is active.
#[derive(Debug, Clone)]
pub struct RecorderEvent {
    pub timestamp: DateTime<Utc>,
    pub charge_point_id: String,
    pub kind: EventKind,
    pub action: String,
    pub direction: Option<FrameDirection>,
    pub payload: Value,
}

/// Observes events flowing through a session. Implementors must be
/// cheap to call on every message — this runs inline in the session
/// actor's hot path, gated by `is_active` so a non-recording session
/// pays only a vtable call.
pub trait Recorder: Send + Sync {
    fn emit(&self, event: RecorderEvent);
    fn start(&self);
    fn stop(&self);
    fn is_active(&self) -> bool;
}

/// The default recorder: does nothing, always reports inactive.
pub struct NoopRecorder;

impl Recorder for NoopRecorder {
    fn emit(&self, _event: RecorderEvent) {}
    fn start(&self) {}
    fn stop(&self) {}
    fn is_active(&self) -> bool {
        false
    }
}

/// A recorder that buffers every event in memory while active, for
/// after-the-fact inspection or export into a non-regression fixture.
pub struct BufferingRecorder {
    active: AtomicBool,
    events: Mutex<Vec<RecorderEvent>>,
}

impl BufferingRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<RecorderEvent> {
        self.events.lock().expect("recorder mutex poisoned").clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().expect("recorder mutex poisoned").len()
    }
}

impl Recorder for BufferingRecorder {
    fn emit(&self, event: RecorderEvent) {
        if !self.is_active() {
            return;
        }
        self.events.lock().expect("recorder mutex poisoned").push(event);
    }

    fn start(&self) {
        self.events.lock().expect("recorder mutex poisoned").clear();
        self.active.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind, action: &str) -> RecorderEvent {
        RecorderEvent {
            timestamp: Utc::now(),
            charge_point_id: "CP-1".into(),
            kind,
            action: action.into(),
            direction: Some(FrameDirection::Sent),
            payload: json!({}),
        }
    }

    #[test]
    fn noop_recorder_is_never_active() {
        let recorder = NoopRecorder;
        recorder.emit(event(EventKind::Ocpp, "Heartbeat"));
        assert!(!recorder.is_active());
    }

    #[test]
    fn buffering_recorder_only_captures_while_active() {
        let recorder = BufferingRecorder::new();
        recorder.emit(event(EventKind::Ocpp, "ignored"));
        recorder.start();
        recorder.emit(event(EventKind::Ocpp, "captured"));
        recorder.emit(event(EventKind::Session, "Available"));
        recorder.stop();
        recorder.emit(event(EventKind::Ocpp, "ignored-again"));

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, "captured");
        assert_eq!(events[1].kind, EventKind::Session);
    }

    #[test]
    fn starting_again_clears_the_previous_window() {
        let recorder = BufferingRecorder::new();
        recorder.start();
        recorder.emit(event(EventKind::Physics, "tick"));
        recorder.stop();
        recorder.start();
        assert_eq!(recorder.event_count(), 0);
    }
}
