//! Per-session outbound backpressure queue.
//!
//! Sits between frame production (the session's mailbox loop, via
//! [`crate::session::actor::SessionActor::send_frame`]) and the actual
//! socket write, which a dedicated writer task drains. Decoupling the
//! two means a stalled write never blocks the mailbox from continuing
//! to tick physics, answer CSMS CALLs, or accept new commands.
//!
//! Bounded at [`CAPACITY`] frames with a small, named policy: a
//! `Heartbeat` already queued is replaced rather than duplicated (never
//! more than one outstanding); once full, the oldest `MeterValues`
//! frame is evicted to make room for the newest one. Everything else —
//! Boot/Authorize/Start/Stop/StatusNotification CALLs, and every
//! CALLRESULT/CALLERROR reply to the CSMS — is `Critical` and is never
//! dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use crate::frame::OcppFrame;

pub const CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Heartbeat,
    MeterValues,
    Critical,
}

impl FrameKind {
    /// Classify an already-encoded frame by the backpressure policy's
    /// three buckets. A CALLRESULT/CALLERROR is always `Critical`: it
    /// answers a CSMS-initiated command and dropping it would leave the
    /// CSMS's request unanswered.
    pub fn classify(frame: &OcppFrame) -> Self {
        match frame {
            OcppFrame::Call { action, .. } => match action.as_str() {
                "Heartbeat" => Self::Heartbeat,
                "MeterValues" => Self::MeterValues,
                _ => Self::Critical,
            },
            OcppFrame::CallResult { .. } | OcppFrame::CallError { .. } => Self::Critical,
        }
    }
}

struct QueuedFrame {
    text: String,
    kind: FrameKind,
}

struct Inner {
    queue: Mutex<VecDeque<QueuedFrame>>,
    notify: Notify,
}

/// Cheaply cloneable handle shared between the mailbox loop (which
/// pushes) and the writer task (which pops).
#[derive(Clone)]
pub struct OutboundQueue {
    inner: Arc<Inner>,
    charge_point_id: Arc<str>,
}

impl OutboundQueue {
    pub fn new(charge_point_id: impl Into<Arc<str>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
            charge_point_id: charge_point_id.into(),
        }
    }

    /// Enqueue one frame, applying the coalesce/eviction policy.
    pub fn push(&self, text: String, kind: FrameKind) {
        let mut queue = self.inner.queue.lock().expect("outbound queue poisoned");
        if kind == FrameKind::Heartbeat {
            if let Some(pos) = queue.iter().position(|f| f.kind == FrameKind::Heartbeat) {
                queue.remove(pos);
            }
        } else if queue.len() >= CAPACITY {
            if let Some(pos) = queue.iter().position(|f| f.kind == FrameKind::MeterValues) {
                queue.remove(pos);
                warn!(
                    charge_point_id = %self.charge_point_id,
                    "outbound queue at capacity, dropped oldest MeterValues frame"
                );
            }
        }
        queue.push_back(QueuedFrame { text, kind });
        drop(queue);
        self.inner.notify.notify_one();
    }

    /// Wait for and remove the next frame, in FIFO order.
    pub async fn pop(&self) -> String {
        loop {
            {
                let mut queue = self.inner.queue.lock().expect("outbound queue poisoned");
                if let Some(frame) = queue.pop_front() {
                    return frame.text;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    /// Drop everything queued, e.g. on transport close — a fresh
    /// connection starts a fresh BootNotification sequence, so frames
    /// queued against the old one are stale.
    pub fn clear(&self) {
        self.inner.queue.lock().expect("outbound queue poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().expect("outbound queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(action: &str) -> OcppFrame {
        OcppFrame::Call {
            unique_id: "1".into(),
            action: action.into(),
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn heartbeat_never_more_than_one_queued() {
        let q = OutboundQueue::new("CP-1");
        q.push("hb1".into(), FrameKind::classify(&call("Heartbeat")));
        q.push("hb2".into(), FrameKind::classify(&call("Heartbeat")));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn coalesced_heartbeat_keeps_latest() {
        let q = OutboundQueue::new("CP-1");
        q.push("hb1".into(), FrameKind::Heartbeat);
        q.push("hb2".into(), FrameKind::Heartbeat);
        assert_eq!(q.pop().await, "hb2");
    }

    #[test]
    fn meter_values_dropped_at_capacity() {
        let q = OutboundQueue::new("CP-1");
        for i in 0..CAPACITY {
            q.push(format!("mv{i}"), FrameKind::MeterValues);
        }
        assert_eq!(q.len(), CAPACITY);
        q.push("mv-newest".into(), FrameKind::MeterValues);
        assert_eq!(q.len(), CAPACITY);
    }

    #[tokio::test]
    async fn meter_values_eviction_drops_oldest_first() {
        let q = OutboundQueue::new("CP-1");
        for i in 0..CAPACITY {
            q.push(format!("mv{i}"), FrameKind::MeterValues);
        }
        q.push("mv-newest".into(), FrameKind::MeterValues);
        assert_eq!(q.pop().await, "mv1");
    }

    #[test]
    fn critical_frames_never_dropped_even_at_capacity() {
        let q = OutboundQueue::new("CP-1");
        for i in 0..CAPACITY {
            q.push(format!("mv{i}"), FrameKind::MeterValues);
        }
        for i in 0..10 {
            q.push(format!("status{i}"), FrameKind::Critical);
        }
        assert_eq!(q.len(), CAPACITY + 10);
    }

    #[test]
    fn clear_empties_the_queue() {
        let q = OutboundQueue::new("CP-1");
        q.push("a".into(), FrameKind::Critical);
        q.push("b".into(), FrameKind::MeterValues);
        q.clear();
        assert!(q.is_empty());
    }

    #[test]
    fn classify_recognizes_action_names() {
        assert_eq!(FrameKind::classify(&call("Heartbeat")), FrameKind::Heartbeat);
        assert_eq!(FrameKind::classify(&call("MeterValues")), FrameKind::MeterValues);
        assert_eq!(FrameKind::classify(&call("BootNotification")), FrameKind::Critical);
        assert_eq!(
            FrameKind::classify(&OcppFrame::CallResult {
                unique_id: "1".into(),
                payload: serde_json::json!({})
            }),
            FrameKind::Critical
        );
    }
}
