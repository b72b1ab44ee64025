//! Per-session actor: owns the session's mutable state exclusively,
//! serializing every mutation through its mailbox so state transitions
//! never race across the transport read loop, the scheduler, and
//! dispatcher-triggered side effects.

pub mod actor;
pub mod buffers;
pub mod model;
pub mod outbound_queue;
pub mod state;

pub use actor::{SessionActor, SessionCommand, SessionHandle};
pub use model::{Connector, Session, SessionIdentity, Transaction};
pub use state::SessionState;
