//! Concurrent OCPP 1.6-J charge point fleet simulator.
//!
//! Each simulated charge point is an independent [`session`] actor: it
//! owns a [`transport`] connection to a CSMS, a [`pending`] table of
//! in-flight calls, and a charging [`physics`] model for any connector
//! mid-transaction. The [`registry`] tracks the fleet of running
//! sessions; the [`scheduler`] drives their periodic work.

pub mod backoff;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod frame;
pub mod messages;
pub mod outbound;
pub mod pending;
pub mod physics;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod smart_charging;
pub mod tnr;
pub mod transport;
