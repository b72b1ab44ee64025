//! Scheduler: drives each session's periodic work — heartbeat and
//! meter-value timing, physics stepping, reservation expiry — by
//! sending fixed-cadence ticks into the session's mailbox. The
//! session itself decides what, if anything, a given tick produces;
//! the scheduler only supplies wall-clock cadence.

use std::time::Duration;

use tokio::time::interval;
use tracing::debug;

use crate::session::SessionHandle;

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn the tick loop for one session. Returns a handle to the
/// spawned task so callers can abort it on session teardown.
pub fn spawn_tick_loop(handle: SessionHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(TICK_INTERVAL);
        let elapsed_secs = TICK_INTERVAL.as_secs_f64();
        loop {
            ticker.tick().await;
            if handle.tick(elapsed_secs).await.is_err() {
                debug!(
                    charge_point_id = %handle.charge_point_id,
                    "session actor gone, stopping tick loop"
                );
                break;
            }
        }
    })
}
