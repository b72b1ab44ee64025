//! Exponential backoff with jitter for session reconnect, adapted from
//! the retry helper's shape: a small stateful struct rather than a
//! one-shot retry wrapper, since reconnects span the whole session
//! lifetime rather than a single call.

use std::time::Duration;

use rand::Rng;

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);
const JITTER_FRACTION: f64 = 0.2;

/// Tracks the current reconnect delay for one session. `next()` doubles
/// the delay (capped at 30s) and applies up to ±20% jitter so a fleet
/// of sessions reconnecting after a shared outage doesn't all retry in
/// lockstep.
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: INITIAL_DELAY,
        }
    }

    /// Reset to the initial delay, called after a successful connect.
    pub fn reset(&mut self) {
        self.current = INITIAL_DELAY;
    }

    /// Return the delay to wait before the next attempt, with jitter
    /// applied, then advance the internal state for the attempt after.
    pub fn next(&mut self) -> Duration {
        let jittered = apply_jitter(self.current);
        self.current = (self.current * 2).min(MAX_DELAY);
        jittered
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_jitter(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_cap() {
        let mut backoff = Backoff::new();
        let mut prev = backoff.next();
        for _ in 0..10 {
            let delay = backoff.next();
            assert!(delay <= MAX_DELAY + MAX_DELAY.mul_f64(JITTER_FRACTION));
            prev = delay;
        }
        let _ = prev;
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new();
        backoff.next();
        backoff.next();
        backoff.reset();
        let delay = backoff.next();
        assert!(delay <= INITIAL_DELAY + INITIAL_DELAY.mul_f64(JITTER_FRACTION));
        assert!(delay >= INITIAL_DELAY - INITIAL_DELAY.mul_f64(JITTER_FRACTION));
    }
}
