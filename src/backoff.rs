//! Reconnect backoff state.
//!
//! Transient connection failures are retried with exponential backoff:
//! delays start at a floor, double on each consecutive failure, and clamp
//! at a cap. Any success resets the sequence to the floor. The backoff is
//! an explicit value carried by the retry loop, not control flow hidden in
//! nested error handling.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Backoff {
    floor: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            floor,
            cap,
            current: floor,
        }
    }

    /// Delay to sleep for the failure just observed. Doubles the next delay,
    /// clamped at the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Reset to the floor. Called on any success.
    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}
