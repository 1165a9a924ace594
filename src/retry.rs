//! Retransmission schedule for the in-flight request
//!
//! RFC 6886 §3.1: the first retransmission happens 250ms after the initial
//! send and every later interval doubles. With the default nine transmissions
//! the ladder waits 250ms, 500ms, 1s ... 64s, so a silent gateway is given up
//! on 127.75s after the first send.

use std::time::Duration;
use tokio::time::Instant;

/// Default delay before the first retransmission
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Default number of transmissions, including the first one
pub const MAX_TRANSMISSIONS: u32 = 9;

/// Shape of the backoff ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    initial_delay: Duration,
    max_transmissions: u32,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(INITIAL_RETRY_DELAY, MAX_TRANSMISSIONS)
    }
}

impl RetrySchedule {
    /// Create a schedule; `max_transmissions` is clamped to at least 1
    pub fn new(initial_delay: Duration, max_transmissions: u32) -> Self {
        Self {
            initial_delay,
            max_transmissions: max_transmissions.max(1),
        }
    }

    /// Number of transmissions before giving up
    pub fn max_transmissions(&self) -> u32 {
        self.max_transmissions
    }

    /// Wait that follows the `transmission`-th send (1-based)
    pub fn delay_after(&self, transmission: u32) -> Duration {
        let factor = 1u32
            .checked_shl(transmission.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    /// Time from the first send until the request fails with a timeout
    pub fn total_duration(&self) -> Duration {
        (1..=self.max_transmissions)
            .map(|n| self.delay_after(n))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Arm a timer for a request whose first transmission happened at `sent_at`
    pub fn arm(&self, sent_at: Instant) -> RetryTimer {
        RetryTimer {
            attempt: 1,
            max_transmissions: self.max_transmissions,
            next_delay: self.initial_delay,
            fire_at: sent_at + self.initial_delay,
            deadline: sent_at + self.total_duration(),
        }
    }
}

/// What to do when a [`RetryTimer`] fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Re-send the same datagram; carries the new transmission count
    Retransmit(u32),
    /// The ladder is exhausted
    GiveUp,
}

/// Backoff state of one in-flight request
#[derive(Debug, Clone)]
pub struct RetryTimer {
    attempt: u32,
    max_transmissions: u32,
    next_delay: Duration,
    fire_at: Instant,
    deadline: Instant,
}

impl RetryTimer {
    /// Transmissions sent so far (at least 1)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Current backoff interval
    pub fn next_delay(&self) -> Duration {
        self.next_delay
    }

    /// When the timer next fires
    pub fn fire_at(&self) -> Instant {
        self.fire_at
    }

    /// Absolute give-up time
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Advance the ladder after the timer fired
    pub fn on_fire(&mut self) -> RetryAction {
        if self.attempt >= self.max_transmissions {
            return RetryAction::GiveUp;
        }

        self.attempt += 1;
        self.next_delay = self.next_delay.saturating_mul(2);
        self.fire_at += self.next_delay;
        RetryAction::Retransmit(self.attempt)
    }
}
