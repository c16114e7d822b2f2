//! One-shot timeout service
//!
//! A fixed-capacity pool of one-shot timers, identified by handle. The pool
//! holds the current time, advanced by [`Node::process`](crate::Node),
//! so slots can arm relative timeouts without threading a clock through
//! every call.

use snafu::Snafu;

/// Number of timer entries in a pool
///
/// One armed timer per client slot is the steady-state maximum; the extra
/// headroom covers the cancel/create sequence used when a timeout is
/// refreshed.
const POOL_SIZE: usize = 16;

/// Identifies an armed timer in a [`TimerPool`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimerHandle(u8);

/// Error type for timer pool operations
#[derive(Clone, Copy, Debug, PartialEq, Snafu)]
pub enum TimerError {
    /// All timer entries are in use
    Exhausted,
    /// The handle does not refer to an armed timer
    StaleHandle,
}

/// A pool of one-shot millisecond timers
#[derive(Debug, Default)]
pub struct TimerPool {
    /// Expiry time in ms for each armed entry
    deadlines: [Option<u64>; POOL_SIZE],
    now_ms: u64,
}

impl TimerPool {
    pub const fn new() -> Self {
        Self {
            deadlines: [None; POOL_SIZE],
            now_ms: 0,
        }
    }

    /// Advance the pool's notion of the current time
    ///
    /// Time never moves backwards; a stale `now_ms` is ignored.
    pub fn advance(&mut self, now_ms: u64) {
        if now_ms > self.now_ms {
            self.now_ms = now_ms;
        }
    }

    /// Arm a one-shot timer expiring `timeout_ms` from now
    pub fn create(&mut self, timeout_ms: u32) -> Result<TimerHandle, TimerError> {
        let slot = self
            .deadlines
            .iter()
            .position(|d| d.is_none())
            .ok_or(TimerError::Exhausted)?;
        self.deadlines[slot] = Some(self.now_ms + timeout_ms as u64);
        Ok(TimerHandle(slot as u8))
    }

    /// Disarm a timer
    pub fn cancel(&mut self, handle: TimerHandle) -> Result<(), TimerError> {
        let entry = self
            .deadlines
            .get_mut(handle.0 as usize)
            .ok_or(TimerError::StaleHandle)?;
        if entry.take().is_none() {
            return Err(TimerError::StaleHandle);
        }
        Ok(())
    }

    /// Check whether an armed timer has expired
    ///
    /// Returns false for stale handles; expired timers stay armed until
    /// cancelled so the caller decides when to consume the event.
    pub fn expired(&self, handle: TimerHandle) -> bool {
        match self.deadlines.get(handle.0 as usize) {
            Some(Some(deadline)) => *deadline <= self.now_ms,
            _ => false,
        }
    }
}
