//! Wake-holds keep the host from suspending while a script runs.
//!
//! The platform owns the timeout: a hold that outlives it simply stops being
//! held, and the run carries on.

use std::time::{Duration, Instant};

pub const WAKE_HOLD_TAG: &str = "tagsh::executing";

pub trait WakeHold: Send {
    fn acquire(&mut self, timeout: Duration);
    fn is_held(&self) -> bool;
    fn release(&mut self);
}

pub trait PowerManager: Send + Sync {
    fn new_wake_hold(&self, tag: &str) -> Box<dyn WakeHold>;
}

/// Hands out holds that never report held. Used where the host has no
/// suspend control.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPower;

impl PowerManager for NoPower {
    fn new_wake_hold(&self, _tag: &str) -> Box<dyn WakeHold> {
        Box::new(NoHold)
    }
}

struct NoHold;

impl WakeHold for NoHold {
    fn acquire(&mut self, _timeout: Duration) {}

    fn is_held(&self) -> bool {
        false
    }

    fn release(&mut self) {}
}

/// In-process holds that expire at their deadline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimedPower;

impl PowerManager for TimedPower {
    fn new_wake_hold(&self, tag: &str) -> Box<dyn WakeHold> {
        Box::new(TimedWakeHold::new(tag))
    }
}

#[derive(Debug)]
pub struct TimedWakeHold {
    tag: String,
    held: bool,
    /// `None` while held means the timeout is too far out to represent.
    deadline: Option<Instant>,
}

impl TimedWakeHold {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            held: false,
            deadline: None,
        }
    }
}

impl WakeHold for TimedWakeHold {
    fn acquire(&mut self, timeout: Duration) {
        self.held = true;
        self.deadline = Instant::now().checked_add(timeout);
        tracing::debug!(tag = %self.tag, timeout_secs = timeout.as_secs(), "wake-hold acquired");
    }

    fn is_held(&self) -> bool {
        self.held && self.deadline.is_none_or(|d| Instant::now() < d)
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.held) {
            self.deadline = None;
            tracing::debug!(tag = %self.tag, "wake-hold released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_hold_expires_silently() {
        let mut hold = TimedPower.new_wake_hold(WAKE_HOLD_TAG);
        assert!(!hold.is_held());
        hold.acquire(Duration::from_millis(20));
        assert!(hold.is_held());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!hold.is_held());
        hold.release();
        assert!(!hold.is_held());
    }

    #[test]
    fn release_drops_the_hold() {
        let mut hold = TimedWakeHold::new("test");
        hold.acquire(Duration::from_secs(60));
        assert!(hold.is_held());
        hold.release();
        assert!(!hold.is_held());
    }

    #[test]
    fn unrepresentable_timeout_holds_until_release() {
        let mut hold = TimedWakeHold::new("test");
        hold.acquire(Duration::MAX);
        assert!(hold.is_held());
        hold.release();
        assert!(!hold.is_held());
    }

    #[test]
    fn no_power_never_holds() {
        let mut hold = NoPower.new_wake_hold(WAKE_HOLD_TAG);
        hold.acquire(Duration::from_secs(60));
        assert!(!hold.is_held());
    }
}
