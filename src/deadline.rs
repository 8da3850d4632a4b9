//! Per-request deadlines.
//!
//! Every external request carries a deadline. Engine operations check it
//! at each blocking point (buffer acquisition, immutable-queue waits,
//! table reads) and fail with a timeout once it has passed. Commit-log
//! appends already in a buffer are not cancellable; the deadline only
//! governs whether the caller keeps waiting.

use std::time::{Duration, Instant};

/// An optional point in time after which an operation should give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never expires.
    pub fn none() -> Self {
        Deadline(None)
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline(Some(Instant::now() + timeout))
    }

    /// A deadline at an absolute instant.
    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        match self.0 {
            Some(t) => Instant::now() >= t,
            None => false,
        }
    }

    /// Time remaining, clamped to `fallback` when unbounded.
    ///
    /// Blocking waits use this to pick a `Condvar`/channel timeout: a
    /// bounded deadline waits exactly as long as it has left, an unbounded
    /// one polls at `fallback` granularity.
    pub fn remaining_or(&self, fallback: Duration) -> Duration {
        match self.0 {
            Some(t) => t.saturating_duration_since(Instant::now()),
            None => fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_never_expires() {
        let d = Deadline::none();
        assert!(!d.expired());
        assert_eq!(d.remaining_or(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn past_deadline_is_expired() {
        let d = Deadline::at(Instant::now() - Duration::from_millis(1));
        assert!(d.expired());
        assert_eq!(d.remaining_or(Duration::from_secs(5)), Duration::ZERO);
    }

    #[test]
    fn future_deadline_is_live() {
        let d = Deadline::after(Duration::from_secs(60));
        assert!(!d.expired());
        assert!(d.remaining_or(Duration::ZERO) > Duration::from_secs(59));
    }
}
