//! Deadline bookkeeping for the blocking facades.

use std::time::{Duration, Instant};

/// Absolute deadline for a timed operation, computed once on entry.
///
/// `None` means the timeout is too large to ever expire (`Duration::MAX`
/// waits forever instead of overflowing).
#[inline]
pub(crate) fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

#[inline]
pub(crate) fn expired(deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => Instant::now() >= deadline,
        None => false,
    }
}

/// Time left until the deadline, saturating at zero. `None` is unbounded.
#[inline]
pub(crate) fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeout_expires_immediately() {
        let deadline = deadline_after(Duration::ZERO);
        assert!(expired(deadline));
    }

    #[test]
    fn max_timeout_never_expires() {
        let deadline = deadline_after(Duration::MAX);
        assert_eq!(deadline, None);
        assert!(!expired(deadline));
        assert_eq!(remaining(deadline), None);
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let deadline = deadline_after(Duration::ZERO);
        assert_eq!(remaining(deadline), Some(Duration::ZERO));
    }
}
