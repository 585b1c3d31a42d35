//! Per-unit wall-clock budget.
//!
//! The loop arms the watchdog before every dispatched unit and disarms it
//! afterwards. It never interrupts anything itself; guest code or an engine
//! binding polls [`Scope::check_time_limit`](crate::Scope::check_time_limit).

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{GuestResult, ScriptError, Throw};

#[derive(Debug, Default)]
pub(crate) struct Watchdog {
    limit: Option<Duration>,
    deadline: Option<Instant>,
}

impl Watchdog {
    pub(crate) fn new(limit: Option<Duration>) -> Self {
        Self {
            limit,
            deadline: None,
        }
    }

    pub(crate) fn arm(&mut self, now: Instant) {
        self.deadline = self.limit.map(|limit| now + limit);
    }

    pub(crate) fn disarm(&mut self) {
        self.deadline = None;
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    pub(crate) fn check(&self) -> GuestResult {
        if self.is_expired(Instant::now()) {
            debug!("Script time limit of {:?} exceeded", self.limit);
            return Err(Throw::Exception(ScriptError::timeout()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_expires() {
        let mut watchdog = Watchdog::new(None);
        let now = Instant::now();
        watchdog.arm(now);
        assert!(!watchdog.is_expired(now + Duration::from_secs(3600)));
        assert!(watchdog.check().is_ok());
    }

    #[test]
    fn test_expires_after_limit() {
        let mut watchdog = Watchdog::new(Some(Duration::from_millis(10)));
        let now = Instant::now();
        watchdog.arm(now);
        assert!(!watchdog.is_expired(now + Duration::from_millis(5)));
        assert!(watchdog.is_expired(now + Duration::from_millis(10)));

        watchdog.disarm();
        assert!(!watchdog.is_expired(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_check_raises_timeout() {
        let mut watchdog = Watchdog::new(Some(Duration::from_millis(1)));
        watchdog.arm(Instant::now() - Duration::from_millis(5));
        match watchdog.check() {
            Err(Throw::Exception(err)) => assert!(err.is_timeout()),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
