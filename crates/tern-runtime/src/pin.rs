//! Keep-alive bookkeeping.
//!
//! The loop stays alive while the pin count is positive even if every queue is
//! empty. Open listening sockets, in-flight async work and referenced timers
//! all hold pins.

use std::sync::atomic::{AtomicI64, Ordering};

use tracing::{debug, warn};

use crate::error::LoopError;
use crate::poller::Waker;

/// Atomic count of reasons to keep the loop alive.
#[derive(Debug)]
pub struct PinCounter {
    count: AtomicI64,
    waker: Waker,
    strict: bool,
}

impl PinCounter {
    pub(crate) fn new(waker: Waker, strict: bool) -> Self {
        Self {
            count: AtomicI64::new(0),
            waker,
            strict,
        }
    }

    /// Add a pin. Returns the new count.
    pub fn pin(&self) -> i64 {
        let current = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Pin count is now {}", current);
        if current == 1 {
            self.waker.wake();
        }
        current
    }

    /// Release a pin. Returns the new count.
    ///
    /// Reaching zero wakes the poller so the loop re-evaluates its exit
    /// condition without waiting out the current timeout. In strict mode an
    /// unpaired call is refused and reported; otherwise it is logged and the
    /// count goes negative, which the loop treats as unpinned.
    pub fn unpin(&self) -> Result<i64, LoopError> {
        let current = if self.strict {
            match self
                .count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| (c > 0).then(|| c - 1))
            {
                Ok(previous) => previous - 1,
                Err(previous) => {
                    warn!("Refusing unpaired unpin, pin count is {}", previous);
                    return Err(LoopError::PinUnderflow(previous - 1));
                }
            }
        } else {
            self.count.fetch_sub(1, Ordering::SeqCst) - 1
        };

        debug!("Pin count is now {}", current);
        if current < 0 {
            warn!("Negative pin count: {}", current);
        }
        if current == 0 {
            self.waker.wake();
        }
        Ok(current)
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_pinned(&self) -> bool {
        self.count() > 0
    }

    /// Release a pin on behalf of internal bookkeeping, where an underflow
    /// can only come from a caller mixing manual unpins with managed ones.
    pub(crate) fn release(&self) {
        if let Err(e) = self.unpin() {
            debug!("Ignoring managed pin release: {}", e);
        }
    }
}

const PIN_REQUESTED: u8 = 0x01;
const PIN_ALLOWED: u8 = 0x02;
const PINNABLE: u8 = PIN_REQUESTED | PIN_ALLOWED;

/// Pin state of one pinnable object (a socket, a timer, a child process).
///
/// The object pins the loop only while it has requested a pin *and* has not
/// been unref'd. Transitions into and out of that state add or release
/// exactly one pin on the counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinState {
    flags: u8,
    request_count: u32,
}

impl Default for PinState {
    fn default() -> Self {
        Self {
            flags: PIN_ALLOWED,
            request_count: 0,
        }
    }
}

impl PinState {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&mut self, flags: u8, pins: &PinCounter) {
        if self.flags != PINNABLE && flags == PINNABLE {
            pins.pin();
        } else if self.flags == PINNABLE && flags != PINNABLE {
            pins.release();
        }
        self.flags = flags;
    }

    /// Clear a previous unref, pinning again if a pin was requested.
    pub fn ref_(&mut self, pins: &PinCounter) {
        self.update(self.flags | PIN_ALLOWED, pins);
    }

    /// Never pin, releasing the pin if one is held.
    pub fn unref(&mut self, pins: &PinCounter) {
        self.update(self.flags & !PIN_ALLOWED, pins);
    }

    pub fn request_pin(&mut self, pins: &PinCounter) {
        self.update(self.flags | PIN_REQUESTED, pins);
    }

    pub fn clear_pin(&mut self, pins: &PinCounter) {
        self.update(self.flags & !PIN_REQUESTED, pins);
    }

    pub fn increment_pin_request(&mut self, pins: &PinCounter) {
        if self.request_count == 0 {
            self.request_pin(pins);
        }
        self.request_count += 1;
    }

    pub fn decrement_pin_request(&mut self, pins: &PinCounter) {
        self.request_count = self.request_count.saturating_sub(1);
        if self.request_count == 0 {
            self.clear_pin(pins);
        }
    }

    /// Whether this object currently holds a pin.
    pub fn is_pinning(&self) -> bool {
        self.flags == PINNABLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Multiplexer;

    fn counter(strict: bool) -> PinCounter {
        let mux = Multiplexer::new(4).unwrap();
        PinCounter::new(mux.waker(), strict)
    }

    #[test]
    fn test_pin_unpin_pairs() {
        let pins = counter(false);
        assert_eq!(pins.pin(), 1);
        assert_eq!(pins.pin(), 2);
        assert!(pins.is_pinned());
        assert_eq!(pins.unpin().unwrap(), 1);
        assert_eq!(pins.unpin().unwrap(), 0);
        assert!(!pins.is_pinned());
    }

    #[test]
    fn test_lenient_unpin_goes_negative() {
        let pins = counter(false);
        assert_eq!(pins.unpin().unwrap(), -1);
        assert!(!pins.is_pinned());
        assert_eq!(pins.pin(), 0);
    }

    #[test]
    fn test_strict_unpin_refuses_underflow() {
        let pins = counter(true);
        let err = pins.unpin().unwrap_err();
        assert!(matches!(err, LoopError::PinUnderflow(-1)));
        assert_eq!(pins.count(), 0);

        pins.pin();
        assert_eq!(pins.unpin().unwrap(), 0);
    }

    #[test]
    fn test_pin_state_ref_unref() {
        let pins = counter(false);
        let mut state = PinState::new();

        state.request_pin(&pins);
        assert!(state.is_pinning());
        assert_eq!(pins.count(), 1);

        state.unref(&pins);
        assert!(!state.is_pinning());
        assert_eq!(pins.count(), 0);

        // A second unref is a no-op.
        state.unref(&pins);
        assert_eq!(pins.count(), 0);

        state.ref_(&pins);
        assert_eq!(pins.count(), 1);

        state.clear_pin(&pins);
        assert_eq!(pins.count(), 0);
    }

    #[test]
    fn test_pin_state_request_counting() {
        let pins = counter(false);
        let mut state = PinState::new();

        state.increment_pin_request(&pins);
        state.increment_pin_request(&pins);
        assert_eq!(pins.count(), 1);

        state.decrement_pin_request(&pins);
        assert_eq!(pins.count(), 1);
        state.decrement_pin_request(&pins);
        assert_eq!(pins.count(), 0);
    }
}
