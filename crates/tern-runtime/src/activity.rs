//! Activities: scheduled units of deferred work.
//!
//! An [`Activity`] owns its payload and travels through exactly one queue at a
//! time. Its mutable cross-thread state (the cancellation bit and, for timers,
//! the keep-alive pin) lives in an [`ActivityRegistry`] keyed by id, so a
//! handle held on another thread never touches the queued record itself.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;

use crate::domain::DomainRef;
use crate::error::GuestResult;
use crate::pin::{PinCounter, PinState};
use crate::scheduler::Shared;
use crate::scope::Scope;

/// Stable identifier, unique per loop and increasing in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivityId(pub(crate) u64);

impl ActivityId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActivityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What scheduled the activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    /// Timer queue entry, one-shot or repeating.
    Timer,
    /// Deferred callback enqueued by guest code on the loop thread.
    Callback,
    /// Generic task submitted through a `LoopHandle`, possibly from another thread.
    Task,
}

/// One-shot payload.
pub type TaskFn = Box<dyn FnOnce(&mut Scope<'_>) -> GuestResult + Send>;

/// Timer payload; repeating timers call it once per firing.
pub type TimerFn = Box<dyn FnMut(&mut Scope<'_>) -> GuestResult + Send>;

pub(crate) enum Payload {
    Once(TaskFn),
    Repeat(TimerFn),
    Spent,
}

pub(crate) struct Activity {
    pub(crate) id: ActivityId,
    pub(crate) kind: ActivityKind,
    pub(crate) fire_at: Instant,
    /// Set for repeating timers, always non-zero.
    pub(crate) interval: Option<Duration>,
    pub(crate) domain: Option<DomainRef>,
    pub(crate) tick_depth: u32,
    pub(crate) payload: Payload,
}

impl Activity {
    pub(crate) fn task(
        id: ActivityId,
        kind: ActivityKind,
        payload: TaskFn,
        domain: Option<DomainRef>,
        tick_depth: u32,
    ) -> Self {
        Self {
            id,
            kind,
            fire_at: Instant::now(),
            interval: None,
            domain,
            tick_depth,
            payload: Payload::Once(payload),
        }
    }

    pub(crate) fn timer(
        id: ActivityId,
        fire_at: Instant,
        interval: Option<Duration>,
        payload: TimerFn,
        domain: Option<DomainRef>,
        tick_depth: u32,
    ) -> Self {
        Self {
            id,
            kind: ActivityKind::Timer,
            fire_at,
            interval,
            domain,
            tick_depth,
            payload: Payload::Repeat(payload),
        }
    }

    /// Run the payload. One-shot payloads are consumed; repeating ones are
    /// kept for the next firing.
    pub(crate) fn run(&mut self, scope: &mut Scope<'_>) -> GuestResult {
        match std::mem::replace(&mut self.payload, Payload::Spent) {
            Payload::Once(f) => f(scope),
            Payload::Repeat(mut f) => {
                let result = f(scope);
                self.payload = Payload::Repeat(f);
                result
            }
            Payload::Spent => Ok(()),
        }
    }
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("fire_at", &self.fire_at)
            .field("interval", &self.interval)
            .field("domain", &self.domain)
            .field("tick_depth", &self.tick_depth)
            .finish_non_exhaustive()
    }
}

struct ActivityEntry {
    cancelled: bool,
    pin: PinState,
}

/// Cross-thread state of every activity that has not been retired yet.
#[derive(Default)]
pub(crate) struct ActivityRegistry {
    live: DashMap<ActivityId, ActivityEntry>,
}

impl ActivityRegistry {
    pub(crate) fn track(&self, id: ActivityId, kind: ActivityKind, pins: &PinCounter) {
        let mut entry = ActivityEntry {
            cancelled: false,
            pin: PinState::new(),
        };
        // Armed timers keep the loop alive until they fire, are cancelled or unref'd.
        if kind == ActivityKind::Timer {
            entry.pin.request_pin(pins);
        }
        self.live.insert(id, entry);
    }

    /// Flip the cancellation bit. Returns false if the activity was already
    /// cancelled or retired.
    pub(crate) fn cancel(&self, id: ActivityId, pins: &PinCounter) -> bool {
        let Some(mut entry) = self.live.get_mut(&id) else {
            return false;
        };
        if entry.cancelled {
            return false;
        }
        entry.cancelled = true;
        entry.pin.clear_pin(pins);
        trace!("Cancelled activity {}", id);
        true
    }

    pub(crate) fn is_cancelled(&self, id: ActivityId) -> bool {
        self.live.get(&id).map(|e| e.cancelled).unwrap_or(false)
    }

    pub(crate) fn is_live(&self, id: ActivityId) -> bool {
        self.live.contains_key(&id)
    }

    pub(crate) fn set_ref(&self, id: ActivityId, referenced: bool, pins: &PinCounter) {
        if let Some(mut entry) = self.live.get_mut(&id) {
            if referenced {
                entry.pin.ref_(pins);
            } else {
                entry.pin.unref(pins);
            }
        }
    }

    /// Forget an activity that will not run again, releasing its pin.
    pub(crate) fn retire(&self, id: ActivityId, pins: &PinCounter) {
        if let Some((_, mut entry)) = self.live.remove(&id) {
            entry.pin.clear_pin(pins);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }
}

/// Thread-safe handle to a submitted activity.
#[derive(Clone)]
pub struct ActivityHandle {
    id: ActivityId,
    kind: ActivityKind,
    shared: Arc<Shared>,
}

impl ActivityHandle {
    pub(crate) fn new(id: ActivityId, kind: ActivityKind, shared: Arc<Shared>) -> Self {
        Self { id, kind, shared }
    }

    pub fn id(&self) -> ActivityId {
        self.id
    }

    pub fn kind(&self) -> ActivityKind {
        self.kind
    }

    /// Cancel the activity. Idempotent. Removal from the timer queue is lazy;
    /// a cancel racing with an in-flight firing may let that firing complete.
    pub fn cancel(&self) {
        self.shared.cancel(self.id);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.activities.is_cancelled(self.id)
    }

    /// Whether the activity may still run.
    pub fn is_pending(&self) -> bool {
        self.shared.activities.is_live(self.id) && !self.is_cancelled()
    }

    /// Choose whether an armed timer keeps the loop alive.
    pub fn set_ref(&self, referenced: bool) {
        self.shared
            .activities
            .set_ref(self.id, referenced, &self.shared.pins);
    }
}

impl fmt::Debug for ActivityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Multiplexer;

    fn pins() -> PinCounter {
        PinCounter::new(Multiplexer::new(4).unwrap().waker(), false)
    }

    #[test]
    fn test_timer_tracking_pins_until_retired() {
        let pins = pins();
        let registry = ActivityRegistry::default();

        registry.track(ActivityId(1), ActivityKind::Timer, &pins);
        registry.track(ActivityId(2), ActivityKind::Task, &pins);
        assert_eq!(pins.count(), 1);
        assert_eq!(registry.len(), 2);

        registry.retire(ActivityId(1), &pins);
        assert_eq!(pins.count(), 0);
        assert!(!registry.is_live(ActivityId(1)));

        // Retiring twice does not release twice.
        registry.retire(ActivityId(1), &pins);
        assert_eq!(pins.count(), 0);
    }

    #[test]
    fn test_cancel_releases_pin_once() {
        let pins = pins();
        let registry = ActivityRegistry::default();
        registry.track(ActivityId(7), ActivityKind::Timer, &pins);

        assert!(registry.cancel(ActivityId(7), &pins));
        assert!(!registry.cancel(ActivityId(7), &pins));
        assert!(registry.is_cancelled(ActivityId(7)));
        assert_eq!(pins.count(), 0);

        registry.retire(ActivityId(7), &pins);
        assert_eq!(pins.count(), 0);
    }

    #[test]
    fn test_cancel_after_retire_is_noop() {
        let pins = pins();
        let registry = ActivityRegistry::default();
        registry.track(ActivityId(3), ActivityKind::Task, &pins);
        registry.retire(ActivityId(3), &pins);

        assert!(!registry.cancel(ActivityId(3), &pins));
        assert!(!registry.is_cancelled(ActivityId(3)));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_unref_timer_releases_pin() {
        let pins = pins();
        let registry = ActivityRegistry::default();
        registry.track(ActivityId(4), ActivityKind::Timer, &pins);

        registry.set_ref(ActivityId(4), false, &pins);
        assert_eq!(pins.count(), 0);
        registry.set_ref(ActivityId(4), true, &pins);
        assert_eq!(pins.count(), 1);

        registry.retire(ActivityId(4), &pins);
        assert_eq!(pins.count(), 0);
    }
}
