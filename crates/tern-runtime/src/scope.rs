//! Loop-thread context.
//!
//! A [`Scope`] is handed to every payload, I/O handler, host facade call and
//! fatal handler. It is the only way to reach loop-thread-confined state (the
//! timer queue, the multiplexer, the current domain) and cannot leave the
//! loop thread.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::activity::{Activity, ActivityHandle, ActivityKind};
use crate::closeable::{Closeable, CloseableId};
use crate::config::LoopConfig;
use crate::domain::DomainRef;
use crate::error::{GuestResult, LoopError};
use crate::pin::PinCounter;
use crate::poller::{Interest, IoHandler, Multiplexer, SourceKey};
use crate::scheduler::{LoopHandle, Shared};
use crate::timer::TimerQueue;
use crate::watchdog::Watchdog;

/// Loop-thread-confined state.
pub(crate) struct LoopCore {
    pub(crate) shared: Arc<Shared>,
    pub(crate) timers: TimerQueue,
    pub(crate) mux: Multiplexer,
    pub(crate) current_domain: Option<DomainRef>,
    pub(crate) watchdog: Watchdog,
    /// Depth of the unit currently running.
    pub(crate) tick_depth: u32,
    pub(crate) config: LoopConfig,
}

impl LoopCore {
    pub(crate) fn new(shared: Arc<Shared>, mux: Multiplexer, config: LoopConfig) -> Self {
        Self {
            shared,
            timers: TimerQueue::default(),
            mux,
            current_domain: None,
            watchdog: Watchdog::new(config.script_time_limit()),
            tick_depth: 0,
            config,
        }
    }

    /// Move timers created on other threads into the timer queue.
    pub(crate) fn merge_incoming_timers(&mut self) {
        let incoming = std::mem::take(&mut *self.shared.incoming_timers.lock());
        for timer in incoming {
            self.timers.insert(timer);
        }
    }
}

/// Access to the event loop from code running on it.
pub struct Scope<'a> {
    core: &'a mut LoopCore,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(core: &'a mut LoopCore) -> Self {
        Self { core }
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn name(&self) -> &str {
        &self.core.shared.name
    }

    /// Thread-safe handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(self.core.shared.clone())
    }

    /// Depth of the unit currently running: 0 for work that came from
    /// outside the loop, one more than the submitter for nested callbacks.
    pub fn tick_depth(&self) -> u32 {
        self.core.tick_depth
    }

    /// Enqueue a deferred callback. It runs after everything already queued.
    pub fn submit<F>(&mut self, payload: F, domain: Option<DomainRef>) -> ActivityHandle
    where
        F: FnOnce(&mut Scope<'_>) -> GuestResult + Send + 'static,
    {
        let shared = &self.core.shared;
        let id = shared.next_id();
        let activity = Activity::task(
            id,
            ActivityKind::Callback,
            Box::new(payload),
            domain,
            self.core.tick_depth + 1,
        );
        shared.enqueue(activity, false);
        ActivityHandle::new(id, ActivityKind::Callback, shared.clone())
    }

    /// Arm a timer. `interval` is only used when `repeating`.
    pub fn create_timer<F>(
        &mut self,
        delay: Duration,
        repeating: bool,
        interval: Duration,
        payload: F,
        domain: Option<DomainRef>,
    ) -> ActivityHandle
    where
        F: FnMut(&mut Scope<'_>) -> GuestResult + Send + 'static,
    {
        let timer = self.core.shared.new_timer(
            delay,
            repeating,
            interval,
            Box::new(payload),
            domain,
            self.core.tick_depth + 1,
        );
        let id = timer.id;
        self.core.timers.insert(timer);
        ActivityHandle::new(id, ActivityKind::Timer, self.core.shared.clone())
    }

    pub fn cancel(&mut self, activity: &ActivityHandle) {
        self.core.shared.cancel(activity.id());
    }

    pub fn pin(&mut self) -> i64 {
        self.core.shared.pins.pin()
    }

    pub fn unpin(&mut self) -> Result<i64, LoopError> {
        self.core.shared.pins.unpin()
    }

    pub fn pin_count(&self) -> i64 {
        self.core.shared.pins.count()
    }

    pub fn pins(&self) -> &PinCounter {
        &self.core.shared.pins
    }

    pub fn current_domain(&self) -> Option<&DomainRef> {
        self.core.current_domain.as_ref()
    }

    pub fn set_current_domain(&mut self, domain: Option<DomainRef>) {
        self.core.current_domain = domain;
    }

    /// Watch a non-blocking file descriptor. The handler runs on the loop
    /// thread each time the source becomes ready.
    pub fn register_source<H>(
        &mut self,
        fd: RawFd,
        interest: Interest,
        handler: H,
    ) -> Result<SourceKey, LoopError>
    where
        H: IoHandler + 'static,
    {
        self.core.mux.register(fd, interest, Box::new(handler))
    }

    /// Re-arm a source outside its own handler.
    pub fn reregister_source(&mut self, key: SourceKey, interest: Interest) -> Result<(), LoopError> {
        self.core.mux.reregister(key, interest)
    }

    pub fn deregister_source(&mut self, key: SourceKey) -> Result<(), LoopError> {
        self.core.mux.deregister(key)
    }

    pub fn register_closeable(&mut self, handle: Box<dyn Closeable>) -> CloseableId {
        self.core.shared.register_closeable(handle)
    }

    pub fn unregister_closeable(&mut self, id: CloseableId) -> Option<Box<dyn Closeable>> {
        self.core.shared.closeables.unregister(id)
    }

    /// Raise a timed-out exception if the current unit has overrun the
    /// script time limit.
    pub fn check_time_limit(&self) -> GuestResult {
        self.core.watchdog.check()
    }
}

impl std::fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.core.shared.name)
            .field("tick_depth", &self.core.tick_depth)
            .field("current_domain", &self.core.current_domain)
            .finish_non_exhaustive()
    }
}
