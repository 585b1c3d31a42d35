//! Cross-thread scheduling surface.
//!
//! [`LoopHandle`] is what native modules, worker threads and the async pool
//! hold on to. Everything reachable from it is thread-safe: the Tick Queue,
//! the incoming-timer list, the activity registry, the pin counter and the
//! closeable registry. Every mutation that could unblock the loop wakes the
//! multiplexer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::activity::{
    Activity, ActivityHandle, ActivityId, ActivityKind, ActivityRegistry, TaskFn, TimerFn,
};
use crate::closeable::{Closeable, CloseableId, CloseableRegistry};
use crate::domain::DomainRef;
use crate::environment::Environment;
use crate::error::{GuestResult, LoopError};
use crate::pin::PinCounter;
use crate::poller::Waker;
use crate::scope::Scope;
use crate::status::LoopState;
use crate::tick::TickQueue;

/// Smallest interval a repeating timer may have.
const MIN_REPEAT_INTERVAL: Duration = Duration::from_millis(1);

// ─────────────────────────────────────────────────────────────────────────────
// Shared State
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) ticks: TickQueue,
    /// Timers created off the loop thread, merged by the loop.
    pub(crate) incoming_timers: Mutex<Vec<Activity>>,
    pub(crate) activities: ActivityRegistry,
    pub(crate) pins: PinCounter,
    pub(crate) closeables: CloseableRegistry,
    pub(crate) waker: Waker,
    pub(crate) env: Environment,
    /// Held shared while admitting work, exclusively while leaving `Running`.
    admission: RwLock<()>,
    cancel_requested: AtomicBool,
    state: AtomicU8,
    next_id: AtomicU64,
}

impl Shared {
    pub(crate) fn new(name: String, env: Environment, waker: Waker, strict_pins: bool) -> Self {
        Self {
            name,
            ticks: TickQueue::default(),
            incoming_timers: Mutex::new(Vec::new()),
            activities: ActivityRegistry::default(),
            pins: PinCounter::new(waker.clone(), strict_pins),
            closeables: CloseableRegistry::default(),
            waker,
            env,
            admission: RwLock::new(()),
            cancel_requested: AtomicBool::new(false),
            state: AtomicU8::new(LoopState::Running as u8),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_id(&self) -> ActivityId {
        ActivityId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Publish a terminal state. Once this returns no submission, timer or
    /// closeable can be admitted, so a drain that follows sees everything.
    pub(crate) fn seal(&self, state: LoopState) {
        let _closed = self.admission.write();
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn is_accepting(&self) -> bool {
        self.state() == LoopState::Running
    }

    pub(crate) fn request_cancel(&self) {
        if !self.cancel_requested.swap(true, Ordering::SeqCst) {
            debug!("[loop:{}] Cancellation requested", self.name);
        }
        self.waker.wake();
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Append to the Tick Queue. Returns false if the loop has terminated.
    pub(crate) fn enqueue(&self, activity: Activity, wake: bool) -> bool {
        let _open = self.admission.read();
        if !self.is_accepting() {
            debug!(
                "[loop:{}] Dropping activity {} submitted after termination",
                self.name, activity.id
            );
            return false;
        }
        self.activities
            .track(activity.id, activity.kind, &self.pins);
        self.ticks.push(activity);
        if wake {
            self.waker.wake();
        }
        true
    }

    /// Build a timer activity and start tracking it. Tracking takes the
    /// timer's keep-alive pin.
    pub(crate) fn new_timer(
        &self,
        delay: Duration,
        repeating: bool,
        interval: Duration,
        payload: TimerFn,
        domain: Option<DomainRef>,
        tick_depth: u32,
    ) -> Activity {
        let id = self.next_id();
        let fire_at = Instant::now() + delay;
        let interval = repeating.then(|| interval.max(MIN_REPEAT_INTERVAL));
        debug!(
            "[loop:{}] Created timer {} to fire in {:?} (repeat {:?})",
            self.name, id, delay, interval
        );
        self.activities
            .track(id, ActivityKind::Timer, &self.pins);
        Activity::timer(id, fire_at, interval, payload, domain, tick_depth)
    }

    /// Hand a timer created off the loop thread to the loop. Returns false
    /// (and retires the timer) if the loop has terminated.
    pub(crate) fn admit_timer(&self, timer: Activity) -> bool {
        let _open = self.admission.read();
        if !self.is_accepting() {
            debug!(
                "[loop:{}] Dropping timer {} created after termination",
                self.name, timer.id
            );
            self.activities.retire(timer.id, &self.pins);
            return false;
        }
        self.incoming_timers.lock().push(timer);
        self.waker.wake();
        true
    }

    /// Track a handle until the loop terminates. A handle offered after
    /// termination is closed right away.
    pub(crate) fn register_closeable(&self, handle: Box<dyn Closeable>) -> CloseableId {
        let _open = self.admission.read();
        if !self.is_accepting() {
            return self.closeables.close_untracked(handle);
        }
        self.closeables.register(handle)
    }

    pub(crate) fn cancel(&self, id: ActivityId) {
        self.activities.cancel(id, &self.pins);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loop Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Thread-safe handle used to schedule work on an event loop.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<Shared>,
}

impl LoopHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Schedule `payload` to run as soon as possible on the loop thread.
    ///
    /// Work submitted after the loop has terminated is dropped; the returned
    /// handle then reports it as not pending.
    pub fn submit<F>(&self, payload: F, domain: Option<DomainRef>) -> ActivityHandle
    where
        F: FnOnce(&mut Scope<'_>) -> GuestResult + Send + 'static,
    {
        self.submit_boxed(Box::new(payload), domain)
    }

    pub fn submit_boxed(&self, payload: TaskFn, domain: Option<DomainRef>) -> ActivityHandle {
        let id = self.shared.next_id();
        let activity = Activity::task(id, ActivityKind::Task, payload, domain, 0);
        self.shared.enqueue(activity, true);
        ActivityHandle::new(id, ActivityKind::Task, self.shared.clone())
    }

    /// Arm a timer from any thread. `interval` is only used when `repeating`.
    pub fn create_timer<F>(
        &self,
        delay: Duration,
        repeating: bool,
        interval: Duration,
        payload: F,
        domain: Option<DomainRef>,
    ) -> ActivityHandle
    where
        F: FnMut(&mut Scope<'_>) -> GuestResult + Send + 'static,
    {
        let timer = self
            .shared
            .new_timer(delay, repeating, interval, Box::new(payload), domain, 0);
        let id = timer.id;
        self.shared.admit_timer(timer);
        ActivityHandle::new(id, ActivityKind::Timer, self.shared.clone())
    }

    pub fn cancel(&self, activity: &ActivityHandle) {
        self.shared.cancel(activity.id());
    }

    pub fn pin(&self) -> i64 {
        self.shared.pins.pin()
    }

    pub fn unpin(&self) -> Result<i64, LoopError> {
        self.shared.pins.unpin()
    }

    pub fn pin_count(&self) -> i64 {
        self.shared.pins.count()
    }

    /// The loop's pin counter, for driving a [`PinState`](crate::PinState).
    pub fn pins(&self) -> &PinCounter {
        &self.shared.pins
    }

    /// Track a handle so it is closed when the loop terminates. After
    /// termination the handle is closed immediately.
    pub fn register_closeable(&self, handle: Box<dyn Closeable>) -> CloseableId {
        self.shared.register_closeable(handle)
    }

    pub fn unregister_closeable(&self, id: CloseableId) -> Option<Box<dyn Closeable>> {
        self.shared.closeables.unregister(id)
    }

    /// Run blocking `work` on the environment's async pool and deliver its
    /// result to `complete` on the loop thread.
    ///
    /// The loop stays pinned while the work is in flight. The completion is
    /// queued before the pin is released, so the loop cannot drain to empty in
    /// between. Errors from `work` reach `complete` as values.
    pub fn run_async<T, W, C>(&self, work: W, complete: C, domain: Option<DomainRef>)
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        C: FnOnce(&mut Scope<'_>, T) -> GuestResult + Send + 'static,
    {
        self.shared.pins.pin();
        let guard = AsyncPin {
            shared: self.shared.clone(),
        };
        let handle = self.clone();
        self.shared.env.async_pool().spawn_blocking(move || {
            let value = work();
            handle.submit(move |scope| complete(scope, value), domain);
            drop(guard);
        });
    }

    /// Ask the loop to stop at its next iteration boundary, discarding
    /// pending work.
    pub fn terminate(&self) {
        self.shared.request_cancel();
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    /// Interrupt a blocking poll.
    pub fn wake(&self) {
        self.shared.waker.wake();
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.shared.name)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Releases the pin taken for in-flight async work, even if the work panics.
struct AsyncPin {
    shared: Arc<Shared>,
}

impl Drop for AsyncPin {
    fn drop(&mut self) {
        self.shared.pins.release();
    }
}
