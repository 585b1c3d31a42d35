//! The event loop driver.
//!
//! One iteration runs these phases, always in this order:
//!
//! 1. exit check: nothing queued, nothing pinned, no immediate work
//! 2. cancellation check
//! 3. tick phase: the host's tick tasks, then the Tick Queue
//! 4. one batch of host immediate tasks
//! 5. poll timeout computation
//! 6. I/O poll, the only place the loop thread blocks
//! 7. ready I/O dispatch
//! 8. expired timers
//!
//! Every dispatched unit runs under the same protocol: enter its domain, run
//! it, exit the domain. If the unit throws, the domain is left current and the
//! exception goes to the host's fatal handler. A handled exception lets the
//! loop continue (cutting the current tick drain short); an unhandled one ends
//! the run. `Throw::Exit` skips the fatal handler and ends the run at once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info_span, trace};
use uuid::Uuid;

use crate::activity::TaskFn;
use crate::domain::DomainRef;
use crate::environment::Environment;
use crate::error::{GuestResult, LoopError, ScriptError, Throw};
use crate::host::HostProcess;
use crate::poller::{Interest, Multiplexer};
use crate::scheduler::{LoopHandle, Shared};
use crate::scope::{LoopCore, Scope};
use crate::status::ScriptStatus;

/// Outcome of a unit that did not stop the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Completed,
    /// The unit threw and the fatal handler recovered.
    Recovered,
}

/// Reason the loop must stop.
#[derive(Debug)]
enum Halt {
    Exit(i32),
    Failed(ScriptError),
}

/// A single-threaded event loop bound to one guest session.
pub struct EventLoop {
    host: Box<dyn HostProcess>,
    core: LoopCore,
    session: Uuid,
    exit_notified: bool,
}

impl EventLoop {
    pub fn new(
        env: &Environment,
        name: impl Into<String>,
        host: Box<dyn HostProcess>,
    ) -> Result<Self, LoopError> {
        let config = env.config().event_loop.clone();
        let mux = Multiplexer::new(config.max_poll_events)?;
        let shared = Arc::new(Shared::new(
            name.into(),
            env.clone(),
            mux.waker(),
            config.strict_pin_accounting,
        ));

        Ok(Self {
            host,
            core: LoopCore::new(shared, mux, config),
            session: Uuid::new_v4(),
            exit_notified: false,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle::new(self.core.shared.clone())
    }

    pub fn session_id(&self) -> Uuid {
        self.session
    }

    /// Run `main` (if any) and then iterate until the loop terminates.
    pub fn run(mut self, main: Option<TaskFn>) -> ScriptStatus {
        let span = info_span!("event_loop", name = %self.core.shared.name, session = %self.session);
        let _enter = span.enter();
        debug!("[loop:{}] Starting", self.core.shared.name);

        let result = self.run_main(main).and_then(|()| self.main_loop());
        self.finish(result)
    }

    fn run_main(&mut self, main: Option<TaskFn>) -> Result<(), Halt> {
        if let Some(main) = main {
            self.protect(None, 0, |_, scope| main(scope))?;
        }
        Ok(())
    }

    fn main_loop(&mut self) -> Result<ScriptStatus, Halt> {
        loop {
            let shared = self.core.shared.clone();
            let tick_pending = !shared.ticks.is_empty() || self.host.is_tick_task_pending();
            let immediate_pending = self.host.is_immediate_task_pending();
            let pinned = shared.pins.is_pinned();
            trace!(
                "[loop:{}] ticks={} timers={} live={} sources={} closeables={} pins={} immediate={}",
                shared.name,
                shared.ticks.len(),
                self.core.timers.len(),
                shared.activities.len(),
                self.core.mux.len(),
                shared.closeables.len(),
                shared.pins.count(),
                immediate_pending
            );

            if !tick_pending && !pinned && !immediate_pending {
                debug!("[loop:{}] No more work, exiting", shared.name);
                return Ok(ScriptStatus::Ok);
            }
            if shared.is_cancel_requested() {
                debug!("[loop:{}] Cancelled", shared.name);
                return Ok(ScriptStatus::Cancelled);
            }

            self.drain_ticks()?;

            if self.host.is_immediate_task_pending() {
                self.protect(None, 0, |host, scope| host.process_immediate_tasks(scope))?;
            }

            self.core.merge_incoming_timers();
            let timeout = self.poll_timeout();
            if timeout != Some(Duration::ZERO) {
                debug!("[loop:{}] Sleeping for {:?}", shared.name, timeout);
            }
            self.core.mux.poll(timeout).map_err(|e| {
                Halt::Failed(ScriptError::new(format!("I/O poll failed: {}", e)))
            })?;

            self.dispatch_io()?;
            self.fire_timers()?;
        }
    }

    /// Zero when there is work to get back to or nothing holds the loop open;
    /// otherwise until the next timer, or the idle timeout if none is armed.
    fn poll_timeout(&self) -> Option<Duration> {
        let shared = &self.core.shared;
        if !shared.ticks.is_empty()
            || self.host.is_tick_task_pending()
            || self.host.is_immediate_task_pending()
            || !shared.pins.is_pinned()
        {
            return Some(Duration::ZERO);
        }
        match self.core.timers.next_deadline() {
            Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
            None => self.core.config.idle_poll_timeout(),
        }
    }

    /// Host tick tasks, then the Tick Queue. Only a recovered Tick Queue
    /// activity cuts the drain short.
    fn drain_ticks(&mut self) -> Result<(), Halt> {
        if self.host.is_tick_task_pending() {
            self.protect(None, 0, |host, scope| host.process_tick_tasks(scope))?;
        }

        let shared = self.core.shared.clone();
        while let Some(mut activity) = shared.ticks.pop() {
            let id = activity.id;
            if shared.activities.is_cancelled(id) {
                shared.activities.retire(id, &shared.pins);
                continue;
            }
            let domain = activity.domain.take();
            let outcome = self.protect(domain, activity.tick_depth, |_, scope| activity.run(scope));
            shared.activities.retire(id, &shared.pins);
            if outcome? == Dispatch::Recovered {
                break;
            }
        }
        Ok(())
    }

    fn dispatch_io(&mut self) -> Result<(), Halt> {
        for (key, readiness) in self.core.mux.take_ready() {
            let Some(mut handler) = self.core.mux.checkout(key) else {
                continue;
            };
            let mut rearm = Interest::NONE;
            let outcome = self.protect(None, 0, |_, scope| {
                rearm = handler.ready(scope, readiness)?;
                Ok(())
            });
            self.core.mux.checkin(key, handler, rearm);
            outcome?;
        }
        Ok(())
    }

    fn fire_timers(&mut self) -> Result<(), Halt> {
        self.core.merge_incoming_timers();
        let shared = self.core.shared.clone();
        let now = Instant::now();

        while let Some(mut timer) = self.core.timers.pop_expired(now) {
            let id = timer.id;
            if shared.activities.is_cancelled(id) {
                shared.activities.retire(id, &shared.pins);
                continue;
            }

            debug!("[loop:{}] Executing timer {}", shared.name, id);
            let domain = timer.domain.clone();
            let outcome = self.protect(domain, timer.tick_depth, |_, scope| timer.run(scope));

            match timer.interval {
                Some(interval) if outcome.is_ok() && !shared.activities.is_cancelled(id) => {
                    timer.fire_at = now + interval;
                    debug!(
                        "[loop:{}] Re-registering timer {} to fire in {:?}",
                        shared.name, id, interval
                    );
                    self.core.timers.insert(timer);
                }
                _ => shared.activities.retire(id, &shared.pins),
            }
            outcome?;
        }
        Ok(())
    }

    /// Run one unit under the domain and fatal-handler protocol.
    fn protect<F>(
        &mut self,
        domain: Option<DomainRef>,
        tick_depth: u32,
        unit: F,
    ) -> Result<Dispatch, Halt>
    where
        F: FnOnce(&mut dyn HostProcess, &mut Scope<'_>) -> GuestResult,
    {
        let domain = DomainRef::live(domain.as_ref());
        let previous = domain
            .as_ref()
            .map(|d| self.core.current_domain.replace(d.clone()));
        self.core.tick_depth = tick_depth;
        self.core.watchdog.arm(Instant::now());

        let result = {
            let mut scope = Scope::new(&mut self.core);
            run_unit(domain.as_ref(), self.host.as_mut(), &mut scope, unit)
        };
        self.core.watchdog.disarm();
        self.core.tick_depth = 0;

        let err = match result {
            Ok(()) => {
                if let Some(previous) = previous {
                    self.core.current_domain = previous;
                }
                return Ok(Dispatch::Completed);
            }
            Err(Throw::Exit(code)) => {
                debug!("[loop:{}] Exit requested with code {}", self.core.shared.name, code);
                return Err(Halt::Exit(code));
            }
            Err(Throw::Exception(err)) => err,
        };

        let handled = match self.host.fatal_handler() {
            Some(handler) => {
                let mut scope = Scope::new(&mut self.core);
                handler.handle(&mut scope, &err)
            }
            None => false,
        };
        debug!(
            "[loop:{}] Fatal handler {} exception: {}",
            self.core.shared.name,
            if handled { "recovered" } else { "did not handle" },
            err.message()
        );

        if handled {
            Ok(Dispatch::Recovered)
        } else {
            Err(Halt::Failed(err))
        }
    }

    /// Deliver the exit event, publish the final state and release
    /// everything the session still holds.
    fn finish(&mut self, result: Result<ScriptStatus, Halt>) -> ScriptStatus {
        let mut status = match result {
            Ok(status) => status,
            Err(Halt::Exit(code)) => ScriptStatus::Exit(code),
            Err(Halt::Failed(err)) => ScriptStatus::Failed(err),
        };

        if !self.exit_notified && !self.host.is_exiting() {
            self.exit_notified = true;
            let code = status.exit_code();
            self.core.watchdog.arm(Instant::now());
            let fired = {
                let mut scope = Scope::new(&mut self.core);
                self.host.fire_exit(&mut scope, code)
            };
            self.core.watchdog.disarm();
            match fired {
                Ok(()) => {}
                Err(Throw::Exit(replaced)) => {
                    debug!(
                        "[loop:{}] Exit handler replaced exit code {} with {}",
                        self.core.shared.name, code, replaced
                    );
                    status = ScriptStatus::Exit(replaced);
                }
                Err(Throw::Exception(err)) => {
                    debug!(
                        "[loop:{}] Exit handler threw: {}",
                        self.core.shared.name,
                        err.message()
                    );
                    status = ScriptStatus::Failed(err);
                }
            }
        }

        let shared = self.core.shared.clone();
        shared.seal(status.state());

        for activity in shared.ticks.drain() {
            shared.activities.retire(activity.id, &shared.pins);
        }
        self.core.merge_incoming_timers();
        for id in self.core.timers.clear() {
            shared.activities.retire(id, &shared.pins);
        }
        self.core.mux.deregister_all();
        let closed = shared.closeables.close_all();

        debug!(
            "[loop:{}] Finished with {} ({} leaked handles closed)",
            shared.name, status, closed
        );
        status
    }
}

/// Enter, run, exit. The exit is skipped when the unit throws.
fn run_unit<F>(
    domain: Option<&DomainRef>,
    host: &mut dyn HostProcess,
    scope: &mut Scope<'_>,
    unit: F,
) -> GuestResult
where
    F: FnOnce(&mut dyn HostProcess, &mut Scope<'_>) -> GuestResult,
{
    if let Some(domain) = domain {
        domain.enter()?;
    }
    unit(host, scope)?;
    if let Some(domain) = domain {
        domain.exit()?;
    }
    Ok(())
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.core.shared.name)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
