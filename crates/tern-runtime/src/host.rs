//! Host Process Facade.
//!
//! The loop never knows how the guest-side `process` object is implemented.
//! It only asks whether tick or immediate work is pending, asks it to run that
//! work, and asks it for the fatal-exception hook. Every method has a default
//! so a host only implements what its guest environment actually has.

use crate::error::{GuestResult, ScriptError};
use crate::scope::Scope;

/// Decides whether an exception that escaped a dispatched unit is recoverable.
pub trait FatalHandler {
    /// Return `true` if the exception was handled and the loop should go on.
    fn handle(&mut self, scope: &mut Scope<'_>, error: &ScriptError) -> bool;
}

impl<F> FatalHandler for F
where
    F: FnMut(&mut Scope<'_>, &ScriptError) -> bool,
{
    fn handle(&mut self, scope: &mut Scope<'_>, error: &ScriptError) -> bool {
        self(scope, error)
    }
}

/// Guest-side process object consulted by the loop on every iteration.
///
/// Pending checks may be called several times per iteration and must not
/// have side effects.
pub trait HostProcess {
    /// Whether the guest's own tick queue (`nextTick`) has work.
    fn is_tick_task_pending(&self) -> bool {
        false
    }

    /// Run the guest's tick queue. Called at the start of the tick phase.
    fn process_tick_tasks(&mut self, _scope: &mut Scope<'_>) -> GuestResult {
        Ok(())
    }

    fn is_immediate_task_pending(&self) -> bool {
        false
    }

    /// Run one batch of immediate tasks. Called at most once per iteration.
    fn process_immediate_tasks(&mut self, _scope: &mut Scope<'_>) -> GuestResult {
        Ok(())
    }

    /// The hook exceptions are referred to. Without one every exception is fatal.
    fn fatal_handler(&mut self) -> Option<&mut dyn FatalHandler> {
        None
    }

    /// Whether the guest is already emitting its exit event.
    fn is_exiting(&self) -> bool {
        false
    }

    /// Deliver the exit event. Throwing `Throw::Exit` replaces the exit code.
    fn fire_exit(&mut self, _scope: &mut Scope<'_>, _code: i32) -> GuestResult {
        Ok(())
    }
}

/// Host without any guest-side process object.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHost;

impl HostProcess for NullHost {}
