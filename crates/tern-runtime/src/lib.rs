//! Tern Runtime
//!
//! The event loop that drives a guest scripting session: a single-threaded
//! cooperative scheduler interleaving deferred callbacks, immediate tasks, I/O
//! readiness and timers, with cross-thread submission and keep-alive pins.
//!
//! # Architecture
//!
//! - Each guest session runs one [`EventLoop`], usually on its own thread via [`spawn_loop`]
//! - Guest code and native bindings on the loop thread work through a [`Scope`]
//! - Other threads hold a [`LoopHandle`] and only ever submit, cancel and pin
//! - Blocking work runs on the [`Environment`]'s async pool and reports back through the Tick Queue
//!
//! # Example
//!
//! ```ignore
//! let env = Environment::with_defaults()?;
//! let event_loop = EventLoop::new(&env, "main", Box::new(NullHost))?;
//! let status = event_loop.run(Some(Box::new(|scope: &mut Scope<'_>| {
//!     scope.create_timer(Duration::from_millis(10), false, Duration::ZERO, |_| Ok(()), None);
//!     Ok(())
//! })));
//! assert_eq!(status, ScriptStatus::Ok);
//! ```

mod activity;
mod closeable;
mod config;
mod domain;
mod environment;
mod error;
mod event_loop;
mod host;
mod pin;
mod poller;
mod scheduler;
mod scope;
mod spawn;
mod status;
mod tick;
mod timer;
mod watchdog;

pub use activity::{ActivityHandle, ActivityId, ActivityKind, TaskFn, TimerFn};
pub use closeable::{Closeable, CloseableId};
pub use config::{ConfigError, EnvironmentConfig, LoopConfig, RuntimeConfig};
pub use domain::{Domain, DomainRef};
pub use environment::Environment;
pub use error::{
    CANCEL_CODE, EXCEPTION_CODE, GuestResult, LoopError, OK_CODE, ScriptError, TIMEOUT_CODE, Throw,
};
pub use event_loop::EventLoop;
pub use host::{FatalHandler, HostProcess, NullHost};
pub use pin::{PinCounter, PinState};
pub use poller::{Interest, IoHandler, SourceKey, Waker};
pub use scheduler::LoopHandle;
pub use scope::Scope;
pub use spawn::{LoopThread, spawn_loop};
pub use status::{LoopState, ScriptStatus};
