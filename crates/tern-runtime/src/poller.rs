//! I/O readiness multiplexer.
//!
//! Wraps a [`polling::Poller`] (epoll, kqueue or IOCP depending on platform)
//! together with the per-source handlers the loop dispatches to. Registrations
//! are one-shot: once a source reports readiness it stays disarmed until its
//! handler asks to be re-armed.
//!
//! Only the loop thread touches the registration table. The [`Waker`] is the
//! single piece that crosses threads; it interrupts a blocking
//! [`Multiplexer::poll`] and, if nobody is polling yet, makes the next poll
//! return immediately.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use polling::{Event as PollEvent, Poller};
use tracing::{trace, warn};

use crate::error::{GuestResult, LoopError};
use crate::scope::Scope;

/// Identifies a registered I/O source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey(usize);

impl SourceKey {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Readiness interest, also used to report which directions became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    pub fn is_none(&self) -> bool {
        !self.readable && !self.writable
    }

    fn to_event(self, key: SourceKey) -> PollEvent {
        PollEvent {
            key: key.0,
            readable: self.readable,
            writable: self.writable,
        }
    }

    fn from_event(event: &PollEvent) -> Self {
        Interest {
            readable: event.readable,
            writable: event.writable,
        }
    }
}

/// Callback invoked on the loop thread when a source becomes ready.
///
/// The returned interest re-arms the source; [`Interest::NONE`] leaves it
/// disarmed until [`Scope::reregister_source`] is called. I/O failures seen by
/// the handler belong to the handler: deliver them to guest callbacks as
/// values rather than raising them.
pub trait IoHandler {
    fn ready(&mut self, scope: &mut Scope<'_>, readiness: Interest) -> GuestResult<Interest>;
}

impl<F> IoHandler for F
where
    F: FnMut(&mut Scope<'_>, Interest) -> GuestResult<Interest>,
{
    fn ready(&mut self, scope: &mut Scope<'_>, readiness: Interest) -> GuestResult<Interest> {
        self(scope, readiness)
    }
}

/// Thread-safe handle that interrupts a blocking poll.
#[derive(Clone)]
pub struct Waker {
    poller: Arc<Poller>,
}

impl Waker {
    pub fn wake(&self) {
        if let Err(e) = self.poller.notify() {
            warn!("Failed to wake event loop poller: {}", e);
        }
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker").finish_non_exhaustive()
    }
}

struct Registration {
    fd: RawFd,
    interest: Interest,
    /// `None` while the handler is checked out for dispatch.
    handler: Option<Box<dyn IoHandler>>,
}

pub(crate) struct Multiplexer {
    poller: Arc<Poller>,
    sources: HashMap<SourceKey, Registration>,
    events: Vec<PollEvent>,
    ready: Vec<(SourceKey, Interest)>,
    next_key: usize,
}

impl Multiplexer {
    pub(crate) fn new(capacity: usize) -> Result<Self, LoopError> {
        let poller = Poller::new().map_err(LoopError::Poller)?;
        Ok(Self {
            poller: Arc::new(poller),
            sources: HashMap::new(),
            events: Vec::with_capacity(capacity),
            ready: Vec::with_capacity(capacity),
            next_key: 1,
        })
    }

    pub(crate) fn waker(&self) -> Waker {
        Waker {
            poller: self.poller.clone(),
        }
    }

    pub(crate) fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        handler: Box<dyn IoHandler>,
    ) -> Result<SourceKey, LoopError> {
        let key = SourceKey(self.next_key);
        self.poller.add(fd, interest.to_event(key))?;
        self.next_key += 1;

        self.sources.insert(
            key,
            Registration {
                fd,
                interest,
                handler: Some(handler),
            },
        );
        trace!("Registered fd {} as {:?} with {:?}", fd, key, interest);
        Ok(key)
    }

    pub(crate) fn reregister(&mut self, key: SourceKey, interest: Interest) -> Result<(), LoopError> {
        let registration = self
            .sources
            .get_mut(&key)
            .ok_or(LoopError::UnknownSource(key))?;
        self.poller.modify(registration.fd, interest.to_event(key))?;
        registration.interest = interest;
        Ok(())
    }

    pub(crate) fn deregister(&mut self, key: SourceKey) -> Result<(), LoopError> {
        let registration = self
            .sources
            .remove(&key)
            .ok_or(LoopError::UnknownSource(key))?;
        self.poller.delete(registration.fd)?;
        trace!("Deregistered {:?}", key);
        Ok(())
    }

    /// Drop every registration. Used when the loop terminates.
    pub(crate) fn deregister_all(&mut self) {
        for (key, registration) in self.sources.drain() {
            if let Err(e) = self.poller.delete(registration.fd) {
                trace!("Failed to delete {:?} from poller: {}", key, e);
            }
        }
        self.ready.clear();
    }

    /// Block for up to `timeout` (`None` = indefinitely) and record which
    /// sources became ready.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.events.clear();
        match self.poller.wait(&mut self.events, timeout) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        for event in &self.events {
            let key = SourceKey(event.key);
            if let Some(registration) = self.sources.get_mut(&key) {
                // One-shot: the kernel side is disarmed until we modify it again.
                registration.interest = Interest::NONE;
                self.ready.push((key, Interest::from_event(event)));
            }
        }
        Ok(self.ready.len())
    }

    pub(crate) fn take_ready(&mut self) -> Vec<(SourceKey, Interest)> {
        std::mem::take(&mut self.ready)
    }

    /// Borrow a handler out of the table for the duration of its dispatch.
    pub(crate) fn checkout(&mut self, key: SourceKey) -> Option<Box<dyn IoHandler>> {
        self.sources.get_mut(&key).and_then(|r| r.handler.take())
    }

    /// Return a handler after dispatch and re-arm it. A handler whose source
    /// was deregistered during dispatch is dropped.
    pub(crate) fn checkin(&mut self, key: SourceKey, handler: Box<dyn IoHandler>, rearm: Interest) {
        let Some(registration) = self.sources.get_mut(&key) else {
            return;
        };
        registration.handler = Some(handler);

        if rearm.is_none() || registration.interest == rearm {
            return;
        }
        match self.poller.modify(registration.fd, rearm.to_event(key)) {
            Ok(()) => registration.interest = rearm,
            Err(e) => {
                warn!("Failed to re-arm {:?} (fd {}): {}; dropping source", key, registration.fd, e);
                self.sources.remove(&key);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sources.len()
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("sources", &self.sources.len())
            .field("ready", &self.ready.len())
            .finish_non_exhaustive()
    }
}
