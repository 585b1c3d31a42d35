//! Error-containment domains.
//!
//! A domain is an opaque guest-side scope attached to a unit of work when it
//! is submitted. The loop enters it before running the unit and exits it
//! afterwards, except when the unit throws: the domain then stays current so
//! the fatal handler can see which scope the failure belongs to.

use std::fmt;
use std::sync::Arc;

use crate::error::GuestResult;

/// Guest-side error-containment scope.
pub trait Domain: Send + Sync {
    /// Disposed domains are ignored by the loop.
    fn is_disposed(&self) -> bool {
        false
    }

    fn enter(&self) -> GuestResult {
        Ok(())
    }

    fn exit(&self) -> GuestResult {
        Ok(())
    }
}

/// Shared reference to a domain.
#[derive(Clone)]
pub struct DomainRef(Arc<dyn Domain>);

impl DomainRef {
    pub fn new(domain: impl Domain + 'static) -> Self {
        Self(Arc::new(domain))
    }

    pub fn from_arc(domain: Arc<dyn Domain>) -> Self {
        Self(domain)
    }

    /// Identity comparison; two refs are equal when they share the domain.
    pub fn same(&self, other: &DomainRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The domain, unless it has been disposed.
    pub(crate) fn live(domain: Option<&DomainRef>) -> Option<DomainRef> {
        domain.filter(|d| !d.0.is_disposed()).cloned()
    }

    pub(crate) fn enter(&self) -> GuestResult {
        self.0.enter()
    }

    pub(crate) fn exit(&self) -> GuestResult {
        self.0.exit()
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for DomainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainRef({:#x})", self.addr())
    }
}

impl fmt::Display for DomainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flagged(AtomicBool);

    impl Domain for Flagged {
        fn is_disposed(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_identity() {
        let a = DomainRef::new(Flagged(AtomicBool::new(false)));
        let b = a.clone();
        let c = DomainRef::new(Flagged(AtomicBool::new(false)));
        assert!(a.same(&b));
        assert!(!a.same(&c));
    }

    #[test]
    fn test_disposed_domain_is_dropped() {
        let inner = Arc::new(Flagged(AtomicBool::new(false)));
        let domain = DomainRef::from_arc(inner.clone());
        assert!(DomainRef::live(Some(&domain)).is_some());

        inner.0.store(true, Ordering::SeqCst);
        assert!(DomainRef::live(Some(&domain)).is_none());
        assert!(DomainRef::live(None).is_none());
    }
}
