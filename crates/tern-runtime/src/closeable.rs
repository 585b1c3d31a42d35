//! Resources force-closed when the loop terminates.
//!
//! Native bindings register every file or socket they open and unregister it
//! when guest code closes it. Whatever is still registered at shutdown has
//! leaked and is closed by the loop.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

/// A resource the loop can close on the guest's behalf.
pub trait Closeable: Send {
    fn close(self: Box<Self>) -> io::Result<()>;

    /// Short description used in shutdown logs.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

impl Closeable for File {
    fn close(self: Box<Self>) -> io::Result<()> {
        drop(self);
        Ok(())
    }
}

impl Closeable for TcpListener {
    fn close(self: Box<Self>) -> io::Result<()> {
        drop(self);
        Ok(())
    }

    fn describe(&self) -> String {
        match self.local_addr() {
            Ok(addr) => format!("TCP listener {}", addr),
            Err(_) => "TCP listener".to_string(),
        }
    }
}

impl Closeable for TcpStream {
    fn close(self: Box<Self>) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn describe(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => format!("TCP stream to {}", addr),
            Err(_) => "TCP stream".to_string(),
        }
    }
}

impl Closeable for UnixStream {
    fn close(self: Box<Self>) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// Registration token returned by `register_closeable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseableId(u64);

impl fmt::Display for CloseableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
pub(crate) struct CloseableRegistry {
    handles: Mutex<HashMap<CloseableId, Box<dyn Closeable>>>,
    next_id: AtomicU64,
}

impl CloseableRegistry {
    fn next_id(&self) -> CloseableId {
        CloseableId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn register(&self, handle: Box<dyn Closeable>) -> CloseableId {
        let id = self.next_id();
        self.handles.lock().insert(id, handle);
        id
    }

    /// Close a handle offered after `close_all` has already run. The returned
    /// id is never tracked.
    pub(crate) fn close_untracked(&self, handle: Box<dyn Closeable>) -> CloseableId {
        let id = self.next_id();
        close_handle(id, handle, "late");
        id
    }

    /// Stop tracking a handle, giving it back to the caller.
    pub(crate) fn unregister(&self, id: CloseableId) -> Option<Box<dyn Closeable>> {
        self.handles.lock().remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Close every handle still registered. Returns how many were closed.
    pub(crate) fn close_all(&self) -> usize {
        let leaked: Vec<_> = self.handles.lock().drain().collect();
        let closed = leaked.len();
        for (id, handle) in leaked {
            close_handle(id, handle, "leaked");
        }
        closed
    }
}

fn close_handle(id: CloseableId, handle: Box<dyn Closeable>, what: &str) {
    let description = handle.describe();
    debug!("Closing {} handle {} ({})", what, id, description);
    if let Err(e) = handle.close() {
        debug!("Error closing {} handle {} ({}): {}", what, id, description, e);
    }
}

impl fmt::Debug for CloseableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseableRegistry")
            .field("handles", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    struct Tracked(Arc<AtomicBool>);

    impl Closeable for Tracked {
        fn close(self: Box<Self>) -> io::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_close_all_closes_registered_only() {
        let registry = CloseableRegistry::default();
        let leaked = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicBool::new(false));

        registry.register(Box::new(Tracked(leaked.clone())));
        let id = registry.register(Box::new(Tracked(released.clone())));
        assert_eq!(registry.len(), 2);

        assert!(registry.unregister(id).is_some());
        assert!(registry.unregister(id).is_none());

        assert_eq!(registry.close_all(), 1);
        assert!(leaked.load(Ordering::SeqCst));
        assert!(!released.load(Ordering::SeqCst));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_closing_stream_signals_peer() {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let registry = CloseableRegistry::default();
        registry.register(Box::new(ours));
        registry.close_all();

        let mut buf = [0u8; 8];
        assert_eq!(theirs.read(&mut buf).unwrap(), 0);
    }
}
