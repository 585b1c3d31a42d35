//! Dedicated loop threads.
//!
//! Each guest session gets its own named OS thread. The host facade is built
//! on that thread, so it does not need to be `Send`.

use std::thread;

use tokio::sync::oneshot;
use tracing::debug;

use crate::activity::TaskFn;
use crate::environment::Environment;
use crate::error::LoopError;
use crate::event_loop::EventLoop;
use crate::host::HostProcess;
use crate::scheduler::LoopHandle;
use crate::status::{LoopState, ScriptStatus};

/// Start an event loop on a new thread and wait until it accepts work.
pub fn spawn_loop<F>(
    env: &Environment,
    name: impl Into<String>,
    make_host: F,
    main: Option<TaskFn>,
) -> Result<LoopThread, LoopError>
where
    F: FnOnce() -> Box<dyn HostProcess> + Send + 'static,
{
    let name = name.into();
    debug!("[spawn_loop] Starting {}", name);

    let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<Result<LoopHandle, LoopError>>(1);
    let (done_tx, done_rx) = oneshot::channel();

    let env = env.clone();
    let name_clone = name.clone();
    let thread = thread::Builder::new()
        .name(name.clone())
        .spawn(move || -> Result<ScriptStatus, LoopError> {
            debug!("[spawn_loop:{}] Thread started", name_clone);

            let event_loop = match EventLoop::new(&env, name_clone.clone(), make_host()) {
                Ok(event_loop) => event_loop,
                Err(e) => {
                    let reported = LoopError::SpawnFailed(std::io::Error::other(e.to_string()));
                    let _ = init_tx.send(Err(e));
                    return Err(reported);
                }
            };
            let _ = init_tx.send(Ok(event_loop.handle()));

            let status = event_loop.run(main);
            let _ = done_tx.send(status.clone());
            debug!("[spawn_loop:{}] Thread exiting with {}", name_clone, status);
            Ok(status)
        })
        .map_err(LoopError::SpawnFailed)?;

    let handle = init_rx.recv().map_err(|_| LoopError::ChannelClosed)??;
    debug!("[spawn_loop] {} is ready", name);

    Ok(LoopThread {
        handle,
        thread: Some(thread),
        done: Some(done_rx),
    })
}

/// An event loop running on its own thread.
///
/// Dropping it cancels the loop and waits for the thread to finish.
pub struct LoopThread {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<Result<ScriptStatus, LoopError>>>,
    done: Option<oneshot::Receiver<ScriptStatus>>,
}

impl LoopThread {
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    /// Request cooperative cancellation.
    pub fn terminate(&self) {
        self.handle.terminate();
    }

    pub fn state(&self) -> LoopState {
        self.handle.state()
    }

    /// Block until the loop thread finishes.
    pub fn join(mut self) -> Result<ScriptStatus, LoopError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| LoopError::ThreadPanic)?,
            None => Err(LoopError::ChannelClosed),
        }
    }

    /// Wait for the final status without blocking the async runtime.
    pub async fn wait(&mut self) -> Result<ScriptStatus, LoopError> {
        let done = self.done.take().ok_or(LoopError::ChannelClosed)?;
        done.await.map_err(|_| LoopError::ChannelClosed)
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.terminate();
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for LoopThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopThread")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::host::NullHost;
    use crate::scope::Scope;

    fn null_host() -> Box<dyn HostProcess> {
        Box::new(NullHost)
    }

    #[test]
    fn test_spawned_loop_runs_to_completion() {
        let env = Environment::with_defaults().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let thread = spawn_loop(
            &env,
            "spawned",
            null_host,
            Some(Box::new(move |scope: &mut Scope<'_>| {
                scope.create_timer(
                    Duration::from_millis(10),
                    false,
                    Duration::ZERO,
                    move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                    None,
                );
                Ok(())
            })),
        )
        .unwrap();

        assert_eq!(thread.join().unwrap(), ScriptStatus::Ok);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_terminate_cancels_pinned_loop() {
        let env = Environment::with_defaults().unwrap();
        let thread = spawn_loop(
            &env,
            "pinned",
            null_host,
            Some(Box::new(|scope: &mut Scope<'_>| {
                scope.pin();
                Ok(())
            })),
        )
        .unwrap();
        assert_eq!(thread.state(), LoopState::Running);

        thread.terminate();
        assert_eq!(thread.join().unwrap(), ScriptStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_wait_reports_status() {
        let env = Environment::with_defaults().unwrap();
        let mut thread = spawn_loop(
            &env,
            "waited",
            null_host,
            Some(Box::new(|scope: &mut Scope<'_>| {
                let handle = scope.handle();
                handle.pin();
                scope.submit(
                    move |_| {
                        handle.unpin().map_err(|e| crate::Throw::error(e.to_string()))?;
                        Err(crate::Throw::exit(5))
                    },
                    None,
                );
                Ok(())
            })),
        )
        .unwrap();

        let status = thread.wait().await.unwrap();
        assert_eq!(status, ScriptStatus::Exit(5));
        assert_eq!(status.exit_code(), 5);
        assert!(matches!(thread.wait().await, Err(LoopError::ChannelClosed)));
    }
}
