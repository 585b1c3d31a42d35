//! Runtime environment shared by event loops.
//!
//! Owns what would otherwise be process-wide: the configuration and the async
//! worker pool that runs blocking work on behalf of guests. Loops sharing an
//! environment share nothing else.

use std::fmt;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::LoopError;

/// Cheaply cloneable handle to a runtime environment.
#[derive(Clone)]
pub struct Environment {
    inner: Arc<Inner>,
}

struct Inner {
    config: RuntimeConfig,
    handle: Handle,
    pool: Option<Runtime>,
}

impl Environment {
    pub fn new(config: RuntimeConfig) -> Result<Self, LoopError> {
        config.validate()?;
        let settings = &config.environment;
        let pool = Builder::new_multi_thread()
            .worker_threads(settings.async_worker_threads)
            .max_blocking_threads(settings.max_blocking_threads)
            .thread_keep_alive(settings.blocking_keep_alive())
            .thread_name(settings.thread_name.clone())
            .enable_all()
            .build()
            .map_err(LoopError::SpawnFailed)?;
        debug!(
            "[environment] Async pool started with {} workers",
            settings.async_worker_threads
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                handle: pool.handle().clone(),
                pool: Some(pool),
            }),
        })
    }

    pub fn with_defaults() -> Result<Self, LoopError> {
        Self::new(RuntimeConfig::default())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Handle to the async worker pool.
    pub fn async_pool(&self) -> Handle {
        self.inner.handle.clone()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which panics inside async contexts.
        if let Some(pool) = self.pool.take() {
            pool.shutdown_background();
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pool_runs_blocking_work() {
        let env = Environment::with_defaults().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        env.async_pool().spawn_blocking(move || {
            tx.send(std::thread::current().name().map(str::to_string)).unwrap();
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("tern-async"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.event_loop.max_poll_events = 0;
        let err = Environment::new(config).unwrap_err();
        assert!(matches!(err, LoopError::Config(_)));
    }
}
