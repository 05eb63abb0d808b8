//! Dedicated runtime thread bridging sync callers into async sessions.
//!
//! The subsystem is consumed from synchronous code, while transports and
//! sessions are async. The [`Runner`] owns a background thread running a
//! single-threaded tokio runtime; callers submit futures with
//! [`Runner::block_on`] and wait on a bounded channel receive, so a hung
//! server can never block the caller past the given bound.
//!
//! A timed-out future is not cancelled; it keeps running on the runner
//! thread and its result is discarded. Shutdown is idempotent and gives
//! in-flight tasks a short grace period before the runtime is dropped.

use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use tokio::runtime;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::McpError;

/// Grace period for in-flight tasks when the runtime shuts down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct RunnerThread {
    shutdown_tx: oneshot::Sender<()>,
    join_handle: thread::JoinHandle<()>,
}

/// Background async context with a blocking submission API.
pub struct Runner {
    handle: runtime::Handle,
    thread: Mutex<Option<RunnerThread>>,
}

impl Runner {
    /// Spawn the runner thread and wait for its runtime to come up.
    pub fn new() -> Result<Self, McpError> {
        let (handle_tx, handle_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let join_handle = thread::Builder::new()
            .name("mcp-runner".to_string())
            .spawn(move || {
                let rt = match runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = handle_tx.send(Err(McpError::session(format!(
                            "Failed to build runtime: {}",
                            e
                        ))));
                        return;
                    }
                };

                let _ = handle_tx.send(Ok(rt.handle().clone()));

                // Park on the shutdown signal; spawned tasks run while we
                // wait. A dropped sender counts as shutdown too.
                rt.block_on(async {
                    let _ = shutdown_rx.await;
                });

                debug!("runner shutting down");
                rt.shutdown_timeout(SHUTDOWN_GRACE);
            })
            .map_err(|e| McpError::session(format!("Failed to spawn runner thread: {}", e)))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| McpError::session("Runner thread exited before startup"))??;

        Ok(Self {
            handle,
            thread: Mutex::new(Some(RunnerThread {
                shutdown_tx,
                join_handle,
            })),
        })
    }

    /// Handle for spawning directly onto the runner's runtime.
    pub fn handle(&self) -> &runtime::Handle {
        &self.handle
    }

    /// Run a future on the runner thread, blocking the caller for at most
    /// `bound`.
    ///
    /// On timeout the future is left running and its eventual result is
    /// discarded.
    pub fn block_on<F>(&self, future: F, bound: Duration) -> Result<F::Output, McpError>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_stopped() {
            return Err(McpError::session("Runner has been shut down"));
        }

        let (tx, rx) = std_mpsc::channel();
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });

        match rx.recv_timeout(bound) {
            Ok(output) => Ok(output),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Err(McpError::timeout(bound)),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                Err(McpError::session("Runner task was dropped"))
            }
        }
    }

    fn is_stopped(&self) -> bool {
        match self.thread.lock() {
            Ok(guard) => guard.is_none(),
            Err(_) => true,
        }
    }

    /// Stop the runtime and join the runner thread. Safe to call more
    /// than once.
    pub fn shutdown(&self) {
        let thread = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };

        if let Some(RunnerThread {
            shutdown_tx,
            join_handle,
        }) = thread
        {
            let _ = shutdown_tx.send(());
            if join_handle.join().is_err() {
                warn!("runner thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_on_round_trip() {
        let runner = Runner::new().unwrap();
        let result = runner
            .block_on(async { 40 + 2 }, Duration::from_secs(1))
            .unwrap();
        assert_eq!(result, 42);
        runner.shutdown();
    }

    #[test]
    fn test_block_on_respects_bound() {
        let runner = Runner::new().unwrap();
        let started = std::time::Instant::now();
        let result = runner.block_on(
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            },
            Duration::from_millis(100),
        );
        assert!(matches!(result, Err(McpError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
        runner.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let runner = Runner::new().unwrap();
        runner.shutdown();
        runner.shutdown();

        let result = runner.block_on(async { 1 }, Duration::from_millis(100));
        assert!(result.is_err());
    }

    #[test]
    fn test_tasks_outlive_individual_calls() {
        let runner = Runner::new().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        runner.handle().spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(7);
        });

        let result = runner
            .block_on(async { rx.await.unwrap_or(0) }, Duration::from_secs(1))
            .unwrap();
        assert_eq!(result, 7);
    }
}
