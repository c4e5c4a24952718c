//! Ownership handle for spawned background tasks.

use tokio::task::JoinHandle;

/// Aborts the wrapped task when dropped.
///
/// Every scan, telemetry pump, clock, watcher and retrieval task in the core is
/// held through one of these, so a consumer that walks away (drops its manager
/// or replaces the slot holding the guard) leaves no timers or callbacks behind.
#[derive(Debug)]
pub struct TaskGuard {
    handle: Option<JoinHandle<()>>,
}

impl TaskGuard {
    /// Spawn `future` on the current tokio runtime and guard it.
    pub fn spawn<F>(future: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(future)),
        }
    }

    /// Abort the task now.
    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Release the task without aborting it.
    ///
    /// Used by a task that is tearing down its own slot on completion.
    pub fn disarm(mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
