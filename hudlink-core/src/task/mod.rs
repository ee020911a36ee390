//! Task ownership helpers.
//!
//! Every background task in the link is owned by something that ends
//! it: a [`ScopedTask`] aborts its task on drop, and a [`TaskGroup`]
//! shares one [`CancellationToken`] among its tasks so they can be
//! shut down together and awaited.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ── ScopedTask ───────────────────────────────────────────────────

/// A spawned task that is aborted when the handle is dropped.
#[derive(Debug)]
pub struct ScopedTask {
    handle: Option<JoinHandle<()>>,
}

impl ScopedTask {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(future)),
        }
    }

    /// Abort the task and wait until it is gone.
    pub async fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ScopedTask {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

// ── TaskGroup ────────────────────────────────────────────────────

/// Named tasks sharing one cancellation token.
pub struct TaskGroup {
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Spawn `f(token)`. The task is expected to return once the token
    /// is cancelled.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|(_, handle)| !handle.is_finished());
        let handle = tokio::spawn(f(self.token.clone()));
        debug!("task {name} spawned");
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every task and wait for all of them to finish.
    pub async fn shutdown(&mut self) {
        self.token.cancel();
        for (name, handle) in self.tasks.drain(..) {
            match handle.await {
                Ok(()) => debug!("task {name} finished"),
                Err(e) if e.is_cancelled() => debug!("task {name} aborted"),
                Err(e) => warn!("task {name} panicked: {e}"),
            }
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio_test::assert_pending;

    #[tokio::test]
    async fn scoped_task_aborts_on_drop() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
        let task = ScopedTask::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        drop(task);
        // The sender is dropped with the aborted future.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn group_shutdown_waits_for_tasks() {
        let mut group = TaskGroup::new();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        group.spawn("worker", move |token| async move {
            token.cancelled().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(group.len(), 1);

        group.shutdown().await;
        assert!(done.load(Ordering::SeqCst));
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn shutdown_pending_until_tasks_exit() {
        let mut group = TaskGroup::new();
        let (release, released) = tokio::sync::oneshot::channel::<()>();
        // Ignores the token on purpose.
        group.spawn("stubborn", |_token| async move {
            let _ = released.await;
        });

        let mut shutdown = tokio_test::task::spawn(group.shutdown());
        assert_pending!(shutdown.poll());

        release.send(()).unwrap();
        let mut polls = 0;
        while shutdown.poll().is_pending() {
            polls += 1;
            assert!(polls < 100, "shutdown never completed");
            tokio::task::yield_now().await;
        }
        drop(shutdown);
        assert!(group.is_empty());
    }
}
