//! Named, logging, task-tracking capability shared by listeners and connections.
//!
//! A [`Component`] owns a name and a tracing span. Tasks spawned through it run
//! inside that span and are tracked by a [`TaskHandle`], which can cancel the task
//! and wait for it with a [`StopTimeout`].
//!
//! Cancelling drops the task's future. Every socket owned by that future is closed
//! on drop, so pending reads and writes end immediately.

use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

/// How long a stop operation waits for the stopped task to confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopTimeout {
    /// Request the stop and return immediately.
    NoWait,
    /// Wait up to the given duration.
    Wait(Duration),
    /// Block until the task has ended.
    #[default]
    Infinite,
}

impl StopTimeout {
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            StopTimeout::NoWait
        } else {
            StopTimeout::Wait(Duration::from_millis(ms))
        }
    }
}

impl From<Option<Duration>> for StopTimeout {
    fn from(value: Option<Duration>) -> Self {
        match value {
            None => StopTimeout::Infinite,
            Some(d) if d.is_zero() => StopTimeout::NoWait,
            Some(d) => StopTimeout::Wait(d),
        }
    }
}

/// Name plus tracing span of a long-lived component.
#[derive(Debug, Clone)]
pub struct Component {
    name: String,
    span: Span,
}

impl Component {
    pub fn new(name: impl Into<String>, span: Span) -> Self {
        Self {
            name: name.into(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Spawn a task inside this component's span.
    ///
    /// `f` receives the cancellation token so it can observe the stop request
    /// at points where it wants to finish gracefully.
    pub fn spawn<F, Fut>(&self, f: F) -> TaskHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let fut = f(token.clone());
        let cancel = token.clone();

        tokio::spawn(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::trace!("task cancelled");
                    }
                    _ = fut => {}
                }
                let _ = done_tx.send(true);
            }
            .instrument(self.span.clone()),
        );

        TaskHandle {
            name: self.name.clone(),
            token,
            done: done_rx,
        }
    }
}

/// Handle to a task spawned by a [`Component`].
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: String,
    token: CancellationToken,
    done: watch::Receiver<bool>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request the task to stop. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        // A dropped sender means the task is gone (finished, panicked or runtime shut down).
        *self.done.borrow() || self.done.has_changed().is_err()
    }

    /// Wait for the task to end. Returns whether it ended within `timeout`.
    pub async fn wait(&self, timeout: StopTimeout) -> bool {
        let mut done = self.done.clone();
        let finished = async move {
            // An Err means the sender was dropped, which also means the task is gone.
            let _ = done.wait_for(|finished| *finished).await;
        };

        match timeout {
            StopTimeout::NoWait => self.is_finished(),
            StopTimeout::Wait(d) => tokio::time::timeout(d, finished).await.is_ok(),
            StopTimeout::Infinite => {
                finished.await;
                true
            }
        }
    }
}

/// Wait on the union of `handles` under a single deadline.
///
/// Returns whether every task confirmed it ended.
pub async fn wait_all(handles: &[TaskHandle], timeout: StopTimeout) -> bool {
    if handles.is_empty() {
        return true;
    }
    match timeout {
        StopTimeout::NoWait => handles.iter().all(TaskHandle::is_finished),
        StopTimeout::Wait(d) => {
            let all = join_all(handles.iter().map(|h| h.wait(StopTimeout::Infinite)));
            tokio::time::timeout(d, all).await.is_ok()
        }
        StopTimeout::Infinite => {
            join_all(handles.iter().map(|h| h.wait(StopTimeout::Infinite))).await;
            true
        }
    }
}
