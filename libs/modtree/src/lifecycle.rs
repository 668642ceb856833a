//! Controller for one long-running background job owned by a module.
//!
//! Modules that run a loop between `start` and `stop` (the configuration event
//! pump, pollers, listeners) keep a [`TaskLifecycle`] and drive it from their
//! hooks.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type TaskResult<T = ()> = anyhow::Result<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Stopped,
    Running,
    Stopping,
}

impl TaskStatus {
    #[inline]
    const fn as_u8(self) -> u8 {
        match self {
            TaskStatus::Stopped => 0,
            TaskStatus::Running => 1,
            TaskStatus::Stopping => 2,
        }
    }

    #[inline]
    const fn from_u8(x: u8) -> Self {
        match x {
            1 => TaskStatus::Running,
            2 => TaskStatus::Stopping,
            _ => TaskStatus::Stopped,
        }
    }
}

/// Why [`TaskLifecycle::stop`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Finished,
    Cancelled,
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("background task already started")]
    AlreadyStarted,
}

pub struct TaskLifecycle {
    status: Arc<AtomicU8>,
    handle: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl TaskLifecycle {
    pub fn new() -> Self {
        Self {
            status: Arc::new(AtomicU8::new(TaskStatus::Stopped.as_u8())),
            handle: Mutex::new(None),
            cancel: Mutex::new(None),
        }
    }

    #[inline]
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.status() == TaskStatus::Running
    }

    /// Spawn `make(token)`. `token` is usually a child of the owning unit's token, so
    /// stopping the unit also cancels the job.
    #[tracing::instrument(skip(self, token, make), level = "debug")]
    pub fn start<F, Fut>(&self, token: CancellationToken, make: F) -> Result<(), LifecycleError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        if self
            .status
            .compare_exchange(
                TaskStatus::Stopped.as_u8(),
                TaskStatus::Running.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(LifecycleError::AlreadyStarted);
        }

        *self.cancel.lock() = Some(token.clone());
        let status = self.status.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = make(token).await {
                tracing::error!(error = %format!("{e:#}"), "background task failed");
            }
            // A job that returns on its own is stopped; one being stopped stays
            // `Stopping` until `stop` has joined it.
            let _ = status.compare_exchange(
                TaskStatus::Running.as_u8(),
                TaskStatus::Stopped.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        });
        *self.handle.lock() = Some(handle);
        tracing::debug!("background task running");
        Ok(())
    }

    /// Cancel the job and wait up to `timeout` for it to return; abort it otherwise.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn stop(&self, timeout: Duration) -> StopReason {
        let Some(mut handle) = self.handle.lock().take() else {
            return StopReason::Finished;
        };
        self.status
            .store(TaskStatus::Stopping.as_u8(), Ordering::Release);

        let cancelled = match self.cancel.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };

        let reason = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    tracing::warn!(error = %e, "background task join error");
                }
                if cancelled {
                    StopReason::Cancelled
                } else {
                    StopReason::Finished
                }
            }
            Err(_) => {
                tracing::warn!(?timeout, "background task did not stop in time; aborting");
                handle.abort();
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        tracing::warn!(error = %e, "background task join error");
                    }
                }
                StopReason::Timeout
            }
        };

        self.status
            .store(TaskStatus::Stopped.as_u8(), Ordering::Release);
        tracing::debug!(?reason, "background task stopped");
        reason
    }
}

impl Default for TaskLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskLifecycle {
    fn drop(&mut self) {
        if let Some(tok) = self.cancel.get_mut().take() {
            tok.cancel();
        }
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
