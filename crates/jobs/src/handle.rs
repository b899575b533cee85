use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::error;
use uuid::Uuid;

use crate::ResourceKind;

#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The callable returned an error. The original error is kept so the
    /// inspector can downcast it.
    #[error("job failed: {0:#}")]
    Failed(Arc<anyhow::Error>),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error("job has not finished yet")]
    Pending,

    #[error("timed out after {0:?} waiting for job")]
    TimedOut(Duration),

    #[error("scheduler shut down before the job ran")]
    SchedulerClosed,
}

impl JobError {
    /// The callable's own error, when there is one.
    pub fn source_error(&self) -> Option<&anyhow::Error> {
        match self {
            JobError::Failed(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

type DoneCallback<T> = Box<dyn FnOnce(&JobHandle<T>) + Send + 'static>;

struct JobState<T> {
    outcome: Option<Result<T, JobError>>,
    callbacks: Vec<DoneCallback<T>>,
}

struct JobInner<T> {
    id: Uuid,
    kind: ResourceKind,
    state: Mutex<JobState<T>>,
    settled: watch::Sender<bool>,
}

/// Handle to a submitted job.
///
/// Cloning is cheap; all clones observe the same outcome.
pub struct JobHandle<T> {
    inner: Arc<JobInner<T>>,
}

impl<T> Clone for JobHandle<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> std::fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl<T: Clone + Send + 'static> JobHandle<T> {
    pub(crate) fn new(kind: ResourceKind) -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            inner: Arc::new(JobInner {
                id: Uuid::new_v4(),
                kind,
                state: Mutex::new(JobState {
                    outcome: None,
                    callbacks: Vec::new(),
                }),
                settled,
            }),
        }
    }

    /// A handle that is already finished with `outcome`.
    pub fn completed(kind: ResourceKind, outcome: anyhow::Result<T>) -> Self {
        let handle = Self::new(kind);
        handle.complete(outcome.map_err(|e| JobError::Failed(Arc::new(e))));
        handle
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.inner.kind
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// Register a continuation. It runs exactly once: on the worker when the
    /// job finishes, or right here if the job has already finished.
    pub fn on_done(&self, callback: impl FnOnce(&JobHandle<T>) + Send + 'static) {
        {
            let mut st = self.inner.state.lock();
            if st.outcome.is_none() {
                st.callbacks.push(Box::new(callback));
                return;
            }
        }
        self.run_callback(Box::new(callback));
    }

    /// The job's outcome, or `JobError::Pending` while it is still running.
    pub fn try_result(&self) -> Result<T, JobError> {
        self.inner
            .state
            .lock()
            .outcome
            .clone()
            .unwrap_or(Err(JobError::Pending))
    }

    /// Wait for the job and every callback registered before it finished.
    pub async fn wait(&self) -> Result<T, JobError> {
        let mut rx = self.inner.settled.subscribe();
        if rx.wait_for(|settled| *settled).await.is_err() {
            return Err(JobError::SchedulerClosed);
        }
        self.try_result()
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. The job keeps
    /// running.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<T, JobError> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| JobError::TimedOut(timeout))?
    }

    pub(crate) fn complete(&self, outcome: Result<T, JobError>) {
        let callbacks = {
            let mut st = self.inner.state.lock();
            if st.outcome.is_some() {
                return;
            }
            st.outcome = Some(outcome);
            std::mem::take(&mut st.callbacks)
        };
        for cb in callbacks {
            self.run_callback(cb);
        }
        self.inner.settled.send_replace(true);
    }

    fn run_callback(&self, cb: DoneCallback<T>) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cb(self))) {
            error!(job_id = %self.inner.id, panic = %panic_message(&*panic), "job callback panicked");
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callback_on_finished_handle_runs_immediately() {
        let handle = JobHandle::completed(ResourceKind::Cpu, Ok(7u32));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        handle.on_done(move |h| {
            assert_eq!(h.try_result().unwrap(), 7);
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_completion_is_ignored() {
        let handle: JobHandle<u32> = JobHandle::new(ResourceKind::Cpu);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        handle.on_done(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(matches!(handle.try_result(), Err(JobError::Pending)));
        handle.complete(Ok(1));
        handle.complete(Ok(2));
        assert_eq!(handle.try_result().unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
