use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::handle::{panic_message, JobError, JobHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub cpu_workers: usize,
    pub gpu_workers: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cpu_workers: 4,
            // one accelerator
            gpu_workers: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("{0:?} pool needs at least one worker")]
    EmptyPool(ResourceKind),
}

/// Runs blocking callables on bounded CPU and GPU pools.
///
/// `submit` never blocks: the job waits for a pool slot on the runtime and
/// then runs on a blocking thread. Its callbacks run on that same thread,
/// right after the callable returns. Jobs cannot be cancelled or
/// prioritized.
#[derive(Clone)]
pub struct JobScheduler {
    runtime: Handle,
    cpu: Arc<Semaphore>,
    gpu: Arc<Semaphore>,
}

impl JobScheduler {
    /// Build a scheduler on the current tokio runtime.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let runtime = Handle::try_current().map_err(|e| SchedulerError::NoRuntime(e.to_string()))?;
        Self::with_runtime(runtime, config)
    }

    pub fn with_runtime(runtime: Handle, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        if config.cpu_workers == 0 {
            return Err(SchedulerError::EmptyPool(ResourceKind::Cpu));
        }
        if config.gpu_workers == 0 {
            return Err(SchedulerError::EmptyPool(ResourceKind::Gpu));
        }
        Ok(Self {
            runtime,
            cpu: Arc::new(Semaphore::new(config.cpu_workers)),
            gpu: Arc::new(Semaphore::new(config.gpu_workers)),
        })
    }

    fn pool(&self, kind: ResourceKind) -> Arc<Semaphore> {
        match kind {
            ResourceKind::Cpu => self.cpu.clone(),
            ResourceKind::Gpu => self.gpu.clone(),
        }
    }

    pub fn submit<T, F>(&self, kind: ResourceKind, job: F) -> JobHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let handle = JobHandle::new(kind);
        self.spawn_job(handle.clone(), job);
        handle
    }

    /// Submit with a completion callback, invoked exactly once on the
    /// worker after the callable returns or fails.
    pub fn submit_with_callback<T, F, C>(&self, kind: ResourceKind, job: F, done: C) -> JobHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        C: FnOnce(&JobHandle<T>) + Send + 'static,
    {
        let handle = JobHandle::new(kind);
        handle.on_done(done);
        self.spawn_job(handle.clone(), job);
        handle
    }

    fn spawn_job<T, F>(&self, handle: JobHandle<T>, job: F)
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let kind = handle.kind();
        let pool = self.pool(kind);
        let runtime = self.runtime.clone();

        self.runtime.spawn(async move {
            let permit = match pool.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    handle.complete(Err(JobError::SchedulerClosed));
                    return;
                }
            };
            let job_id = handle.id();
            let joined = runtime
                .spawn_blocking(move || {
                    let _permit = permit;
                    debug!(%job_id, ?kind, "job started");
                    let outcome = match catch_unwind(AssertUnwindSafe(job)) {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(JobError::Failed(Arc::new(e))),
                        Err(panic) => Err(JobError::Panicked(panic_message(&*panic))),
                    };
                    handle.complete(outcome);
                    debug!(%job_id, "job finished");
                })
                .await;
            if let Err(e) = joined {
                error!(%job_id, "job worker failed: {e}");
            }
        });
    }

    /// Free slots in a pool right now.
    pub fn available_workers(&self, kind: ResourceKind) -> usize {
        self.pool(kind).available_permits()
    }
}
