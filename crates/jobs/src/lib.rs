//! Bounded background job pools with completion callbacks.

mod handle;
mod scheduler;

pub use handle::{JobError, JobHandle};
pub use scheduler::{JobScheduler, ResourceKind, SchedulerConfig, SchedulerError};
