//! Run jobs in the same process as the dispatcher. This is only really useful for unit tests.

use std::{
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use error_stack::Report;

use super::{DispatchDescriptor, ExecutionError, ExecutionResult, Executor};

/// Runs a closure for every job. The closure gets the descriptor and plays the part of the
/// job, usually by writing the declared output files.
pub struct InProcessExecutor<FUNC> {
    job_fn: FUNC,
    executed: AtomicUsize,
}

impl<F, FUNC> InProcessExecutor<FUNC>
where
    F: Future<Output = Result<ExecutionResult, Report<ExecutionError>>> + Send,
    FUNC: Fn(DispatchDescriptor) -> F + Send + Sync,
{
    pub fn new(job_fn: FUNC) -> Self {
        Self {
            job_fn,
            executed: AtomicUsize::new(0),
        }
    }

    /// The number of jobs run so far.
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<F, FUNC> Executor for InProcessExecutor<FUNC>
where
    F: Future<Output = Result<ExecutionResult, Report<ExecutionError>>> + Send,
    FUNC: Fn(DispatchDescriptor) -> F + Send + Sync,
{
    async fn execute(
        &self,
        descriptor: DispatchDescriptor,
    ) -> Result<ExecutionResult, Report<ExecutionError>> {
        self.executed.fetch_add(1, Ordering::Relaxed);
        (self.job_fn)(descriptor).await
    }
}
