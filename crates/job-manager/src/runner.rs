//! The run loop connecting a [Dispatcher] to an [Executor].

use creel_worker::JobId;
use error_stack::Report;
use futures::{stream::FuturesUnordered, FutureExt, StreamExt};
use tracing::{event, instrument, Level};

use crate::{
    dispatch::{DispatchError, Dispatcher},
    scheduler::SchedulerBehavior,
    spawn::{DispatchDescriptor, ExecutionResult, Executor},
    store::Completed,
};

/// How many jobs to ask for at once when the executor sets no concurrency limit.
const MAX_OBTAIN: usize = 64;

/// Where the run loop gets its jobs and sends their results.
#[async_trait::async_trait]
pub trait JobSource: Send + Sync {
    async fn obtain(&self, n: usize) -> Result<Vec<DispatchDescriptor>, Report<DispatchError>>;

    async fn release(
        &self,
        job: JobId,
        return_code: i32,
        output: &str,
    ) -> Result<Completed, Report<DispatchError>>;

    async fn done(&self) -> Result<bool, Report<DispatchError>>;
}

#[async_trait::async_trait]
impl JobSource for Dispatcher {
    async fn obtain(&self, n: usize) -> Result<Vec<DispatchDescriptor>, Report<DispatchError>> {
        Dispatcher::obtain(self, n).await
    }

    async fn release(
        &self,
        job: JobId,
        return_code: i32,
        output: &str,
    ) -> Result<Completed, Report<DispatchError>> {
        Dispatcher::release(self, job, return_code, output).await
    }

    async fn done(&self) -> Result<bool, Report<DispatchError>> {
        Dispatcher::done(self).await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Jobs released, merge jobs included.
    pub jobs: usize,
    pub failed: usize,
    pub merges: usize,
}

/// A finished job whose result still has to be released.
struct Finished {
    id: JobId,
    merge: bool,
    result: ExecutionResult,
}

/// Hand jobs to `executor` and release their results until the source has no work left.
///
/// Errors from the source do not end the run. A failed `obtain` is tried again after the poll
/// interval, and a failed release is kept and tried again on every later round, so jobs that
/// are still executing are never abandoned.
#[instrument(level = "info", skip_all)]
pub async fn run(
    source: &dyn JobSource,
    executor: &dyn Executor,
    behavior: &SchedulerBehavior,
) -> RunSummary {
    let max_running = behavior.max_concurrent_jobs.unwrap_or(usize::MAX).max(1);
    let mut summary = RunSummary::default();
    let mut running = FuturesUnordered::new();
    let mut unreleased = Vec::new();

    loop {
        for finished in std::mem::take(&mut unreleased) {
            if let Some(finished) = release(source, finished, &mut summary).await {
                unreleased.push(finished);
            }
        }

        let capacity = max_running.saturating_sub(running.len()).min(MAX_OBTAIN);
        if capacity > 0 {
            match source.obtain(capacity).await {
                Ok(descriptors) => {
                    for descriptor in descriptors {
                        let id = descriptor.id;
                        let merge = descriptor.merge;
                        running.push(
                            executor
                                .execute(descriptor)
                                .map(move |result| (id, merge, result)),
                        );
                    }
                }
                Err(e) => {
                    event!(Level::ERROR, error = ?e, "failed to obtain jobs, trying again");
                }
            }
        }

        if running.is_empty() {
            if unreleased.is_empty() {
                match source.done().await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => event!(Level::ERROR, error = ?e, "failed to check for remaining work"),
                }
            }

            event!(Level::DEBUG, "nothing to run, waiting");
            tokio::time::sleep(behavior.poll_interval()).await;
            continue;
        }

        tokio::select! {
            Some((id, merge, result)) = running.next() => {
                let result = result.unwrap_or_else(|e| {
                    event!(Level::ERROR, job = %id, error = ?e, "executor failed to run job");
                    ExecutionResult::new(-1, format!("{e:?}"))
                });
                let finished = Finished { id, merge, result };
                if let Some(finished) = release(source, finished, &mut summary).await {
                    unreleased.push(finished);
                }
            }
            // Wake up now and then to pick up retries whose backoff has passed.
            _ = tokio::time::sleep(behavior.poll_interval()) => {}
        }
    }

    event!(Level::INFO, jobs = summary.jobs, failed = summary.failed, merges = summary.merges, "all work done");
    summary
}

/// Release a finished job. The job is handed back when the release failed.
async fn release(
    source: &dyn JobSource,
    finished: Finished,
    summary: &mut RunSummary,
) -> Option<Finished> {
    let released = source
        .release(finished.id, finished.result.return_code, &finished.result.output)
        .await;
    let completed = match released {
        Ok(completed) => completed,
        Err(e) => {
            event!(Level::ERROR, job = %finished.id, error = ?e, "failed to release job, trying again");
            return Some(finished);
        }
    };

    if let Completed::Applied { .. } = completed {
        summary.jobs += 1;
        if finished.merge {
            summary.merges += 1;
        }
        if finished.result.return_code != 0 {
            summary.failed += 1;
        }
    }

    None
}
