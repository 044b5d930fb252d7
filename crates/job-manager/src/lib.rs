//! The controller side of Creel: a persistent store of work units, the workflows that produce
//! and consume them, and the dispatcher that turns them into jobs and merges their outputs.

pub mod config;
pub mod dataset;
pub mod dispatch;
pub mod merge;
pub mod runner;
pub mod sandbox;
pub mod scheduler;
pub mod spawn;
pub mod store;
pub mod task_status;
pub mod workflow;

#[cfg(test)]
mod test_util;

pub use config::{ConfigError, ControllerConfig};
pub use dispatch::{DispatchError, Dispatcher};
pub use runner::{run, JobSource, RunSummary};
pub use spawn::{DispatchDescriptor, ExecutionError, ExecutionResult, Executor};
pub use store::{StoreError, WorkUnitStore};
pub use workflow::{Workflow, WorkflowError, WorkflowSpec};
