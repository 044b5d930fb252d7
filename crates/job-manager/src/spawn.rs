//! The boundary to the execution backend. The dispatcher only produces [DispatchDescriptor]s and
//! consumes [ExecutionResult]s; an [Executor] decides where and how jobs actually run.

#[cfg(feature = "inprocess")]
pub mod inprocess;

use std::path::PathBuf;

use creel_worker::JobId;
use error_stack::Report;
use thiserror::Error;

/// A file the executor places next to the job before it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputFile {
    pub source: PathBuf,
    /// The file name inside the job's scratch area.
    pub staged_name: String,
    /// The file is identical across jobs and may be cached by the executor.
    pub cacheable: bool,
}

impl InputFile {
    pub fn new(source: impl Into<PathBuf>, staged_name: impl Into<String>, cacheable: bool) -> Self {
        Self {
            source: source.into(),
            staged_name: staged_name.into(),
            cacheable,
        }
    }
}

/// A file the executor copies back once the job has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// Where the file ends up on the controller side.
    pub destination: PathBuf,
    /// The file name inside the job's scratch area.
    pub staged_name: String,
}

impl OutputFile {
    pub fn new(destination: impl Into<PathBuf>, staged_name: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            staged_name: staged_name.into(),
        }
    }
}

/// Advisory limits for a job. They are passed on to the executor and never enforced here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    pub cores: Option<u32>,
    pub memory_mb: Option<u64>,
    pub disk_mb: Option<u64>,
    pub runtime_secs: Option<u64>,
}

/// Everything an executor needs to run one job.
#[derive(Debug, Clone)]
pub struct DispatchDescriptor {
    pub id: JobId,
    pub workflow: String,
    /// The job combines outputs of earlier jobs.
    pub merge: bool,
    pub command: String,
    pub inputs: Vec<InputFile>,
    pub outputs: Vec<OutputFile>,
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub return_code: i32,
    /// The combined output of the job, saved as its log.
    pub output: String,
}

impl ExecutionResult {
    pub fn new(return_code: i32, output: impl Into<String>) -> Self {
        Self {
            return_code,
            output: output.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start")]
    DidNotStart,
    #[error("Failed to stage input files")]
    StageIn,
    #[error("Failed to stage output files")]
    StageOut,
    #[error("Job was lost by the executor")]
    Lost,
}

#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Run a job to completion. A job that ran and failed is an `Ok` result with a non-zero
    /// return code; errors mean the executor could not run the job at all.
    async fn execute(
        &self,
        descriptor: DispatchDescriptor,
    ) -> Result<ExecutionResult, Report<ExecutionError>>;
}
