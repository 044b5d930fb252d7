//! Types shared between the Creel controller and the code that runs a job on a worker: the
//! serialized job parameters and the execution report a job leaves behind.

use serde::{Deserialize, Serialize};

mod params;
mod report;

pub use params::{EventMask, ParametersError, TaskKind, TaskParameters, PARAMETERS_VERSION};
pub use report::{merge_reports, ExecutionReport, ReportError, ReportedOutput};

/// The file name of the serialized parameters inside a job directory and the job's sandbox.
pub const PARAMETERS_FILE: &str = "parameters.json";
/// The file name of a job's execution report.
pub const REPORT_FILE: &str = "report.json";

/// The store-assigned identifier of a job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(JobId)
    }
}

/// A luminosity section, the smallest addressable slice of a run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lumi {
    pub run: u32,
    pub lumi: u32,
}

impl Lumi {
    pub fn new(run: u32, lumi: u32) -> Self {
        Self { run, lumi }
    }
}

impl std::fmt::Display for Lumi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.run, self.lumi)
    }
}
