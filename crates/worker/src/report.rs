use std::{collections::BTreeSet, path::Path};

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Lumi;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to read execution report")]
    Read,
    #[error("Failed to write execution report")]
    Write,
}

/// A file produced by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedOutput {
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    #[serde(default)]
    pub events: u64,
}

/// The summary a job writes when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionReport {
    pub exit_code: i32,
    pub events_read: u64,
    pub events_written: u64,
    pub input_files: Vec<String>,
    pub lumis: Vec<Lumi>,
    pub output_files: Vec<ReportedOutput>,
    pub cpu_time_secs: f64,
    pub wall_time_secs: f64,
}

impl ExecutionReport {
    pub fn read(path: &Path) -> Result<Self, Report<ReportError>> {
        let data = std::fs::read(path)
            .change_context(ReportError::Read)
            .attach_printable_lazy(|| path.display().to_string())?;
        serde_json::from_slice(&data)
            .change_context(ReportError::Read)
            .attach_printable_lazy(|| path.display().to_string())
    }

    pub fn write(&self, path: &Path) -> Result<(), Report<ReportError>> {
        let data = serde_json::to_vec_pretty(self).change_context(ReportError::Write)?;
        std::fs::write(path, data)
            .change_context(ReportError::Write)
            .attach_printable_lazy(|| path.display().to_string())
    }

    /// The size of the output file `name`, if the job reported it.
    pub fn output_size(&self, name: &str) -> Option<u64> {
        self.output_files
            .iter()
            .find(|output| output.name == name)
            .map(|output| output.size)
    }
}

/// Combine the reports of several jobs into one summary. Counters are summed, input files and
/// lumis are unioned, and outputs with the same name are folded together. The first non-zero
/// exit code wins.
pub fn merge_reports(reports: impl IntoIterator<Item = ExecutionReport>) -> ExecutionReport {
    let mut merged = ExecutionReport::default();
    let mut inputs = BTreeSet::new();
    let mut lumis = BTreeSet::new();

    for report in reports {
        if merged.exit_code == 0 {
            merged.exit_code = report.exit_code;
        }
        merged.events_read += report.events_read;
        merged.events_written += report.events_written;
        merged.cpu_time_secs += report.cpu_time_secs;
        merged.wall_time_secs += report.wall_time_secs;
        inputs.extend(report.input_files);
        lumis.extend(report.lumis);

        for output in report.output_files {
            match merged
                .output_files
                .iter_mut()
                .find(|existing| existing.name == output.name)
            {
                Some(existing) => {
                    existing.size += output.size;
                    existing.events += output.events;
                }
                None => merged.output_files.push(output),
            }
        }
    }

    merged.input_files = inputs.into_iter().collect();
    merged.lumis = lumis.into_iter().collect();
    merged
}
