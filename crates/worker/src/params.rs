use std::path::Path;

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Lumi;

/// The current version of the [TaskParameters] schema. Readers refuse any other version.
pub const PARAMETERS_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ParametersError {
    #[error("Failed to read job parameters")]
    Read,
    #[error("Failed to write job parameters")]
    Write,
    #[error("Unsupported job parameters version {0}")]
    Version(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Regular,
    Merge,
}

/// Which events of the input the job should process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMask {
    /// The number of events to process, or -1 for all of them.
    pub events: i64,
    pub events_per_lumi: Option<u64>,
}

impl Default for EventMask {
    fn default() -> Self {
        Self {
            events: -1,
            events_per_lumi: None,
        }
    }
}

/// Everything a worker needs to know to run one job. This is written into the job directory
/// and shipped with the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskParameters {
    pub version: u32,
    pub kind: TaskKind,
    pub executable: String,
    pub arguments: Vec<String>,
    /// Input files to read.
    pub files: Vec<String>,
    pub lumis: Vec<Lumi>,
    /// Name of the task configuration file inside the sandbox, if any.
    pub task_config: Option<String>,
    pub mask: EventMask,
    /// Pairs of (produced file name, staged name).
    pub output_files: Vec<(String, String)>,
    pub cores: Option<u32>,
    /// Hard limit on the task runtime, in seconds.
    pub task_runtime: Option<u64>,
    pub prologue: Option<Vec<String>>,
    pub epilogue: Option<Vec<String>>,
    /// Pass the input files as trailing arguments to the executable.
    pub append_inputs_to_args: bool,
    pub randomize_seeds: bool,
    pub global_tag: Option<String>,
}

impl TaskParameters {
    pub fn new(kind: TaskKind, files: Vec<String>, lumis: Vec<Lumi>) -> Self {
        Self {
            version: PARAMETERS_VERSION,
            kind,
            executable: String::new(),
            arguments: Vec::new(),
            files,
            lumis,
            task_config: None,
            mask: EventMask::default(),
            output_files: Vec::new(),
            cores: None,
            task_runtime: None,
            prologue: None,
            epilogue: None,
            append_inputs_to_args: false,
            randomize_seeds: false,
            global_tag: None,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Report<ParametersError>> {
        serde_json::to_vec_pretty(self).change_context(ParametersError::Write)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, Report<ParametersError>> {
        #[derive(Deserialize)]
        struct Versioned {
            version: u32,
        }

        let Versioned { version } =
            serde_json::from_slice(data).change_context(ParametersError::Read)?;
        if version != PARAMETERS_VERSION {
            return Err(Report::new(ParametersError::Version(version)));
        }

        serde_json::from_slice(data).change_context(ParametersError::Read)
    }

    pub fn write(&self, path: &Path) -> Result<(), Report<ParametersError>> {
        std::fs::write(path, self.to_json()?)
            .change_context(ParametersError::Write)
            .attach_printable_lazy(|| path.display().to_string())
    }

    pub fn read(path: &Path) -> Result<Self, Report<ParametersError>> {
        let data = std::fs::read(path)
            .change_context(ParametersError::Read)
            .attach_printable_lazy(|| path.display().to_string())?;
        Self::from_json(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskParameters {
        let mut params = TaskParameters::new(
            TaskKind::Regular,
            vec!["/store/a.root".to_string(), "/store/b.root".to_string()],
            vec![Lumi::new(1, 4), Lumi::new(1, 5)],
        );
        params.executable = "cmsRun".to_string();
        params.arguments = vec!["maxEvents=10".to_string()];
        params.task_runtime = Some(4200);
        params
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parameters.json");
        let params = sample();
        params.write(&path).expect("writing parameters");

        let read = TaskParameters::read(&path).expect("reading parameters");
        assert_eq!(read, params);
    }

    #[test]
    fn rejects_other_versions() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["version"] = serde_json::json!(2);
        let data = serde_json::to_vec(&value).unwrap();

        let err = TaskParameters::from_json(&data).expect_err("version 2 should be rejected");
        assert!(matches!(err.current_context(), ParametersError::Version(2)));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = TaskParameters::read(Path::new("/nonexistent/parameters.json")).unwrap_err();
        assert!(matches!(err.current_context(), ParametersError::Read));
    }
}
