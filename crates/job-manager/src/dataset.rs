//! Where work units come from, and what a task configuration produces.

use std::path::Path;

use creel_worker::Lumi;
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::NewUnit;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to partition dataset")]
    Partition,
    #[error("Failed to describe task configuration {0}")]
    Describe(String),
}

/// The input of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatasetSpec {
    /// A list of input files, split into groups of `files_per_task`.
    Files {
        files: Vec<String>,
        #[serde(default = "default_files_per_task")]
        files_per_task: usize,
    },
    /// Generated events with no input files.
    Production {
        events_per_task: u64,
        events_per_lumi: u64,
        num_tasks: u32,
        #[serde(default = "default_randomize_seeds")]
        randomize_seeds: bool,
    },
    /// The merged outputs of another workflow. Units are created as that workflow finishes its
    /// outputs.
    Parent,
}

fn default_files_per_task() -> usize {
    1
}

fn default_randomize_seeds() -> bool {
    true
}

/// Turns a dataset into work units.
pub trait DatasetPartitioner: Send + Sync {
    fn partition(&self, dataset: &DatasetSpec) -> Result<Vec<NewUnit>, Report<DatasetError>>;
}

/// Partitions file lists and production requests without consulting any external catalog.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicPartitioner;

impl DatasetPartitioner for BasicPartitioner {
    fn partition(&self, dataset: &DatasetSpec) -> Result<Vec<NewUnit>, Report<DatasetError>> {
        match dataset {
            DatasetSpec::Files {
                files,
                files_per_task,
            } => {
                if *files_per_task == 0 {
                    return Err(Report::new(DatasetError::Partition))
                        .attach_printable("files_per_task must be at least 1");
                }

                let units = files
                    .chunks(*files_per_task)
                    .enumerate()
                    .map(|(chunk, files)| NewUnit {
                        files: files.to_vec(),
                        lumis: (0..files.len())
                            .map(|i| Lumi::new(1, (chunk * files_per_task + i + 1) as u32))
                            .collect(),
                        arg: None,
                    })
                    .collect();
                Ok(units)
            }
            DatasetSpec::Production {
                events_per_task,
                events_per_lumi,
                num_tasks,
                ..
            } => {
                if *events_per_lumi == 0 {
                    return Err(Report::new(DatasetError::Partition))
                        .attach_printable("events_per_lumi must be at least 1");
                }

                let lumis_per_task = (events_per_task / events_per_lumi).max(1) as u32;
                let units = (0..*num_tasks)
                    .map(|task| NewUnit {
                        files: Vec::new(),
                        lumis: (0..lumis_per_task)
                            .map(|i| Lumi::new(1, task * lumis_per_task + i + 1))
                            .collect(),
                        arg: None,
                    })
                    .collect();
                Ok(units)
            }
            DatasetSpec::Parent => Ok(Vec::new()),
        }
    }
}

/// Give every unit one copy per unique argument. With no unique arguments the units are
/// returned unchanged.
pub fn with_unique_arguments(units: Vec<NewUnit>, arguments: &[String]) -> Vec<NewUnit> {
    if arguments.is_empty() {
        return units;
    }

    units
        .iter()
        .flat_map(|unit| {
            arguments.iter().map(|arg| NewUnit {
                arg: Some(arg.clone()),
                ..unit.clone()
            })
        })
        .collect()
}

/// The kind of files a task writes, which decides how they are merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputKind {
    #[default]
    EventData,
    Generic,
}

/// What running a task configuration will produce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescription {
    pub outputs: Vec<String>,
    pub global_tag: Option<String>,
    pub output_kind: OutputKind,
}

/// Discovers the outputs of a task configuration for workflows that do not declare them.
pub trait TaskDescriptor: Send + Sync {
    fn describe(
        &self,
        config: &Path,
        arguments: &[String],
    ) -> Result<TaskDescription, Report<DatasetError>>;
}

/// Returns the same description for every configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDescriptor(pub TaskDescription);

impl TaskDescriptor for StaticDescriptor {
    fn describe(
        &self,
        _config: &Path,
        _arguments: &[String],
    ) -> Result<TaskDescription, Report<DatasetError>> {
        Ok(self.0.clone())
    }
}
