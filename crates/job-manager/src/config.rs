//! Controller configuration. Everything the core needs from the environment is resolved here,
//! once, when the configuration is loaded.

use std::path::{Path, PathBuf};

use error_stack::{Report, ResultExt};
use serde::Deserialize;
use thiserror::Error;
use tracing::{event, Level};

use crate::{scheduler::SchedulerBehavior, workflow::WorkflowSpec};

/// Environment variable naming the release area to package into a sandbox.
pub const RELEASE_ENV_VAR: &str = "LOCALRT";
/// Environment variable naming the directory with the wrapper and merge helper files.
pub const DATA_DIR_ENV_VAR: &str = "CREEL_DATA_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file")]
    Read,
    #[error("Invalid configuration")]
    Invalid,
    #[error("Missing setting {0}")]
    Missing(&'static str),
}

/// Helper files shipped with every job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportFiles {
    /// Sets up the runtime environment and invokes the runner.
    pub wrapper: PathBuf,
    /// Reads the job parameters and runs the executable.
    pub runner: PathBuf,
    /// Combines execution reports at the end of merge jobs.
    pub merge_reports: PathBuf,
    /// Task configuration used to merge event-data outputs.
    pub merge_config: PathBuf,
}

impl SupportFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            wrapper: dir.join("wrapper.sh"),
            runner: dir.join("task"),
            merge_reports: dir.join("creel-merge-reports"),
            merge_config: dir.join("merge_cfg.py"),
        }
    }
}

/// Executables used by merge jobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MergeCommands {
    /// Merges event-data files, driven by [SupportFiles::merge_config].
    pub event_data: String,
    /// Concatenates any other kind of output.
    pub generic: String,
}

impl Default for MergeCommands {
    fn default() -> Self {
        Self {
            event_data: "cmsRun".to_string(),
            generic: "hadd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Holds the store, the sandboxes and one directory per workflow.
    pub workdir: PathBuf,
    /// Root of the final output area.
    pub stageout: PathBuf,
    /// Location of the work unit database. Defaults to `store.db` inside the workdir.
    #[serde(default)]
    pub store: Option<PathBuf>,
    /// Directories searched for relative task configuration and extra input paths.
    #[serde(default)]
    pub basedirs: Vec<PathBuf>,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(skip)]
    pub support: Option<SupportFiles>,
    #[serde(default)]
    pub scheduler: SchedulerBehavior,
    #[serde(default)]
    pub merge: MergeCommands,
    /// Release area to package for workflows that specify neither a sandbox nor a release.
    #[serde(default)]
    pub sandbox_release: Option<PathBuf>,
    #[serde(default)]
    pub workflows: Vec<WorkflowSpec>,
}

impl ControllerConfig {
    pub fn new(workdir: PathBuf, stageout: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            workdir,
            stageout,
            store: None,
            basedirs: Vec::new(),
            support: Some(SupportFiles::in_dir(&data_dir)),
            data_dir: Some(data_dir),
            scheduler: SchedulerBehavior::default(),
            merge: MergeCommands::default(),
            sandbox_release: None,
            workflows: Vec::new(),
        }
    }

    /// Read a JSON configuration file and resolve the settings that fall back to the
    /// environment.
    pub fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        let data = std::fs::read(path)
            .change_context(ConfigError::Read)
            .attach_printable_lazy(|| path.display().to_string())?;
        let mut config: ControllerConfig = serde_json::from_slice(&data)
            .change_context(ConfigError::Invalid)
            .attach_printable_lazy(|| path.display().to_string())?;

        if let Some(dir) = path.parent() {
            if config.basedirs.is_empty() {
                config.basedirs.push(dir.to_path_buf());
            }
        }

        config.resolve_environment(|name| std::env::var_os(name).map(PathBuf::from))?;
        Ok(config)
    }

    /// Fill in the settings that default to environment variables. `lookup` returns the value
    /// of an environment variable.
    pub fn resolve_environment(
        &mut self,
        lookup: impl Fn(&str) -> Option<PathBuf>,
    ) -> Result<(), Report<ConfigError>> {
        if self.data_dir.is_none() {
            self.data_dir = lookup(DATA_DIR_ENV_VAR);
        }

        let data_dir = self
            .data_dir
            .as_deref()
            .ok_or(ConfigError::Missing("data_dir"))
            .attach_printable_lazy(|| format!("Set it or {DATA_DIR_ENV_VAR}"))?;
        self.support = Some(SupportFiles::in_dir(data_dir));

        if self.sandbox_release.is_none() {
            self.sandbox_release = lookup(RELEASE_ENV_VAR);
        }

        for workflow in self.workflows.iter_mut() {
            if workflow.sandbox.is_none() && workflow.sandbox_release.is_none() {
                workflow.sandbox_release = self.sandbox_release.clone();
                event!(Level::DEBUG, workflow = %workflow.label, release = ?workflow.sandbox_release, "using default sandbox release");
            }
        }

        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .clone()
            .unwrap_or_else(|| self.workdir.join("store.db"))
    }

    pub fn support_files(&self) -> Result<&SupportFiles, Report<ConfigError>> {
        self.support
            .as_ref()
            .ok_or(ConfigError::Missing("data_dir"))
            .map_err(Report::new)
    }
}
