//! A workflow: one command run over every unit of a dataset, with optional merging of its
//! outputs and downstream workflows consuming them.

use std::path::{Path, PathBuf};

use creel_worker::{JobId, TaskKind, TaskParameters};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{event, instrument, Level};

use crate::{
    config::ControllerConfig,
    dataset::{DatasetSpec, OutputKind, TaskDescriptor},
    sandbox::{Sandbox, SandboxManager, SANDBOX_STAGED_NAME},
    spawn::{InputFile, OutputFile},
};

/// The file written into the workflow directory to resume a run.
const STATE_FILE: &str = "workflow.json";

/// Extra time granted to a task beyond its declared runtime, in seconds.
const RUNTIME_GRACE_SECS: u64 = 10 * 60;
/// Extra time requested from the executor beyond the declared runtime, in seconds.
const RUNTIME_HINT_PADDING_SECS: u64 = 15 * 60;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid configuration for workflow {0}")]
    Configuration(String),
    #[error("Resource for workflow {0} is unavailable")]
    Resource(String),
    #[error("Failed to set up workflow {0}")]
    Setup(String),
}

/// The merge size as written in the configuration: a number of bytes, or a string with a
/// `k`, `m` or `g` suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MergeSizeSpec {
    Bytes(f64),
    Text(String),
}

impl Default for MergeSizeSpec {
    fn default() -> Self {
        MergeSizeSpec::Bytes(-1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSize {
    Disabled,
    Bytes(u64),
}

impl MergeSize {
    pub fn parse(spec: &MergeSizeSpec) -> MergeSize {
        match spec {
            MergeSizeSpec::Bytes(bytes) => Self::from_bytes(*bytes),
            MergeSizeSpec::Text(text) => Self::parse_str(text),
        }
    }

    pub fn parse_str(text: &str) -> MergeSize {
        let text = text.trim();
        let disabled = || {
            event!(Level::ERROR, merge_size = %text, "merging disabled due to malformed size");
            MergeSize::Disabled
        };

        let Some(unit) = text.chars().last() else {
            return disabled();
        };
        let multiplier = match unit.to_ascii_lowercase() {
            'k' => 1e3,
            'm' => 1e6,
            'g' => 1e9,
            _ => return disabled(),
        };

        match text[..text.len() - unit.len_utf8()].trim().parse::<f64>() {
            Ok(value) if value.is_finite() => Self::from_bytes(value * multiplier),
            _ => disabled(),
        }
    }

    fn from_bytes(bytes: f64) -> MergeSize {
        if bytes >= 1.0 {
            let bytes = bytes as u64;
            event!(Level::INFO, bytes, "merging outputs up to size");
            MergeSize::Bytes(bytes)
        } else {
            MergeSize::Disabled
        }
    }

    pub fn threshold(&self) -> Option<u64> {
        match self {
            MergeSize::Disabled => None,
            MergeSize::Bytes(bytes) => Some(*bytes),
        }
    }
}

/// A workflow as written in the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSpec {
    pub label: String,
    #[serde(default)]
    pub category: Option<String>,
    pub dataset: DatasetSpec,
    /// Label used when publishing outputs. Defaults to the label.
    #[serde(default)]
    pub publish_label: Option<String>,
    /// The upstream workflow whose outputs form the dataset.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Every unit is run once per unique argument.
    #[serde(default)]
    pub unique_arguments: Vec<String>,
    /// Output files of the task. When absent they are discovered from the task configuration.
    #[serde(default)]
    pub outputs: Option<Vec<String>>,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default)]
    pub output_kind: Option<OutputKind>,
    #[serde(default)]
    pub merge_size: MergeSizeSpec,
    #[serde(default = "default_merge_cleanup")]
    pub merge_cleanup: bool,
    /// An existing sandbox archive to reuse.
    #[serde(default)]
    pub sandbox: Option<PathBuf>,
    /// A release area to package into a sandbox.
    #[serde(default)]
    pub sandbox_release: Option<PathBuf>,
    #[serde(default)]
    pub sandbox_blacklist: Vec<String>,
    #[serde(default)]
    pub task_config: Option<PathBuf>,
    #[serde(default)]
    pub extra_inputs: Vec<PathBuf>,
    #[serde(default)]
    pub global_tag: Option<String>,
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// Expected runtime of a task, in seconds.
    #[serde(default)]
    pub runtime: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    #[serde(default)]
    pub disk_mb: Option<u64>,
}

fn default_command() -> String {
    "cmsRun".to_string()
}

fn default_output_format() -> String {
    "{base}_{id}.{ext}".to_string()
}

fn default_merge_cleanup() -> bool {
    true
}

fn default_cores() -> u32 {
    1
}

impl WorkflowSpec {
    pub fn new(label: impl Into<String>, dataset: DatasetSpec) -> Self {
        Self {
            label: label.into(),
            category: None,
            dataset,
            publish_label: None,
            parent: None,
            command: default_command(),
            arguments: Vec::new(),
            unique_arguments: Vec::new(),
            outputs: None,
            output_format: default_output_format(),
            output_kind: None,
            merge_size: MergeSizeSpec::default(),
            merge_cleanup: default_merge_cleanup(),
            sandbox: None,
            sandbox_release: None,
            sandbox_blacklist: Vec::new(),
            task_config: None,
            extra_inputs: Vec::new(),
            global_tag: None,
            cores: default_cores(),
            runtime: None,
            memory_mb: None,
            disk_mb: None,
        }
    }
}

#[derive(Debug, Clone)]
enum SandboxSource {
    Recycle(PathBuf),
    Package {
        release: PathBuf,
        blacklist: Vec<String>,
    },
}

/// The results of [Workflow::setup], saved so that a resumed run does not redo them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SetupState {
    sandbox: Sandbox,
    outputs: Vec<String>,
    task_config: Option<PathBuf>,
    extra_inputs: Vec<PathBuf>,
    global_tag: Option<String>,
    output_kind: OutputKind,
}

/// What [Workflow::setup] needs from its surroundings.
pub struct SetupContext<'a> {
    pub workdir: &'a Path,
    pub stageout: &'a Path,
    pub basedirs: &'a [PathBuf],
    pub sandboxes: &'a SandboxManager,
    pub descriptor: &'a dyn TaskDescriptor,
}

/// The kind of job being prepared by [Workflow::adjust].
#[derive(Debug, Clone, Copy)]
pub enum DispatchKind<'a> {
    Regular { unique_argument: Option<&'a str> },
    /// A merge job combining outputs whose jobs wrote the given reports.
    Merge { reports: &'a [PathBuf] },
}

#[derive(Debug)]
pub struct Workflow {
    pub label: String,
    pub category: String,
    pub publish_label: String,
    pub dataset: DatasetSpec,
    pub merge_size: MergeSize,
    pub merge_cleanup: bool,
    pub unique_arguments: Vec<String>,
    prerequisite: Option<String>,
    dependents: Vec<String>,
    command: String,
    arguments: Vec<String>,
    declared_outputs: Option<Vec<String>>,
    output_format: String,
    output_kind: Option<OutputKind>,
    sandbox_source: SandboxSource,
    task_config: Option<PathBuf>,
    extra_inputs: Vec<PathBuf>,
    global_tag: Option<String>,
    cores: u32,
    runtime: Option<u64>,
    memory_mb: Option<u64>,
    disk_mb: Option<u64>,
    workdir: Option<PathBuf>,
    state: Option<SetupState>,
}

impl Workflow {
    pub fn new(spec: WorkflowSpec) -> Result<Self, Report<WorkflowError>> {
        let sandbox_source = match (spec.sandbox, spec.sandbox_release) {
            (Some(archive), _) => SandboxSource::Recycle(archive),
            (None, Some(release)) => SandboxSource::Package {
                release,
                blacklist: spec.sandbox_blacklist,
            },
            (None, None) => {
                return Err(Report::new(WorkflowError::Configuration(spec.label)))
                    .attach_printable("Neither a sandbox nor a sandbox release was given");
            }
        };

        if spec.parent.is_some() != matches!(spec.dataset, DatasetSpec::Parent) {
            return Err(Report::new(WorkflowError::Configuration(spec.label)))
                .attach_printable("A parent workflow goes with a parent dataset, and only with one");
        }

        let merge_size = MergeSize::parse(&spec.merge_size);
        Ok(Self {
            category: spec.category.unwrap_or_else(|| spec.label.clone()),
            publish_label: spec.publish_label.unwrap_or_else(|| spec.label.clone()),
            label: spec.label,
            dataset: spec.dataset,
            merge_size,
            merge_cleanup: spec.merge_cleanup,
            unique_arguments: spec.unique_arguments,
            prerequisite: spec.parent,
            dependents: Vec::new(),
            command: spec.command,
            arguments: spec.arguments,
            declared_outputs: spec.outputs,
            output_format: spec.output_format,
            output_kind: spec.output_kind,
            sandbox_source,
            task_config: spec.task_config,
            extra_inputs: spec.extra_inputs,
            global_tag: spec.global_tag,
            cores: spec.cores,
            runtime: spec.runtime,
            memory_mb: spec.memory_mb,
            disk_mb: spec.disk_mb,
            workdir: None,
            state: None,
        })
    }

    pub fn prerequisite(&self) -> Option<&str> {
        self.prerequisite.as_deref()
    }

    pub fn dependents(&self) -> &[String] {
        &self.dependents
    }

    pub fn merges(&self) -> bool {
        self.merge_size != MergeSize::Disabled
    }

    /// Output file names, as discovered at setup or declared in the configuration.
    pub fn output_names(&self) -> &[String] {
        match (&self.state, &self.declared_outputs) {
            (Some(state), _) => &state.outputs,
            (None, Some(declared)) => declared,
            (None, None) => &[],
        }
    }

    pub fn sandbox(&self) -> Option<&Sandbox> {
        self.state.as_ref().map(|s| &s.sandbox)
    }

    /// The directory holding this workflow's job directories.
    pub fn workdir(&self) -> Result<&Path, Report<WorkflowError>> {
        self.workdir
            .as_deref()
            .ok_or_else(|| Report::new(WorkflowError::Setup(self.label.clone())))
            .attach_printable("Workflow has not been set up")
    }

    fn setup_state(&self) -> Result<&SetupState, Report<WorkflowError>> {
        self.state
            .as_ref()
            .ok_or_else(|| Report::new(WorkflowError::Setup(self.label.clone())))
            .attach_printable("Workflow has not been set up")
    }

    /// Add a workflow consuming the output of this one.
    pub fn register(&mut self, dependent: &str) -> Result<(), Report<WorkflowError>> {
        let outputs = self.output_names().len();
        if outputs != 1 {
            return Err(Report::new(WorkflowError::Configuration(self.label.clone())))
                .attach_printable_lazy(|| {
                    format!(
                        "Workflow {dependent} depends on this workflow, which needs exactly one output but has {outputs}"
                    )
                });
        }

        event!(Level::DEBUG, workflow = %self.label, %dependent, "registering dependent");
        self.dependents.push(dependent.to_string());
        Ok(())
    }

    /// Create the working directory, obtain the sandbox, copy the task inputs and determine
    /// the outputs.
    #[instrument(level = "debug", skip(self, ctx), fields(workflow = %self.label))]
    pub async fn setup(&mut self, ctx: &SetupContext<'_>) -> Result<(), Report<WorkflowError>> {
        let error = || WorkflowError::Setup(self.label.clone());
        let workdir = ctx.workdir.join(&self.label);
        tokio::fs::create_dir_all(&workdir)
            .await
            .change_context_lazy(error)
            .attach_printable_lazy(|| workdir.display().to_string())?;

        let stageout = ctx.stageout.join(&self.label);
        if stageout_has_files(&stageout).await {
            return Err(Report::new(WorkflowError::Resource(self.label.clone())))
                .attach_printable_lazy(|| {
                    format!("Stageout directory {} is not empty", stageout.display())
                });
        }

        let sandbox = match &self.sandbox_source {
            SandboxSource::Recycle(archive) => ctx.sandboxes.recycle(archive).await,
            SandboxSource::Package { release, blacklist } => {
                ctx.sandboxes.package(release, blacklist).await
            }
        }
        .change_context_lazy(error)?;

        let task_config = match &self.task_config {
            Some(path) => Some(copy_input(path, ctx.basedirs, &workdir).await.change_context_lazy(error)?),
            None => None,
        };

        let mut extra_inputs = Vec::with_capacity(self.extra_inputs.len());
        for path in &self.extra_inputs {
            extra_inputs.push(copy_input(path, ctx.basedirs, &workdir).await.change_context_lazy(error)?);
        }

        let mut global_tag = self.global_tag.clone();
        let mut output_kind = self.output_kind.unwrap_or_default();
        let outputs = match (&self.declared_outputs, &task_config) {
            (Some(declared), _) => declared.clone(),
            (None, Some(config)) => {
                let description = ctx
                    .descriptor
                    .describe(config, &self.arguments)
                    .change_context_lazy(error)?;
                global_tag = global_tag.or(description.global_tag);
                output_kind = self.output_kind.unwrap_or(description.output_kind);
                description.outputs
            }
            (None, None) => Vec::new(),
        };

        tokio::fs::create_dir_all(&stageout)
            .await
            .change_context_lazy(|| WorkflowError::Resource(self.label.clone()))
            .attach_printable_lazy(|| stageout.display().to_string())?;

        let state = SetupState {
            sandbox,
            outputs,
            task_config,
            extra_inputs,
            global_tag,
            output_kind,
        };
        let data = serde_json::to_vec_pretty(&state).change_context_lazy(error)?;
        tokio::fs::write(workdir.join(STATE_FILE), data)
            .await
            .change_context_lazy(error)?;

        event!(Level::INFO, workflow = %self.label, sandbox = %state.sandbox.version, outputs = ?state.outputs, "workflow set up");
        self.state = Some(state);
        self.workdir = Some(workdir);
        Ok(())
    }

    /// Reload the results of an earlier [Workflow::setup].
    pub async fn restore(&mut self, workdir: &Path) -> Result<(), Report<WorkflowError>> {
        let error = || WorkflowError::Setup(self.label.clone());
        let workdir = workdir.join(&self.label);
        let path = workdir.join(STATE_FILE);
        let data = tokio::fs::read(&path)
            .await
            .change_context_lazy(error)
            .attach_printable_lazy(|| path.display().to_string())?;
        let state: SetupState = serde_json::from_slice(&data)
            .change_context_lazy(error)
            .attach_printable_lazy(|| path.display().to_string())?;

        event!(Level::INFO, workflow = %self.label, sandbox = %state.sandbox.version, "workflow restored");
        self.state = Some(state);
        self.workdir = Some(workdir);
        Ok(())
    }

    /// The outputs of the job `id`, as pairs of the file name the task writes and the path
    /// the file is staged to, relative to the stageout root.
    pub fn outputs<'a>(
        &'a self,
        id: impl std::fmt::Display,
    ) -> impl Iterator<Item = (String, PathBuf)> + Clone + 'a {
        let id = id.to_string();
        self.output_names().iter().map(move |name| {
            let (base, ext) = split_extension(name);
            let staged = format_output_name(&self.output_format, base, ext, &id);
            (name.clone(), Path::new(&self.label).join(staged))
        })
    }

    /// The runtime to request from the executor, in seconds.
    pub fn runtime_hint(&self) -> Option<u64> {
        self.runtime.map(|r| r + RUNTIME_HINT_PADDING_SECS)
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    pub fn memory_mb(&self) -> Option<u64> {
        self.memory_mb
    }

    pub fn disk_mb(&self) -> Option<u64> {
        self.disk_mb
    }

    /// Fill in the workflow-specific parts of a job: its executable and arguments, the files
    /// staged in with it, and the files staged back out.
    pub fn adjust(
        &self,
        config: &ControllerConfig,
        job: JobId,
        kind: DispatchKind<'_>,
        params: &mut TaskParameters,
        inputs: &mut Vec<InputFile>,
        outputs: &mut Vec<OutputFile>,
    ) -> Result<(), Report<WorkflowError>> {
        let state = self.setup_state()?;
        let support = config
            .support_files()
            .change_context_lazy(|| WorkflowError::Configuration(self.label.clone()))?;

        inputs.push(InputFile::new(
            &state.sandbox.archive,
            SANDBOX_STAGED_NAME,
            true,
        ));

        let task_config = match kind {
            DispatchKind::Regular { unique_argument } => {
                params.kind = TaskKind::Regular;
                params.executable = self.command.clone();
                params.arguments = self.arguments.clone();
                if let Some(arg) = unique_argument {
                    params.arguments.push(arg.to_string());
                }

                for path in &state.extra_inputs {
                    inputs.push(InputFile::new(path, file_name(path), true));
                }

                params.cores = Some(self.cores);
                params.task_runtime = self.runtime.map(|r| r + RUNTIME_GRACE_SECS);

                if let DatasetSpec::Production {
                    events_per_task,
                    events_per_lumi,
                    randomize_seeds,
                    ..
                } = &self.dataset
                {
                    params.mask.events = i64::try_from(*events_per_task).unwrap_or(i64::MAX);
                    params.mask.events_per_lumi = Some(*events_per_lumi);
                    params.randomize_seeds = *randomize_seeds;
                } else {
                    params.mask.events = -1;
                }

                state.task_config.clone()
            }
            DispatchKind::Merge { reports } => {
                params.kind = TaskKind::Merge;
                let tool = file_name(&support.merge_reports);
                inputs.push(InputFile::new(&support.merge_reports, &tool, true));

                let mut epilogue = vec![format!("./{tool}"), creel_worker::REPORT_FILE.to_string()];
                for report in reports {
                    let renamed = report_name(report);
                    inputs.push(InputFile::new(report, &renamed, false));
                    epilogue.push(renamed);
                }
                params.prologue = None;
                params.epilogue = Some(epilogue);

                let output = self
                    .outputs(job)
                    .next()
                    .map(|(_, staged)| file_name(&staged))
                    .ok_or_else(|| Report::new(WorkflowError::Configuration(self.label.clone())))
                    .attach_printable("Merging a workflow without outputs")?;

                match state.output_kind {
                    OutputKind::EventData => {
                        params.executable = config.merge.event_data.clone();
                        params.arguments = vec![format!("output={output}")];
                        params.append_inputs_to_args = false;
                        Some(support.merge_config.clone())
                    }
                    OutputKind::Generic => {
                        params.executable = config.merge.generic.clone();
                        params.arguments = vec![
                            "-n".to_string(),
                            "0".to_string(),
                            "-f".to_string(),
                            output,
                        ];
                        params.append_inputs_to_args = true;
                        None
                    }
                }
            }
        };

        params.task_config = task_config.as_ref().map(|path| file_name(path));
        if let Some(path) = &task_config {
            inputs.push(InputFile::new(path, file_name(path), true));
        }
        params.global_tag = state.global_tag.clone();

        params.output_files.clear();
        for (name, staged) in self.outputs(job) {
            let staged_name = file_name(&staged);
            outputs.push(OutputFile::new(config.stageout.join(&staged), &staged_name));
            params.output_files.push((name, staged_name));
        }

        Ok(())
    }
}

/// True if the directory exists and holds anything.
async fn stageout_has_files(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

/// Find a task input, relative paths being looked up in each base directory in turn, and
/// copy it into the workflow directory.
async fn copy_input(
    path: &Path,
    basedirs: &[PathBuf],
    workdir: &Path,
) -> Result<PathBuf, Report<std::io::Error>> {
    let source = if path.is_absolute() {
        path.to_path_buf()
    } else {
        basedirs
            .iter()
            .map(|dir| dir.join(path))
            .find(|candidate| candidate.exists())
            .unwrap_or_else(|| path.to_path_buf())
    };

    let target = workdir.join(file_name(path));
    if tokio::fs::try_exists(&target).await.unwrap_or(false) {
        return Ok(target);
    }

    let source_for_copy = source.clone();
    let target_for_copy = target.clone();
    tokio::task::spawn_blocking(move || copy_tree(&source_for_copy, &target_for_copy))
        .await
        .map_err(|e| Report::new(std::io::Error::new(std::io::ErrorKind::Other, e)))?
        .attach_printable_lazy(|| source.display().to_string())?;

    Ok(target)
}

fn copy_tree(source: &Path, target: &Path) -> Result<(), Report<std::io::Error>> {
    if source.is_file() {
        std::fs::copy(source, target)?;
        return Ok(());
    }

    for entry in walkdir::WalkDir::new(source) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else {
            std::fs::copy(entry.path(), &destination)?;
        }
    }

    Ok(())
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// A name for a report that does not collide with the reports of other jobs, built from the
/// last three components of its path.
fn report_name(path: &Path) -> String {
    let components = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    components[components.len().saturating_sub(3)..].join("_")
}

/// Split a file name into its base and extension, without the separating dot. Leading dots
/// do not start an extension.
fn split_extension(name: &str) -> (&str, &str) {
    let start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    let file = &name[start..];
    match file.rfind('.') {
        Some(dot) if file[..dot].chars().any(|c| c != '.') => {
            (&name[..start + dot], &name[start + dot + 1..])
        }
        _ => (name, ""),
    }
}

/// Substitute `{base}`, `{ext}` and `{id}` in an output file name template. Other text,
/// including unknown placeholders, is kept as it is.
fn format_output_name(template: &str, base: &str, ext: &str, id: &str) -> String {
    let mut result = String::with_capacity(template.len() + base.len() + id.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        result.push_str(&rest[..open]);
        let after = &rest[open..];
        let replacement = [("{base}", base), ("{ext}", ext), ("{id}", id)]
            .into_iter()
            .find(|(placeholder, _)| after.starts_with(placeholder));
        match replacement {
            Some((placeholder, value)) => {
                result.push_str(value);
                rest = &after[placeholder.len()..];
            }
            None => {
                result.push('{');
                rest = &after[1..];
            }
        }
    }
    result.push_str(rest);
    result
}
