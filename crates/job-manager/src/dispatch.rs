//! The dispatcher turns claimed work units into job descriptors for the executor, and folds the
//! results of those jobs back into the store, the job directories and the merge groups.


use std::path::{Path, PathBuf};

use ahash::{HashMap, HashSet};
use creel_worker::{ExecutionReport, JobId, TaskKind, TaskParameters, PARAMETERS_FILE, REPORT_FILE};
use error_stack::{Report, ResultExt};
use parking_lot::Mutex;
use petgraph::{
    algo::{is_cyclic_directed, toposort},
    graph::DiGraph,
};
use thiserror::Error;
use tracing::{event, instrument, Level};

use crate::{
    config::ControllerConfig,
    dataset::{with_unique_arguments, DatasetPartitioner, TaskDescriptor},
    merge::{MergeGroup, MergeState},
    sandbox::SandboxManager,
    spawn::{DispatchDescriptor, InputFile, OutputFile, Resources},
    store::{
        Batch, Completed, Completion, DownstreamUnit, JobKind, JobRecord, JobStatus, NewOutput,
        NewUnit, OutputRecord, UnitCounts, WorkUnitStore,
    },
    task_status::{StatusCollector, StatusUpdateData},
    workflow::{file_name, DispatchKind, SetupContext, Workflow},
};

/// The captured output of a job.
pub const LOG_FILE: &str = "job.log";
/// The output of the executable itself, staged back by the job.
pub const EXECUTABLE_LOG_FILE: &str = "executable.log";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid workflow configuration")]
    Configuration,
    #[error("Workflow dependencies form a cycle")]
    Cycle,
    #[error("Failed to set up workflow {0}")]
    Setup(String),
    #[error("Work unit store failed")]
    Store,
    #[error("Failed to prepare job {0}")]
    Prepare(JobId),
    #[error("Failed to release job {0}")]
    Release(JobId),
    #[error("Unknown job {0}")]
    UnknownJob(JobId),
    #[error("Unknown workflow {0}")]
    UnknownWorkflow(String),
    #[error("Failed to access job directories")]
    Io,
}

pub struct Dispatcher {
    config: ControllerConfig,
    store: WorkUnitStore,
    workflows: HashMap<String, Workflow>,
    /// Workflow labels with every workflow after its prerequisite.
    order: Vec<String>,
    merges: Mutex<HashMap<String, MergeGroup>>,
    status: StatusCollector,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workflows", &self.order)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Set up every configured workflow and bring the store and the job directories back into
    /// a consistent state after an earlier run.
    #[instrument(level = "info", skip_all)]
    pub async fn new(
        config: ControllerConfig,
        partitioner: &dyn DatasetPartitioner,
        descriptor: &dyn TaskDescriptor,
    ) -> Result<Self, Report<DispatchError>> {
        let mut workflows = HashMap::default();
        for spec in config.workflows.iter().cloned() {
            let label = spec.label.clone();
            let workflow = Workflow::new(spec).change_context(DispatchError::Configuration)?;
            if workflows.insert(label.clone(), workflow).is_some() {
                return Err(Report::new(DispatchError::Configuration))
                    .attach_printable_lazy(|| format!("Workflow {label} is defined twice"));
            }
        }
        let order = dependency_order(&workflows)?;

        tokio::fs::create_dir_all(&config.workdir)
            .await
            .change_context(DispatchError::Io)
            .attach_printable_lazy(|| config.workdir.display().to_string())?;
        let store = WorkUnitStore::open(&config.store_path(), config.scheduler.retry.clone())
            .await
            .change_context(DispatchError::Store)?;
        store.reset().await.change_context(DispatchError::Store)?;

        let sandboxes = SandboxManager::new(config.workdir.join("sandboxes"));
        let ctx = SetupContext {
            workdir: &config.workdir,
            stageout: &config.stageout,
            basedirs: &config.basedirs,
            sandboxes: &sandboxes,
            descriptor,
        };

        // Workflows set up concurrently so that the ones sharing a release wait on a single
        // sandbox build.
        let registered = futures::future::try_join_all(workflows.values_mut().map(|workflow| {
            let ctx = &ctx;
            let store = &store;
            let workdir = &config.workdir;
            async move {
                let label = workflow.label.clone();
                let registered = store
                    .is_registered(&label)
                    .await
                    .change_context(DispatchError::Store)?;
                let result = if registered {
                    workflow.restore(workdir).await
                } else {
                    workflow.setup(ctx).await
                };
                result.change_context_lazy(|| DispatchError::Setup(label.clone()))?;
                Ok::<_, Report<DispatchError>>((label, registered))
            }
        }))
        .await?;

        for label in &order {
            let parent = workflows
                .get(label)
                .and_then(|w| w.prerequisite())
                .map(String::from);
            if let Some(parent) = parent {
                workflows
                    .get_mut(&parent)
                    .ok_or_else(|| Report::new(DispatchError::UnknownWorkflow(parent.clone())))?
                    .register(label)
                    .change_context(DispatchError::Configuration)?;
            }
        }

        for (label, _) in registered.iter().filter(|(_, registered)| !registered) {
            let workflow = workflows
                .get(label)
                .ok_or_else(|| Report::new(DispatchError::UnknownWorkflow(label.clone())))?;
            let units = partitioner
                .partition(&workflow.dataset)
                .change_context_lazy(|| DispatchError::Setup(label.clone()))?;
            let units = with_unique_arguments(units, &workflow.unique_arguments);
            store
                .register(label, &units)
                .await
                .change_context(DispatchError::Store)?;
        }

        let status = StatusCollector::new(1024);
        for workflow in workflows.values() {
            recover_job_dirs(&store, workflow, &status).await?;
        }

        let mut merges = HashMap::default();
        for workflow in workflows.values() {
            let Some(threshold) = workflow.merge_size.threshold() else {
                continue;
            };

            let mut group = MergeGroup::new(
                &workflow.label,
                threshold,
                config.scheduler.flush_on_exhaustion,
            );
            let outputs = store
                .unmerged_outputs(&workflow.label)
                .await
                .change_context(DispatchError::Store)?;
            if !outputs.is_empty() {
                event!(Level::INFO, workflow = %workflow.label, outputs = outputs.len(), "resuming merge group");
            }
            for output in outputs {
                group.add(output);
            }
            merges.insert(workflow.label.clone(), group);
        }

        Ok(Self {
            config,
            store,
            workflows,
            order,
            merges: Mutex::new(merges),
            status,
        })
    }

    pub fn store(&self) -> &WorkUnitStore {
        &self.store
    }

    pub fn status(&self) -> &StatusCollector {
        &self.status
    }

    pub fn workflow(&self, label: &str) -> Result<&Workflow, Report<DispatchError>> {
        self.workflows
            .get(label)
            .ok_or_else(|| Report::new(DispatchError::UnknownWorkflow(label.to_string())))
    }

    pub fn merge_state(&self, label: &str) -> Option<MergeState> {
        self.merges.lock().get(label).map(|g| g.state())
    }

    /// Unit counts for every workflow, upstream workflows first.
    pub async fn counts(&self) -> Result<Vec<(String, UnitCounts)>, Report<DispatchError>> {
        let mut counts = Vec::with_capacity(self.order.len());
        for label in &self.order {
            let c = self
                .store
                .counts(label)
                .await
                .change_context(DispatchError::Store)?;
            counts.push((label.clone(), c));
        }
        Ok(counts)
    }

    /// Create up to `n` jobs. Merge jobs that are ready go first, the rest are filled with
    /// batches of work units. An empty result means nothing can run right now, not that the
    /// work is finished; see [Dispatcher::done].
    #[instrument(level = "debug", skip(self))]
    pub async fn obtain(&self, n: usize) -> Result<Vec<DispatchDescriptor>, Report<DispatchError>> {
        self.update_exhaustion().await?;

        let mut descriptors = Vec::new();
        let ready = {
            let mut merges = self.merges.lock();
            merges
                .iter_mut()
                .filter_map(|(label, group)| group.take_ready().map(|o| (label.clone(), o)))
                .take(n)
                .collect::<Vec<_>>()
        };

        let mut ready = ready.into_iter();
        while let Some((label, outputs)) = ready.next() {
            match self.dispatch_merge(&label, outputs).await {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => {
                    let mut merges = self.merges.lock();
                    for (label, outputs) in ready {
                        if let Some(group) = merges.get_mut(&label) {
                            group.restore(outputs);
                        }
                    }
                    return self.partial(descriptors, e);
                }
            }
        }

        let remaining = n.saturating_sub(descriptors.len());
        if remaining == 0 {
            return Ok(descriptors);
        }

        let caps = vec![self.config.scheduler.units_per_batch; remaining];
        let batches = match self.store.claim(&caps).await {
            Ok(batches) => batches,
            Err(e) => return self.partial(descriptors, e.change_context(DispatchError::Store)),
        };

        let mut error = None;
        for batch in batches {
            match self.prepare_batch(&batch).await {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => {
                    self.abandon(batch.job, &batch.workflow).await;
                    error.get_or_insert(e);
                }
            }
        }

        match error {
            Some(e) => self.partial(descriptors, e),
            None => Ok(descriptors),
        }
    }

    /// Jobs that were created already have to reach the executor, so an error only surfaces
    /// when there is nothing else to return.
    fn partial(
        &self,
        descriptors: Vec<DispatchDescriptor>,
        error: Report<DispatchError>,
    ) -> Result<Vec<DispatchDescriptor>, Report<DispatchError>> {
        if descriptors.is_empty() {
            Err(error)
        } else {
            event!(Level::ERROR, ?error, "failed to create some jobs");
            Ok(descriptors)
        }
    }

    /// Mark a job that could not be dispatched as failed.
    async fn abandon(&self, job: JobId, workflow: &str) {
        if let Err(e) = self.store.complete(job, true).await {
            event!(Level::ERROR, %job, %workflow, error = ?e, "failed to abandon job");
        }

        if let Some(group) = self.merges.lock().get_mut(workflow) {
            group.finish(job, false);
        }
    }

    async fn dispatch_merge(
        &self,
        label: &str,
        outputs: Vec<OutputRecord>,
    ) -> Result<DispatchDescriptor, Report<DispatchError>> {
        let ids = outputs.iter().map(|o| o.id).collect::<Vec<_>>();
        let job = match self.store.claim_merge(label, &ids).await {
            Ok(job) => job,
            Err(e) => {
                if let Some(group) = self.merges.lock().get_mut(label) {
                    group.restore(outputs);
                }
                return Err(e.change_context(DispatchError::Store));
            }
        };

        if let Some(group) = self.merges.lock().get_mut(label) {
            group.dispatched(job, outputs.clone());
        }

        let workflow = self.workflow(label)?;
        let files = outputs
            .iter()
            .map(|o| self.config.stageout.join(&o.path).to_string_lossy().into_owned())
            .collect();
        let reports = outputs
            .iter()
            .map(|o| PathBuf::from(&o.report))
            .collect::<Vec<_>>();
        let params = TaskParameters::new(TaskKind::Merge, files, Vec::new());

        match self
            .prepare(workflow, job, DispatchKind::Merge { reports: &reports }, params, outputs.len())
            .await
        {
            Ok(descriptor) => Ok(descriptor),
            Err(e) => {
                self.abandon(job, label).await;
                Err(e)
            }
        }
    }

    async fn prepare_batch(&self, batch: &Batch) -> Result<DispatchDescriptor, Report<DispatchError>> {
        let workflow = self.workflow(&batch.workflow)?;
        let params = TaskParameters::new(TaskKind::Regular, batch.files(), batch.lumis());
        self.prepare(
            workflow,
            batch.job,
            DispatchKind::Regular {
                unique_argument: batch.arg.as_deref(),
            },
            params,
            batch.units.len(),
        )
        .await
    }

    /// Create the job directory, write the job parameters into it and describe the job for the
    /// executor.
    async fn prepare(
        &self,
        workflow: &Workflow,
        job: JobId,
        kind: DispatchKind<'_>,
        mut params: TaskParameters,
        units: usize,
    ) -> Result<DispatchDescriptor, Report<DispatchError>> {
        let error = || DispatchError::Prepare(job);
        let job_dir = workflow
            .workdir()
            .change_context_lazy(error)?
            .join(JobStatus::Running.dir_name())
            .join(job.to_string());
        tokio::fs::create_dir_all(&job_dir)
            .await
            .change_context_lazy(error)
            .attach_printable_lazy(|| job_dir.display().to_string())?;

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        workflow
            .adjust(&self.config, job, kind, &mut params, &mut inputs, &mut outputs)
            .change_context_lazy(error)?;

        let parameters = job_dir.join(PARAMETERS_FILE);
        let data = params.to_json().change_context_lazy(error)?;
        tokio::fs::write(&parameters, data)
            .await
            .change_context_lazy(error)?;

        let support = self.config.support_files().change_context_lazy(error)?;
        let wrapper = file_name(&support.wrapper);
        let runner = file_name(&support.runner);
        inputs.push(InputFile::new(parameters, PARAMETERS_FILE, false));
        inputs.push(InputFile::new(&support.wrapper, &wrapper, true));
        inputs.push(InputFile::new(&support.runner, &runner, true));
        outputs.push(OutputFile::new(job_dir.join(REPORT_FILE), REPORT_FILE));
        outputs.push(OutputFile::new(
            job_dir.join(EXECUTABLE_LOG_FILE),
            EXECUTABLE_LOG_FILE,
        ));

        let merge = params.kind == TaskKind::Merge;
        event!(Level::DEBUG, %job, workflow = %workflow.label, units, merge, "dispatching job");
        self.status
            .add(job, &workflow.label, StatusUpdateData::Dispatched { units, merge });

        Ok(DispatchDescriptor {
            id: job,
            workflow: workflow.label.clone(),
            merge,
            command: format!("./{wrapper} ./{runner} {PARAMETERS_FILE}"),
            inputs,
            outputs,
            resources: Resources {
                cores: Some(workflow.cores()),
                memory_mb: workflow.memory_mb(),
                disk_mb: workflow.disk_mb(),
                runtime_secs: workflow.runtime_hint(),
            },
        })
    }

    /// Record the result of a job. A non-zero return code fails the job's units. Releasing a
    /// job a second time only replaces its log.
    #[instrument(level = "debug", skip(self, output))]
    pub async fn release(
        &self,
        job: JobId,
        return_code: i32,
        output: &str,
    ) -> Result<Completed, Report<DispatchError>> {
        let error = || DispatchError::Release(job);
        let record = self
            .store
            .job(job)
            .await
            .change_context_lazy(error)?
            .ok_or_else(|| Report::new(DispatchError::UnknownJob(job)))?;
        let workflow = self.workflow(&record.workflow)?;
        let workdir = workflow.workdir().change_context_lazy(error)?;

        let failed = return_code != 0;
        let name = job.to_string();
        let running = workdir.join(JobStatus::Running.dir_name()).join(&name);
        let finished_status = if failed {
            JobStatus::Failed
        } else {
            JobStatus::Successful
        };
        let finished = workdir.join(finished_status.dir_name()).join(&name);

        let mut completion = Completion {
            log: Some(output.to_string()),
            ..Completion::new(failed)
        };
        if !failed && record.status == JobStatus::Running {
            self.collect_outputs(workflow, &record, &running, &finished, &mut completion)
                .await;
        }

        let completed = self
            .store
            .complete_with(job, completion.clone())
            .await
            .change_context_lazy(error)?;

        let (units, output_ids) = match &completed {
            Completed::Duplicate => {
                let dir = existing_job_dir(workdir, &name).await;
                if let Some(dir) = dir {
                    write_log(&dir, output).await;
                }
                event!(Level::DEBUG, %job, workflow = %workflow.label, "job released again");
                return Ok(completed);
            }
            Completed::Applied { units, outputs } => (units, outputs),
        };

        // The store has already committed the result, so the in-memory state below has to
        // follow it. A directory left in `running` is moved by recovery on the next start.
        write_log(&running, output).await;
        if let Err(e) = move_dir(&running, &finished).await {
            event!(Level::WARN, %job, workflow = %workflow.label, error = ?e, "failed to move job directory");
        }

        match record.kind {
            JobKind::Merge => {
                let consumed = self
                    .merges
                    .lock()
                    .get_mut(&workflow.label)
                    .map(|group| group.finish(job, !failed))
                    .unwrap_or_default();
                if !failed && workflow.merge_cleanup {
                    self.remove_outputs(&consumed).await;
                }
            }
            JobKind::Regular => {
                let new_outputs = completion
                    .outputs
                    .iter()
                    .zip(output_ids.iter())
                    .filter(|(output, _)| output.mergeable)
                    .map(|(output, id)| OutputRecord {
                        id: *id,
                        workflow: workflow.label.clone(),
                        job,
                        path: output.path.clone(),
                        report: output.report.clone(),
                        size: output.size,
                    })
                    .collect::<Vec<_>>();
                if !new_outputs.is_empty() {
                    if let Some(group) = self.merges.lock().get_mut(&workflow.label) {
                        for output in new_outputs {
                            group.add(output);
                        }
                    }
                }
            }
        }

        if failed {
            let attempts = units
                .iter()
                .map(|u| format!("{}:{}", u.id, u.attempts))
                .collect::<Vec<_>>()
                .join(",");
            event!(Level::WARN, %job, workflow = %workflow.label, return_code, units = %attempts, "job failed");
            self.status
                .add(job, &workflow.label, StatusUpdateData::Failed { return_code });
        } else {
            event!(Level::INFO, %job, workflow = %workflow.label, units = units.len(), "job succeeded");
            self.status
                .add(job, &workflow.label, StatusUpdateData::Succeeded);
        }

        Ok(completed)
    }

    /// Describe the outputs of a successful job. Outputs of a merging workflow wait in its
    /// merge group; final outputs become units of every dependent workflow.
    async fn collect_outputs(
        &self,
        workflow: &Workflow,
        record: &JobRecord,
        running: &Path,
        finished: &Path,
        completion: &mut Completion,
    ) {
        let report = match ExecutionReport::read(&running.join(REPORT_FILE)) {
            Ok(report) => Some(report),
            Err(e) => {
                event!(Level::DEBUG, job = %record.id, error = ?e, "no usable report, using file sizes");
                None
            }
        };

        let report_path = finished.join(REPORT_FILE).to_string_lossy().into_owned();
        let merging = workflow.merges() && record.kind == JobKind::Regular;
        // Only the first output is merged, and only it feeds dependent workflows.
        let limit = if record.kind == JobKind::Merge { 1 } else { usize::MAX };
        for (index, (_, staged)) in workflow.outputs(record.id).take(limit).enumerate() {
            let staged_name = file_name(&staged);
            let destination = self.config.stageout.join(&staged);
            let size = match report.as_ref().and_then(|r| r.output_size(&staged_name)) {
                Some(size) => size,
                None => tokio::fs::metadata(&destination)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0),
            };

            let mergeable = merging && index == 0;
            completion.outputs.push(NewOutput {
                path: staged.to_string_lossy().into_owned(),
                report: report_path.clone(),
                size,
                mergeable,
            });

            if index == 0 && !mergeable {
                completion
                    .downstream
                    .extend(self.downstream_units(workflow, &destination));
            }
        }
    }

    fn downstream_units(&self, workflow: &Workflow, file: &Path) -> Vec<DownstreamUnit> {
        let unit = NewUnit {
            files: vec![file.to_string_lossy().into_owned()],
            ..Default::default()
        };

        workflow
            .dependents()
            .iter()
            .filter_map(|label| self.workflows.get(label))
            .flat_map(|dependent| {
                with_unique_arguments(vec![unit.clone()], &dependent.unique_arguments)
                    .into_iter()
                    .map(|unit| DownstreamUnit {
                        workflow: dependent.label.clone(),
                        unit,
                    })
            })
            .collect()
    }

    async fn remove_outputs(&self, outputs: &[OutputRecord]) {
        for output in outputs {
            let path = self.config.stageout.join(&output.path);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                event!(Level::WARN, path = %path.display(), error = %e, "failed to remove merged output");
            }
        }
    }

    /// Tell merge groups whether their workflow can still produce outputs. A workflow is
    /// exhausted when it has no unfinished units and its prerequisite is finished. A workflow
    /// is finished once it is exhausted and its merge group has nothing left to merge.
    async fn update_exhaustion(&self) -> Result<(), Report<DispatchError>> {
        let mut unfinished = HashMap::default();
        for label in &self.order {
            let count = self
                .store
                .unfinished_count_for(label)
                .await
                .change_context(DispatchError::Store)?;
            unfinished.insert(label.as_str(), count);
        }

        let mut finished: HashSet<&str> = HashSet::default();
        let mut merges = self.merges.lock();
        for label in &self.order {
            let upstream_done = match self.workflows.get(label).and_then(|w| w.prerequisite()) {
                None => true,
                Some(parent) => finished.contains(parent),
            };
            let exhausted =
                upstream_done && unfinished.get(label.as_str()).copied().unwrap_or(0) == 0;

            // Parents come first in `order`, so their groups already reflect this pass.
            let drained = match merges.get_mut(label) {
                Some(group) => {
                    group.set_exhausted(exhausted);
                    group.outstanding() == 0
                }
                None => true,
            };

            if exhausted && drained {
                finished.insert(label.as_str());
            }
        }
        Ok(())
    }

    /// Units that are not finished plus merge work that still has to run.
    pub async fn work_left(&self) -> Result<u64, Report<DispatchError>> {
        self.update_exhaustion().await?;
        let units = self
            .store
            .unfinished_count()
            .await
            .change_context(DispatchError::Store)?;
        let merges = self
            .merges
            .lock()
            .values()
            .map(|g| g.outstanding() as u64)
            .sum::<u64>();
        Ok(units + merges)
    }

    pub async fn done(&self) -> Result<bool, Report<DispatchError>> {
        Ok(self.work_left().await? == 0)
    }
}

/// Order workflows so that every workflow comes after its prerequisite, rejecting unknown
/// prerequisites and cycles.
fn dependency_order(
    workflows: &HashMap<String, Workflow>,
) -> Result<Vec<String>, Report<DispatchError>> {
    let mut labels = workflows.keys().cloned().collect::<Vec<_>>();
    labels.sort();

    let mut graph = DiGraph::<String, ()>::new();
    let mut nodes = HashMap::default();
    for label in labels {
        let node = graph.add_node(label.clone());
        nodes.insert(label, node);
    }

    for (label, workflow) in workflows {
        let Some(parent) = workflow.prerequisite() else {
            continue;
        };
        let (Some(&from), Some(&to)) = (nodes.get(parent), nodes.get(label)) else {
            return Err(Report::new(DispatchError::Configuration)).attach_printable_lazy(|| {
                format!("Workflow {label} depends on unknown workflow {parent}")
            });
        };
        graph.add_edge(from, to, ());
    }

    if is_cyclic_directed(&graph) {
        return Err(Report::new(DispatchError::Cycle));
    }

    let sorted = toposort(&graph, None).map_err(|_| Report::new(DispatchError::Cycle))?;
    Ok(sorted.into_iter().map(|node| graph[node].clone()).collect())
}

/// Move job directories left in `running` by an earlier run to where the store says they
/// belong. The store has been reset, so they end up failed unless the job had completed.
async fn recover_job_dirs(
    store: &WorkUnitStore,
    workflow: &Workflow,
    status: &StatusCollector,
) -> Result<usize, Report<DispatchError>> {
    let workdir = workflow.workdir().change_context(DispatchError::Io)?;
    let running = workdir.join(JobStatus::Running.dir_name());
    let Ok(mut entries) = tokio::fs::read_dir(&running).await else {
        return Ok(0);
    };

    let mut recovered = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .change_context(DispatchError::Io)?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Ok(job) = name.parse::<JobId>() else {
            event!(Level::WARN, workflow = %workflow.label, %name, "ignoring unexpected entry in running jobs");
            continue;
        };

        let record = store.job(job).await.change_context(DispatchError::Store)?;
        let successful = record.map(|r| r.status) == Some(JobStatus::Successful);
        let target_status = if successful {
            JobStatus::Successful
        } else {
            JobStatus::Failed
        };

        move_dir(&entry.path(), &workdir.join(target_status.dir_name()).join(&name))
            .await
            .change_context(DispatchError::Io)?;
        event!(Level::WARN, %job, workflow = %workflow.label, successful, "recovered job left running by an earlier run");
        status.add(
            job,
            &workflow.label,
            StatusUpdateData::Recovered { successful },
        );
        recovered += 1;
    }

    Ok(recovered)
}

async fn existing_job_dir(workdir: &Path, name: &str) -> Option<PathBuf> {
    for status in [JobStatus::Successful, JobStatus::Failed, JobStatus::Running] {
        let dir = workdir.join(status.dir_name()).join(name);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Some(dir);
        }
    }
    None
}

async fn write_log(dir: &Path, output: &str) {
    let result = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(LOG_FILE), output).await
    }
    .await;

    if let Err(e) = result {
        event!(Level::WARN, dir = %dir.display(), error = %e, "failed to write job log");
    }
}

/// Move a job directory, replacing any directory left at the target.
async fn move_dir(from: &Path, to: &Path) -> Result<(), Report<std::io::Error>> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::try_exists(to).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(to).await?;
    }
    tokio::fs::rename(from, to)
        .await
        .attach_printable_lazy(|| format!("{} -> {}", from.display(), to.display()))?;
    Ok(())
}
