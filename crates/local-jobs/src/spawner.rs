//! Run jobs as normal processes on the local system. This is generally only useful for
//! development and testing.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use creel_job_manager::spawn::{InputFile, OutputFile};
use creel_job_manager::{DispatchDescriptor, ExecutionError, ExecutionResult, Executor};
use creel_worker::JobId;
use error_stack::{Report, ResultExt};
use futures::stream::TryStreamExt;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncRead};
use tokio_stream::wrappers::LinesStream;
use tracing::{event, instrument, Level};

/// Run each job in its own scratch directory, with the job's command executed by `sh`.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor {
    /// A directory for the scratch areas instead of the system default.
    pub tmpdir: Option<PathBuf>,
    /// Leave scratch areas behind after the job finishes.
    pub keep_scratch: bool,
}

impl LocalExecutor {
    fn scratch_dir(&self, id: JobId) -> PathBuf {
        let dir = self.tmpdir.clone().unwrap_or_else(std::env::temp_dir);
        let prefix: u32 = rand::thread_rng().gen();
        dir.join(format!("creel-{prefix:08x}-{id}"))
    }

    async fn run_in(
        &self,
        scratch: &Path,
        descriptor: &DispatchDescriptor,
    ) -> Result<ExecutionResult, Report<ExecutionError>> {
        stage_in(scratch, &descriptor.inputs).await?;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&descriptor.command)
            .current_dir(scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .change_context(ExecutionError::DidNotStart)
            .attach_printable_lazy(|| descriptor.command.clone())?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Report::new(ExecutionError::DidNotStart))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Report::new(ExecutionError::DidNotStart))?;

        let (stdout, stderr, status) =
            tokio::join!(collect_lines(stdout), collect_lines(stderr), child.wait());
        let status = status.change_context(ExecutionError::Lost)?;

        stage_out(scratch, &descriptor.outputs).await?;

        let mut output = String::new();
        for line in stdout.iter().chain(stderr.iter()) {
            output.push_str(line);
            output.push('\n');
        }

        Ok(ExecutionResult::new(status.code().unwrap_or(-1), output))
    }
}

#[async_trait::async_trait]
impl Executor for LocalExecutor {
    #[instrument(level = "debug", skip_all, fields(job = %descriptor.id, workflow = %descriptor.workflow))]
    async fn execute(
        &self,
        descriptor: DispatchDescriptor,
    ) -> Result<ExecutionResult, Report<ExecutionError>> {
        let scratch = self.scratch_dir(descriptor.id);
        let result = self.run_in(&scratch, &descriptor).await;

        if !self.keep_scratch {
            tokio::fs::remove_dir_all(&scratch).await.ok();
        }

        if let Ok(result) = &result {
            event!(Level::DEBUG, return_code = result.return_code, "local job finished");
        }
        result
    }
}

async fn stage_in(scratch: &Path, inputs: &[InputFile]) -> Result<(), Report<ExecutionError>> {
    tokio::fs::create_dir_all(scratch)
        .await
        .change_context(ExecutionError::DidNotStart)
        .attach_printable_lazy(|| scratch.display().to_string())?;

    for input in inputs {
        tokio::fs::copy(&input.source, scratch.join(&input.staged_name))
            .await
            .change_context(ExecutionError::StageIn)
            .attach_printable_lazy(|| input.source.display().to_string())?;
    }

    Ok(())
}

/// Copy back every output the job produced. Missing outputs are left for the dispatcher to
/// notice, since a failed job often produces nothing.
async fn stage_out(scratch: &Path, outputs: &[OutputFile]) -> Result<(), Report<ExecutionError>> {
    for output in outputs {
        let source = scratch.join(&output.staged_name);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            event!(Level::DEBUG, file = %output.staged_name, "job did not produce output");
            continue;
        }

        if let Some(parent) = output.destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .change_context(ExecutionError::StageOut)
                .attach_printable_lazy(|| parent.display().to_string())?;
        }
        tokio::fs::copy(&source, &output.destination)
            .await
            .change_context(ExecutionError::StageOut)
            .attach_printable_lazy(|| output.destination.display().to_string())?;
    }

    Ok(())
}

async fn collect_lines(reader: impl AsyncRead + Unpin) -> Vec<String> {
    let mut lines = LinesStream::new(tokio::io::BufReader::new(reader).lines());
    let mut collected = Vec::new();
    while let Ok(Some(line)) = lines.try_next().await {
        collected.push(line);
    }
    collected
}
