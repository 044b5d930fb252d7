use std::path::PathBuf;

use creel_worker::{ExecutionReport, ReportedOutput, REPORT_FILE};
use once_cell::sync::Lazy;

use crate::{
    config::ControllerConfig,
    dataset::DatasetSpec,
    dispatch::EXECUTABLE_LOG_FILE,
    spawn::DispatchDescriptor,
    workflow::WorkflowSpec,
};

pub static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        configure_tracing();
    }
});

fn configure_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    let subscriber = tracing_subscriber::Registry::default().with(tree);

    tracing::subscriber::set_global_default(subscriber).unwrap();
}

pub fn setup_test_tracing() {
    Lazy::force(&TRACING);
}

/// A scratch area with a release to package and the support files jobs need.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub config: ControllerConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        setup_test_tracing();
        let dir = tempfile::tempdir().unwrap();

        let release = dir.path().join("release");
        std::fs::create_dir_all(release.join("lib")).unwrap();
        std::fs::write(release.join("lib/libanalysis.so"), "analysis").unwrap();

        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        for name in ["wrapper.sh", "task", "creel-merge-reports", "merge_cfg.py"] {
            std::fs::write(data.join(name), name).unwrap();
        }

        let mut config = ControllerConfig::new(
            dir.path().join("work"),
            dir.path().join("stageout"),
            data,
        );
        config.basedirs = vec![dir.path().to_path_buf()];
        config.sandbox_release = Some(release);

        TestEnv { dir, config }
    }

    /// A workflow with one declared output, packaging the test release.
    pub fn workflow(&self, label: &str, dataset: DatasetSpec) -> WorkflowSpec {
        let mut spec = WorkflowSpec::new(label, dataset);
        spec.sandbox_release = self.config.sandbox_release.clone();
        spec.outputs = Some(vec!["output.root".to_string()]);
        spec
    }

    pub fn files(n: usize) -> DatasetSpec {
        DatasetSpec::Files {
            files: (0..n).map(|i| format!("/store/input_{i}.root")).collect(),
            files_per_task: 1,
        }
    }

    pub fn job_dir(&self, workflow: &str, state: &str, job: creel_worker::JobId) -> PathBuf {
        self.config
            .workdir
            .join(workflow)
            .join(state)
            .join(job.to_string())
    }
}

/// Play the part of a successful job: write every declared output and a report claiming each
/// output is `size` bytes.
pub fn complete_job(descriptor: &DispatchDescriptor, size: u64) {
    let mut report = ExecutionReport::default();
    let mut report_path = None;

    for output in &descriptor.outputs {
        if output.staged_name == REPORT_FILE {
            report_path = Some(output.destination.clone());
            continue;
        }

        std::fs::create_dir_all(output.destination.parent().unwrap()).unwrap();
        std::fs::write(&output.destination, &output.staged_name).unwrap();
        if output.staged_name != EXECUTABLE_LOG_FILE {
            report.output_files.push(ReportedOutput {
                name: output.staged_name.clone(),
                size,
                events: 100,
            });
        }
    }

    report.write(&report_path.unwrap()).unwrap();
}
