//! Epilogue of merge jobs: fold the execution reports of the merged jobs into one report.

use std::path::PathBuf;

use clap::Parser;
use creel_worker::{merge_reports, ExecutionReport, ReportError};
use error_stack::Report;

#[derive(Debug, Parser)]
struct Cli {
    /// Where to write the combined report.
    output: PathBuf,
    /// The reports of the merged jobs.
    reports: Vec<PathBuf>,
}

fn main() -> Result<(), Report<ReportError>> {
    let args = Cli::parse();

    let reports = args
        .reports
        .iter()
        .map(|path| ExecutionReport::read(path))
        .collect::<Result<Vec<_>, _>>()?;

    merge_reports(reports).write(&args.output)
}
