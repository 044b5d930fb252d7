use ahash::HashMap;
use creel_worker::JobId;
use tracing::{event, Level};

use crate::store::OutputRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    /// No output has arrived yet.
    Pending,
    /// Outputs are arriving but there are not enough of them to merge.
    Accumulating,
    /// The available outputs should be merged.
    Ready,
    /// A merge job consuming the outputs is running.
    Dispatched,
    /// The last merge job succeeded.
    Done,
    /// The last merge job failed and its inputs are available again.
    Failed,
}

/// Collects the mergeable outputs of one workflow until they are worth merging.
#[derive(Debug)]
pub struct MergeGroup {
    workflow: String,
    threshold: u64,
    flush_on_exhaustion: bool,
    exhausted: bool,
    available: Vec<OutputRecord>,
    in_flight: HashMap<JobId, Vec<OutputRecord>>,
    state: MergeState,
}

impl MergeGroup {
    pub fn new(workflow: impl Into<String>, threshold: u64, flush_on_exhaustion: bool) -> Self {
        Self {
            workflow: workflow.into(),
            threshold,
            flush_on_exhaustion,
            exhausted: false,
            available: Vec::new(),
            in_flight: HashMap::default(),
            state: MergeState::Pending,
        }
    }

    pub fn state(&self) -> MergeState {
        self.state
    }

    pub fn available_bytes(&self) -> u64 {
        self.available.iter().map(|o| o.size).sum()
    }

    pub fn available(&self) -> &[OutputRecord] {
        &self.available
    }

    /// True once no more outputs will arrive.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    fn is_ready(&self) -> bool {
        !self.available.is_empty()
            && (self.available_bytes() >= self.threshold
                || (self.exhausted && self.flush_on_exhaustion))
    }

    fn refresh(&mut self) {
        if self.is_ready() {
            if self.state != MergeState::Ready {
                event!(Level::DEBUG, workflow = %self.workflow, outputs = self.available.len(), bytes = self.available_bytes(), "merge ready");
            }
            self.state = MergeState::Ready;
        } else if !self.available.is_empty() {
            self.state = MergeState::Accumulating;
        }
    }

    pub fn add(&mut self, output: OutputRecord) {
        self.available.push(output);
        self.refresh();
    }

    /// Note whether the workflow and everything upstream of it has finished. Exhaustion is
    /// withdrawn when new units show up for the workflow, as after a retried upstream merge.
    pub fn set_exhausted(&mut self, exhausted: bool) {
        if self.exhausted == exhausted {
            return;
        }

        event!(Level::DEBUG, workflow = %self.workflow, exhausted, "merge group exhaustion changed");
        self.exhausted = exhausted;
        self.refresh();
    }

    /// Take all available outputs if they are ready to be merged.
    pub fn take_ready(&mut self) -> Option<Vec<OutputRecord>> {
        if !self.is_ready() {
            return None;
        }

        Some(std::mem::take(&mut self.available))
    }

    /// Put outputs returned by [MergeGroup::take_ready] back, when no job could be created
    /// for them.
    pub fn restore(&mut self, mut outputs: Vec<OutputRecord>) {
        outputs.append(&mut self.available);
        self.available = outputs;
        self.refresh();
    }

    pub fn dispatched(&mut self, job: JobId, outputs: Vec<OutputRecord>) {
        self.in_flight.insert(job, outputs);
        self.state = MergeState::Dispatched;
    }

    /// Record the outcome of merge job `job`. Returns the outputs it consumed. After a failure
    /// they are available again and also returned.
    pub fn finish(&mut self, job: JobId, success: bool) -> Vec<OutputRecord> {
        let Some(outputs) = self.in_flight.remove(&job) else {
            return Vec::new();
        };

        if success {
            self.state = MergeState::Done;
        } else {
            event!(Level::WARN, workflow = %self.workflow, %job, outputs = outputs.len(), "merge failed, outputs will be merged again");
            self.state = MergeState::Failed;
            let mut available = outputs.clone();
            available.append(&mut self.available);
            self.available = available;
        }

        outputs
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Merge work that still has to happen: running merge jobs plus outputs that are ready to
    /// be merged.
    pub fn outstanding(&self) -> usize {
        let ready = if self.is_ready() {
            self.available.len()
        } else {
            0
        };
        self.in_flight.len() + ready
    }
}
