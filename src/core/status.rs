//! Status snapshots for tasks and streams.

use crate::core::state::ProcessingState;
use crate::core::task::TaskShared;
use serde::Serialize;

/// Point-in-time view of one task, summed across its input slots the way the
/// aggregate counters are reported.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub state: ProcessingState,
    pub error: Option<String>,
    pub pending_queue: usize,
    pub using_data: bool,
    pub has_changed_parameters: bool,
    pub message_count: u64,
    pub byte_rate: u64,
    pub message_rate: u64,
    pub drop_count: u64,
    pub dupe_count: u64,
}

impl TaskStatus {
    pub fn collect(task: &TaskShared) -> Self {
        let stats = task.stats_snapshot();
        let mut message_count = 0;
        let mut byte_rate = 0;
        let mut message_rate = 0;
        let mut drop_count = 0;
        let mut dupe_count = 0;
        for entry in &stats {
            message_count += entry.message_count();
            byte_rate += entry.byte_rate();
            message_rate += entry.message_rate();
            drop_count += entry.drop_count();
            dupe_count += entry.dupe_count();
        }
        Self {
            name: task.name(),
            state: task.state(),
            error: task.error_text(),
            pending_queue: task.queue_len(),
            using_data: task.is_using_data(),
            has_changed_parameters: task.has_changed_parameters(),
            message_count,
            byte_rate,
            message_rate,
            drop_count,
            dupe_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub name: String,
    pub tasks: Vec<TaskStatus>,
}

impl StreamStatus {
    /// Worst state across the stream: any Failure wins, else any non-Run.
    pub fn aggregate_state(&self) -> ProcessingState {
        let mut aggregate = ProcessingState::Run;
        for task in &self.tasks {
            if task.state == ProcessingState::Failure {
                return ProcessingState::Failure;
            }
            if task.state != ProcessingState::Run {
                aggregate = task.state;
            }
        }
        aggregate
    }
}
