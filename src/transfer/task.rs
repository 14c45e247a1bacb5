//! Download tasks and their lifecycle.
//!
//! One task per shipment descriptor. A task moves
//! `Queued → InProgress → {Succeeded | Failed | Skipped}`; terminal states
//! never transition again within a run.

use crate::error::InsurerId;
use crate::protocol::messages::ShipmentDescriptor;
use crate::transfer::summary::TaskOutcome;

/// All states a download task can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in the run's queue.
    Queued,
    /// Claimed by a worker.
    InProgress,
    /// Payload validated, archived and (per policy) acknowledged.
    Succeeded,
    /// Error after retries exhausted, or a terminal fault.
    Failed,
    /// Explicitly excluded (zero-size shipment, cancelled run).
    Skipped,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }
}

/// A queued shipment download.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub insurer: InsurerId,
    pub descriptor: ShipmentDescriptor,
    pub state: TaskState,
    /// Transport-error retries already spent on this task.
    pub retries: u32,
}

impl DownloadTask {
    pub fn new(insurer: InsurerId, descriptor: ShipmentDescriptor) -> Self {
        Self {
            insurer,
            descriptor,
            state: TaskState::Queued,
            retries: 0,
        }
    }

    /// Claim the task for a worker.
    pub fn start(&mut self) {
        self.state = TaskState::InProgress;
    }

    /// Move to the terminal state matching the recorded outcome.
    pub fn finish(&mut self, outcome: &TaskOutcome) {
        self.state = match outcome {
            TaskOutcome::Succeeded => TaskState::Succeeded,
            TaskOutcome::Failed(_) => TaskState::Failed,
            TaskOutcome::Skipped(_) => TaskState::Skipped,
        };
    }

    /// Zero-size shipments carry nothing worth fetching; they are skipped
    /// at queueing time.
    pub fn is_empty_shipment(&self) -> bool {
        self.descriptor.size_estimate == Some(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::ShipmentStatus;

    fn descriptor(size: Option<u64>) -> ShipmentDescriptor {
        ShipmentDescriptor {
            id: "L-1".into(),
            category: "100".into(),
            delivery_date: None,
            size_estimate: size,
            status: ShipmentStatus::Available,
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::InProgress.is_terminal());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
    }

    #[test]
    fn test_lifecycle_transitions() {
        use crate::transfer::summary::FailureReason;

        let mut task = DownloadTask::new(InsurerId::from("degenia"), descriptor(Some(10)));
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.retries, 0);

        task.start();
        assert_eq!(task.state, TaskState::InProgress);

        task.finish(&TaskOutcome::Succeeded);
        assert_eq!(task.state, TaskState::Succeeded);
        assert!(task.state.is_terminal());

        let mut failed = DownloadTask::new(InsurerId::from("degenia"), descriptor(Some(10)));
        failed.finish(&TaskOutcome::Failed(FailureReason::Transport("timeout".into())));
        assert_eq!(failed.state, TaskState::Failed);
    }

    #[test]
    fn test_zero_size_detection() {
        let insurer = InsurerId::from("degenia");
        assert!(DownloadTask::new(insurer.clone(), descriptor(Some(0))).is_empty_shipment());
        assert!(!DownloadTask::new(insurer.clone(), descriptor(Some(10))).is_empty_shipment());
        // Unknown size is not grounds for skipping.
        assert!(!DownloadTask::new(insurer, descriptor(None)).is_empty_shipment());
    }
}
