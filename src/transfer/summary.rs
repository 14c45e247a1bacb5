//! Aggregated results of one download run.

use crate::error::FetchError;

/// Why a shipment ended up failed or skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Transport retries exhausted.
    Transport(String),
    /// Terminal SOAP fault.
    ProtocolFault(String),
    /// Multipart/MTOM decode failure.
    MalformedResponse(String),
    /// Payload failed content validation (quarantined).
    Validation(String),
    /// Archive collaborator rejected the upload.
    Archive(String),
    /// Archived successfully but the acknowledge call failed; the shipment
    /// will be re-offered (and de-duplicated by content hash) next run.
    Acknowledge(String),
    /// Run aborted before the task was dispatched.
    RunAborted,
    /// Zero-size shipment, excluded at queueing time.
    EmptyShipment,
}

impl FailureReason {
    pub fn from_error(err: &FetchError) -> Self {
        match err {
            FetchError::Transport { .. } => Self::Transport(err.to_string()),
            FetchError::ProtocolFault { .. } => Self::ProtocolFault(err.to_string()),
            FetchError::MalformedResponse { .. } => Self::MalformedResponse(err.to_string()),
            FetchError::Validation { .. } => Self::Validation(err.to_string()),
            FetchError::Auth { .. } => Self::RunAborted,
        }
    }
}

/// Outcome of one task, reported by a worker to the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed(FailureReason),
    Skipped(FailureReason),
}

/// Per-shipment record in the run summary.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub shipment_id: String,
    pub outcome: TaskOutcome,
}

/// What a run produced. Failed shipments are safely retryable in a later
/// run: the insurer's own `listShipments` excludes acknowledged shipments,
/// so no local state is needed.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub records: Vec<TaskRecord>,
}

impl RunSummary {
    pub fn record(&mut self, shipment_id: String, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Succeeded => self.succeeded += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
            TaskOutcome::Skipped(_) => self.skipped += 1,
        }
        self.records.push(TaskRecord {
            shipment_id,
            outcome,
        });
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    /// Failure reasons keyed by shipment id, for reporting.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &FailureReason)> {
        self.records.iter().filter_map(|r| match &r.outcome {
            TaskOutcome::Failed(reason) => Some((r.shipment_id.as_str(), reason)),
            _ => None,
        })
    }
}
