//! Concurrent shipment download for one insurer.
//!
//! The orchestrator queues one task per listed shipment and spawns a
//! bounded pool of workers. Effective parallelism is governed per dispatch:
//! every worker takes a [`RateGovernor`] permit before its outbound call,
//! so the pool shrinks and grows mid-run with the governor's budget
//! without restarting anything.
//!
//! Each worker: pop task → permit → token (shared, single-flight) →
//! `getShipment` with transport retries → hand validated parts to the
//! archive → acknowledge per policy. Shipment-scoped failures are recorded
//! and siblings continue; only an unobtainable token aborts the run.
//! Cancellation is cooperative: in-flight calls complete, nothing new is
//! dispatched.
//!
//! Results flow over an mpsc channel to the aggregator; run progress is
//! published on an optional event channel so an embedding UI can observe
//! the run without coupling into the orchestration.

use crate::archive::{ArchiveSink, DocumentMeta};
use crate::config::{InsurerConfig, RESULT_CHANNEL_DEPTH, SHIPMENT_MAX_RETRIES};
use crate::error::FetchError;
use crate::governor::{Outcome, RateGovernor};
use crate::protocol::messages::{ShipmentFilters, ShipmentPayload, SoapFault};
use crate::protocol::ShipmentApi;
use crate::token::credential::Credential;
use crate::token::store::TokenStore;
use crate::transfer::summary::{FailureReason, RunSummary, TaskOutcome};
use crate::transfer::task::DownloadTask;
use crate::util::stop::StopSignal;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Progress notifications for an embedding application.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Started {
        run_id: Uuid,
        insurer: crate::error::InsurerId,
        queued: usize,
    },
    TaskStarted {
        shipment_id: String,
    },
    TaskFinished {
        shipment_id: String,
        outcome: TaskOutcome,
    },
    Finished {
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
}

/// Message from a worker to the aggregator.
enum WorkerMsg {
    Started(String),
    Finished(String, TaskOutcome),
}

/// Orchestrates one insurer's shipment downloads.
pub struct DownloadOrchestrator<S, A> {
    config: InsurerConfig,
    service: Arc<S>,
    archive: Arc<A>,
    governor: Arc<RateGovernor>,
    tokens: Arc<TokenStore<S>>,
    stop: StopSignal,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
    max_retries: u32,
}

impl<S, A> DownloadOrchestrator<S, A>
where
    S: ShipmentApi + Send + Sync + 'static,
    A: ArchiveSink + Send + Sync + 'static,
{
    pub fn new(config: InsurerConfig, service: Arc<S>, archive: Arc<A>) -> Self {
        let governor = Arc::new(RateGovernor::new(config.governor.limits()));
        let tokens = Arc::new(TokenStore::new(
            Arc::clone(&service),
            config.refresh_margin(),
        ));
        Self {
            config,
            service,
            archive,
            governor,
            tokens,
            stop: StopSignal::new(),
            events: None,
            max_retries: SHIPMENT_MAX_RETRIES,
        }
    }

    /// Share a governor across runs (e.g. several batches against the same
    /// insurer) instead of the per-run default.
    pub fn with_governor(mut self, governor: Arc<RateGovernor>) -> Self {
        self.governor = governor;
        self
    }

    /// Publish progress events to the given channel.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Attach an external cancellation signal.
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// The signal that cancels this orchestrator's runs.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Download every shipment the insurer currently offers.
    ///
    /// Returns the run summary, or an error when the run as a whole could
    /// not proceed (token unobtainable, shipment list unavailable).
    pub async fn run(
        &self,
        credential: &Credential,
        filters: &ShipmentFilters,
    ) -> Result<RunSummary, FetchError> {
        let run_id = Uuid::new_v4();
        let insurer = self.config.id.clone();

        // No shipment can be fetched without a token; failure here is
        // fatal before any task is queued.
        let token = self.tokens.get_token(credential).await?;
        let descriptors = self.list_with_retries(&token, filters).await?;

        let mut summary = RunSummary::default();
        let mut queue = VecDeque::new();
        for descriptor in descriptors {
            let mut task = DownloadTask::new(insurer.clone(), descriptor);
            if task.is_empty_shipment() {
                debug!(shipment = %task.descriptor.id, "zero-size shipment, skipping");
                let outcome = TaskOutcome::Skipped(FailureReason::EmptyShipment);
                task.finish(&outcome);
                summary.record(task.descriptor.id.clone(), outcome);
                continue;
            }
            queue.push_back(task);
        }

        info!(
            run_id = %run_id,
            insurer = %insurer,
            queued = queue.len(),
            skipped_empty = summary.skipped,
            "download run starting"
        );
        self.emit(RunEvent::Started {
            run_id,
            insurer: insurer.clone(),
            queued: queue.len(),
        });

        let worker_count = queue.len().min(self.config.governor.ceiling).max(1);
        let queue = Arc::new(Mutex::new(queue));
        let (tx, mut rx) = mpsc::channel::<WorkerMsg>(RESULT_CHANNEL_DEPTH);
        let auth_failure: Arc<Mutex<Option<FetchError>>> = Arc::new(Mutex::new(None));

        // Run-local stop: raised by external cancellation, by a mid-run
        // auth failure, and unconditionally at run end (which also lets
        // the forwarder task finish).
        let run_stop = StopSignal::new();
        if self.stop.raised() {
            run_stop.raise();
        }
        {
            let external = self.stop.clone();
            let local = run_stop.clone();
            let local_done = run_stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = external.wait() => local.raise(),
                    _ = local_done.wait() => {}
                }
            });
        }

        let mut handles = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let ctx = WorkerCtx {
                service: Arc::clone(&self.service),
                archive: Arc::clone(&self.archive),
                tokens: Arc::clone(&self.tokens),
                governor: Arc::clone(&self.governor),
                credential: credential.clone(),
                queue: Arc::clone(&queue),
                tx: tx.clone(),
                run_stop: run_stop.clone(),
                auth_failure: Arc::clone(&auth_failure),
                max_retries: self.max_retries,
            };
            handles.push(tokio::spawn(async move {
                ctx.work().await;
                debug!(worker, "worker finished");
            }));
        }
        drop(tx);

        while let Some(msg) = rx.recv().await {
            match msg {
                WorkerMsg::Started(shipment_id) => {
                    self.emit(RunEvent::TaskStarted { shipment_id });
                }
                WorkerMsg::Finished(shipment_id, outcome) => {
                    self.emit(RunEvent::TaskFinished {
                        shipment_id: shipment_id.clone(),
                        outcome: outcome.clone(),
                    });
                    summary.record(shipment_id, outcome);
                }
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
        run_stop.raise();

        // Tasks still queued after cancellation or abort were never
        // dispatched.
        let leftovers: Vec<DownloadTask> = {
            let mut q = queue.lock().unwrap_or_else(|e| e.into_inner());
            q.drain(..).collect()
        };
        for mut task in leftovers {
            let outcome = TaskOutcome::Skipped(FailureReason::RunAborted);
            task.finish(&outcome);
            self.emit(RunEvent::TaskFinished {
                shipment_id: task.descriptor.id.clone(),
                outcome: outcome.clone(),
            });
            summary.record(task.descriptor.id, outcome);
        }

        let auth = auth_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(err) = auth {
            error!(run_id = %run_id, insurer = %insurer, error = %err, "run aborted");
            return Err(err);
        }

        info!(
            run_id = %run_id,
            insurer = %insurer,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "download run finished"
        );
        self.emit(RunEvent::Finished {
            succeeded: summary.succeeded,
            failed: summary.failed,
            skipped: summary.skipped,
        });
        Ok(summary)
    }

    async fn list_with_retries(
        &self,
        token: &crate::token::token::SecurityToken,
        filters: &ShipmentFilters,
    ) -> Result<Vec<crate::protocol::messages::ShipmentDescriptor>, FetchError> {
        let mut attempt = 0u32;
        loop {
            match self.service.list_shipments(token, filters).await {
                Ok(list) => return Ok(list),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    warn!(
                        insurer = %self.config.id,
                        attempt,
                        error = %err,
                        "shipment list failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(500) * (attempt + 1)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Everything one worker needs, cloned per worker.
struct WorkerCtx<S, A> {
    service: Arc<S>,
    archive: Arc<A>,
    tokens: Arc<TokenStore<S>>,
    governor: Arc<RateGovernor>,
    credential: Credential,
    queue: Arc<Mutex<VecDeque<DownloadTask>>>,
    tx: mpsc::Sender<WorkerMsg>,
    run_stop: StopSignal,
    auth_failure: Arc<Mutex<Option<FetchError>>>,
    max_retries: u32,
}

impl<S, A> WorkerCtx<S, A>
where
    S: ShipmentApi + Send + Sync,
    A: ArchiveSink + Send + Sync,
{
    async fn work(&self) {
        loop {
            if self.run_stop.raised() {
                return;
            }
            let Some(mut task) = self.pop_task() else { return };

            // The permit is what sizes the effective pool to the
            // governor's current budget.
            let Some(permit) = self.governor.acquire(&self.run_stop).await else {
                self.push_back(task);
                return;
            };

            let pause = self.governor.dispatch_delay();
            if !pause.is_zero()
                && self
                    .run_stop
                    .select(tokio::time::sleep(pause))
                    .await
                    .is_none()
            {
                drop(permit);
                self.push_back(task);
                return;
            }

            // Started is published only once the task actually dispatches;
            // tasks pushed back on cancellation never appear as started.
            task.start();
            let shipment_id = task.descriptor.id.clone();
            let _ = self.tx.send(WorkerMsg::Started(shipment_id.clone())).await;

            let outcome = self.process(&mut task).await;
            drop(permit);
            task.finish(&outcome);
            debug_assert!(task.state.is_terminal());

            let abort = matches!(&outcome, TaskOutcome::Skipped(FailureReason::RunAborted));
            let _ = self
                .tx
                .send(WorkerMsg::Finished(shipment_id, outcome))
                .await;
            if abort {
                return;
            }
        }
    }

    /// Full lifecycle of one task; never returns early without an outcome.
    async fn process(&self, task: &mut DownloadTask) -> TaskOutcome {
        let payload = match self.fetch_with_retries(task).await {
            Ok(payload) => payload,
            Err(err @ FetchError::Auth { .. }) => {
                // Nothing can proceed without a token; flag the run.
                let mut slot = self.auth_failure.lock().unwrap_or_else(|e| e.into_inner());
                slot.get_or_insert(err);
                self.run_stop.raise();
                return TaskOutcome::Skipped(FailureReason::RunAborted);
            }
            Err(err) => {
                warn!(shipment = %task.descriptor.id, error = %err, "shipment failed");
                return TaskOutcome::Failed(FailureReason::from_error(&err));
            }
        };

        if !payload.all_validated() {
            warn!(
                shipment = %task.descriptor.id,
                parts = ?payload.unvalidated_ids(),
                "payload failed validation, quarantining shipment"
            );
            return TaskOutcome::Failed(FailureReason::Validation(format!(
                "unvalidated parts: {:?}",
                payload.unvalidated_ids()
            )));
        }

        if let Err(err) = self.archive_parts(task, &payload).await {
            warn!(shipment = %task.descriptor.id, error = %err, "archive hand-off failed");
            return TaskOutcome::Failed(FailureReason::Archive(err.to_string()));
        }

        // Commit only after the archive owns the documents.
        match self.acknowledge(task).await {
            Ok(()) => TaskOutcome::Succeeded,
            Err(err) => {
                // Archived but unacknowledged: the shipment is re-offered
                // next run and de-duplicated by content hash.
                warn!(shipment = %task.descriptor.id, error = %err, "acknowledge failed");
                TaskOutcome::Failed(FailureReason::Acknowledge(err.to_string()))
            }
        }
    }

    async fn fetch_with_retries(
        &self,
        task: &mut DownloadTask,
    ) -> Result<ShipmentPayload, FetchError> {
        let mut reissued = false;
        loop {
            let token = self.tokens.get_token(&self.credential).await?;
            match self.service.get_shipment(&token, &task.descriptor).await {
                Ok(payload) => {
                    self.governor.report(Outcome::Success);
                    return Ok(payload);
                }
                Err(err) => {
                    self.governor.report(if err.is_throttle() {
                        Outcome::Throttled
                    } else {
                        Outcome::Failure
                    });
                    // A server-side token rejection invalidates the cached
                    // token once; a fresh one is issued on the next loop.
                    if !reissued && is_token_rejection(&err) {
                        reissued = true;
                        warn!(
                            shipment = %task.descriptor.id,
                            error = %err,
                            "server rejected token, forcing re-issue"
                        );
                        self.tokens.invalidate(&token.key);
                        continue;
                    }
                    if !err.is_retryable() || task.retries >= self.max_retries {
                        return Err(err);
                    }
                    task.retries += 1;
                    let pause = self.governor.dispatch_delay()
                        + Duration::from_millis(250) * task.retries;
                    debug!(
                        shipment = %task.descriptor.id,
                        retries = task.retries,
                        pause_ms = pause.as_millis() as u64,
                        "transport failure, retrying shipment"
                    );
                    if self
                        .run_stop
                        .select(tokio::time::sleep(pause))
                        .await
                        .is_none()
                    {
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn archive_parts(
        &self,
        task: &DownloadTask,
        payload: &ShipmentPayload,
    ) -> anyhow::Result<()> {
        for part in &payload.parts {
            let meta = DocumentMeta::for_part(
                &task.insurer,
                &task.descriptor,
                &part.content_id,
                &part.mime_type,
                &part.data,
            );
            let document_id = self.archive.upload_document(part.data.clone(), meta).await?;
            debug!(
                shipment = %task.descriptor.id,
                content_id = %part.content_id,
                document_id = %document_id,
                "part archived"
            );
        }
        Ok(())
    }

    async fn acknowledge(&self, task: &DownloadTask) -> Result<(), FetchError> {
        let token = self.tokens.get_token(&self.credential).await?;
        self.service
            .acknowledge_shipment(&token, &task.descriptor)
            .await
    }

    fn pop_task(&self) -> Option<DownloadTask> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn push_back(&self, task: DownloadTask) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_front(task);
    }
}

/// A security-flavoured fault on a shipment operation means the server no
/// longer accepts our token (expired or revoked server-side).
fn is_token_rejection(err: &FetchError) -> bool {
    match err {
        FetchError::ProtocolFault { code, message, .. } => {
            SoapFault::security_flavoured(code, message)
        }
        _ => false,
    }
}
