use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::ProgressStore;
use crate::config::{Config, FailurePolicy};
use crate::driver::{RecordDriver, RecordOutcome};
use crate::errors::ApproverError;
use crate::portal::Portal;
use crate::records::{AccountRecord, RecordStatus};

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Every pending record was attempted.
    Completed,
    /// Stopped after a Failed record under [`FailurePolicy::Halt`].
    Halted,
    /// Stopped by the operator; the checkpoint is consistent.
    Interrupted,
    /// The browser session could not be recovered.
    SessionLost(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub confirmed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Pending records never attempted because the run stopped early.
    pub not_attempted: usize,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub summary: RunSummary,
    pub records: Vec<AccountRecord>,
    pub last_completed_index: usize,
}

impl RunReport {
    /// Process exit code for this outcome.
    pub fn exit_code(&self, fail_on_record_error: bool) -> i32 {
        match &self.status {
            RunStatus::SessionLost(_) => 2,
            RunStatus::Interrupted => 130,
            RunStatus::Halted => 1,
            RunStatus::Completed if fail_on_record_error && self.summary.failed > 0 => 1,
            RunStatus::Completed => 0,
        }
    }
}

/// Receives per-record progress for display.
pub trait RunObserver: Send {
    fn skipped(&mut self, _record: &AccountRecord) {}
    fn started(&mut self, _record: &AccountRecord) {}
    fn finished(&mut self, _record: &AccountRecord, _outcome: &RecordOutcome) {}
}

/// Observer that only logs.
pub struct LogObserver;

impl RunObserver for LogObserver {
    fn skipped(&mut self, record: &AccountRecord) {
        info!("[SKIP] Already completed: {}", record);
    }

    fn finished(&mut self, record: &AccountRecord, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Confirmed { .. } => info!("[DONE] {}", record),
            RecordOutcome::Failed { error, .. } => warn!("[FAILED] {}: {}", record, error),
        }
    }
}

pub struct Orchestrator<P: Portal> {
    portal: P,
    store: ProgressStore,
    config: Config,
    cancel: CancellationToken,
}

impl<P: Portal> Orchestrator<P> {
    pub fn new(portal: P, store: ProgressStore, config: Config, cancel: CancellationToken) -> Self {
        Self {
            portal,
            store,
            config,
            cancel,
        }
    }

    pub fn portal(&self) -> &P {
        &self.portal
    }

    /// Process every record the checkpoint does not already cover, then
    /// release the automation tab whatever the outcome.
    pub async fn run(
        &self,
        records: Vec<AccountRecord>,
        observer: &mut dyn RunObserver,
    ) -> Result<RunReport, ApproverError> {
        let result = self.process(records, observer).await;
        if let Err(e) = self.portal.close().await {
            warn!(error = %e, "Failed to close automation tab");
        }
        result
    }

    async fn process(
        &self,
        mut records: Vec<AccountRecord>,
        observer: &mut dyn RunObserver,
    ) -> Result<RunReport, ApproverError> {
        let mut checkpoint = if self.config.checkpoint.resume {
            self.store.load()
        } else {
            info!("Resume disabled, ignoring any existing checkpoint");
            Default::default()
        };
        checkpoint.clamp_to(records.len());

        let mut summary = RunSummary::default();
        let mut pending = Vec::new();
        for (i, record) in records.iter_mut().enumerate() {
            if checkpoint.is_done(record) {
                record.status = RecordStatus::Done;
                summary.skipped += 1;
                observer.skipped(record);
            } else {
                pending.push(i);
            }
        }
        info!(
            total = records.len(),
            pending = pending.len(),
            resume_after = checkpoint.last_completed_index,
            "Starting run"
        );

        let driver = RecordDriver::new(&self.portal, &self.config.run.approvers, self.cancel.clone())
            .with_retry(self.config.retry.clone())
            .with_reconnect(self.config.browser.reconnect.clone())
            .with_per_item_delay(self.config.timeouts.per_item_delay);

        let mut status = RunStatus::Completed;
        let mut attempted = 0usize;
        let mut duplicates = 0usize;

        for &i in &pending {
            if self.cancel.is_cancelled() {
                status = RunStatus::Interrupted;
                break;
            }
            // An earlier row with the same key may have been confirmed this run.
            if checkpoint.is_done(&records[i]) {
                records[i].status = RecordStatus::Done;
                summary.skipped += 1;
                observer.skipped(&records[i]);
                duplicates += 1;
                continue;
            }
            attempted += 1;

            let record = records[i].clone();
            observer.started(&record);
            let start = checkpoint.resume_cursor(&record).unwrap_or((0, 0));
            if start != (0, 0) {
                info!(link_index = start.0, approver_index = start.1, "Resuming inside {}", record);
            }

            let store = &self.store;
            let mut on_progress = |cursor: (usize, usize)| {
                checkpoint.set_in_progress(&record, cursor.0, cursor.1);
                store.save(&checkpoint)
            };
            let outcome = driver.drive(&record, start, &mut on_progress).await;

            match outcome {
                Ok(outcome) => {
                    match &outcome {
                        RecordOutcome::Confirmed { .. } => {
                            records[i].status = RecordStatus::Done;
                            checkpoint.mark_confirmed(&record, &records);
                            summary.confirmed += 1;
                        }
                        RecordOutcome::Failed { error, .. } => {
                            records[i].status = RecordStatus::Failed;
                            checkpoint.mark_failed(&record, error);
                            summary.failed += 1;
                        }
                    }
                    self.store.save(&checkpoint)?;
                    observer.finished(&records[i], &outcome);

                    if !outcome.is_confirmed() && self.config.run.on_failure == FailurePolicy::Halt {
                        warn!("Halting after failed record {}", record);
                        status = RunStatus::Halted;
                        break;
                    }
                }
                Err(ApproverError::Cancelled) => {
                    attempted -= 1;
                    warn!("Interrupted while processing {}", record);
                    status = RunStatus::Interrupted;
                    break;
                }
                Err(e) if e.is_session_loss() => {
                    attempted -= 1;
                    error!(error = %e, "Browser session lost, stopping run");
                    status = RunStatus::SessionLost(e.to_string());
                    break;
                }
                Err(e) => {
                    if let Err(save_err) = self.store.save(&checkpoint) {
                        error!(error = %save_err, "Could not persist checkpoint");
                    }
                    return Err(e);
                }
            }
        }

        summary.not_attempted = pending.len() - attempted - duplicates;
        self.store.save(&checkpoint)?;
        info!(
            confirmed = summary.confirmed,
            failed = summary.failed,
            skipped = summary.skipped,
            "Run finished: {:?}",
            status
        );

        Ok(RunReport {
            status,
            summary,
            records,
            last_completed_index: checkpoint.last_completed_index,
        })
    }
}
