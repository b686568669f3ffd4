//! Per-record state machine.
//!
//! ```text
//! Start -> LinkLocated -> TableOpened -> ApproversEntered(n) -> Submitted -> Confirmed
//!   ^                                                                   |
//!   +------------------ transient failure, attempts left ---------------+--> Failed
//! ```
//!
//! The add-approver form takes one approver per submission, so for every
//! "New approver" link the driver cycles `TableOpened -> ApproversEntered(n)
//! -> Submitted` once per approver. A restart begins again at `Start` but
//! keeps the submission cursor, so approvers already confirmed are not added
//! twice.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::ApproverError;
use crate::portal::Portal;
use crate::records::AccountRecord;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Start,
    LinkLocated { links: usize },
    TableOpened { link: usize },
    ApproversEntered(usize),
    Submitted,
    Confirmed,
    Failed,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverState::Start => write!(f, "Start"),
            DriverState::LinkLocated { links } => write!(f, "LinkLocated({links} links)"),
            DriverState::TableOpened { link } => write!(f, "TableOpened(link {})", link + 1),
            DriverState::ApproversEntered(n) => write!(f, "ApproversEntered({n})"),
            DriverState::Submitted => write!(f, "Submitted"),
            DriverState::Confirmed => write!(f, "Confirmed"),
            DriverState::Failed => write!(f, "Failed"),
        }
    }
}

/// Position of the next submission: `(link index, approver index)`.
pub type Cursor = (usize, usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Confirmed {
        attempts: u32,
        submissions: usize,
    },
    Failed {
        attempts: u32,
        /// Furthest state reached by the last attempt.
        state: DriverState,
        error: String,
    },
}

impl RecordOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, RecordOutcome::Confirmed { .. })
    }
}

pub struct RecordDriver<'a, P: Portal + ?Sized> {
    portal: &'a P,
    approvers: &'a [String],
    retry: RetryPolicy,
    reconnect: RetryPolicy,
    per_item_delay: Duration,
    cancel: CancellationToken,
}

impl<'a, P: Portal + ?Sized> RecordDriver<'a, P> {
    pub fn new(portal: &'a P, approvers: &'a [String], cancel: CancellationToken) -> Self {
        Self {
            portal,
            approvers,
            retry: RetryPolicy::record_default(),
            reconnect: RetryPolicy::reconnect_default(),
            per_item_delay: Duration::ZERO,
            cancel,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reconnect(mut self, reconnect: RetryPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_per_item_delay(mut self, delay: Duration) -> Self {
        self.per_item_delay = delay;
        self
    }

    /// Drive one record to a terminal state.
    ///
    /// `on_progress` is called with the new cursor after every confirmed
    /// submission. `Err` is reserved for conditions that end the whole run:
    /// cancellation, an unrecoverable session, or progress that cannot be
    /// persisted.
    #[instrument(skip_all, fields(index = record.index, ou_id = %record.ou_id))]
    pub async fn drive<F>(
        &self,
        record: &AccountRecord,
        start: Cursor,
        on_progress: &mut F,
    ) -> Result<RecordOutcome, ApproverError>
    where
        F: FnMut(Cursor) -> Result<(), ApproverError> + Send,
    {
        let mut cursor = start;
        let mut submissions = 0usize;
        let mut last_error = String::new();
        let mut last_state = DriverState::Start;
        let mut attempts = 0;

        for attempt in 1..=self.retry.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(ApproverError::Cancelled);
            }
            attempts = attempt;
            if attempt > 1 {
                info!(attempt, max = self.retry.max_attempts, "Restarting record from Start");
            }

            let mut state = DriverState::Start;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(ApproverError::Cancelled),
                r = self.attempt(record, &mut cursor, &mut submissions, &mut state, on_progress) => r,
            };

            match result {
                Ok(()) => {
                    info!(attempt, submissions, "Record confirmed");
                    return Ok(RecordOutcome::Confirmed {
                        attempts: attempt,
                        submissions,
                    });
                }
                Err(ApproverError::Cancelled) => return Err(ApproverError::Cancelled),
                Err(e @ ApproverError::Io(_)) => return Err(e),
                Err(e) => {
                    warn!(attempt, state = %state, error = %e, "Attempt failed");
                    last_error = e.to_string();
                    last_state = state;

                    if e.is_session_loss() || !self.portal.is_alive().await {
                        self.recover_session().await?;
                    } else if !e.is_transient() {
                        break;
                    }
                }
            }

            if attempt < self.retry.max_attempts {
                let delay = self.retry.backoff_delay(attempt);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(ApproverError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        error!(state = %last_state, error = %last_error, "Record failed");
        Ok(RecordOutcome::Failed {
            attempts,
            state: last_state,
            error: last_error,
        })
    }

    async fn attempt<F>(
        &self,
        record: &AccountRecord,
        cursor: &mut Cursor,
        submissions: &mut usize,
        state: &mut DriverState,
        on_progress: &mut F,
    ) -> Result<(), ApproverError>
    where
        F: FnMut(Cursor) -> Result<(), ApproverError> + Send,
    {
        self.portal.open_packages().await?;
        self.portal.search_account(&record.ou_id).await?;
        let links = self.portal.approver_links(&record.account_name).await?;
        transition(state, DriverState::LinkLocated { links: links.len() });
        info!(
            "Found {} row(s) for Account '{}' (searched by OU ID '{}')",
            links.len(),
            record.account_name,
            record.ou_id
        );

        // (links.len(), 0) means every link was done before a crash.
        if cursor.0 > links.len() || (cursor.0 == links.len() && cursor.1 > 0) {
            warn!(link_index = cursor.0, "Saved link index out of range, starting at the first link");
            *cursor = (0, 0);
        }

        for (link_index, link) in links.iter().enumerate().skip(cursor.0) {
            debug!("Processing link {}/{}: {}", link_index + 1, links.len(), link);
            let first = if link_index == cursor.0 { cursor.1 } else { 0 };

            for (approver_index, approver) in self.approvers.iter().enumerate().skip(first) {
                self.portal.open_approver_form(link).await?;
                transition(state, DriverState::TableOpened { link: link_index });

                self.portal.enter_approver(approver).await?;
                transition(state, DriverState::ApproversEntered(approver_index + 1));

                self.portal.submit().await?;
                transition(state, DriverState::Submitted);

                self.portal.await_confirmation().await?;
                *submissions += 1;

                *cursor = if approver_index + 1 < self.approvers.len() {
                    (link_index, approver_index + 1)
                } else {
                    (link_index + 1, 0)
                };
                on_progress(*cursor)?;

                if !self.per_item_delay.is_zero() {
                    tokio::time::sleep(self.per_item_delay).await;
                }
            }
        }

        transition(state, DriverState::Confirmed);
        Ok(())
    }

    /// Bounded reconnect; failure is fatal for the run.
    async fn recover_session(&self) -> Result<(), ApproverError> {
        for attempt in 1..=self.reconnect.max_attempts {
            match self.portal.reconnect().await {
                Ok(()) => {
                    info!(attempt, "Browser session re-established");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect failed");
                    if attempt < self.reconnect.max_attempts {
                        tokio::time::sleep(self.reconnect.backoff_delay(attempt)).await;
                    }
                }
            }
        }
        Err(ApproverError::SessionLost(format!(
            "could not reconnect after {} attempts",
            self.reconnect.max_attempts
        )))
    }
}

fn transition(state: &mut DriverState, next: DriverState) {
    debug!(from = %state, to = %next, "State transition");
    *state = next;
}
