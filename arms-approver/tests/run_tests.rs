use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use arms_approver::checkpoint::InProgress;
use arms_approver::{
    AccountRecord, ApproverError, Checkpoint, Config, DriverState, FailurePolicy, LogObserver,
    Orchestrator, Portal, ProgressStore, RecordDriver, RecordOutcome, RecordStatus, RetryPolicy,
    RunStatus,
};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// In-memory portal whose behavior per OU ID is scripted up front.
#[derive(Default)]
struct ScriptedPortal {
    /// Number of "New approver" links per OU ID; missing means one.
    links: HashMap<String, usize>,
    /// OU IDs whose approver suggestions never appear.
    no_suggestions: HashSet<String>,
    /// OU ID whose packages page kills the browser session.
    session_dies_on: Option<String>,
    /// OU ID whose first submission cancels the run and then hangs.
    cancel_on: Option<(String, CancellationToken)>,
    /// Submission number (1-based, per OU) after which the next submit fails once.
    fail_submit_after: Option<(String, usize)>,
    state: Mutex<PortalState>,
}

#[derive(Default)]
struct PortalState {
    current_ou: String,
    current_link: String,
    dead: bool,
    submit_failed_once: bool,
    opened: HashMap<String, usize>,
    submitted: Vec<(String, String, String)>,
    reconnects: usize,
    closed: bool,
    pending_approver: Option<String>,
}

impl ScriptedPortal {
    fn opened(&self, ou: &str) -> usize {
        self.state.lock().unwrap().opened.get(ou).copied().unwrap_or(0)
    }

    fn submitted(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().submitted.clone()
    }

    fn submitted_for(&self, ou: &str) -> usize {
        self.submitted().iter().filter(|(o, _, _)| o == ou).count()
    }
}

#[async_trait]
impl Portal for ScriptedPortal {
    async fn is_alive(&self) -> bool {
        !self.state.lock().unwrap().dead
    }

    async fn reconnect(&self) -> Result<(), ApproverError> {
        let mut state = self.state.lock().unwrap();
        state.reconnects += 1;
        Err(ApproverError::Connection {
            endpoint: "127.0.0.1:9222".into(),
            message: "connection refused".into(),
        })
    }

    async fn open_packages(&self) -> Result<(), ApproverError> {
        let state = self.state.lock().unwrap();
        if state.dead {
            return Err(ApproverError::SessionLost("tab closed".into()));
        }
        Ok(())
    }

    async fn search_account(&self, ou_id: &str) -> Result<(), ApproverError> {
        let mut state = self.state.lock().unwrap();
        *state.opened.entry(ou_id.to_string()).or_default() += 1;
        state.current_ou = ou_id.to_string();
        if self.session_dies_on.as_deref() == Some(ou_id) {
            state.dead = true;
            return Err(ApproverError::SessionLost("browser closed".into()));
        }
        Ok(())
    }

    async fn approver_links(&self, _account_name: &str) -> Result<Vec<String>, ApproverError> {
        let state = self.state.lock().unwrap();
        let count = self.links.get(&state.current_ou).copied().unwrap_or(1);
        Ok((0..count)
            .map(|i| format!("https://arms.test/approver/{}/{}", state.current_ou, i))
            .collect())
    }

    async fn open_approver_form(&self, link: &str) -> Result<(), ApproverError> {
        self.state.lock().unwrap().current_link = link.to_string();
        Ok(())
    }

    async fn enter_approver(&self, approver: &str) -> Result<(), ApproverError> {
        let mut state = self.state.lock().unwrap();
        if self.no_suggestions.contains(&state.current_ou) {
            return Err(ApproverError::SuggestionNotFound {
                query: approver.to_string(),
            });
        }
        state.pending_approver = Some(approver.to_string());
        Ok(())
    }

    async fn submit(&self) -> Result<(), ApproverError> {
        if let Some((ou, token)) = &self.cancel_on {
            let hang = self.state.lock().unwrap().current_ou == *ou;
            if hang {
                token.cancel();
                std::future::pending::<()>().await;
            }
        }
        let mut state = self.state.lock().unwrap();
        if let Some((ou, after)) = &self.fail_submit_after {
            let done = state.submitted.iter().filter(|(o, _, _)| o == ou).count();
            if state.current_ou == *ou && done == *after && !state.submit_failed_once {
                state.submit_failed_once = true;
                return Err(ApproverError::Timeout("submit button".into()));
            }
        }
        let approver = state
            .pending_approver
            .take()
            .ok_or_else(|| ApproverError::ElementNotFound("approver not entered".into()))?;
        let entry = (state.current_ou.clone(), state.current_link.clone(), approver);
        state.submitted.push(entry);
        Ok(())
    }

    async fn await_confirmation(&self) -> Result<(), ApproverError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ApproverError> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

fn record(index: usize, ou: &str, name: &str) -> AccountRecord {
    AccountRecord {
        index,
        row: index + 1,
        ou_id: ou.to_string(),
        account_name: name.to_string(),
        status: RecordStatus::Pending,
    }
}

fn two_records() -> Vec<AccountRecord> {
    vec![record(1, "OU1", "Alpha"), record(2, "OU2", "Beta")]
}

fn approvers() -> Vec<String> {
    vec!["ann".into(), "bob".into(), "cid".into()]
}

fn fast_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.checkpoint.path = dir.path().join("progress.json");
    config.run.approvers = approvers();
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };
    config.browser.reconnect = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    };
    config.timeouts.per_item_delay = Duration::ZERO;
    config
}

/// Route run logs to the test harness; `RUST_LOG=arms_approver=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn orchestrator(
    portal: ScriptedPortal,
    config: Config,
    cancel: CancellationToken,
) -> Orchestrator<ScriptedPortal> {
    init_tracing();
    let store = ProgressStore::new(&config.checkpoint.path);
    Orchestrator::new(portal, store, config, cancel)
}

#[tokio::test]
async fn fresh_run_confirms_every_record() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(&dir);
    let store = ProgressStore::new(&config.checkpoint.path);
    let orch = orchestrator(ScriptedPortal::default(), config, CancellationToken::new());

    let report = orch.run(two_records(), &mut LogObserver).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.summary.confirmed, 2);
    assert_eq!(report.summary.failed, 0);
    assert_eq!(report.last_completed_index, 2);
    assert_eq!(report.exit_code(true), 0);
    assert!(report.records.iter().all(|r| r.status == RecordStatus::Done));

    // One link per record, three approvers each, in configured order.
    let submitted = orch.portal().submitted();
    assert_eq!(submitted.len(), 6);
    let first: Vec<_> = submitted[..3].iter().map(|(_, _, a)| a.as_str()).collect();
    assert_eq!(first, ["ann", "bob", "cid"]);
    assert!(orch.portal().state.lock().unwrap().closed);

    let saved = store.try_load().unwrap().unwrap();
    assert_eq!(saved.last_completed_index, 2);
    assert!(saved.in_progress.is_empty());
    assert_eq!(saved.completed_keys.len(), 2);
}

#[tokio::test]
async fn resumes_after_last_completed_index() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(&dir);
    let store = ProgressStore::new(&config.checkpoint.path);
    let checkpoint = Checkpoint {
        last_completed_index: 1,
        ..Default::default()
    };
    store.save(&checkpoint).unwrap();

    let orch = orchestrator(ScriptedPortal::default(), config, CancellationToken::new());
    let report = orch.run(two_records(), &mut LogObserver).await.unwrap();

    assert_eq!(report.summary.skipped, 1);
    assert_eq!(report.summary.confirmed, 1);
    assert_eq!(orch.portal().opened("OU1"), 0);
    assert_eq!(orch.portal().submitted_for("OU2"), 3);
    assert_eq!(report.last_completed_index, 2);
}

#[tokio::test]
async fn duplicate_key_later_in_input_is_skipped() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(&dir);
    let orch = orchestrator(ScriptedPortal::default(), config, CancellationToken::new());

    let records = vec![record(1, "OU1", "Alpha"), record(2, " ou1 ", "ALPHA")];
    let report = orch.run(records, &mut LogObserver).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.summary.confirmed, 1);
    assert_eq!(report.summary.skipped, 1);
    assert_eq!(report.summary.not_attempted, 0);
    assert_eq!(orch.portal().submitted().len(), 3);
    assert_eq!(orch.portal().opened(" ou1 "), 0);
    assert_eq!(report.records[1].status, RecordStatus::Done);
    assert_eq!(report.last_completed_index, 2);
}

#[tokio::test]
async fn completed_keys_skip_moved_rows() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(&dir);
    let store = ProgressStore::new(&config.checkpoint.path);
    let mut checkpoint = Checkpoint::default();
    checkpoint.completed_keys.insert(record(0, " ou2 ", "BETA").key());
    store.save(&checkpoint).unwrap();

    let orch = orchestrator(ScriptedPortal::default(), config, CancellationToken::new());
    let report = orch.run(two_records(), &mut LogObserver).await.unwrap();

    assert_eq!(report.summary.skipped, 1);
    assert_eq!(orch.portal().opened("OU2"), 0);
    assert_eq!(report.last_completed_index, 2);
}

#[tokio::test]
async fn missing_suggestion_is_retried_then_marked_failed() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(&dir);
    let store = ProgressStore::new(&config.checkpoint.path);
    let portal = ScriptedPortal {
        no_suggestions: HashSet::from(["OU1".to_string()]),
        ..Default::default()
    };
    let orch = orchestrator(portal, config, CancellationToken::new());

    let report = orch.run(two_records(), &mut LogObserver).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(orch.portal().opened("OU1"), 3);
    assert_eq!(report.records[0].status, RecordStatus::Failed);
    assert_eq!(report.records[1].status, RecordStatus::Done);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.confirmed, 1);
    assert_eq!(report.exit_code(false), 0);
    assert_eq!(report.exit_code(true), 1);

    // The watermark cannot pass a failed record; the key set covers row 2.
    let saved = store.try_load().unwrap().unwrap();
    assert_eq!(saved.last_completed_index, 0);
    assert!(saved.failed.contains(&1));
    assert!(saved.completed_keys.contains(&record(2, "OU2", "Beta").key()));
    let last_error = saved.last_error.unwrap();
    assert_eq!(last_error.ou_id, "OU1");
    assert!(last_error.error.contains("ann"));
}

#[tokio::test]
async fn halt_policy_stops_after_first_failure() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config(&dir);
    config.run.on_failure = FailurePolicy::Halt;
    let portal = ScriptedPortal {
        no_suggestions: HashSet::from(["OU1".to_string()]),
        ..Default::default()
    };
    let orch = orchestrator(portal, config, CancellationToken::new());

    let report = orch.run(two_records(), &mut LogObserver).await.unwrap();

    assert_eq!(report.status, RunStatus::Halted);
    assert_eq!(report.summary.not_attempted, 1);
    assert_eq!(orch.portal().opened("OU2"), 0);
    assert_eq!(report.exit_code(false), 1);
}

#[tokio::test]
async fn cancellation_leaves_consistent_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(&dir);
    let store = ProgressStore::new(&config.checkpoint.path);
    let cancel = CancellationToken::new();
    let portal = ScriptedPortal {
        cancel_on: Some(("OU2".to_string(), cancel.clone())),
        ..Default::default()
    };
    let orch = orchestrator(portal, config, cancel);

    let report = orch.run(two_records(), &mut LogObserver).await.unwrap();

    assert_eq!(report.status, RunStatus::Interrupted);
    assert_eq!(report.exit_code(false), 130);
    assert_eq!(report.summary.confirmed, 1);
    assert_eq!(report.summary.not_attempted, 1);
    assert!(orch.portal().state.lock().unwrap().closed);

    let saved = store.try_load().unwrap().unwrap();
    assert_eq!(saved.last_completed_index, 1);
}

#[tokio::test]
async fn unrecoverable_session_loss_ends_run() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(&dir);
    let portal = ScriptedPortal {
        session_dies_on: Some("OU1".to_string()),
        ..Default::default()
    };
    let orch = orchestrator(portal, config, CancellationToken::new());

    let report = orch.run(two_records(), &mut LogObserver).await.unwrap();

    assert!(matches!(report.status, RunStatus::SessionLost(_)));
    assert_eq!(report.exit_code(false), 2);
    assert_eq!(orch.portal().state.lock().unwrap().reconnects, 2);
    assert_eq!(orch.portal().opened("OU2"), 0);
    assert_eq!(report.last_completed_index, 0);
}

#[tokio::test]
async fn rerun_after_completion_submits_nothing() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(&dir);

    let first = orchestrator(ScriptedPortal::default(), config.clone(), CancellationToken::new());
    first.run(two_records(), &mut LogObserver).await.unwrap();

    let second = orchestrator(ScriptedPortal::default(), config, CancellationToken::new());
    let report = second.run(two_records(), &mut LogObserver).await.unwrap();

    assert_eq!(report.summary.skipped, 2);
    assert!(second.portal().submitted().is_empty());
    assert_eq!(report.last_completed_index, 2);
}

#[tokio::test]
async fn in_record_progress_resumes_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(&dir);
    let store = ProgressStore::new(&config.checkpoint.path);
    let records = two_records();

    // Link 0 finished and the first approver of link 1 confirmed before a crash.
    let mut checkpoint = Checkpoint::default();
    checkpoint.in_progress.insert(
        records[0].key(),
        InProgress {
            row: records[0].row,
            link_index: 1,
            approver_index: 1,
            updated_at: chrono::Local::now(),
        },
    );
    store.save(&checkpoint).unwrap();

    let portal = ScriptedPortal {
        links: HashMap::from([("OU1".to_string(), 2)]),
        ..Default::default()
    };
    let orch = orchestrator(portal, config, CancellationToken::new());
    let report = orch.run(records, &mut LogObserver).await.unwrap();

    assert_eq!(report.summary.confirmed, 2);
    let ou1: Vec<_> = orch
        .portal()
        .submitted()
        .into_iter()
        .filter(|(ou, _, _)| ou == "OU1")
        .map(|(_, link, approver)| (link, approver))
        .collect();
    assert_eq!(
        ou1,
        vec![
            ("https://arms.test/approver/OU1/1".to_string(), "bob".to_string()),
            ("https://arms.test/approver/OU1/1".to_string(), "cid".to_string()),
        ]
    );
}

#[tokio::test]
async fn driver_restart_keeps_submission_cursor() {
    let portal = ScriptedPortal {
        fail_submit_after: Some(("OU1".to_string(), 1)),
        ..Default::default()
    };
    let approvers = approvers();
    let driver = RecordDriver::new(&portal, &approvers, CancellationToken::new()).with_retry(
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
    );

    let mut cursors = Vec::new();
    let mut on_progress = |cursor: (usize, usize)| -> Result<(), ApproverError> {
        cursors.push(cursor);
        Ok(())
    };
    let outcome = driver
        .drive(&record(1, "OU1", "Alpha"), (0, 0), &mut on_progress)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RecordOutcome::Confirmed {
            attempts: 2,
            submissions: 3
        }
    );
    assert_eq!(cursors, vec![(0, 1), (0, 2), (1, 0)]);
    assert_eq!(portal.opened("OU1"), 2);
    let names: Vec<_> = portal.submitted().into_iter().map(|(_, _, a)| a).collect();
    assert_eq!(names, ["ann", "bob", "cid"]);
}

#[tokio::test]
async fn driver_reports_state_reached_on_failure() {
    let portal = ScriptedPortal {
        no_suggestions: HashSet::from(["OU1".to_string()]),
        ..Default::default()
    };
    let approvers = approvers();
    let driver = RecordDriver::new(&portal, &approvers, CancellationToken::new()).with_retry(
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
    );

    let mut ignore = |_: (usize, usize)| -> Result<(), ApproverError> { Ok(()) };
    let outcome = driver
        .drive(&record(1, "OU1", "Alpha"), (0, 0), &mut ignore)
        .await
        .unwrap();

    match outcome {
        RecordOutcome::Failed {
            attempts,
            state,
            error,
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(state, DriverState::TableOpened { link: 0 });
            assert!(error.contains("ann"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}
