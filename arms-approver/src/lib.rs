//! Resumable approver entry for the ARMS portal.
//!
//! Reads account records from a spreadsheet, attaches to a browser the
//! operator already started with remote debugging enabled, and for each record
//! adds three approvers through the portal's "New approver" forms. Progress is
//! checkpointed after every submission so an interrupted run picks up where
//! it stopped.

pub mod cdp_client;
pub mod checkpoint;
pub mod config;
pub mod driver;
pub mod errors;
pub mod locator;
pub mod orchestrator;
pub mod portal;
pub mod records;
pub mod retry;
pub mod selector;
pub mod session;

pub use checkpoint::{Checkpoint, ProgressStore};
pub use config::{BrowserKind, Config, FailurePolicy};
pub use driver::{DriverState, RecordDriver, RecordOutcome};
pub use errors::ApproverError;
pub use locator::Locator;
pub use orchestrator::{LogObserver, Orchestrator, RunObserver, RunReport, RunStatus, RunSummary};
pub use portal::{CdpPortal, MatchMode, Portal, PortalConfig};
pub use records::{read_records, AccountRecord, ColumnSpec, RecordStatus};
pub use retry::RetryPolicy;
pub use selector::Selector;
pub use session::{BrowserSession, CdpSession, TabHandle};
