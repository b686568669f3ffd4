use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApproverError {
    #[error("Input format error: {0}")]
    InputFormat(String),

    #[error("Input file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Cannot reach the remote debugging endpoint {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("No matching suggestion for approver '{query}'")]
    SuggestionNotFound { query: String },

    #[error("Element is detached from DOM: {0}")]
    StaleElement(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Script evaluation failed: {0}")]
    Script(String),

    #[error("Browser session lost: {0}")]
    SessionLost(String),

    #[error("Checkpoint file is corrupt: {0}")]
    CheckpointCorrupt(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApproverError {
    /// Failures of the page itself (timing races, missing elements, empty
    /// suggestion lists). These restart the current record.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApproverError::ElementNotFound(_)
                | ApproverError::SuggestionNotFound { .. }
                | ApproverError::StaleElement(_)
                | ApproverError::Timeout(_)
                | ApproverError::Script(_)
        )
    }

    /// The debugging connection itself is gone; only a reconnect can help.
    pub fn is_session_loss(&self) -> bool {
        matches!(
            self,
            ApproverError::SessionLost(_) | ApproverError::Connection { .. }
        )
    }
}
