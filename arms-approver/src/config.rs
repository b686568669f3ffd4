//! Run configuration.
//!
//! Built-in defaults, optionally overridden by a YAML file, then by the
//! command line. Durations in YAML are plain milliseconds; human strings like
//! "2s" are accepted through [`parse_duration`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ApproverError;
use crate::portal::PortalConfig;
use crate::records::ColumnSpec;
use crate::retry::RetryPolicy;

pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:9222";
pub const APPROVER_COUNT: usize = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub input: InputConfig,
    pub checkpoint: CheckpointConfig,
    pub browser: BrowserConfig,
    pub portal: PortalConfig,
    /// Record-level restarts.
    pub retry: RetryPolicy,
    pub timeouts: Timeouts,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub path: Option<PathBuf>,
    #[serde(flatten)]
    pub columns: ColumnSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub path: PathBuf,
    /// Skip records the checkpoint marks as done.
    pub resume: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("progress.json"),
            resume: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    #[default]
    Chrome,
    Edge,
}

impl BrowserKind {
    /// What the operator has to do before the tool can attach.
    pub fn launch_instructions(&self, port: u16) -> String {
        match self {
            BrowserKind::Chrome => format!(
                "Start Chrome in debug mode first, e.g.\n  chrome.exe --remote-debugging-port={port}\nthen log in to ARMS in that window."
            ),
            BrowserKind::Edge => format!(
                "Start Edge in debug mode first, e.g.\n  msedge.exe --remote-debugging-port={port}\nthen log in to ARMS in that window."
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// `host:port` or `http://host:port` of the remote debugging endpoint.
    pub endpoint: String,
    pub kind: BrowserKind,
    pub reconnect: RetryPolicy,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            kind: BrowserKind::default(),
            reconnect: RetryPolicy::reconnect_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Waiting for links, tables, inputs and overlays.
    #[serde(with = "millis")]
    pub element: Duration,
    /// Waiting for the autocomplete list to populate.
    #[serde(with = "millis")]
    pub suggestion: Duration,
    /// Waiting for the success signal after Submit.
    #[serde(with = "millis")]
    pub confirmation: Duration,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Pause after each submitted approver.
    #[serde(with = "millis")]
    pub per_item_delay: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            element: Duration::from_secs(30),
            suggestion: Duration::from_secs(20),
            confirmation: Duration::from_secs(40),
            poll_interval: Duration::from_millis(250),
            per_item_delay: Duration::from_millis(300),
        }
    }
}

/// What to do after a record ends Failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Continue,
    Halt,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub approvers: Vec<String>,
    pub on_failure: FailurePolicy,
    /// Exit non-zero when any record ended Failed.
    pub fail_on_record_error: bool,
}

impl Config {
    pub fn from_yaml_file(path: &Path) -> Result<Self, ApproverError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ApproverError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ApproverError> {
        serde_yaml::from_str(text).map_err(|e| ApproverError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ApproverError> {
        if self.run.approvers.len() != APPROVER_COUNT
            || self.run.approvers.iter().any(|a| a.trim().is_empty())
        {
            return Err(ApproverError::Config(format!(
                "exactly {APPROVER_COUNT} non-empty approvers are required, got {}",
                self.run.approvers.len()
            )));
        }
        if self.retry.max_attempts == 0 || self.browser.reconnect.max_attempts == 0 {
            return Err(ApproverError::Config("retry attempts must be at least 1".into()));
        }
        for (name, value) in [
            ("element", self.timeouts.element),
            ("suggestion", self.timeouts.suggestion),
            ("confirmation", self.timeouts.confirmation),
            ("poll_interval", self.timeouts.poll_interval),
        ] {
            if value.is_zero() {
                return Err(ApproverError::Config(format!("timeout '{name}' must be non-zero")));
            }
        }
        if self.input.columns.ou_id_column.trim().is_empty()
            || self.input.columns.account_name_column.trim().is_empty()
        {
            return Err(ApproverError::Config("column names must not be empty".into()));
        }
        Ok(())
    }
}

/// Split a comma-separated approver list, dropping empty entries.
pub fn parse_approvers(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse human-readable durations: "1s", "500ms", "2m", "1.5s", "30" (ms).
pub fn parse_duration(input: &str) -> Result<Duration, ApproverError> {
    let input = input.trim();

    if let Ok(ms) = input.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }

    let split_pos = input
        .char_indices()
        .find(|(_, ch)| ch.is_alphabetic())
        .map(|(i, _)| i)
        .unwrap_or(input.len());
    let (number_part, unit_part) = input.split_at(split_pos);
    if number_part.is_empty() {
        return Err(ApproverError::Config(format!("no numeric value in duration: {input}")));
    }

    let value: f64 = number_part
        .trim()
        .parse()
        .map_err(|_| ApproverError::Config(format!("invalid number in duration: {number_part}")))?;

    let multiplier = match unit_part {
        "ms" | "milliseconds" | "millisecond" => 1.0,
        "s" | "sec" | "secs" | "second" | "seconds" => 1000.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000.0,
        _ => return Err(ApproverError::Config(format!("unknown time unit: {unit_part}"))),
    };

    Ok(Duration::from_millis((value * multiplier) as u64))
}

/// Serialize a `Duration` as integer milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
