use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommandRecord {
    pub id: u64,                    // Sequential per engagement
    pub engagement: String,         // Workspace the command belongs to
    pub command: String,            // Command executed
    pub command_hash: String,       // SHA256 of the normalised command
    pub timestamp: DateTime<Utc>,   // Start of execution
    pub working_dir: PathBuf,       // Working directory
    pub status: ExecutionStatus,    // success | error
    #[serde(default)]
    pub exit_code: Option<u32>,     // Known only for normal exits
    pub duration_ms: u64,           // Execution duration (milliseconds)
    #[serde(default)]
    pub timed_out: bool,            // Killed by the timeout budget
    #[serde(default)]
    pub tags: Vec<String>,          // Operator tags, the only mutable field
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CommandExecution {
    pub record: CommandRecord, // Command record
    pub raw_output: String,    // Output as captured
    pub redacted_output: String, // Output with secrets masked
}

/// Which copy of the output a reader wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputView {
    #[default]
    Redacted,
    Raw,
}

impl CommandExecution {
    pub fn output(&self, view: OutputView) -> &str {
        match view {
            OutputView::Redacted => &self.redacted_output,
            OutputView::Raw => &self.raw_output,
        }
    }
}

/// Row of the recordings index.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordingEntry {
    pub id: u64,
    pub engagement: String,
    pub path: PathBuf,
    #[serde(default)]
    pub cast_path: Option<PathBuf>,
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
}

/// Row of the screenshots index, written by the screenshot tool.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScreenshotEntry {
    pub id: u64,
    pub engagement: String,
    #[serde(default)]
    pub command_id: Option<u64>,
    pub path: PathBuf,
    #[serde(default)]
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-engagement summary for listings.
#[derive(Debug, Clone)]
pub struct EngagementSummary {
    pub name: String,
    pub command_count: usize,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct EngagementStats {
    pub total: usize,
    pub succeeded: usize,
    pub average_ms: f64,
    pub last: Option<CommandRecord>,
}

impl EngagementStats {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64 * 100.0
        }
    }
}
