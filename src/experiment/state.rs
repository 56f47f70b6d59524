//! Scan session state and the session summary sidecar.

use super::plan::ScanPlan;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Lifecycle state of a scan session.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> Validating ──ok──> Running ──done──> Completed
///  ▲                  │                 │  │
///  │                  │ error           │  └─cancel─> Cancelling ──> Cancelled
///  │                  ▼                 ▼
///  │                Failed <────────── error
///  │
///  └── any terminal state, once Finished is published
/// ```
///
/// Completed, Cancelled and Failed are terminal. The engine publishes the
/// terminal state with `Finished`, then returns its status to Idle and keeps
/// the terminal state in [`RunStatus::last_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session running
    #[default]
    Idle,
    /// Planning and pre-flight limit checks
    Validating,
    /// Visiting points
    Running,
    /// Cancel observed, stopping axes
    Cancelling,
    /// Stopped on request
    Cancelled,
    /// Every point visited
    Completed,
    /// Aborted by an error
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Validating => write!(f, "Validating"),
            SessionState::Running => write!(f, "Running"),
            SessionState::Cancelling => write!(f, "Cancelling"),
            SessionState::Cancelled => write!(f, "Cancelled"),
            SessionState::Completed => write!(f, "Completed"),
            SessionState::Failed => write!(f, "Failed"),
        }
    }
}

impl SessionState {
    /// Whether the session has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Cancelled | SessionState::Completed | SessionState::Failed
        )
    }

    /// Whether a new session may start from this state.
    pub fn can_begin(&self) -> bool {
        matches!(self, SessionState::Idle) || self.is_terminal()
    }
}

/// Snapshot of the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStatus {
    /// State of the running session, Idle between sessions
    pub state: SessionState,
    /// Terminal state of the last finished session
    pub last_state: Option<SessionState>,
    /// Current or last session id
    pub run_id: Option<Uuid>,
    /// Records produced so far
    pub measured: usize,
    /// Points planned
    pub planned: usize,
    /// Error that ended the last session
    pub last_error: Option<String>,
}

/// Description of a finished session, saved as JSON next to the data file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id
    pub run_id: Uuid,
    /// Start time
    pub started: DateTime<Local>,
    /// End time
    pub finished: DateTime<Local>,
    /// The requested plan
    pub plan: ScanPlan,
    /// Terminal state
    pub state: SessionState,
    /// Points planned
    pub planned: usize,
    /// Records written
    pub measured: usize,
    /// Error text for failed sessions
    pub error: Option<String>,
    /// Data file, if one was written
    pub data_file: Option<String>,
}

impl SessionSummary {
    /// Save as pretty JSON, creating the parent directory.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize session summary")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create summary directory")?;
        }

        fs::write(&path, json)
            .with_context(|| format!("Failed to write session summary to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Load a saved summary.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read session summary from {:?}", path.as_ref()))?;
        serde_json::from_str(&json).context("Failed to deserialize session summary")
    }
}
