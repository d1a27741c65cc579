//! Per-release run results.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eptm_core::DesignPoint;

/// How one design point's run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// The engine exited with a non-zero status. `-1` when it was killed by
    /// a signal.
    ProcessFailure { exit_code: i32 },
    /// Killed after exceeding the per-run limit.
    Timeout { limit_ms: u64 },
    /// The invocation could not be built; nothing was spawned.
    BuildError { reason: String },
    /// The process could not be spawned or waited on.
    LaunchError { reason: String },
    /// Terminated because the batch was cancelled.
    Cancelled,
}

impl RunOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::ProcessFailure { .. } => "process_failure",
            Self::Timeout { .. } => "timeout",
            Self::BuildError { .. } => "build_error",
            Self::LaunchError { .. } => "launch_error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Engine stdout/stderr as retained by the launcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CapturedStdio {
    #[default]
    None,
    /// Trailing bytes of each stream, lossily decoded.
    Inline {
        stdout: String,
        stderr: String,
        truncated: bool,
    },
    LogFiles { stdout: PathBuf, stderr: PathBuf },
}

/// Result of one design point within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Launch order within the batch, starting at 1.
    pub seq: u64,

    pub design_point: DesignPoint,

    pub outcome: RunOutcome,

    /// Raw exit status when the process exited on its own.
    pub exit_code: Option<i32>,

    pub duration_ms: u64,

    /// Where the engine was told to write; `None` when nothing was spawned.
    pub output_path: Option<PathBuf>,

    #[serde(default)]
    pub stdio: CapturedStdio,

    pub success: bool,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,

    /// Digest of the exact command line, see `Invocation::fingerprint`.
    pub fingerprint: Option<String>,
}

impl RunResult {
    /// Result for a design point that never reached a running process.
    pub fn not_launched(seq: u64, design_point: DesignPoint, outcome: RunOutcome) -> Self {
        let now = Utc::now();
        Self {
            seq,
            design_point,
            success: outcome.is_success(),
            outcome,
            exit_code: None,
            duration_ms: 0,
            output_path: None,
            stdio: CapturedStdio::None,
            started_at: now,
            finished_at: now,
            fingerprint: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.success
    }
}
