//! In-memory launcher fake (testing only)
//!
//! `ScriptedLauncher` satisfies the [`ProcessLauncher`] contract without
//! spawning anything: each design point sleeps for a scripted delay and
//! finishes with a scripted exit code. It records the order of `start` calls
//! and the peak number of runs between `start` and the end of `wait`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use eptm_core::{DesignPoint, Invocation};

use crate::cancel::CancelToken;
use crate::launcher::{EngineRun, ProcessLauncher};
use crate::result::{CapturedStdio, RunOutcome, RunResult};

#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    default_delay: Duration,
    delays: HashMap<String, Duration>,
    exit_codes: HashMap<String, i32>,
    launched: Mutex<Vec<DesignPoint>>,
    running: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay applied to every design point without its own.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn with_point_delay(mut self, point: &str, delay: Duration) -> Self {
        self.delays.insert(point.to_string(), delay);
        self
    }

    /// Exit code for `point`; everything else exits 0.
    pub fn with_exit_code(mut self, point: &str, code: i32) -> Self {
        self.exit_codes.insert(point.to_string(), code);
        self
    }

    pub fn launch_count(&self) -> usize {
        self.launched().len()
    }

    /// Design points in the order `start` was called.
    pub fn launched(&self) -> Vec<DesignPoint> {
        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    fn start(&self, invocation: &Invocation) -> Box<dyn EngineRun> {
        let point = invocation.design_point.clone();
        self.launched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(point.clone());
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);

        let delay = self
            .delays
            .get(point.as_str())
            .copied()
            .unwrap_or(self.default_delay);
        let exit_code = self.exit_codes.get(point.as_str()).copied().unwrap_or(0);
        Box::new(ScriptedRun {
            output_path: invocation.output_path.clone(),
            fingerprint: invocation.fingerprint(),
            design_point: point,
            delay,
            exit_code,
            running: Arc::clone(&self.running),
            started_at: Utc::now(),
            start: Instant::now(),
        })
    }
}

struct ScriptedRun {
    design_point: DesignPoint,
    output_path: PathBuf,
    fingerprint: String,
    delay: Duration,
    exit_code: i32,
    running: Arc<AtomicUsize>,
    started_at: DateTime<Utc>,
    start: Instant,
}

#[async_trait]
impl EngineRun for ScriptedRun {
    async fn wait(self: Box<Self>, mut cancel: CancelToken) -> RunResult {
        let outcome = tokio::select! {
            _ = tokio::time::sleep(self.delay) => match self.exit_code {
                0 => RunOutcome::Succeeded,
                exit_code => RunOutcome::ProcessFailure { exit_code },
            },
            _ = cancel.cancelled() => RunOutcome::Cancelled,
        };
        self.running.fetch_sub(1, Ordering::SeqCst);

        let exit_code = match &outcome {
            RunOutcome::Succeeded => Some(0),
            RunOutcome::ProcessFailure { exit_code } => Some(*exit_code),
            _ => None,
        };
        let ScriptedRun {
            design_point,
            output_path,
            fingerprint,
            started_at,
            start,
            ..
        } = *self;
        RunResult {
            seq: 0,
            design_point,
            success: outcome.is_success(),
            outcome,
            exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
            output_path: Some(output_path),
            stdio: CapturedStdio::None,
            started_at,
            finished_at: Utc::now(),
            fingerprint: Some(fingerprint),
        }
    }
}
