//! Batch coordination: enumerate, build, launch, collect.
//!
//! Design points are pulled from the lazy enumeration one at a time, and
//! only after a launch slot is free, so the number of live engine processes
//! never exceeds [`ConcurrencyPolicy::slots`]. Engines are spawned from the
//! scheduling loop itself, so they start in enumeration order whatever the
//! runtime flavor. Each design point yields
//! exactly one [`RunResult`]; a failure in one release never stops the
//! others.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, warn, Instrument};
use uuid::Uuid;

use eptm_core::obs::{
    batch_span, emit_batch_finished, emit_batch_started, emit_run_finished, emit_run_launched,
};
use eptm_core::{build, resolve, ConcurrencyPolicy, DesignPoint, RawConfig, RunConfig, StdioMode};

use crate::cancel::CancelHandle;
use crate::error::{BatchError, BatchResult};
use crate::launcher::{ChildProcessLauncher, ProcessLauncher};
use crate::manifest::{BatchManifest, ManifestJournal};
use crate::result::{RunOutcome, RunResult};

/// Drives one batch at a time.
///
/// Without an explicit launcher, engine processes are started with a
/// [`ChildProcessLauncher`] built from the resolved execution settings.
pub struct BatchCoordinator {
    launcher: Option<Arc<dyn ProcessLauncher>>,
    journal_path: Option<PathBuf>,
    cancel: CancelHandle,
}

impl BatchCoordinator {
    pub fn new() -> Self {
        Self {
            launcher: None,
            journal_path: None,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Append each result to a JSON-lines journal as it completes.
    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Resolve `raw` for `study_id` and run it with the configured policy.
    ///
    /// A configuration error is returned before any process is launched.
    pub async fn run_study(&self, raw: &RawConfig, study_id: &str) -> BatchResult<BatchManifest> {
        let config = Arc::new(resolve(raw, study_id)?);
        let policy = config.execution.policy;
        self.run_batch(config, study_id, policy).await
    }

    /// Run every design point of `study_id` under `policy`.
    ///
    /// Returns once every launched process has been reaped. Per-release
    /// failures are recorded in the manifest; `Err` means the batch could not
    /// start or its bookkeeping failed.
    pub async fn run_batch(
        &self,
        config: Arc<RunConfig>,
        study_id: &str,
        policy: ConcurrencyPolicy,
    ) -> BatchResult<BatchManifest> {
        let batch_id = Uuid::new_v4();
        let span = batch_span(&batch_id.to_string(), study_id);
        self.drive(config, batch_id, study_id, policy)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        config: Arc<RunConfig>,
        batch_id: Uuid,
        study_id: &str,
        policy: ConcurrencyPolicy,
    ) -> BatchResult<BatchManifest> {
        let mut points = config.catalog().enumerate(study_id)?;

        prepare_dir(&config.output_dir)?;
        if let StdioMode::LogFiles { dir } = &config.execution.stdio {
            prepare_dir(dir)?;
        }
        let mut journal = match &self.journal_path {
            Some(path) => Some(ManifestJournal::create(path)?),
            None => None,
        };
        let launcher = self.launcher.clone().unwrap_or_else(|| {
            Arc::new(ChildProcessLauncher::from_settings(&config.execution))
                as Arc<dyn ProcessLauncher>
        });

        let mut manifest = BatchManifest::begin(batch_id, study_id, policy);
        let slots = policy.slots();
        emit_batch_started(&batch_id.to_string(), study_id, slots);

        let semaphore = Arc::new(Semaphore::new(slots));
        let mut in_flight: JoinSet<RunResult> = JoinSet::new();
        let mut pending: BTreeMap<u64, DesignPoint> = BTreeMap::new();
        let mut cancel = self.cancel.token();
        let mut next_seq = 0u64;
        let mut cancelled = false;

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    collect(joined, &mut pending, &mut manifest, &mut journal);
                    continue;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|_| BatchError::SlotsClosed)?
                }
            };

            // Every design point source is duplicate-free.
            let Some(point) = points.next() else {
                break;
            };
            next_seq += 1;
            let seq = next_seq;

            match build(&config, &point) {
                Ok(invocation) => {
                    emit_run_launched(point.as_str(), seq, &invocation.command_line());
                    // Spawned here, in enumeration order; only the wait runs
                    // in the task.
                    let run = launcher.start(&invocation);
                    pending.insert(seq, point);
                    let token = cancel.clone();
                    in_flight.spawn(async move {
                        let mut result = run.wait(token).await;
                        drop(permit);
                        result.seq = seq;
                        result
                    });
                }
                Err(e) => {
                    let outcome = RunOutcome::BuildError {
                        reason: e.to_string(),
                    };
                    record(
                        RunResult::not_launched(seq, point, outcome),
                        &mut manifest,
                        &mut journal,
                    );
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            collect(joined, &mut pending, &mut manifest, &mut journal);
        }
        for (seq, point) in std::mem::take(&mut pending) {
            let outcome = RunOutcome::LaunchError {
                reason: "launch task ended without reporting a result".to_string(),
            };
            record(
                RunResult::not_launched(seq, point, outcome),
                &mut manifest,
                &mut journal,
            );
        }

        manifest.finalize(cancelled);
        emit_batch_finished(
            &batch_id.to_string(),
            manifest.attempted(),
            manifest.failed_count(),
            manifest.cancelled,
            manifest.success,
        );
        Ok(manifest)
    }
}

impl Default for BatchCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn prepare_dir(dir: &Path) -> BatchResult<()> {
    std::fs::create_dir_all(dir).map_err(|source| BatchError::Prepare {
        path: dir.to_path_buf(),
        source,
    })
}

fn collect(
    joined: Result<RunResult, JoinError>,
    pending: &mut BTreeMap<u64, DesignPoint>,
    manifest: &mut BatchManifest,
    journal: &mut Option<ManifestJournal>,
) {
    match joined {
        Ok(result) => {
            pending.remove(&result.seq);
            record(result, manifest, journal);
        }
        // The design point stays in `pending` and is recorded once the
        // batch drains.
        Err(e) => error!(error = %e, "launch task failed"),
    }
}

fn record(result: RunResult, manifest: &mut BatchManifest, journal: &mut Option<ManifestJournal>) {
    emit_run_finished(
        result.design_point.as_str(),
        result.seq,
        result.outcome.kind(),
        result.duration_ms,
        result.success,
    );
    if let Some(journal) = journal.as_mut() {
        if let Err(e) = journal.append(&result) {
            warn!(error = %e, "failed to append run result to journal");
        }
    }
    manifest.record(result);
}
