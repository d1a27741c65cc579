//! Structured lifecycle events for batches and individual engine runs.
//!
//! Every event carries an `event` field (`batch.started`, `run.launched`,
//! `run.finished`, `batch.finished`) so logs can be filtered without parsing
//! message text. Set `RUST_LOG` to adjust verbosity.

use tracing::{info, warn, Span};

/// Span tagging every event of one batch with its batch and study ids.
///
/// Batches run across `.await` points, so attach it with
/// `tracing::Instrument::instrument` rather than entering it.
///
/// ```ignore
/// run(config).instrument(batch_span("2b1f...", "RUN_42")).await;
/// ```
pub fn batch_span(batch_id: &str, study_id: &str) -> Span {
    tracing::info_span!("eptm.batch", batch_id = %batch_id, study_id = %study_id)
}

pub fn emit_batch_started(batch_id: &str, study_id: &str, slots: usize) {
    info!(event = "batch.started", batch_id = %batch_id, study_id = %study_id, slots = slots);
}

pub fn emit_run_launched(design_point: &str, seq: u64, command_line: &str) {
    info!(
        event = "run.launched",
        design_point = %design_point,
        seq = seq,
        command = %command_line,
    );
}

/// Successful runs log at `info`, anything else at `warn`.
pub fn emit_run_finished(design_point: &str, seq: u64, kind: &str, duration_ms: u64, success: bool) {
    if success {
        info!(
            event = "run.finished",
            design_point = %design_point,
            seq = seq,
            kind = %kind,
            duration_ms = duration_ms,
        );
    } else {
        warn!(
            event = "run.finished",
            design_point = %design_point,
            seq = seq,
            kind = %kind,
            duration_ms = duration_ms,
        );
    }
}

pub fn emit_batch_finished(
    batch_id: &str,
    attempted: usize,
    failed: usize,
    cancelled: bool,
    success: bool,
) {
    info!(
        event = "batch.finished",
        batch_id = %batch_id,
        attempted = attempted,
        failed = failed,
        cancelled = cancelled,
        success = success,
    );
}
