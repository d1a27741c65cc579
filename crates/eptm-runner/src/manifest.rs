//! Batch manifest and its append-only journal.
//!
//! The journal receives one JSON line per result as runs complete, so a
//! crashed or interrupted batch still leaves a record of what finished. The
//! manifest is the final, ordered summary written once the batch ends.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use eptm_core::{ConcurrencyPolicy, DesignPoint};

use crate::error::{ManifestError, ManifestResult};
use crate::result::{RunOutcome, RunResult};

/// Every result of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub batch_id: Uuid,
    pub study_id: String,
    pub policy: ConcurrencyPolicy,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// True when every attempted design point succeeded and the batch was
    /// not cancelled.
    pub success: bool,
    pub cancelled: bool,

    /// Ordered by `seq` once finalized.
    pub results: Vec<RunResult>,
}

impl BatchManifest {
    pub fn begin(batch_id: Uuid, study_id: impl Into<String>, policy: ConcurrencyPolicy) -> Self {
        Self {
            batch_id,
            study_id: study_id.into(),
            policy,
            started_at: Utc::now(),
            finished_at: None,
            success: false,
            cancelled: false,
            results: Vec::new(),
        }
    }

    pub fn record(&mut self, result: RunResult) {
        self.results.push(result);
    }

    /// Sort results into launch order and settle the batch verdict.
    ///
    /// `stopped_early` is set when the scheduling loop stopped pulling design
    /// points. The batch also counts as cancelled when any run was terminated
    /// by cancellation; a cancel that arrives after every run has finished
    /// changes nothing.
    pub fn finalize(&mut self, stopped_early: bool) {
        self.results.sort_by_key(|r| r.seq);
        self.cancelled = stopped_early
            || self
                .results
                .iter()
                .any(|r| r.outcome == RunOutcome::Cancelled);
        self.success = !self.cancelled && self.results.iter().all(RunResult::passed);
        self.finished_at = Some(Utc::now());
    }

    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.passed()).count()
    }

    pub fn get(&self, point: &DesignPoint) -> Option<&RunResult> {
        self.results.iter().find(|r| &r.design_point == point)
    }

    pub fn failures(&self) -> impl Iterator<Item = &RunResult> {
        self.results.iter().filter(|r| !r.passed())
    }

    pub fn write_json(&self, path: &Path) -> ManifestResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        let body = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, body).map_err(|source| io_error(path, source))
    }

    pub fn read_json(path: &Path) -> ManifestResult<Self> {
        let body = std::fs::read(path).map_err(|source| io_error(path, source))?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// JSON-lines file receiving results in completion order.
#[derive(Debug)]
pub struct ManifestJournal {
    path: PathBuf,
    file: File,
}

impl ManifestJournal {
    /// Create (or truncate) the journal at `path`.
    pub fn create(path: &Path) -> ManifestResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|source| io_error(path, source))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, result: &RunResult) -> ManifestResult<()> {
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|()| self.file.flush())
            .map_err(|source| io_error(&self.path, source))
    }

    /// Read every complete line back. A torn final line is ignored.
    pub fn read_all(path: &Path) -> ManifestResult<Vec<RunResult>> {
        let file = File::open(path).map_err(|source| io_error(path, source))?;
        let mut lines = BufReader::new(file).lines().peekable();
        let mut results = Vec::new();
        while let Some(line) = lines.next() {
            let line = line.map_err(|source| io_error(path, source))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(result) => results.push(result),
                Err(_) if lines.peek().is_none() => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(results)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ManifestError {
    ManifestError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::RunOutcome;

    fn result(seq: u64, point: &str, outcome: RunOutcome) -> RunResult {
        RunResult::not_launched(seq, DesignPoint::new(point).unwrap(), outcome)
    }

    #[test]
    fn test_finalize_orders_by_seq_and_sets_verdict() {
        let mut manifest = BatchManifest::begin(Uuid::new_v4(), "RUN_42", ConcurrencyPolicy::Serial);
        manifest.record(result(3, "3", RunOutcome::Succeeded));
        manifest.record(result(1, "1", RunOutcome::Succeeded));
        manifest.record(result(2, "2", RunOutcome::ProcessFailure { exit_code: 1 }));
        manifest.finalize(false);

        let seqs: Vec<u64> = manifest.results.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(!manifest.success);
        assert_eq!(manifest.passed_count(), 2);
        assert_eq!(manifest.failed_count(), 1);
        assert_eq!(manifest.failures().count(), 1);
        assert!(manifest.finished_at.is_some());
    }

    #[test]
    fn test_cancelled_batch_is_not_successful() {
        let mut manifest = BatchManifest::begin(Uuid::new_v4(), "RUN_42", ConcurrencyPolicy::Serial);
        manifest.record(result(1, "1", RunOutcome::Succeeded));
        manifest.finalize(true);
        assert!(manifest.cancelled);
        assert!(!manifest.success);
    }

    #[test]
    fn test_cancelled_run_marks_batch_cancelled() {
        let mut manifest = BatchManifest::begin(Uuid::new_v4(), "RUN_42", ConcurrencyPolicy::Serial);
        manifest.record(result(1, "1", RunOutcome::Succeeded));
        manifest.record(result(2, "2", RunOutcome::Cancelled));
        manifest.finalize(false);
        assert!(manifest.cancelled);
        assert!(!manifest.success);
    }

    #[test]
    fn test_empty_batch_succeeds() {
        let mut manifest = BatchManifest::begin(Uuid::new_v4(), "EMPTY", ConcurrencyPolicy::Serial);
        manifest.finalize(false);
        assert!(manifest.success);
        assert_eq!(manifest.attempted(), 0);
    }

    #[test]
    fn test_get_by_design_point() {
        let mut manifest = BatchManifest::begin(Uuid::new_v4(), "RUN_42", ConcurrencyPolicy::Serial);
        manifest.record(result(1, "5", RunOutcome::Succeeded));
        assert!(manifest.get(&DesignPoint::new("5").unwrap()).is_some());
        assert!(manifest.get(&DesignPoint::new("6").unwrap()).is_none());
    }

    #[test]
    fn test_manifest_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("RUN_42.manifest.json");
        let mut manifest = BatchManifest::begin(
            Uuid::new_v4(),
            "RUN_42",
            ConcurrencyPolicy::BoundedParallel { max_in_flight: 4 },
        );
        manifest.record(result(1, "1", RunOutcome::Succeeded));
        manifest.finalize(false);

        manifest.write_json(&path).unwrap();
        let read = BatchManifest::read_json(&path).unwrap();
        assert_eq!(read.batch_id, manifest.batch_id);
        assert_eq!(read.policy, manifest.policy);
        assert_eq!(read.results, manifest.results);
    }

    #[test]
    fn test_journal_appends_lines_and_tolerates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RUN_42.manifest.jsonl");
        let mut journal = ManifestJournal::create(&path).unwrap();
        journal.append(&result(2, "2", RunOutcome::Succeeded)).unwrap();
        journal.append(&result(1, "1", RunOutcome::Cancelled)).unwrap();

        let mut raw = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(b"{\"seq\": 3, \"design_po").unwrap();

        let read = ManifestJournal::read_all(&path).unwrap();
        let seqs: Vec<u64> = read.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2, 1]);
        assert_eq!(journal.path(), path.as_path());
    }

    #[test]
    fn test_journal_create_truncates_previous_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(&path, "stale\n").unwrap();
        let _journal = ManifestJournal::create(&path).unwrap();
        assert!(ManifestJournal::read_all(&path).unwrap().is_empty());
    }
}
