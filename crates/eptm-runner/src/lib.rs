//! ePTM batch runner
//!
//! Launches engine processes for a resolved [`eptm_core::RunConfig`] and
//! collects one [`RunResult`] per design point into a [`BatchManifest`]:
//! - [`launcher`]: one invocation → one reaped child process
//! - [`coordinator`]: bounded-parallel scheduling over the design points
//! - [`manifest`]: final manifest and the per-result JSON-lines journal

pub mod cancel;
pub mod coordinator;
pub mod error;
pub mod fakes;
pub mod launcher;
pub mod manifest;
pub mod result;

pub use cancel::{CancelHandle, CancelToken};
pub use coordinator::BatchCoordinator;
pub use error::{BatchError, BatchResult, ManifestError, ManifestResult};
pub use launcher::{ChildProcessLauncher, EngineRun, ProcessLauncher};
pub use manifest::{BatchManifest, ManifestJournal};
pub use result::{CapturedStdio, RunOutcome, RunResult};
