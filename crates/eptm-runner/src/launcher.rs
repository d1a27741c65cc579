//! Engine process launching.
//!
//! A [`ProcessLauncher`] turns one [`Invocation`] into one [`RunResult`] in
//! two steps. [`ProcessLauncher::start`] spawns the engine and returns without
//! awaiting anything; [`EngineRun::wait`] supervises it to completion. Neither
//! step returns an error: spawn failures, non-zero exits, timeouts and
//! cancellation all become a [`RunOutcome`]. When `wait` returns, the child
//! has been reaped.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use eptm_core::{DesignPoint, ExecutionSettings, Invocation, StdioMode};

use crate::cancel::CancelToken;
use crate::result::{CapturedStdio, RunOutcome, RunResult};

/// How long to wait for stdout/stderr readers after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Seam between the coordinator and whatever actually runs the engine.
///
/// `start` is synchronous so the coordinator can spawn engines in enumeration
/// order from its own loop. The coordinator assigns `seq` on the returned
/// result; implementations may leave it at zero.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    fn start(&self, invocation: &Invocation) -> Box<dyn EngineRun>;

    /// `start` followed by `wait`.
    async fn launch(&self, invocation: &Invocation, cancel: CancelToken) -> RunResult {
        self.start(invocation).wait(cancel).await
    }
}

/// An engine run that has been started but not yet reaped.
#[async_trait]
pub trait EngineRun: Send {
    async fn wait(self: Box<Self>, cancel: CancelToken) -> RunResult;
}

/// Runs the engine as an OS child process.
#[derive(Debug, Clone)]
pub struct ChildProcessLauncher {
    timeout: Option<Duration>,
    stdio: StdioMode,
}

impl ChildProcessLauncher {
    pub fn new(timeout: Option<Duration>, stdio: StdioMode) -> Self {
        Self { timeout, stdio }
    }

    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self::new(settings.timeout, settings.stdio.clone())
    }

    fn attach_stdio(&self, command: &mut Command, point: &DesignPoint) -> std::io::Result<Sink> {
        match &self.stdio {
            StdioMode::Capture { tail_bytes } => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
                Ok(Sink::Capture {
                    tail_bytes: *tail_bytes,
                })
            }
            StdioMode::LogFiles { dir } => {
                std::fs::create_dir_all(dir)?;
                let (stdout, stderr) = log_file_paths(dir, point);
                command
                    .stdout(File::create(&stdout)?)
                    .stderr(File::create(&stderr)?);
                Ok(Sink::LogFiles { stdout, stderr })
            }
        }
    }
}

/// `<dir>/<dp>.stdout.log` and `<dir>/<dp>.stderr.log`.
pub fn log_file_paths(dir: &Path, point: &DesignPoint) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{point}.stdout.log")),
        dir.join(format!("{point}.stderr.log")),
    )
}

enum Sink {
    Capture { tail_bytes: usize },
    LogFiles { stdout: PathBuf, stderr: PathBuf },
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl ProcessLauncher for ChildProcessLauncher {
    fn start(&self, invocation: &Invocation) -> Box<dyn EngineRun> {
        let started_at = Utc::now();
        let start = Instant::now();
        let point = &invocation.design_point;

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let state = match self.attach_stdio(&mut command, point) {
            Err(e) => Spawned::Failed(format!("failed to open engine log files: {e}")),
            Ok(sink) => match command.spawn() {
                Err(e) => {
                    Spawned::Failed(format!("failed to spawn `{}`: {e}", invocation.program))
                }
                Ok(mut child) => {
                    debug!(design_point = %point, pid = ?child.id(), "engine process spawned");
                    let drains = match &sink {
                        Sink::Capture { tail_bytes } => {
                            Some(Drains::start(&mut child, *tail_bytes))
                        }
                        Sink::LogFiles { .. } => None,
                    };
                    Spawned::Running {
                        child,
                        sink,
                        drains,
                    }
                }
            },
        };

        Box::new(ChildRun {
            design_point: point.clone(),
            output_path: invocation.output_path.clone(),
            fingerprint: invocation.fingerprint(),
            timeout: self.timeout,
            started_at,
            start,
            state,
        })
    }
}

/// A spawned engine child, or the reason it could not be spawned.
pub struct ChildRun {
    design_point: DesignPoint,
    output_path: PathBuf,
    fingerprint: String,
    timeout: Option<Duration>,
    started_at: DateTime<Utc>,
    start: Instant,
    state: Spawned,
}

enum Spawned {
    Running {
        child: Child,
        sink: Sink,
        drains: Option<Drains>,
    },
    Failed(String),
}

#[async_trait]
impl EngineRun for ChildRun {
    async fn wait(self: Box<Self>, mut cancel: CancelToken) -> RunResult {
        let ChildRun {
            design_point: point,
            output_path,
            fingerprint,
            timeout,
            started_at,
            start,
            state,
        } = *self;

        let (mut child, sink, drains) = match state {
            Spawned::Running {
                child,
                sink,
                drains,
            } => (child, sink, drains),
            Spawned::Failed(reason) => {
                return RunResult {
                    outcome: RunOutcome::LaunchError { reason },
                    success: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                    output_path: Some(output_path),
                    fingerprint: Some(fingerprint),
                    started_at,
                    ..RunResult::not_launched(0, point, RunOutcome::Cancelled)
                };
            }
        };

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = deadline(timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        let (outcome, exit_code) = match waited {
            Waited::Exited(Ok(status)) if status.success() => (RunOutcome::Succeeded, status.code()),
            Waited::Exited(Ok(status)) => (
                RunOutcome::ProcessFailure {
                    exit_code: status.code().unwrap_or(-1),
                },
                status.code(),
            ),
            Waited::Exited(Err(e)) => {
                terminate(&mut child, &point).await;
                (
                    RunOutcome::LaunchError {
                        reason: format!("failed to wait for engine: {e}"),
                    },
                    None,
                )
            }
            Waited::TimedOut => {
                terminate(&mut child, &point).await;
                let limit_ms = timeout.map_or(0, |t| t.as_millis() as u64);
                (RunOutcome::Timeout { limit_ms }, None)
            }
            Waited::Cancelled => {
                terminate(&mut child, &point).await;
                (RunOutcome::Cancelled, None)
            }
        };

        let stdio = match (sink, drains) {
            (Sink::LogFiles { stdout, stderr }, _) => CapturedStdio::LogFiles { stdout, stderr },
            (Sink::Capture { .. }, Some(drains)) => drains.collect(&point).await,
            (Sink::Capture { .. }, None) => CapturedStdio::None,
        };

        RunResult {
            seq: 0,
            design_point: point,
            success: outcome.is_success(),
            outcome,
            exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
            output_path: Some(output_path),
            stdio,
            started_at,
            finished_at: Utc::now(),
            fingerprint: Some(fingerprint),
        }
    }
}

async fn deadline(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// SIGKILL and reap.
async fn terminate(child: &mut Child, point: &DesignPoint) {
    if let Err(e) = child.kill().await {
        warn!(design_point = %point, error = %e, "failed to kill engine process");
    }
}

struct Tail {
    text: String,
    truncated: bool,
}

struct Drains {
    stdout: Option<JoinHandle<std::io::Result<Tail>>>,
    stderr: Option<JoinHandle<std::io::Result<Tail>>>,
}

impl Drains {
    fn start(child: &mut Child, tail_bytes: usize) -> Self {
        Self {
            stdout: child
                .stdout
                .take()
                .map(|out| tokio::spawn(read_tail(out, tail_bytes))),
            stderr: child
                .stderr
                .take()
                .map(|err| tokio::spawn(read_tail(err, tail_bytes))),
        }
    }

    async fn collect(self, point: &DesignPoint) -> CapturedStdio {
        let stdout = join_tail(self.stdout, point, "stdout").await;
        let stderr = join_tail(self.stderr, point, "stderr").await;
        CapturedStdio::Inline {
            truncated: stdout.truncated || stderr.truncated,
            stdout: stdout.text,
            stderr: stderr.text,
        }
    }
}

async fn join_tail(
    handle: Option<JoinHandle<std::io::Result<Tail>>>,
    point: &DesignPoint,
    stream: &str,
) -> Tail {
    let empty = Tail {
        text: String::new(),
        truncated: false,
    };
    let Some(mut handle) = handle else {
        return empty;
    };
    match tokio::time::timeout(DRAIN_GRACE, &mut handle).await {
        Ok(Ok(Ok(tail))) => tail,
        Ok(Ok(Err(e))) => {
            warn!(design_point = %point, stream, error = %e, "failed to read engine output");
            empty
        }
        Ok(Err(e)) => {
            warn!(design_point = %point, stream, error = %e, "engine output reader panicked");
            empty
        }
        Err(_) => {
            // A grandchild may still hold the pipe open.
            handle.abort();
            warn!(design_point = %point, stream, "engine output still open after exit, dropped");
            empty
        }
    }
}

/// Read `reader` to EOF, keeping only the last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> std::io::Result<Tail> {
    let mut kept: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        kept.extend_from_slice(&chunk[..n]);
        if kept.len() > limit {
            let excess = kept.len() - limit;
            kept.drain(..excess);
            truncated = true;
        }
    }
    Ok(Tail {
        text: String::from_utf8_lossy(&kept).into_owned(),
        truncated,
    })
}
