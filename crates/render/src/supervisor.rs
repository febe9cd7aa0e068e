//! Stabilizer process supervision
//!
//! Spawns the stabilizer with captured, non-interactive output, streams
//! stdout into the progress parser and stderr into a buffer as lines arrive,
//! and waits for the process without blocking the runtime. Cancellation and
//! the optional per-job deadline both kill the child.

use crate::classify::ProcessReport;
use crate::encode::StabilizerInvocation;
use crate::progress::{parse_progress_line, LineSplitter, ProgressUpdate};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Environment forcing plain, non-terminal output from the tool
const NON_INTERACTIVE_ENV: &[(&str, &str)] = &[("TERM", "dumb"), ("NO_COLOR", "1"), ("CLICOLOR", "0")];

/// Callback receiving parsed progress updates.
pub type ProgressSink<'a> = &'a (dyn Fn(ProgressUpdate) + Send + Sync);

/// Error type for process supervision
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The executable vanished or was never there
    #[error("stabilizer executable not found: {}", .0.display())]
    ExecutableNotFound(PathBuf),

    /// The process could not be started
    #[error("failed to start stabilizer: {0}")]
    Spawn(io::Error),

    /// Waiting on the process failed
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The per-job deadline passed; the process was killed
    #[error("stabilizer did not finish within {0:?}")]
    TimedOut(Duration),

    /// The run was cancelled; the process was killed
    #[error("stabilizer run cancelled")]
    Cancelled,
}

/// Runs one stabilizer invocation to completion.
#[async_trait]
pub trait StabilizerRunner: Send + Sync {
    async fn run(
        &self,
        invocation: &StabilizerInvocation,
        deadline: Option<Duration>,
        on_progress: ProgressSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ProcessReport, SupervisorError>;
}

/// Supervises real stabilizer processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self
    }

    fn command(invocation: &StabilizerInvocation) -> Command {
        let mut cmd = Command::new(invocation.program());
        cmd.args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in NON_INTERACTIVE_ENV {
            cmd.env(key, value);
        }
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);
        cmd
    }
}

enum Stop {
    Exited(io::Result<ExitStatus>, String),
    TimedOut(Duration),
    Cancelled,
}

async fn deadline_elapsed(deadline: Option<Duration>) -> Duration {
    match deadline {
        Some(limit) => {
            tokio::time::sleep(limit).await;
            limit
        }
        None => std::future::pending().await,
    }
}

fn handle_stdout_line(line: &str, on_progress: ProgressSink<'_>) {
    match parse_progress_line(line) {
        Some(update) => on_progress(update),
        None => debug!(target: "stabilizer::stdout", "{}", line),
    }
}

/// Feed stdout to the progress parser chunk by chunk.
async fn pump_stdout<R: AsyncRead + Unpin>(mut stdout: R, on_progress: ProgressSink<'_>) {
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; 4096];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    handle_stdout_line(&line, on_progress);
                }
            }
            Err(e) => {
                warn!("reading stabilizer stdout failed: {}", e);
                break;
            }
        }
    }
    if let Some(line) = splitter.finish() {
        handle_stdout_line(&line, on_progress);
    }
}

/// Kill and reap the child. Returns false, logged, when that fails.
async fn kill_child(child: &mut Child) -> bool {
    match child.kill().await {
        Ok(()) => true,
        Err(e) => {
            warn!(pid = ?child.id(), "failed to kill stabilizer process: {}", e);
            false
        }
    }
}

/// Accumulate stderr, logging each line as it arrives.
async fn collect_stderr<R: AsyncRead + Unpin>(stderr: R) -> String {
    let mut reader = BufReader::new(stderr);
    let mut text = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let chunk = String::from_utf8_lossy(&line);
                debug!(target: "stabilizer::stderr", "{}", chunk.trim_end());
                text.push_str(&chunk);
            }
            Err(e) => {
                warn!("reading stabilizer stderr failed: {}", e);
                break;
            }
        }
    }
    text
}

#[async_trait]
impl StabilizerRunner for ProcessSupervisor {
    async fn run(
        &self,
        invocation: &StabilizerInvocation,
        deadline: Option<Duration>,
        on_progress: ProgressSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ProcessReport, SupervisorError> {
        debug!(
            program = %invocation.program().display(),
            "starting stabilizer: {}",
            invocation.command_line()
        );

        let mut child = Self::command(invocation).spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                SupervisorError::ExecutableNotFound(invocation.program().to_path_buf())
            } else {
                SupervisorError::Spawn(e)
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr not captured"))?;

        let stop = {
            let supervised = async {
                let ((), stderr_text) =
                    tokio::join!(pump_stdout(stdout, on_progress), collect_stderr(stderr));
                (child.wait().await, stderr_text)
            };
            tokio::pin!(supervised);

            tokio::select! {
                (status, stderr_text) = &mut supervised => Stop::Exited(status, stderr_text),
                limit = deadline_elapsed(deadline) => Stop::TimedOut(limit),
                _ = cancel.cancelled() => Stop::Cancelled,
            }
        };

        let (status, stderr_text) = match stop {
            Stop::Exited(status, stderr_text) => (status?, stderr_text),
            Stop::TimedOut(limit) => {
                warn!("stabilizer exceeded {:?}, killing process", limit);
                kill_child(&mut child).await;
                return Err(SupervisorError::TimedOut(limit));
            }
            Stop::Cancelled => {
                warn!("stabilizer run cancelled, killing process");
                kill_child(&mut child).await;
                return Err(SupervisorError::Cancelled);
            }
        };

        let output_file_bytes = tokio::fs::metadata(invocation.output_path())
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len());

        debug!(
            exit_code = ?status.code(),
            stderr_bytes = stderr_text.len(),
            output_exists = output_file_bytes.is_some(),
            "stabilizer exited"
        );

        Ok(ProcessReport {
            exit_code: status.code(),
            stderr_text,
            output_file_bytes,
        })
    }
}
