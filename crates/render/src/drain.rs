//! Queue drain loop
//!
//! Takes a snapshot of the queue and renders each job in turn:
//! `Queued -> Rendering -> Rendered | Failed`. Finished jobs leave the
//! queue either way. A failing job never stops the loop; its error is
//! written to the job's status message and to the drain summary.

use crate::classify::{classify, ErrorKind, ProcessReport, RenderOutcome};
use crate::config::Config;
use crate::encode::{build_invocation, BuildError, RenderSettings};
use crate::job::{JobState, RenderJob};
use crate::locator::locate_stabilizer;
use crate::probe::MediaProbe;
use crate::progress::ProgressUpdate;
use crate::queue::RenderQueue;
use crate::status::SharedStatus;
use crate::supervisor::{StabilizerRunner, SupervisorError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resolves the stabilizer executable from an optional override path.
pub type Locator = fn(Option<&Path>) -> Option<PathBuf>;

/// Exclusive right to drain, held for the whole drain.
#[derive(Debug)]
pub struct DrainGuard(OwnedMutexGuard<()>);

/// Errors that stop a drain before any job runs
#[derive(Debug, Error)]
pub enum DrainError {
    /// No job in the batch can succeed without the executable
    #[error("stabilizer executable not found")]
    ExecutableNotFound,

    /// Another drain holds the queue
    #[error("a drain is already running")]
    AlreadyDraining,

    /// The output directory could not be created
    #[error("failed to create output directory {}: {source}", path.display())]
    OutputDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Per-job failure, folded into the job's status message
#[derive(Debug, Error)]
pub enum JobError {
    /// The source was removed after the job was queued
    #[error("source video no longer exists: {}", .0.display())]
    SourceVanished(PathBuf),

    /// The job could not be turned into an invocation
    #[error("cannot build stabilizer arguments: {0}")]
    Build(#[from] BuildError),

    /// The process could not be run to completion
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::SourceVanished(_) | JobError::Build(_) => ErrorKind::InvalidJob,
            JobError::Supervisor(SupervisorError::ExecutableNotFound(_)) => {
                ErrorKind::ExecutableNotFound
            }
            JobError::Supervisor(SupervisorError::TimedOut(_)) => ErrorKind::TimedOut,
            JobError::Supervisor(SupervisorError::Cancelled) => ErrorKind::Cancelled,
            JobError::Supervisor(_) => ErrorKind::ProcessFailure,
        }
    }
}

/// Answer to "some outputs already exist, overwrite them?"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwriteDecision {
    /// Pass the force-overwrite flag for every job in this drain
    Yes,
    /// Run without the flag; the tool's own overwrite behavior applies
    No,
    /// Abort the drain before any job starts
    Cancel,
}

/// Settings snapshot for one drain.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainOptions {
    pub settings: RenderSettings,
    pub executable_override: Option<PathBuf>,
}

impl DrainOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            settings: RenderSettings::from_config(cfg),
            executable_override: cfg.stabilizer.executable.clone(),
        }
    }
}

/// Final state of one processed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    /// The job as it left the queue
    pub job: RenderJob,
    pub outcome: RenderOutcome,
}

/// What one drain did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrainSummary {
    pub rendered: usize,
    pub failed: usize,
    /// Aborted by the overwrite prompt; nothing ran
    pub aborted: bool,
    /// Stopped early by cancellation; unprocessed jobs stay queued
    pub cancelled: bool,
    pub reports: Vec<JobReport>,
}

/// Human-readable status for a finished job.
pub fn describe_outcome(outcome: &RenderOutcome) -> String {
    let stderr = outcome.stderr_text.trim();
    let mut message = match (outcome.succeeded, outcome.error_kind) {
        (true, Some(ErrorKind::SpuriousStderrSuccess)) => {
            format!("Rendered with warnings: {}", stderr)
        }
        (true, _) => "Rendered".to_string(),
        (false, _) => {
            let code = outcome
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string());
            if stderr.is_empty() {
                format!("Failed (exit code {})", code)
            } else {
                format!("Failed (exit code {}): {}", code, stderr)
            }
        }
    };
    if let Some(hint) = &outcome.hint {
        message.push_str("\nHint: ");
        message.push_str(hint);
    }
    message
}

/// Drains a [`RenderQueue`] one job at a time.
pub struct QueueDrainer {
    queue: RenderQueue,
    runner: Arc<dyn StabilizerRunner>,
    probe: Arc<dyn MediaProbe>,
    status: SharedStatus,
    locate: Locator,
    drain_lock: Arc<Mutex<()>>,
}

impl QueueDrainer {
    pub fn new(
        queue: RenderQueue,
        runner: Arc<dyn StabilizerRunner>,
        probe: Arc<dyn MediaProbe>,
        status: SharedStatus,
    ) -> Self {
        Self {
            queue,
            runner,
            probe,
            status,
            locate: locate_stabilizer,
            drain_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Replace the executable lookup.
    pub fn with_locator(mut self, locate: Locator) -> Self {
        self.locate = locate;
        self
    }

    pub fn queue(&self) -> &RenderQueue {
        &self.queue
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Whether a drain currently holds the queue.
    pub fn is_draining(&self) -> bool {
        self.drain_lock.try_lock().is_err()
    }

    /// Claim the drain slot, or `None` when a drain already holds it.
    ///
    /// The guard can be moved into a spawned task and handed to
    /// [`QueueDrainer::drain_with`].
    pub fn try_begin(&self) -> Option<DrainGuard> {
        self.drain_lock.clone().try_lock_owned().ok().map(DrainGuard)
    }

    /// Render every job queued at the time of the call.
    ///
    /// `decide` is asked once, only when some target outputs already exist.
    /// Jobs enqueued while the drain runs wait for the next drain.
    ///
    /// # Errors
    /// Only conditions that make the whole batch impossible are returned;
    /// per-job failures are recorded in the summary.
    pub async fn drain<F>(
        &self,
        options: DrainOptions,
        decide: F,
        cancel: &CancellationToken,
    ) -> Result<DrainSummary, DrainError>
    where
        F: FnOnce(&[PathBuf]) -> OverwriteDecision,
    {
        let guard = self.try_begin().ok_or(DrainError::AlreadyDraining)?;
        self.drain_with(guard, options, decide, cancel).await
    }

    /// [`QueueDrainer::drain`] with the slot already claimed by
    /// [`QueueDrainer::try_begin`]. The slot is released on return.
    pub async fn drain_with<F>(
        &self,
        guard: DrainGuard,
        options: DrainOptions,
        decide: F,
        cancel: &CancellationToken,
    ) -> Result<DrainSummary, DrainError>
    where
        F: FnOnce(&[PathBuf]) -> OverwriteDecision,
    {
        let _guard = guard;

        let executable = (self.locate)(options.executable_override.as_deref())
            .ok_or_else(|| {
                error!("stabilizer executable not found; nothing can be rendered");
                DrainError::ExecutableNotFound
            })?;

        let mut settings = options.settings;
        tokio::fs::create_dir_all(&settings.output_directory)
            .await
            .map_err(|source| DrainError::OutputDirectory {
                path: settings.output_directory.clone(),
                source,
            })?;

        let snapshot: Vec<RenderJob> = self
            .queue
            .list()
            .into_iter()
            .filter(|job| job.state == JobState::Queued)
            .collect();

        let conflicts: Vec<PathBuf> = snapshot
            .iter()
            .filter(|job| !job.output_name.trim().is_empty())
            .map(|job| job.output_path(&settings.output_directory))
            .filter(|path| path.is_file())
            .collect();
        // Targets that predate this drain; a failed run must not be credited with them.
        let previous_outputs: HashMap<PathBuf, SystemTime> = conflicts
            .iter()
            .filter_map(|path| {
                let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
                Some((path.clone(), modified))
            })
            .collect();
        if !conflicts.is_empty() {
            match decide(&conflicts) {
                OverwriteDecision::Yes => settings.overwrite = true,
                OverwriteDecision::No => settings.overwrite = false,
                OverwriteDecision::Cancel => {
                    info!(conflicts = conflicts.len(), "drain aborted at overwrite prompt");
                    return Ok(DrainSummary {
                        aborted: true,
                        ..DrainSummary::default()
                    });
                }
            }
        }

        info!(
            jobs = snapshot.len(),
            executable = %executable.display(),
            overwrite = settings.overwrite,
            "drain started"
        );
        {
            let mut status = self.status.write().await;
            status.draining = true;
        }

        let mut summary = DrainSummary::default();
        for job in snapshot {
            if cancel.is_cancelled() {
                info!("drain cancelled; remaining jobs stay queued");
                summary.cancelled = true;
                break;
            }
            // removed by the user since the snapshot
            if self.queue.get(job.id).is_none() {
                continue;
            }

            let report = self
                .process_job(&executable, job, &settings, &previous_outputs, cancel)
                .await;
            if report.outcome.succeeded {
                summary.rendered += 1;
            } else {
                summary.failed += 1;
            }
            summary.reports.push(report);
        }

        info!(
            rendered = summary.rendered,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "drain finished"
        );
        {
            let mut status = self.status.write().await;
            status.draining = false;
            status.current_job = None;
            status.current_progress = None;
            status.progress_fraction = 0.0;
            status.last_summary = Some(summary.clone());
        }

        Ok(summary)
    }

    /// Run one job to a terminal state and remove it from the queue.
    async fn process_job(
        &self,
        executable: &Path,
        job: RenderJob,
        settings: &RenderSettings,
        previous_outputs: &HashMap<PathBuf, SystemTime>,
        cancel: &CancellationToken,
    ) -> JobReport {
        self.queue.set_state(job.id, JobState::Rendering, "Rendering");
        {
            let mut status = self.status.write().await;
            status.current_job = Some(job.id);
            status.current_progress = None;
            status.progress_fraction = 0.0;
        }
        info!(job_id = %job.id, output = %job.output_name, "rendering");

        let previous = previous_outputs
            .get(&job.output_path(&settings.output_directory))
            .copied();
        let rendered = self.render(executable, &job, settings, previous, cancel).await;
        let (outcome, message) = match rendered {
            Ok(outcome) => {
                let message = describe_outcome(&outcome);
                (outcome, message)
            }
            Err(e) => {
                let mut outcome = RenderOutcome::not_run(e.kind());
                if matches!(
                    e,
                    JobError::Supervisor(SupervisorError::TimedOut(_) | SupervisorError::Cancelled)
                ) {
                    outcome.output_file_exists =
                        job.output_path(&settings.output_directory).is_file();
                }
                (outcome, format!("Failed: {}", e))
            }
        };

        let state = if outcome.succeeded {
            JobState::Rendered
        } else {
            JobState::Failed
        };
        match (state, outcome.error_kind) {
            (JobState::Rendered, Some(ErrorKind::SpuriousStderrSuccess)) => warn!(
                job_id = %job.id,
                exit_code = ?outcome.exit_code,
                stderr = %outcome.stderr_text.trim(),
                "rendered despite reported error"
            ),
            (JobState::Rendered, _) => info!(job_id = %job.id, "rendered"),
            _ => warn!(
                job_id = %job.id,
                kind = ?outcome.error_kind,
                "render failed: {}",
                message
            ),
        }

        self.queue.set_state(job.id, state, message.clone());
        let finished = self.queue.dequeue(job.id).unwrap_or_else(|| RenderJob {
            state,
            status_message: message,
            ..job
        });

        {
            let mut status = self.status.write().await;
            if outcome.succeeded {
                status.rendered_total += 1;
            } else {
                status.failed_total += 1;
            }
        }

        JobReport {
            job: finished,
            outcome,
        }
    }

    async fn render(
        &self,
        executable: &Path,
        job: &RenderJob,
        settings: &RenderSettings,
        previous_output: Option<SystemTime>,
        cancel: &CancellationToken,
    ) -> Result<RenderOutcome, JobError> {
        if !job.source_video_path.is_file() {
            return Err(JobError::SourceVanished(job.source_video_path.clone()));
        }
        if job.output_name.trim().is_empty() {
            return Err(BuildError::MissingOutputName.into());
        }

        let dimensions = self.probe.dimensions(&job.source_video_path).await;
        let invocation = build_invocation(executable, job, settings, dimensions)?;

        let queue = &self.queue;
        let status = &self.status;
        let id = job.id;
        let on_progress = move |update: ProgressUpdate| {
            let text = update.to_string();
            // Progress is best effort; a busy reader only delays the next update.
            if let Ok(mut snapshot) = status.try_write() {
                snapshot.current_progress = Some(text.clone());
                snapshot.progress_fraction = update.fraction();
            }
            queue.set_status_message(id, text);
        };

        let mut report = self
            .runner
            .run(&invocation, settings.job_timeout, &on_progress, cancel)
            .await?;
        discount_untouched_output(&mut report, invocation.output_path(), previous_output);
        Ok(classify(&report, settings.min_output_bytes))
    }
}

/// Drop the output of a run that reported an error but left a pre-existing
/// target untouched, so the old file is not taken for this run's result.
fn discount_untouched_output(
    report: &mut ProcessReport,
    output_path: &Path,
    previous_output: Option<SystemTime>,
) {
    let clean = report.exit_code == Some(0) && report.stderr_text.trim().is_empty();
    let Some(previous) = previous_output else {
        return;
    };
    if clean || report.output_file_bytes.is_none() {
        return;
    }
    let modified = std::fs::metadata(output_path).and_then(|m| m.modified()).ok();
    if modified == Some(previous) {
        debug!(output = %output_path.display(), "output predates this run; ignoring it");
        report.output_file_bytes = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ProcessReport;
    use crate::encode::{Dimensions, StabilizerInvocation};
    use crate::job::{RenderRequest, Rotation};
    use crate::queue::Enqueued;
    use crate::status::new_shared_status;
    use crate::supervisor::ProgressSink;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Scripted result for one output name.
    #[derive(Clone)]
    struct Script {
        exit_code: i32,
        stderr: &'static str,
        writes_output: bool,
    }

    #[derive(Default)]
    struct FakeRunner {
        scripts: HashMap<String, Script>,
        command_lines: StdMutex<Vec<String>>,
        /// Enqueued into this queue while the first job runs
        late_request: StdMutex<Option<(RenderQueue, RenderRequest)>>,
        /// Cancelled while the first job runs
        cancel_on_first: Option<CancellationToken>,
    }

    impl FakeRunner {
        fn with(scripts: &[(&str, Script)]) -> Self {
            Self {
                scripts: scripts
                    .iter()
                    .map(|(name, script)| (name.to_string(), script.clone()))
                    .collect(),
                ..Self::default()
            }
        }

        fn runs(&self) -> Vec<String> {
            self.command_lines.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StabilizerRunner for FakeRunner {
        async fn run(
            &self,
            invocation: &StabilizerInvocation,
            _deadline: Option<Duration>,
            on_progress: ProgressSink<'_>,
            _cancel: &CancellationToken,
        ) -> Result<ProcessReport, SupervisorError> {
            let first = {
                let mut lines = self.command_lines.lock().unwrap();
                lines.push(invocation.command_line());
                lines.len() == 1
            };
            if first {
                if let Some((queue, request)) = self.late_request.lock().unwrap().take() {
                    queue.enqueue(request).unwrap();
                }
                if let Some(token) = &self.cancel_on_first {
                    token.cancel();
                }
            }

            on_progress(ProgressUpdate {
                elapsed_secs: 83,
                completed: 45,
                total: 100,
                eta: "12.3".to_string(),
            });

            let name = invocation
                .output_path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned();
            let script = self.scripts.get(&name).cloned().unwrap_or(Script {
                exit_code: 0,
                stderr: "",
                writes_output: true,
            });
            if script.writes_output {
                std::fs::write(invocation.output_path(), b"stabilized").unwrap();
            }
            let output_file_bytes = std::fs::metadata(invocation.output_path())
                .ok()
                .map(|m| m.len());

            Ok(ProcessReport {
                exit_code: Some(script.exit_code),
                stderr_text: script.stderr.to_string(),
                output_file_bytes,
            })
        }
    }

    struct FixedProbe;

    #[async_trait]
    impl MediaProbe for FixedProbe {
        async fn dimensions(&self, _source: &Path) -> Option<Dimensions> {
            Some(Dimensions::new(1920, 1080))
        }
    }

    struct Fixture {
        dir: TempDir,
        queue: RenderQueue,
        executable: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let executable = dir.path().join("stabilizer");
            std::fs::write(&executable, b"").unwrap();
            Self {
                dir,
                queue: RenderQueue::new(),
                executable,
            }
        }

        fn output_dir(&self) -> PathBuf {
            self.dir.path().join("out")
        }

        fn request(&self, source: &str, start_ms: u64, output_name: &str) -> RenderRequest {
            let path = self.dir.path().join(source);
            if !path.exists() {
                std::fs::write(&path, b"video").unwrap();
            }
            RenderRequest::new(
                path,
                Duration::from_millis(start_ms),
                Duration::from_millis(start_ms + 4000),
                output_name,
                Rotation::Deg90,
            )
        }

        fn enqueue(&self, source: &str, start_ms: u64, output_name: &str) -> RenderJob {
            match self.queue.enqueue(self.request(source, start_ms, output_name)).unwrap() {
                Enqueued::Added(job) => job,
                Enqueued::Duplicate(_) => panic!("unexpected duplicate"),
            }
        }

        fn options(&self) -> DrainOptions {
            let mut cfg = Config::default();
            cfg.output.directory = self.output_dir();
            cfg.stabilizer.executable = Some(self.executable.clone());
            cfg.stabilizer.parallelism = 1;
            DrainOptions::from_config(&cfg)
        }

        fn drainer(&self, runner: Arc<FakeRunner>) -> QueueDrainer {
            QueueDrainer::new(
                self.queue.clone(),
                runner,
                Arc::new(FixedProbe),
                new_shared_status(),
            )
        }
    }

    fn never_asked(_: &[PathBuf]) -> OverwriteDecision {
        panic!("overwrite prompt should not be shown");
    }

    #[tokio::test]
    async fn test_mixed_outcomes_drain_completes() {
        let fx = Fixture::new();
        let ok = fx.enqueue("a.mp4", 0, "ok.mp4");
        let hard = fx.enqueue("b.mp4", 0, "hard.mp4");
        let spurious = fx.enqueue("c.mp4", 0, "spurious.mp4");

        let runner = Arc::new(FakeRunner::with(&[
            (
                "hard.mp4",
                Script {
                    exit_code: 1,
                    stderr: "Error: failed to open decoder",
                    writes_output: false,
                },
            ),
            (
                "spurious.mp4",
                Script {
                    exit_code: 1,
                    stderr: "QPainter warning",
                    writes_output: true,
                },
            ),
        ]));
        let drainer = fx.drainer(runner.clone());

        let summary = drainer
            .drain(fx.options(), never_asked, &CancellationToken::new())
            .await
            .unwrap();

        assert!(fx.queue.is_empty());
        assert_eq!(summary.rendered, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(runner.runs().len(), 3);

        let by_id = |id| summary.reports.iter().find(|r| r.job.id == id).unwrap();
        assert_eq!(by_id(ok.id).job.state, JobState::Rendered);
        assert_eq!(by_id(ok.id).job.status_message, "Rendered");

        let failed = by_id(hard.id);
        assert_eq!(failed.job.state, JobState::Failed);
        assert_eq!(failed.outcome.error_kind, Some(ErrorKind::ProcessFailure));
        assert!(failed.job.status_message.contains("Error: failed to open decoder"));
        assert_eq!(failed.outcome.stderr_text, "Error: failed to open decoder");

        let warned = by_id(spurious.id);
        assert_eq!(warned.job.state, JobState::Rendered);
        assert_eq!(
            warned.outcome.error_kind,
            Some(ErrorKind::SpuriousStderrSuccess)
        );
        assert!(warned.job.status_message.contains("QPainter warning"));

        let status = drainer.status();
        let snapshot = status.read().await;
        assert!(!snapshot.draining);
        assert_eq!(snapshot.rendered_total, 2);
        assert_eq!(snapshot.failed_total, 1);
        assert_eq!(snapshot.last_summary.as_ref(), Some(&summary));
    }

    #[tokio::test]
    async fn test_known_issue_hint_in_status() {
        let fx = Fixture::new();
        fx.enqueue("a.mp4", 0, "bands.mp4");
        let runner = Arc::new(FakeRunner::with(&[(
            "bands.mp4",
            Script {
                exit_code: 1,
                stderr: "Number of bands (20) exceeds limit (14)",
                writes_output: false,
            },
        )]));

        let summary = fx
            .drainer(runner)
            .drain(fx.options(), never_asked, &CancellationToken::new())
            .await
            .unwrap();

        let report = &summary.reports[0];
        assert_eq!(
            report.outcome.error_kind,
            Some(ErrorKind::KnownIssueProcessFailure)
        );
        assert!(report.job.status_message.contains("Hint: "));
    }

    #[tokio::test]
    async fn test_executable_not_found_stops_before_any_job() {
        let fx = Fixture::new();
        fx.enqueue("a.mp4", 0, "a_out.mp4");
        let runner = Arc::new(FakeRunner::default());

        let result = fx
            .drainer(runner.clone())
            .with_locator(|_| None)
            .drain(fx.options(), never_asked, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DrainError::ExecutableNotFound)));
        assert!(runner.runs().is_empty());
        assert_eq!(fx.queue.list()[0].state, JobState::Queued);
        assert!(!fx.output_dir().exists());
    }

    #[tokio::test]
    async fn test_failed_run_not_credited_with_existing_output() {
        let fx = Fixture::new();
        let job = fx.enqueue("a.mp4", 0, "exists.mp4");
        std::fs::create_dir_all(fx.output_dir()).unwrap();
        std::fs::write(fx.output_dir().join("exists.mp4"), b"from an earlier render").unwrap();

        let runner = Arc::new(FakeRunner::with(&[(
            "exists.mp4",
            Script {
                exit_code: 1,
                stderr: "Error: output exists",
                writes_output: false,
            },
        )]));
        let summary = fx
            .drainer(runner)
            .drain(
                fx.options(),
                |_| OverwriteDecision::No,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        let report = &summary.reports[0];
        assert_eq!(report.job.id, job.id);
        assert_eq!(report.job.state, JobState::Failed);
        assert_eq!(report.outcome.error_kind, Some(ErrorKind::ProcessFailure));
        assert!(!report.outcome.output_file_exists);
    }

    #[test]
    fn test_clean_run_keeps_untouched_output() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.mp4");
        std::fs::write(&output, b"old").unwrap();
        let previous = std::fs::metadata(&output).unwrap().modified().unwrap();

        let mut clean = ProcessReport {
            exit_code: Some(0),
            stderr_text: String::new(),
            output_file_bytes: Some(3),
        };
        discount_untouched_output(&mut clean, &output, Some(previous));
        assert_eq!(clean.output_file_bytes, Some(3));

        let mut failed = ProcessReport {
            exit_code: Some(1),
            stderr_text: "boom".to_string(),
            output_file_bytes: Some(3),
        };
        discount_untouched_output(&mut failed, &output, None);
        assert_eq!(failed.output_file_bytes, Some(3));
        discount_untouched_output(&mut failed, &output, Some(previous));
        assert_eq!(failed.output_file_bytes, None);
    }

    #[tokio::test]
    async fn test_invalid_job_does_not_abort_drain() {
        let fx = Fixture::new();
        let nameless = fx.enqueue("a.mp4", 0, "");
        let vanished = fx.enqueue("gone.mp4", 0, "gone_out.mp4");
        let good = fx.enqueue("c.mp4", 0, "c_out.mp4");
        std::fs::remove_file(&vanished.source_video_path).unwrap();

        let runner = Arc::new(FakeRunner::default());
        let summary = fx
            .drainer(runner.clone())
            .drain(fx.options(), never_asked, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.rendered, 1);
        assert_eq!(runner.runs().len(), 1);

        for id in [nameless.id, vanished.id] {
            let report = summary.reports.iter().find(|r| r.job.id == id).unwrap();
            assert_eq!(report.job.state, JobState::Failed);
            assert_eq!(report.outcome.error_kind, Some(ErrorKind::InvalidJob));
            assert!(report.job.status_message.starts_with("Failed: "));
        }
        let rendered = summary.reports.iter().find(|r| r.job.id == good.id).unwrap();
        assert_eq!(rendered.job.state, JobState::Rendered);
    }

    #[tokio::test]
    async fn test_overwrite_yes_sets_flag() {
        let fx = Fixture::new();
        fx.enqueue("a.mp4", 0, "exists.mp4");
        fx.enqueue("b.mp4", 0, "fresh.mp4");
        std::fs::create_dir_all(fx.output_dir()).unwrap();
        std::fs::write(fx.output_dir().join("exists.mp4"), b"old").unwrap();

        let runner = Arc::new(FakeRunner::default());
        let asked = StdMutex::new(Vec::new());
        let summary = fx
            .drainer(runner.clone())
            .drain(
                fx.options(),
                |conflicts| {
                    asked.lock().unwrap().extend_from_slice(conflicts);
                    OverwriteDecision::Yes
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            *asked.lock().unwrap(),
            vec![fx.output_dir().join("exists.mp4")]
        );
        assert_eq!(summary.rendered, 2);
        assert!(runner.runs().iter().all(|line| line.contains("--overwrite")));
    }

    #[tokio::test]
    async fn test_overwrite_no_keeps_batch_without_flag() {
        let fx = Fixture::new();
        fx.enqueue("a.mp4", 0, "exists.mp4");
        std::fs::create_dir_all(fx.output_dir()).unwrap();
        std::fs::write(fx.output_dir().join("exists.mp4"), b"old").unwrap();

        let runner = Arc::new(FakeRunner::default());
        fx.drainer(runner.clone())
            .drain(
                fx.options(),
                |_| OverwriteDecision::No,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let runs = runner.runs();
        assert_eq!(runs.len(), 1);
        assert!(!runs[0].contains("--overwrite"));
    }

    #[tokio::test]
    async fn test_overwrite_cancel_aborts_before_any_job() {
        let fx = Fixture::new();
        fx.enqueue("a.mp4", 0, "exists.mp4");
        fx.enqueue("b.mp4", 0, "fresh.mp4");
        std::fs::create_dir_all(fx.output_dir()).unwrap();
        std::fs::write(fx.output_dir().join("exists.mp4"), b"old").unwrap();

        let runner = Arc::new(FakeRunner::default());
        let summary = fx
            .drainer(runner.clone())
            .drain(
                fx.options(),
                |_| OverwriteDecision::Cancel,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(summary.aborted);
        assert!(runner.runs().is_empty());
        assert_eq!(fx.queue.len(), 2);
    }

    #[tokio::test]
    async fn test_jobs_added_mid_drain_wait_for_next_drain() {
        let fx = Fixture::new();
        fx.enqueue("a.mp4", 0, "a_out.mp4");
        let runner = Arc::new(FakeRunner::default());
        *runner.late_request.lock().unwrap() =
            Some((fx.queue.clone(), fx.request("late.mp4", 0, "late_out.mp4")));

        let summary = fx
            .drainer(runner.clone())
            .drain(fx.options(), never_asked, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.reports.len(), 1);
        let remaining = fx.queue.list();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].output_name, "late_out.mp4");
        assert_eq!(remaining[0].state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_cancel_between_jobs_leaves_rest_queued() {
        let fx = Fixture::new();
        fx.enqueue("a.mp4", 0, "a_out.mp4");
        let second = fx.enqueue("b.mp4", 0, "b_out.mp4");
        let cancel = CancellationToken::new();
        let runner = Arc::new(FakeRunner {
            cancel_on_first: Some(cancel.clone()),
            ..FakeRunner::default()
        });

        let summary = fx
            .drainer(runner.clone())
            .drain(fx.options(), never_asked, &cancel)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.rendered, 1);
        assert_eq!(runner.runs().len(), 1);
        let remaining = fx.queue.list();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second.id);
        assert_eq!(remaining[0].state, JobState::Queued);
    }

    #[tokio::test]
    async fn test_second_concurrent_drain_rejected() {
        let fx = Fixture::new();
        let drainer = fx.drainer(Arc::new(FakeRunner::default()));
        let held = drainer.try_begin().unwrap();
        assert!(drainer.is_draining());
        assert!(drainer.try_begin().is_none());

        let result = drainer
            .drain(fx.options(), never_asked, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DrainError::AlreadyDraining)));

        drop(held);
        let guard = drainer.try_begin().unwrap();
        let summary = drainer
            .drain_with(guard, fx.options(), never_asked, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, DrainSummary::default());
        assert!(!drainer.is_draining());
    }

    #[tokio::test]
    async fn test_invocation_uses_probe_and_rotation() {
        let fx = Fixture::new();
        fx.enqueue("a.mp4", 1000, "a_out.mp4");
        let runner = Arc::new(FakeRunner::default());

        fx.drainer(runner.clone())
            .drain(fx.options(), never_asked, &CancellationToken::new())
            .await
            .unwrap();

        let line = &runner.runs()[0];
        assert!(line.contains("'trim_ranges_ms': [[1000, 5000]]"));
        assert!(line.contains("'rotation': 270"));
        assert!(line.contains("'output_width': 1080, 'output_height': 1920"));
    }

    #[test]
    fn test_describe_outcome() {
        let mut outcome = RenderOutcome::not_run(ErrorKind::ProcessFailure);
        outcome.exit_code = Some(2);
        assert_eq!(describe_outcome(&outcome), "Failed (exit code 2)");

        outcome.stderr_text = "boom\n".to_string();
        outcome.hint = Some("try again".to_string());
        assert_eq!(
            describe_outcome(&outcome),
            "Failed (exit code 2): boom\nHint: try again"
        );
    }
}
