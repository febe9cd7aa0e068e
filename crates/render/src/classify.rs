//! Failure classification for finished stabilizer runs.
//!
//! Maps exit code, captured stderr and the presence of the expected output
//! file to a [`RenderOutcome`]. Rules, in order:
//!
//! 1. exit 0 and empty stderr -> success
//! 2. error signalled but the output file exists (and reaches the minimum
//!    size) -> success with warning; stderr is kept
//! 3. otherwise -> failure, with a remediation hint for the known audio
//!    band-count issue

use serde::{Deserialize, Serialize};

/// Hint attached when the audio encoder rejects the source's band count.
pub const AUDIO_BANDS_HINT: &str = "The audio encoder rejected this clip (band count exceeds limit). \
Enable the alternate audio codec (audio.alternate_codec = true) or disable audio (audio.enabled = false) and render again.";

/// Classification of a failed or suspicious job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The stabilizer executable could not be located.
    ExecutableNotFound,
    /// The job cannot be rendered as described (no output name, source gone).
    InvalidJob,
    /// Tool signalled an error and produced no output.
    ProcessFailure,
    /// Like `ProcessFailure`, but stderr matches a known issue with a fix.
    KnownIssueProcessFailure,
    /// Tool signalled an error but the output exists; not surfaced as an error.
    SpuriousStderrSuccess,
    /// The per-job deadline passed and the process was killed.
    TimedOut,
    /// The drain was cancelled while the process was running.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ExecutableNotFound => "executable_not_found",
            ErrorKind::InvalidJob => "invalid_job",
            ErrorKind::ProcessFailure => "process_failure",
            ErrorKind::KnownIssueProcessFailure => "known_issue_process_failure",
            ErrorKind::SpuriousStderrSuccess => "spurious_stderr_success",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw result of one supervised process run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessReport {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stderr_text: String,
    /// Size of the expected output file, `None` when it does not exist
    pub output_file_bytes: Option<u64>,
}

/// Interpreted outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderOutcome {
    pub succeeded: bool,
    pub exit_code: Option<i32>,
    pub stderr_text: String,
    pub output_file_exists: bool,
    pub error_kind: Option<ErrorKind>,
    pub hint: Option<String>,
}

impl RenderOutcome {
    /// Outcome for a job that never reached the process stage.
    pub fn not_run(kind: ErrorKind) -> Self {
        Self {
            succeeded: false,
            exit_code: None,
            stderr_text: String::new(),
            output_file_exists: false,
            error_kind: Some(kind),
            hint: None,
        }
    }
}

/// Whether stderr describes the audio encoder band-count limit.
pub fn is_audio_band_issue(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    (lower.contains("number of bands") || lower.contains("band count"))
        && lower.contains("exceeds limit")
}

/// Classify a finished run.
///
/// `min_output_bytes` guards the leniency of rule 2: an output smaller than
/// this does not rescue a run that signalled an error. `1` rejects empty
/// files; `0` accepts any existing file.
pub fn classify(report: &ProcessReport, min_output_bytes: u64) -> RenderOutcome {
    let stderr_empty = report.stderr_text.trim().is_empty();
    let exit_ok = report.exit_code == Some(0);
    let output_file_exists = report.output_file_bytes.is_some();

    let mut outcome = RenderOutcome {
        succeeded: false,
        exit_code: report.exit_code,
        stderr_text: report.stderr_text.clone(),
        output_file_exists,
        error_kind: None,
        hint: None,
    };

    if exit_ok && stderr_empty {
        outcome.succeeded = true;
        return outcome;
    }

    if report
        .output_file_bytes
        .is_some_and(|bytes| bytes >= min_output_bytes)
    {
        outcome.succeeded = true;
        outcome.error_kind = Some(ErrorKind::SpuriousStderrSuccess);
        return outcome;
    }

    if is_audio_band_issue(&report.stderr_text) {
        outcome.error_kind = Some(ErrorKind::KnownIssueProcessFailure);
        outcome.hint = Some(AUDIO_BANDS_HINT.to_string());
    } else {
        outcome.error_kind = Some(ErrorKind::ProcessFailure);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn report(exit_code: Option<i32>, stderr: &str, bytes: Option<u64>) -> ProcessReport {
        ProcessReport {
            exit_code,
            stderr_text: stderr.to_string(),
            output_file_bytes: bytes,
        }
    }

    #[test]
    fn test_clean_success() {
        let outcome = classify(&report(Some(0), "", Some(1024)), 1);
        assert!(outcome.succeeded);
        assert_eq!(outcome.error_kind, None);
        assert!(outcome.hint.is_none());
    }

    #[test]
    fn test_clean_exit_without_file_still_success() {
        // Rule 1 does not look at the file.
        let outcome = classify(&report(Some(0), "", None), 1);
        assert!(outcome.succeeded);
        assert!(!outcome.output_file_exists);
    }

    #[test]
    fn test_spurious_stderr_with_output_is_success() {
        let outcome = classify(
            &report(Some(1), "QPainter::begin: Paint device returned engine == 0", Some(4096)),
            1,
        );
        assert!(outcome.succeeded);
        assert_eq!(outcome.error_kind, Some(ErrorKind::SpuriousStderrSuccess));
        assert!(outcome.stderr_text.contains("QPainter"));
    }

    #[test]
    fn test_stderr_on_zero_exit_with_output_is_warning() {
        let outcome = classify(&report(Some(0), "warning: no gyro data", Some(10)), 1);
        assert!(outcome.succeeded);
        assert_eq!(outcome.error_kind, Some(ErrorKind::SpuriousStderrSuccess));
    }

    #[test]
    fn test_empty_output_does_not_rescue_failure() {
        let outcome = classify(&report(Some(1), "render aborted", Some(0)), 1);
        assert!(!outcome.succeeded);
        assert_eq!(outcome.error_kind, Some(ErrorKind::ProcessFailure));

        let lenient = classify(&report(Some(1), "render aborted", Some(0)), 0);
        assert!(lenient.succeeded);
    }

    #[test]
    fn test_hard_failure() {
        let outcome = classify(&report(Some(1), "Failed to open file", None), 1);
        assert!(!outcome.succeeded);
        assert_eq!(outcome.error_kind, Some(ErrorKind::ProcessFailure));
        assert!(outcome.hint.is_none());
        assert_eq!(outcome.stderr_text, "Failed to open file");
    }

    #[test]
    fn test_signal_without_output_is_failure() {
        let outcome = classify(&report(None, "", None), 1);
        assert!(!outcome.succeeded);
        assert_eq!(outcome.error_kind, Some(ErrorKind::ProcessFailure));
    }

    #[test]
    fn test_audio_band_hint() {
        let stderr = "[aac @ 0x55d] Number of bands (20) exceeds limit (14).\nError while encoding";
        let outcome = classify(&report(Some(1), stderr, None), 1);
        assert_eq!(outcome.error_kind, Some(ErrorKind::KnownIssueProcessFailure));
        assert_eq!(outcome.hint.as_deref(), Some(AUDIO_BANDS_HINT));
    }

    #[test]
    fn test_band_phrase_alone_gets_no_hint() {
        let outcome = classify(&report(Some(1), "number of bands: 20", None), 1);
        assert_eq!(outcome.error_kind, Some(ErrorKind::ProcessFailure));
        assert!(outcome.hint.is_none());

        let outcome = classify(&report(Some(1), "frame size exceeds limit", None), 1);
        assert!(outcome.hint.is_none());
    }

    #[test]
    fn test_not_run_outcome() {
        let outcome = RenderOutcome::not_run(ErrorKind::ExecutableNotFound);
        assert!(!outcome.succeeded);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(outcome.error_kind, Some(ErrorKind::ExecutableNotFound));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_band_heuristic_is_case_insensitive(
            prefix in "[a-z ]{0,10}",
            upper in proptest::bool::ANY,
            middle in "[a-z0-9() ]{0,10}",
        ) {
            let phrase = format!("{}Number of bands {}exceeds limit", prefix, middle);
            let phrase = if upper { phrase.to_uppercase() } else { phrase };
            prop_assert!(is_audio_band_issue(&phrase));
        }

        #[test]
        fn prop_missing_output_and_error_never_succeeds(
            code in 1i32..255,
            stderr in "[a-z ]{0,40}",
        ) {
            let outcome = classify(&report(Some(code), &stderr, None), 1);
            prop_assert!(!outcome.succeeded);
            prop_assert!(matches!(
                outcome.error_kind,
                Some(ErrorKind::ProcessFailure) | Some(ErrorKind::KnownIssueProcessFailure)
            ));
        }
    }
}
