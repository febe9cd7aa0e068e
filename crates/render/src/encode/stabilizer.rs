//! Stabilizer command-line builder
//!
//! Turns a [`RenderJob`] plus the per-drain [`RenderSettings`] into the exact
//! argument list the external stabilization tool expects. Two of the
//! arguments are structured payloads (output parameters and preset) written
//! in the tool's single-quoted key/value shape.

use crate::config::Config;
use crate::job::RenderJob;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Preset payload schema version understood by the tool
const PRESET_VERSION: u32 = 2;

/// Audio codec forced when the alternate codec setting is on
const ALTERNATE_AUDIO_CODEC: &str = "PCM (s16le)";

const FLAG_PARALLEL: &str = "--parallel-renders";
const FLAG_OVERWRITE: &str = "--overwrite";
const FLAG_OUT_PARAMS: &str = "--out-params";
const FLAG_PRESET: &str = "--preset";
const FLAG_STDOUT_PROGRESS: &str = "--stdout-progress";

/// Error type for invocation building
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    /// The job reached the builder without an output file name
    #[error("job has no output name")]
    MissingOutputName,
}

/// Read-only settings snapshot taken once per drain.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSettings {
    /// Directory receiving `{output_directory}/{output_name}`
    pub output_directory: PathBuf,
    /// Optional settings/preset file; used only if it exists
    pub preset_file: Option<PathBuf>,
    pub audio_enabled: bool,
    pub use_alternate_audio_codec: bool,
    /// Global overwrite decision for this drain
    pub overwrite: bool,
    /// Parallel render hint; values above 1 are forwarded to the tool
    pub parallelism: u32,
    /// Per-job deadline
    pub job_timeout: Option<Duration>,
    /// Smallest output accepted when the tool reported an error
    pub min_output_bytes: u64,
}

impl RenderSettings {
    /// Snapshot the configuration. Overwrite starts off; the drain sets it.
    pub fn from_config(cfg: &Config) -> Self {
        let parallelism = if cfg.stabilizer.parallelism > 0 {
            cfg.stabilizer.parallelism
        } else {
            derive_parallelism(num_cpus::get() as u32)
        };

        Self {
            output_directory: cfg.output.directory.clone(),
            preset_file: cfg.stabilizer.preset_file.clone(),
            audio_enabled: cfg.audio.enabled,
            use_alternate_audio_codec: cfg.audio.alternate_codec,
            overwrite: false,
            parallelism,
            job_timeout: match cfg.stabilizer.job_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            min_output_bytes: cfg.output.min_output_bytes,
        }
    }
}

/// Derive the parallel render hint from the core count
/// - half the logical cores, at least 1 and at most 4
fn derive_parallelism(cores: u32) -> u32 {
    (cores / 2).clamp(1, 4)
}

/// Width and height of the source's stored frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn swapped(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }
}

/// A value inside a payload block.
#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Int(u64),
    Str(String),
    Ranges(Vec<(u64, u64)>),
    Block(Block),
}

/// Ordered key/value block rendered as `{ 'key': value, ... }`.
#[derive(Debug, Clone, PartialEq, Default)]
struct Block(Vec<(&'static str, Value)>);

impl Block {
    fn push(&mut self, key: &'static str, value: Value) {
        self.0.push((key, value));
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Str(s) => write!(f, "'{}'", s),
            Value::Ranges(ranges) => {
                f.write_str("[")?;
                for (i, (start, end)) in ranges.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "[{}, {}]", start, end)?;
                }
                f.write_str("]")
            }
            Value::Block(block) => write!(f, "{}", block),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "'{}': {}", key, value)?;
        }
        f.write_str(" }")
    }
}

/// Output-parameters payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputParams {
    pub output_folder: String,
    pub output_filename: String,
    pub use_gpu: bool,
    pub audio: bool,
    pub audio_codec: Option<&'static str>,
}

impl OutputParams {
    fn block(&self) -> Block {
        let mut block = Block::default();
        block.push("output_folder", Value::Str(self.output_folder.clone()));
        block.push("output_filename", Value::Str(self.output_filename.clone()));
        block.push("use_gpu", Value::Bool(self.use_gpu));
        block.push("audio", Value::Bool(self.audio));
        if let Some(codec) = self.audio_codec {
            block.push("audio_codec", Value::Str(codec.to_string()));
        }
        block
    }
}

impl fmt::Display for OutputParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.block().fmt(f)
    }
}

/// Preset payload: trim range, rotation and output size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetBlock {
    pub version: u32,
    /// `None` renders the whole file
    pub trim_range_ms: Option<(u64, u64)>,
    /// Rotation in the tool's convention (already translated)
    pub rotation: u16,
    /// Output frame size, already swapped for quarter turns
    pub output_size: Option<Dimensions>,
}

impl PresetBlock {
    fn block(&self) -> Block {
        let mut block = Block::default();
        block.push("version", Value::Int(u64::from(self.version)));
        if let Some(range) = self.trim_range_ms {
            block.push("trim_ranges_ms", Value::Ranges(vec![range]));
        }

        let mut video_info = Block::default();
        video_info.push("rotation", Value::Int(u64::from(self.rotation)));
        block.push("video_info", Value::Block(video_info));

        if let Some(size) = self.output_size {
            let mut output = Block::default();
            output.push("output_width", Value::Int(u64::from(size.width)));
            output.push("output_height", Value::Int(u64::from(size.height)));
            block.push("output", Value::Block(output));
        }
        block
    }
}

impl fmt::Display for PresetBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.block().fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Argument {
    value: String,
    /// Structured payloads travel as one quoted shell token
    quoted: bool,
}

/// Fully built stabilizer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StabilizerInvocation {
    program: PathBuf,
    args: Vec<Argument>,
    output_path: PathBuf,
}

impl StabilizerInvocation {
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments as passed to the child process.
    pub fn args(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|arg| arg.value.as_str())
    }

    /// File the tool is expected to produce.
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// The argument line: arguments joined with single spaces, payloads
    /// quoted as one token each.
    pub fn command_line(&self) -> String {
        self.args
            .iter()
            .map(|arg| {
                if arg.quoted || arg.value.contains(char::is_whitespace) {
                    format!("\"{}\"", arg.value)
                } else {
                    arg.value.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Build the stabilizer invocation for one job.
///
/// Argument order:
/// 1. source video, then the preset file when configured and present
/// 2. parallel render hint when parallelism > 1
/// 3. overwrite flag when the drain decided to overwrite
/// 4. output-parameters payload
/// 5. preset payload (trim, translated rotation, output size)
/// 6. line-oriented progress on stdout
///
/// Every backslash in the final argument line becomes a forward slash.
///
/// # Errors
/// Returns [`BuildError::MissingOutputName`] when the job has no output
/// name; names are never synthesized here.
pub fn build_invocation(
    executable: &Path,
    job: &RenderJob,
    settings: &RenderSettings,
    dimensions: Option<Dimensions>,
) -> Result<StabilizerInvocation, BuildError> {
    if job.output_name.trim().is_empty() {
        return Err(BuildError::MissingOutputName);
    }

    let mut args = Vec::new();
    let mut plain = |value: String| {
        args.push(Argument {
            value,
            quoted: false,
        })
    };

    plain(path_text(&job.source_video_path));
    if let Some(preset) = settings.preset_file.as_ref().filter(|p| p.is_file()) {
        plain(path_text(preset));
    }

    if settings.parallelism > 1 {
        plain(FLAG_PARALLEL.to_string());
        plain(settings.parallelism.to_string());
    }

    if settings.overwrite {
        plain(FLAG_OVERWRITE.to_string());
    }

    let mut output_folder = path_text(&settings.output_directory);
    if !output_folder.ends_with(['/', '\\']) {
        output_folder.push('/');
    }
    let output_params = OutputParams {
        output_folder,
        output_filename: job.output_name.clone(),
        use_gpu: true,
        audio: settings.audio_enabled,
        audio_codec: (settings.audio_enabled && settings.use_alternate_audio_codec)
            .then_some(ALTERNATE_AUDIO_CODEC),
    };

    let preset = PresetBlock {
        version: PRESET_VERSION,
        trim_range_ms: (!job.is_untrimmed()).then(|| {
            (
                job.start_time.as_millis() as u64,
                job.end_time.as_millis() as u64,
            )
        }),
        rotation: job.rotation.translated(),
        output_size: dimensions.map(|dims| {
            if job.rotation.swaps_dimensions() {
                dims.swapped()
            } else {
                dims
            }
        }),
    };

    plain(FLAG_OUT_PARAMS.to_string());
    args.push(Argument {
        value: output_params.to_string(),
        quoted: true,
    });
    args.push(Argument {
        value: FLAG_PRESET.to_string(),
        quoted: false,
    });
    args.push(Argument {
        value: preset.to_string(),
        quoted: true,
    });
    args.push(Argument {
        value: FLAG_STDOUT_PROGRESS.to_string(),
        quoted: false,
    });

    for arg in &mut args {
        arg.value = arg.value.replace('\\', "/");
    }

    Ok(StabilizerInvocation {
        program: executable.to_path_buf(),
        args,
        output_path: job.output_path(&settings.output_directory),
    })
}
