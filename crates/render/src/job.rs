//! Render job model.
//!
//! A [`RenderJob`] describes one requested extraction: a time range of a
//! source video, the rotation to compensate for, and the output file name.
//! Jobs are ephemeral and live only inside a [`crate::queue::RenderQueue`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Source rotation, in degrees, that the stabilizer has to compensate for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

/// Source rotation -> stabilizer rotation. The tool's convention is the
/// mirror of the source's stored rotation metadata.
const ROTATION_TABLE: [(Rotation, u16); 4] = [
    (Rotation::Deg0, 0),
    (Rotation::Deg90, 270),
    (Rotation::Deg180, 180),
    (Rotation::Deg270, 90),
];

impl Rotation {
    /// Rotation in degrees as stored in the source metadata.
    pub fn degrees(self) -> u16 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// Rotation value in the stabilizer's convention.
    pub fn translated(self) -> u16 {
        ROTATION_TABLE
            .iter()
            .find(|(rotation, _)| *rotation == self)
            .map(|(_, tool)| *tool)
            .unwrap_or(0)
    }

    /// Whether the rendered frame is transposed relative to the stored frame.
    pub fn swaps_dimensions(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }
}

/// Error returned when a rotation outside {0, 90, 180, 270} is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unsupported rotation {0}; expected 0, 90, 180 or 270")]
pub struct InvalidRotation(pub u16);

impl TryFrom<u16> for Rotation {
    type Error = InvalidRotation;

    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::Deg0),
            90 => Ok(Rotation::Deg90),
            180 => Ok(Rotation::Deg180),
            270 => Ok(Rotation::Deg270),
            other => Err(InvalidRotation(other)),
        }
    }
}

impl From<Rotation> for u16 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

impl std::fmt::Display for Rotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// State of a job in the render pipeline.
///
/// Only the drain loop moves a job between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the queue.
    #[default]
    Queued,
    /// The stabilizer is running for this job.
    Rendering,
    /// Output produced.
    Rendered,
    /// Job ended without a usable output.
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Rendering => "rendering",
            JobState::Rendered => "rendered",
            JobState::Failed => "failed",
        }
    }

    /// Rendered and Failed are terminal; the queue keeps no history.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Rendered | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller wants rendered. This is the job submission payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub source_video_path: PathBuf,
    #[serde(with = "millis")]
    pub start_time: Duration,
    #[serde(with = "millis")]
    pub end_time: Duration,
    pub output_name: String,
    #[serde(default)]
    pub rotation: Rotation,
}

impl RenderRequest {
    pub fn new(
        source_video_path: impl Into<PathBuf>,
        start_time: Duration,
        end_time: Duration,
        output_name: impl Into<String>,
        rotation: Rotation,
    ) -> Self {
        Self {
            source_video_path: source_video_path.into(),
            start_time,
            end_time,
            output_name: output_name.into(),
            rotation,
        }
    }
}

/// Stable job identifier, assigned at enqueue time.
pub type JobId = Uuid;

/// A queued extraction request plus its pipeline state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderJob {
    pub id: JobId,
    pub source_video_path: PathBuf,
    #[serde(with = "millis")]
    pub start_time: Duration,
    #[serde(with = "millis")]
    pub end_time: Duration,
    pub output_name: String,
    pub rotation: Rotation,
    pub state: JobState,
    pub status_message: String,
}

impl RenderJob {
    pub(crate) fn from_request(request: RenderRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_video_path: request.source_video_path,
            start_time: request.start_time,
            end_time: request.end_time,
            output_name: request.output_name,
            rotation: request.rotation,
            state: JobState::Queued,
            status_message: String::new(),
        }
    }

    /// Two jobs with the same source and range are the same job;
    /// output name and rotation are not part of identity.
    pub fn same_identity(&self, source: &Path, start: Duration, end: Duration) -> bool {
        self.source_video_path == source && self.start_time == start && self.end_time == end
    }

    /// start == end == 0 means "whole file, no trim".
    pub fn is_untrimmed(&self) -> bool {
        self.start_time.is_zero() && self.end_time.is_zero()
    }

    /// Where the stabilizer writes this job's output.
    pub fn output_path(&self, output_directory: &Path) -> PathBuf {
        output_directory.join(&self.output_name)
    }
}

/// Durations on the wire are whole milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
