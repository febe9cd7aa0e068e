//! Source media probing.
//!
//! The stabilizer needs the stored frame size of the source to write the
//! output dimensions. Probing is best effort: a failed probe only drops the
//! dimensions from the preset.

use crate::encode::Dimensions;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe command failed to execute.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// IO error during probe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves the frame size of a source video.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn dimensions(&self, source: &Path) -> Option<Dimensions>;
}

/// Raw ffprobe JSON structures for parsing.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Option<Vec<Stream>>,
}

#[derive(Debug, Deserialize)]
struct Stream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Takes the first video stream with a non-zero size.
pub fn parse_dimensions(json_str: &str) -> Result<Option<Dimensions>, ProbeError> {
    let output: FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    Ok(output
        .streams
        .unwrap_or_default()
        .into_iter()
        .filter(|s| s.codec_type.as_deref() == Some("video"))
        .find_map(|s| match (s.width, s.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some(Dimensions::new(w, h)),
            _ => None,
        }))
}

/// Probes with `ffprobe -v quiet -print_format json -show_streams <path>`.
#[derive(Debug, Clone, Default)]
pub struct FfprobeProbe;

impl FfprobeProbe {
    pub async fn probe(&self, source: &Path) -> Result<Option<Dimensions>, ProbeError> {
        let output = Command::new("ffprobe")
            .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
            .arg(source)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_dimensions(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn dimensions(&self, source: &Path) -> Option<Dimensions> {
        match self.probe(source).await {
            Ok(dims) => dims,
            Err(e) => {
                warn!(source = %source.display(), "could not probe source dimensions: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_first_video_stream() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "aac"},
                {"codec_type": "video", "codec_name": "hevc", "width": 3840, "height": 2160},
                {"codec_type": "video", "codec_name": "mjpeg", "width": 640, "height": 360}
            ]
        }"#;
        assert_eq!(
            parse_dimensions(json).unwrap(),
            Some(Dimensions::new(3840, 2160))
        );
    }

    #[test]
    fn test_parse_skips_zero_sized_streams() {
        let json = r#"{"streams": [
            {"codec_type": "video", "width": 0, "height": 0},
            {"codec_type": "video", "width": 1920, "height": 1080}
        ]}"#;
        assert_eq!(
            parse_dimensions(json).unwrap(),
            Some(Dimensions::new(1920, 1080))
        );
    }

    #[test]
    fn test_parse_no_video() {
        assert_eq!(parse_dimensions(r#"{"streams": []}"#).unwrap(), None);
        assert_eq!(parse_dimensions(r#"{}"#).unwrap(), None);
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(matches!(
            parse_dimensions("not json"),
            Err(ProbeError::ParseError(_))
        ));
    }
}
