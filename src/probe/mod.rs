//! Post-hoc frame count of a saved artifact via an external prober.

use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("unparseable frame count: {0:?}")]
    Unparseable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProbeResult {
    pub frames: u64,
    pub duration_secs: f64,
    pub fps: Option<f64>,
}

pub struct FrameProbe {
    program: String,
}

impl FrameProbe {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Decoded video frame count of the first video stream in `path`.
    pub async fn frame_count(&self, path: &Path) -> Result<u64, ProbeError> {
        let output = tokio::process::Command::new(&self.program)
            .args([
                "-v",
                "error",
                "-count_frames",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=nb_read_frames",
                "-of",
                "csv=p=0",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|source| ProbeError::Launch {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_frame_count(&String::from_utf8_lossy(&output.stdout))
    }

    /// Probe and compute FPS over `duration`.
    pub async fn measure(&self, path: &Path, duration: Duration) -> Result<ProbeResult, ProbeError> {
        let frames = self.frame_count(path).await?;
        let duration_secs = duration.as_secs_f64();
        let fps = (duration_secs > 0.0).then(|| frames as f64 / duration_secs);
        Ok(ProbeResult {
            frames,
            duration_secs,
            fps,
        })
    }

    /// Probe failures only get logged; a run never fails because of them.
    pub async fn probe_and_log(&self, path: &Path, duration: Duration) -> Option<ProbeResult> {
        match self.measure(path, duration).await {
            Ok(result) => {
                tracing::info!(
                    path = %path.display(),
                    frames = result.frames,
                    duration_secs = result.duration_secs,
                    fps = ?result.fps,
                    "frame probe"
                );
                Some(result)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "frame probe failed");
                None
            }
        }
    }
}

/// The prober prints one count per line; take the first non-empty one.
pub fn parse_frame_count(stdout: &str) -> Result<u64, ProbeError> {
    let line = stdout
        .lines()
        .map(|l| l.trim().trim_end_matches(','))
        .find(|l| !l.is_empty())
        .unwrap_or("");
    line.parse()
        .map_err(|_| ProbeError::Unparseable(stdout.trim().to_string()))
}
