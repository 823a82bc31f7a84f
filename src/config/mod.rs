//! Configuration for all three roles.
//!
//! Resolution order: CLI flags → environment variables → config file →
//! defaults. The config file is only read when `--config` (or
//! `$SCREENRELAY_CONFIG`) names one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::milestone::DEFAULT_MARKS_MS;
use crate::stats::MetricSet;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Which metric categories are recorded
    pub metrics: MetricSet,
    /// Where reports, merged media and log files go
    pub output_dir: PathBuf,
    pub milestones: MilestoneSettings,
    pub sender: SenderSettings,
    pub receiver: ReceiverSettings,
    pub resources: ResourceSettings,
    pub probe: ProbeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MilestoneSettings {
    /// Elapsed milliseconds from session start
    pub marks_ms: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderSettings {
    /// Chunk production interval
    pub interval_ms: u64,
    /// Stop automatically after this long. 0 = run until interrupted.
    pub duration_secs: u64,
    /// Delay between stopping capture and announcing end of stream
    pub end_grace_ms: u64,
    /// Chunks retained for the recorded artifact; oldest dropped beyond this
    pub buffer_capacity: usize,
    /// Synthetic source payload range (bytes)
    pub synthetic_min_bytes: usize,
    pub synthetic_max_bytes: usize,
    /// File source slice size (bytes)
    pub file_slice_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSettings {
    /// Pending-append queue slots; arrivals beyond this are dropped
    pub queue_capacity: usize,
    /// Queue depth that triggers a backlog warning
    pub queue_warn_depth: usize,
    /// Chunks retained for the received artifact
    pub retain_capacity: usize,
    /// Player command fed through stdin, e.g. "ffplay -loglevel error -"
    pub player: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Frame-count probe executable
    pub program: String,
    /// Probe merged artifacts once a session ends
    pub after_session: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for Settings {
    fn default() -> Self {
        Self {
            metrics: MetricSet::all(),
            output_dir: PathBuf::from("."),
            milestones: MilestoneSettings::default(),
            sender: SenderSettings::default(),
            receiver: ReceiverSettings::default(),
            resources: ResourceSettings::default(),
            probe: ProbeSettings::default(),
        }
    }
}

impl Default for MilestoneSettings {
    fn default() -> Self {
        Self {
            marks_ms: DEFAULT_MARKS_MS.to_vec(),
        }
    }
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            interval_ms: 150,
            duration_secs: 60,
            end_grace_ms: 5_000,
            buffer_capacity: 100_000,
            synthetic_min_bytes: 1_000,
            synthetic_max_bytes: 40_000,
            file_slice_bytes: 32 * 1024,
        }
    }
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 4_096,
            queue_warn_depth: 32,
            retain_capacity: 100_000,
            player: None,
        }
    }
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 5_000,
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            program: "ffprobe".to_string(),
            after_session: true,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl Settings {
    /// Load from an explicit path (or `$SCREENRELAY_CONFIG`), then apply
    /// env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("SCREENRELAY_CONFIG").map(PathBuf::from));
        let mut settings = match path {
            Some(path) => Self::from_file(&path)?,
            None => Settings::default(),
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Apply SCREENRELAY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SCREENRELAY_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SCREENRELAY_SENDER__INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.sender.interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("SCREENRELAY_RESOURCES__POLL_INTERVAL_MS") {
            if let Ok(ms) = v.parse() {
                self.resources.poll_interval_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("SCREENRELAY_PROBE__PROGRAM") {
            self.probe.program = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sender.interval_ms == 0 {
            return Err(ConfigError::Invalid("sender.interval_ms must be > 0".into()));
        }
        if self.sender.synthetic_min_bytes > self.sender.synthetic_max_bytes {
            return Err(ConfigError::Invalid(
                "sender.synthetic_min_bytes exceeds synthetic_max_bytes".into(),
            ));
        }
        if self.sender.file_slice_bytes == 0 {
            return Err(ConfigError::Invalid("sender.file_slice_bytes must be > 0".into()));
        }
        if self.resources.enabled && self.resources.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "resources.poll_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::MetricCategory;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.milestones.marks_ms, vec![60_000, 300_000, 1_800_000]);
        assert_eq!(s.sender.interval_ms, 150);
        assert_eq!(s.resources.poll_interval_ms, 5_000);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
metrics = ["network_delay", "decode_to_display"]
output_dir = "/tmp/runs"

[milestones]
marks_ms = [1000, 2000]

[receiver]
player = "ffplay -"
"#
        )
        .unwrap();

        let s = Settings::from_file(file.path()).unwrap();
        assert_eq!(s.milestones.marks_ms, vec![1000, 2000]);
        assert_eq!(s.output_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(s.receiver.player.as_deref(), Some("ffplay -"));
        assert_eq!(s.receiver.queue_capacity, 4_096);
        assert!(s.metrics.contains(MetricCategory::DecodeToDisplay));
        assert!(!s.metrics.contains(MetricCategory::ChunkSize));
    }

    #[test]
    fn test_bad_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sender\ninterval_ms = ").unwrap();
        let err = Settings::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut s = Settings::default();
        s.sender.interval_ms = 0;
        assert!(matches!(s.validate(), Err(ConfigError::Invalid(_))));
    }
}
