use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Per-run output files, all sharing one timestamp so a run's artifact,
/// report, and log sort together.
#[derive(Debug, Clone)]
pub struct RunStorage {
    dir: PathBuf,
    stamp: String,
}

impl RunStorage {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        Self::with_stamp(dir, stamp)
    }

    pub fn with_stamp<P: AsRef<Path>>(dir: P, stamp: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        Ok(Self {
            dir,
            stamp: stamp.into(),
        })
    }

    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// `<dir>/<prefix>_<stamp>.<ext>`
    pub fn path(&self, prefix: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.{}", prefix, self.stamp, ext))
    }

    /// Save the concatenated media of a session
    pub fn write_artifact(&self, prefix: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.path(prefix, "webm");
        std::fs::write(&path, data)
            .with_context(|| format!("Failed to write artifact {}", path.display()))?;
        tracing::info!(path = %path.display(), bytes = data.len(), "artifact saved");
        Ok(path)
    }

    pub fn write_json<T: Serialize>(&self, prefix: &str, value: &T) -> Result<PathBuf> {
        let path = self.path(prefix, "json");
        let json = serde_json::to_vec_pretty(value)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        tracing::info!(path = %path.display(), "report saved");
        Ok(path)
    }

    /// Append one record as a JSON line
    pub fn append_jsonl<T: Serialize>(&self, prefix: &str, value: &T) -> Result<PathBuf> {
        let path = self.path(prefix, "jsonl");
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(&line)?;
        Ok(path)
    }

    pub fn write_text(&self, prefix: &str, text: &str) -> Result<PathBuf> {
        let path = self.path(prefix, "txt");
        std::fs::write(&path, text)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}
