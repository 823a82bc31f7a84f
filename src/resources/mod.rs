//! Process resource sampling from `/proc/self`.
//!
//! CPU% is the change in utime+stime between two polls over the wall time
//! between them. Memory is resident set size. GPU utilisation has no
//! portable source and is reported as unavailable.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::config::ResourceSettings;
use crate::stats::{MetricBook, MetricCategory};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
    pub gpu_percent: Option<f64>,
}

impl ResourceSample {
    /// Feed every available reading into `book`.
    pub fn record_into(&self, book: &mut MetricBook) {
        if let Some(cpu) = self.cpu_percent {
            book.record(MetricCategory::CpuPercent, cpu);
        }
        if let Some(mem) = self.memory_mb {
            book.record(MetricCategory::MemoryMb, mem);
        }
        if let Some(gpu) = self.gpu_percent {
            book.record(MetricCategory::GpuPercent, gpu);
        }
    }
}

pub struct ProcSampler {
    ticks_per_sec: f64,
    last: Option<(u64, Instant)>,
}

impl ProcSampler {
    pub fn new() -> Self {
        Self {
            ticks_per_sec: clock_ticks_per_sec(),
            last: None,
        }
    }

    /// Take one sample. The first call has no CPU baseline yet, so its
    /// `cpu_percent` is `None`.
    pub fn sample(&mut self) -> ResourceSample {
        let now = Instant::now();
        let ticks = std::fs::read_to_string("/proc/self/stat")
            .ok()
            .and_then(|s| parse_stat_cpu_ticks(&s));
        let memory_mb = std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|s| parse_status_rss_kb(&s))
            .map(|kb| kb as f64 / 1024.0);

        let cpu_percent = ticks.and_then(|ticks| {
            let prev = self.last.replace((ticks, now));
            prev.and_then(|(prev_ticks, prev_at)| {
                cpu_percent(prev_ticks, ticks, now.duration_since(prev_at), self.ticks_per_sec)
            })
        });

        ResourceSample {
            cpu_percent,
            memory_mb,
            gpu_percent: None,
        }
    }
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll on `interval` in a background task. The task ends when the
/// receiver is dropped.
pub fn spawn_sampler(interval: Duration) -> mpsc::Receiver<ResourceSample> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let mut sampler = ProcSampler::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let sample = sampler.sample();
            tracing::debug!(
                cpu = ?sample.cpu_percent,
                memory_mb = ?sample.memory_mb,
                "resource sample"
            );
            if tx.send(sample).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Start the sampler when enabled in `settings`.
pub fn spawn_from_settings(settings: &ResourceSettings) -> Option<mpsc::Receiver<ResourceSample>> {
    settings
        .enabled
        .then(|| spawn_sampler(Duration::from_millis(settings.poll_interval_ms)))
}

/// Next sample from an optional sampler; never resolves when there is none,
/// so it can sit in a `select!` unconditionally.
pub async fn next_sample(rx: &mut Option<mpsc::Receiver<ResourceSample>>) -> Option<ResourceSample> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// utime + stime (fields 14 and 15) from a `/proc/<pid>/stat` line.
///
/// The command name in field 2 may contain spaces and parentheses, so
/// fields are counted from the last `)`.
pub fn parse_stat_cpu_ticks(stat: &str) -> Option<u64> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // after_comm starts at field 3 (state)
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// `VmRSS` in kB from `/proc/<pid>/status`.
pub fn parse_status_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

fn cpu_percent(prev_ticks: u64, ticks: u64, elapsed: Duration, ticks_per_sec: f64) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 || ticks < prev_ticks {
        return None;
    }
    Some((ticks - prev_ticks) as f64 / ticks_per_sec / secs * 100.0)
}

fn clock_ticks_per_sec() -> f64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions
        let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if ticks > 0 {
            return ticks as f64;
        }
    }
    100.0
}
