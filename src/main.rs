mod buffer;
mod cli;
mod client;
mod clock;
mod config;
mod milestone;
mod probe;
mod protocol;
mod receiver;
mod relay;
mod resources;
mod sender;
mod stats;
mod storage;

use anyhow::{Context, Result};
use cli::{Cli, Commands, CommonArgs};
use config::Settings;
use probe::FrameProbe;
use sender::run::SendOptions;
use sender::source::SourceKind;
use std::fs::File;
use std::sync::Arc;
use storage::RunStorage;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    let settings = resolve_settings(&cli.common, &cli.command)?;

    let storage = RunStorage::new(&settings.output_dir)?;
    let log_file = if cli.common.no_log_file || matches!(cli.command, Commands::Probe { .. }) {
        None
    } else {
        let path = storage.path(&format!("{}_trace", cli.command.role()), "log");
        Some(File::create(&path).with_context(|| format!("Failed to create log file {}", path.display()))?)
    };
    init_logging(log_file);
    tracing::info!(
        role = cli.command.role(),
        run = storage.stamp(),
        output_dir = %settings.output_dir.display(),
        "screenrelay starting"
    );

    match cli.command {
        Commands::Relay { addr } => {
            relay::start_relay(addr, settings).await?;
        }
        Commands::Send { relay, file, .. } => {
            let source = match file {
                Some(path) => SourceKind::File {
                    path,
                    slice_bytes: settings.sender.file_slice_bytes,
                },
                None => SourceKind::Synthetic {
                    min_bytes: settings.sender.synthetic_min_bytes,
                    max_bytes: settings.sender.synthetic_max_bytes,
                },
            };
            let options = SendOptions {
                relay_url: relay,
                source,
            };
            sender::run::run(options, &settings, &storage).await?;
        }
        Commands::Receive { relay, .. } => {
            receiver::run::run(&relay, &settings, &storage).await?;
        }
        Commands::Probe { path, duration_secs } => {
            probe_file(&settings, &path, duration_secs).await?;
        }
    }

    Ok(())
}

/// Config file and environment first, then CLI flags on top.
fn resolve_settings(common: &CommonArgs, command: &Commands) -> Result<Settings> {
    let mut settings = Settings::load(common.config.as_deref())?;

    if let Some(dir) = &common.output_dir {
        settings.output_dir = dir.clone();
    }
    if common.no_resources {
        settings.resources.enabled = false;
    }
    match command {
        Commands::Send {
            interval_ms,
            duration_secs,
            ..
        } => {
            if let Some(ms) = interval_ms {
                settings.sender.interval_ms = *ms;
            }
            if let Some(secs) = duration_secs {
                settings.sender.duration_secs = *secs;
            }
        }
        Commands::Receive { player, .. } => {
            if player.is_some() {
                settings.receiver.player = player.clone();
            }
        }
        _ => {}
    }

    settings.validate()?;
    Ok(settings)
}

fn init_logging(log_file: Option<File>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::io::stderr.and(Arc::new(file)))
            .init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn probe_file(settings: &Settings, path: &std::path::Path, duration_secs: Option<f64>) -> Result<()> {
    let probe = FrameProbe::new(settings.probe.program.clone());
    let frames = probe.frame_count(path).await?;
    println!("🎞️  {}: {} frames", path.display(), frames);
    if let Some(secs) = duration_secs.filter(|s| *s > 0.0) {
        println!("   {:.2} fps over {:.1} s", frames as f64 / secs, secs);
    }
    Ok(())
}
