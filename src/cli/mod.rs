use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "screenrelay")]
#[command(about = "📡 Screen-share chunk relay with end-to-end timing telemetry", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags every role understands
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// TOML config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for artifacts, reports and logs
    #[arg(short, long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Do not tee log output into the output directory
    #[arg(long, global = true)]
    pub no_log_file: bool,

    /// Disable CPU/memory sampling
    #[arg(long, global = true)]
    pub no_resources: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay
    Relay {
        /// Address to bind to
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        addr: String,
    },

    /// Produce chunks and stream them to the relay
    Send {
        /// Relay server URL
        #[arg(short, long, default_value = "ws://127.0.0.1:3000")]
        relay: String,

        /// Replay an encoded media file in slices
        #[arg(short, long, conflicts_with = "synthetic")]
        file: Option<PathBuf>,

        /// Send random payloads instead of a file
        #[arg(long)]
        synthetic: bool,

        /// Chunk interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Stop after this many seconds (0 = until Ctrl+C)
        #[arg(long)]
        duration_secs: Option<u64>,
    },

    /// Receive a stream, feed it to a decoder sink and report
    Receive {
        /// Relay server URL
        #[arg(short, long, default_value = "ws://127.0.0.1:3000")]
        relay: String,

        /// Player command fed through stdin, e.g. "ffplay -"
        #[arg(short, long)]
        player: Option<String>,
    },

    /// Count frames in a saved artifact and report FPS
    Probe {
        /// Media file to probe
        path: PathBuf,

        /// Session duration used for the FPS figure
        #[arg(long)]
        duration_secs: Option<f64>,
    },
}

impl Commands {
    /// Role name used in log file names
    pub fn role(&self) -> &'static str {
        match self {
            Commands::Relay { .. } => "relay",
            Commands::Send { .. } => "sender",
            Commands::Receive { .. } => "receiver",
            Commands::Probe { .. } => "probe",
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_send_defaults_and_overrides() {
        let cli = Cli::parse_from(["screenrelay", "send", "--synthetic", "--interval-ms", "100"]);
        match cli.command {
            Commands::Send {
                relay,
                file,
                synthetic,
                interval_ms,
                duration_secs,
            } => {
                assert_eq!(relay, "ws://127.0.0.1:3000");
                assert!(file.is_none());
                assert!(synthetic);
                assert_eq!(interval_ms, Some(100));
                assert_eq!(duration_secs, None);
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_file_and_synthetic_conflict() {
        assert!(Cli::try_parse_from(["screenrelay", "send", "--file", "a.webm", "--synthetic"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["screenrelay", "relay", "--output-dir", "/tmp/runs", "--no-log-file"]);
        assert_eq!(cli.common.output_dir, Some(PathBuf::from("/tmp/runs")));
        assert!(cli.common.no_log_file);
        assert_eq!(cli.command.role(), "relay");
    }
}
