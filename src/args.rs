use clap::Parser;
use std::path::PathBuf;

/// CLI surface for the supervisor binary (`quakewatch`).
///
/// Command-line values override the configuration file, per spec.md
/// section 6; every field that can be overridden is `Option` here and
/// merged into [`crate::config::Config`] by [`crate::config::Config::merge_cli`].
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "quakewatch.toml")]
    pub config: PathBuf,
    /// Override the configured stream selector (network.station.location.channel).
    #[arg(long)]
    pub nslc: Option<String>,
    /// Override the configured start time (ISO-8601 UTC).
    #[arg(long = "start-time")]
    pub start_time: Option<String>,
    /// Override the configured end time (ISO-8601 UTC).
    #[arg(long = "end-time")]
    pub end_time: Option<String>,
    /// Override the configured output directory for history logs and alarm artifacts.
    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,
    /// Increase logging verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Run a fixed number of packet iterations per worker, then exit (for benchmarking).
    #[arg(long)]
    pub benchmark: bool,
    /// Disable latency alarms regardless of the configured maximum_latency.
    #[arg(long = "no-latency")]
    pub no_latency: bool,
    /// Cap each worker to this many packets, then exit; unset runs until `endtime`.
    #[arg(long = "max-iterations")]
    pub max_iterations: Option<u64>,
    /// Port to serve the `/metrics` prometheus endpoint on.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,
}

impl Cli {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            nslc: self.nslc.clone(),
            start_time: self.start_time.clone(),
            end_time: self.end_time.clone(),
            output_dir: self.output_dir.clone(),
            latency_off: self.no_latency,
        }
    }
}

/// The subset of CLI flags that can override configuration file values.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub nslc: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub latency_off: bool,
}

/// CLI surface for the independent history-watch binary
/// (`quakewatch-history-watch`, C9).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct WatchCli {
    /// Path to the TOML configuration file (only `outputdir` and
    /// `mysql_info` are consulted).
    #[arg(long, default_value = "quakewatch.toml")]
    pub config: PathBuf,
    /// Override the configured output directory to scan for history logs.
    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,
    /// Seconds between scans of the output directory.
    #[arg(long = "refresh-interval", default_value_t = 10.0)]
    pub refresh_interval: f64,
    /// Increase logging verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Stop after this many scan iterations; unset runs forever.
    #[arg(long = "max-iterations")]
    pub max_iterations: Option<u64>,
}
