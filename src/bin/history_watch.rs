//! `quakewatch-history-watch`: the independent history-log tailing process
//! (C9). Ported from `watch_threshold_monitor.py`'s scan/sleep loop.

use clap::Parser;
use eyre::WrapErr;
use hifitime::prelude::*;
use quakewatch::args::WatchCli;
use quakewatch::config::Config;
use quakewatch::history_watch::HistoryWatcher;
use quakewatch::status_store::{LoggingStatusStore, MySqlStatusStore, StatusStore};
use quakewatch::telemetry;
use std::time::Duration;
use tracing::info;

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = WatchCli::parse();
    telemetry::init_tracing_subscriber(cli.verbose);

    let config = Config::from_file(&cli.config).wrap_err("loading configuration")?;
    let output_dir = cli.output_dir.clone().unwrap_or(config.outputdir.clone());

    let status_store: Box<dyn StatusStore + Send> = match &config.mysql_info {
        Some(mysql_info) => Box::new(MySqlStatusStore::new(&mysql_info.url()).wrap_err("connecting to mysql_info")?),
        None => {
            info!("no mysql_info configured, logging status updates instead of upserting them");
            Box::new(LoggingStatusStore)
        }
    };

    let mut watcher = HistoryWatcher::new(
        output_dir,
        config.maximum_latency,
        config.latency_alarm_timeout.seconds(),
        config.seconds_to_keep,
        status_store,
    );

    let mut iterations: u64 = 0;
    while cli.max_iterations.map(|max| iterations < max).unwrap_or(true) {
        let now = Epoch::now().unwrap_or(Epoch::from_unix_seconds(0.0));
        match watcher.tick(now) {
            Ok(summary) => {
                info!(stations = summary.stations_seen, late = summary.late_stations.len(), "tick complete");
            }
            Err(e) => {
                tracing::error!(error = %e, "history watcher tick failed");
            }
        }

        iterations += 1;
        std::thread::sleep(Duration::from_secs_f64(cli.refresh_interval));
    }

    Ok(())
}
