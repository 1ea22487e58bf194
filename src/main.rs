pub use clap::Parser;
use eyre::WrapErr;
use hifitime::prelude::*;
use quakewatch::args::Cli;
use quakewatch::calibration::{RawCalibrationEntry, TableCalibrationProvider};
use quakewatch::config::{Api, Config};
use quakewatch::errors::FatalError;
use quakewatch::notify::{Notifier, RecordingNotifier, SmtpNotifier};
use quakewatch::source::archive_file::JsonFileWaveformIndex;
use quakewatch::source::query::QuerySource;
use quakewatch::source::StreamIdPattern;
use quakewatch::status_store::{LoggingStatusStore, MySqlStatusStore, StatusStore};
use quakewatch::supervisor;
use quakewatch::telemetry;
use quakewatch::worker::{Mode, StationWorker, WorkerConfig, WorkerReport};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    telemetry::init_tracing_subscriber(cli.verbose);

    let config = Config::from_file(&cli.config)
        .wrap_err("loading configuration")?
        .merge_cli(&cli.overrides());

    let server = quakewatch::metrics::start_web_server(cli.metrics_port)?;
    let server_handle = server.handle();
    tokio::spawn(server);

    let now = Epoch::now().unwrap_or_else(|_| Epoch::from_unix_seconds(0.0));
    let mode = Mode::derive(config.end_epoch(), now);
    info!(?mode, nslc = %config.nslc, "resolved run mode");

    let configured = config.configured_stations();
    let station_pattern = config.station_pattern().to_string();
    let stations = supervisor::expand_stations(&station_pattern, &configured);
    if stations.is_empty() {
        return Err(FatalError::NoStationMatch(station_pattern).into());
    }
    info!(stations = ?stations, "dispatching one worker per station");

    let config = Arc::new(config);
    let cli_max_iterations = cli.max_iterations;
    let benchmark = cli.benchmark;

    let reports: Vec<WorkerReport> = tokio::task::spawn_blocking(move || {
        supervisor::run(stations, move |station| {
            build_and_run_worker(&config, station, mode, cli_max_iterations, benchmark)
        })
    })
    .await
    .wrap_err("worker pool task panicked")?;

    let mut alarms = 0u64;
    for report in &reports {
        alarms += report.alarms_emitted;
        info!(
            station = %report.station,
            packets = report.packets_processed,
            late = report.late_packets,
            alarms = report.alarms_emitted,
            latency_alarms = report.latency_alarms_emitted,
            "final worker report"
        );
    }
    info!(workers = reports.len(), total_alarms = alarms, "supervisor finished");

    server_handle.stop(true).await;
    Ok(())
}

/// Build one station's [`StationWorker`] and drive it to completion. Runs on
/// a supervisor-spawned worker thread, never on the tokio runtime.
fn build_and_run_worker(
    config: &Config,
    station: &str,
    mode: Mode,
    cli_max_iterations: Option<u64>,
    benchmark: bool,
) -> eyre::Result<WorkerReport> {
    let bands = config.resolved_bands(station)?;
    let pattern = station_pattern(config, station)?;

    let source: Box<dyn quakewatch::source::PacketSource + Send> = match config.api {
        Api::Query => {
            let backend = JsonFileWaveformIndex::load(std::path::Path::new(&config.datasource))
                .wrap_err_with(|| format!("loading datasource for station {station}"))?;
            let archive_end = matches!(mode, Mode::Archive).then(|| config.end_epoch());
            Box::new(QuerySource::new(backend, config.start_epoch(), archive_end, config.seconds_per_packet))
        }
        Api::Broker | Api::Stream => {
            return Err(FatalError::BackendNotConfigured(format!("{:?}", config.api)).into());
        }
    };

    let calibration = build_calibration_provider(config);
    let notifier = build_notifier(config);
    let status_store = build_status_store(config)?;

    let filter = config.filterdef.as_ref().map(|f| f.to_spec(sample_rate_hint(config)));

    let worker_config = WorkerConfig {
        station: station.to_string(),
        pattern,
        bands,
        buffer_seconds: config.buffer_secs,
        filter,
        seconds_per_packet: config.seconds_per_packet,
        maximum_latency: config.maximum_latency,
        latency_alarm_timeout: config.latency_alarm_timeout.seconds(),
        threshold_alarm_timeout: config.threshold_alarm_timeout.seconds(),
        seconds_to_keep: config.seconds_to_keep,
        start: config.start_epoch(),
        endtime: config.end_epoch(),
        mode,
        output_dir: config.outputdir.clone(),
        recipients: config.email_list.clone(),
        remove_instrument_response: config.remove_instrument_response,
        max_iterations: if benchmark { cli_max_iterations.or(Some(1)) } else { cli_max_iterations },
    };

    let mut worker = StationWorker::new(worker_config, source, calibration, notifier, status_store);
    worker.run()
}

fn station_pattern(config: &Config, station: &str) -> eyre::Result<StreamIdPattern> {
    let parts: Vec<&str> = config.nslc.split('.').collect();
    if parts.len() != 4 {
        return Err(FatalError::BadStreamPattern(config.nslc.clone()).into());
    }
    Ok(StreamIdPattern {
        network: parts[0].to_string(),
        station: station.to_string(),
        location: parts[2].to_string(),
        channel: parts[3].to_string(),
    })
}

/// A crude per-station sample-rate hint for filter design, since this
/// binary has no instrument-response catalogue available before the first
/// packet arrives. 100Hz matches every fixture and config example in this
/// repository; a deployment with different hardware would thread its real
/// rate through here instead.
fn sample_rate_hint(_config: &Config) -> f64 {
    100.0
}

fn build_calibration_provider(config: &Config) -> Box<dyn quakewatch::calibration::CalibrationProvider + Send> {
    let path = config.xmlfile.clone();
    let loader = move || -> Result<Vec<RawCalibrationEntry>, quakewatch::calibration::Error> {
        let Some(path) = &path else { return Ok(Vec::new()) };
        let text = std::fs::read_to_string(path)
            .map_err(|e| quakewatch::calibration::Error::RefreshFailed(format!("{path:?}: {e}")))?;
        serde_json::from_str(&text).map_err(|e| quakewatch::calibration::Error::RefreshFailed(format!("{path:?}: {e}")))
    };
    Box::new(TableCalibrationProvider::new(config.response_update_interval.seconds(), Box::new(loader)))
}

fn build_notifier(config: &Config) -> Box<dyn Notifier + Send> {
    if config.email_list.is_empty() {
        return Box::new(RecordingNotifier::default());
    }
    match SmtpNotifier::new("localhost", "quakewatch@localhost") {
        Ok(n) => Box::new(n),
        Err(e) => {
            tracing::warn!(error = %e, "failed to build smtp notifier, alarms will not be emailed");
            Box::new(RecordingNotifier::default())
        }
    }
}

fn build_status_store(config: &Config) -> eyre::Result<Box<dyn StatusStore + Send>> {
    match &config.mysql_info {
        Some(mysql_info) => {
            let store = MySqlStatusStore::new(&mysql_info.url()).wrap_err("connecting to mysql_info")?;
            Ok(Box::new(store))
        }
        None => Ok(Box::new(LoggingStatusStore)),
    }
}
