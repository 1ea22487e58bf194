//! Station-pattern expansion and the one-thread-per-station worker pool.
//!
//! Grounded on `threshold_monitor.py`'s `parse_station_matches`/`run_parallel`
//! and styled on the teacher's `main.rs` `thread_spawn!` macro, minus
//! `core_affinity`: this system has no NUMA/FPGA locality requirement, so
//! workers are plain named `std::thread`s rather than pinned to specific
//! cores.

use crate::stream_id::station_matches;
use crate::worker::WorkerReport;
use tracing::{error, info};

/// Expand a (possibly wildcarded) station pattern against the configured
/// station names, sorted for deterministic dispatch order.
pub fn expand_stations(pattern: &str, configured: &[String]) -> Vec<String> {
    let mut matched: Vec<String> = configured
        .iter()
        .filter(|station| station_matches(pattern, station))
        .cloned()
        .collect();
    matched.sort();
    matched.dedup();
    matched
}

/// Spawn one worker thread per station in `stations`, running `make_worker`
/// to build and drive each one, then join all of them and collect their
/// reports. A worker that returns `Err` or panics is logged and simply
/// omitted from the result; it never aborts its siblings.
pub fn run<F>(stations: Vec<String>, make_worker: F) -> Vec<WorkerReport>
where
    F: Fn(&str) -> eyre::Result<WorkerReport> + Send + Sync + 'static,
{
    let make_worker = std::sync::Arc::new(make_worker);
    let handles: Vec<_> = stations
        .into_iter()
        .map(|station| {
            let make_worker = make_worker.clone();
            std::thread::Builder::new()
                .name(format!("worker-{station}"))
                .spawn(move || (station.clone(), make_worker(&station)))
                .expect("failed to spawn worker thread")
        })
        .collect();

    let mut reports = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok((station, Ok(report))) => {
                info!(station, packets = report.packets_processed, alarms = report.alarms_emitted, "worker finished");
                reports.push(report);
            }
            Ok((station, Err(e))) => {
                error!(station, error = %e, "worker exited with an error");
            }
            Err(_) => {
                error!("worker thread panicked");
            }
        }
    }
    reports
}
