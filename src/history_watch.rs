//! Independent history-log tailer: cross-station latency/threshold summary
//! and status-store upsert, run as its own process.
//!
//! Grounded on `watch_threshold_monitor.py`: glob `outputdir` for
//! `*_latency.csv`/`*_threshold.csv`, tail each under the shared advisory
//! lock, pick the highest-`value` threshold row per station (ties broken by
//! insertion order, same as the Python's `sort_values('value')` + last-row
//! pick), and apply the same rising-edge-plus-cooldown late-data rule as the
//! worker's own [`crate::latency::LatencyTracker`].

use crate::history_log::{self, HistoryLog, LATENCY_HEADER, THRESHOLD_HEADER};
use crate::status_store::StatusStore;
use hifitime::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::warn;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("reading output directory {0:?}: {1}")]
    ReadDir(PathBuf, #[source] std::io::Error),
    #[error(transparent)]
    Log(#[from] history_log::Error),
    #[error(transparent)]
    Status(#[from] crate::status_store::Error),
}

#[derive(Debug, Clone, Default)]
pub struct WatchSummary {
    pub stations_seen: usize,
    pub late_stations: Vec<String>,
}

struct LatencyRow {
    station: String,
    seconds_ago: f64,
}

struct ThresholdRow {
    station: String,
    value: f64,
    band: String,
}

/// Tails every `{station}_latency.csv`/`{station}_threshold.csv` pair under
/// `output_dir` once per [`tick`](Self::tick), independent of any worker
/// process, exactly per spec.md's "separate process" requirement.
pub struct HistoryWatcher {
    output_dir: PathBuf,
    maximum_latency: f64,
    latency_alarm_timeout: Duration,
    seconds_to_keep: f64,
    last_latency: f64,
    last_alarm_at: Option<Epoch>,
    status_store: Box<dyn StatusStore + Send>,
}

impl HistoryWatcher {
    pub fn new(
        output_dir: PathBuf,
        maximum_latency: f64,
        latency_alarm_timeout: Duration,
        seconds_to_keep: f64,
        status_store: Box<dyn StatusStore + Send>,
    ) -> Self {
        Self {
            output_dir,
            maximum_latency,
            latency_alarm_timeout,
            seconds_to_keep,
            last_latency: 0.0,
            last_alarm_at: None,
            status_store,
        }
    }

    /// One scan-and-upsert pass. Missing or empty log files are silently
    /// skipped (a worker that hasn't produced any data yet is not an error
    /// here).
    pub fn tick(&mut self, now: Epoch) -> Result<WatchSummary, Error> {
        let latency_rows = self.read_latency_rows(now)?;
        let threshold_rows = self.read_threshold_rows()?;

        let mut late_stations = Vec::new();
        let mut max_latency_this_tick: f64 = 0.0;
        for row in &latency_rows {
            if row.seconds_ago > self.maximum_latency && row.seconds_ago > self.last_latency + 0.5 {
                late_stations.push(row.station.clone());
                max_latency_this_tick = max_latency_this_tick.max(row.seconds_ago);
            }
        }
        if !late_stations.is_empty() {
            let can_alarm = match self.last_alarm_at {
                None => true,
                Some(last) => (now - last).to_seconds() >= self.latency_alarm_timeout.to_seconds(),
            };
            if can_alarm {
                self.last_alarm_at = Some(now);
                warn!(stations = ?late_stations, "late data detected by history watcher");
            }
        }
        self.last_latency = max_latency_this_tick;

        let mut stations: Vec<String> = latency_rows.iter().map(|r| r.station.clone()).collect();
        stations.extend(threshold_rows.iter().map(|r| r.station.clone()));
        stations.sort();
        stations.dedup();

        for station in &stations {
            let band = threshold_rows
                .iter()
                .filter(|r| &r.station == station)
                .max_by(|a, b| a.value.partial_cmp(&b.value).unwrap())
                .map(|r| r.band.clone());
            if let Some(band) = band {
                let mut flags = BTreeMap::new();
                flags.insert(band.clone(), true);
                let system_status = band != crate::threshold::OFF;
                self.status_store.update(station, &flags, system_status)?;
            }
        }

        Ok(WatchSummary { stations_seen: stations.len(), late_stations })
    }

    fn read_latency_rows(&self, now: Epoch) -> Result<Vec<LatencyRow>, Error> {
        let mut rows = Vec::new();
        for (station, path) in self.matching_files("_latency.csv")? {
            let log = HistoryLog::new(path, LATENCY_HEADER, self.seconds_to_keep);
            let tail = log.tail(1)?;
            let Some(line) = tail.last() else { continue };
            let fields: Vec<&str> = line.split(',').collect();
            let Some(end_str) = fields.get(4) else { continue };
            let Ok(end) = Epoch::from_str(end_str) else { continue };
            rows.push(LatencyRow { station, seconds_ago: (now - end).to_seconds() });
        }
        Ok(rows)
    }

    fn read_threshold_rows(&self) -> Result<Vec<ThresholdRow>, Error> {
        let mut rows = Vec::new();
        for (station, path) in self.matching_files("_threshold.csv")? {
            let log = HistoryLog::new(path, THRESHOLD_HEADER, self.seconds_to_keep);
            let tail = log.tail(3)?;
            let Some(line) = tail.last() else { continue };
            let fields: Vec<&str> = line.split(',').collect();
            let (Some(value_str), Some(band)) = (fields.get(5), fields.get(6)) else { continue };
            let Ok(value) = value_str.parse::<f64>() else { continue };
            rows.push(ThresholdRow { station, value, band: band.to_string() });
        }
        Ok(rows)
    }

    /// List `(station, path)` pairs for files in `output_dir` named
    /// `{station}{suffix}`.
    fn matching_files(&self, suffix: &str) -> Result<Vec<(String, PathBuf)>, Error> {
        let mut found = Vec::new();
        let entries = match std::fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(Error::ReadDir(self.output_dir.clone(), e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::ReadDir(self.output_dir.clone(), e))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if let Some(station) = name.strip_suffix(suffix) {
                found.push((station.to_string(), path));
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status_store::RecordingStatusStore;
    use std::sync::{Arc, Mutex};

    struct SharedStatusStore(Arc<Mutex<RecordingStatusStore>>);
    impl StatusStore for SharedStatusStore {
        fn update(&mut self, station: &str, band_flags: &BTreeMap<String, bool>, system_status: bool) -> Result<(), crate::status_store::Error> {
            self.0.lock().unwrap().update(station, band_flags, system_status)
        }
    }

    fn write_latency(dir: &tempfile::TempDir, station: &str, end: Epoch) {
        let log = HistoryLog::new(dir.path().join(format!("{station}_latency.csv")), LATENCY_HEADER, 60.0);
        log.append(&format!("1,AK.{station}.--.HNZ,{end},{end},{end},0.1,1.0")).unwrap();
    }

    fn write_threshold(dir: &tempfile::TempDir, station: &str, value: f64, band: &str) {
        let log = HistoryLog::new(dir.path().join(format!("{station}_threshold.csv")), THRESHOLD_HEADER, 60.0);
        log.append(&format!("1,AK.{station}.--.HNZ,t0,t0,t0,{value:.6},{band}")).unwrap();
    }

    #[test]
    fn tick_upserts_status_for_every_station_with_a_threshold_row() {
        let dir = tempfile::tempdir().unwrap();
        let now = Epoch::from_unix_seconds(1000.0);
        write_latency(&dir, "VMT", now - 1.0.seconds());
        write_threshold(&dir, "VMT", 1.5, "MEDIUM");

        let store = Arc::new(Mutex::new(RecordingStatusStore::default()));
        let mut watcher = HistoryWatcher::new(
            dir.path().to_path_buf(),
            10.0,
            60.0.seconds(),
            60.0,
            Box::new(SharedStatusStore(store.clone())),
        );
        let summary = watcher.tick(now).unwrap();
        assert_eq!(summary.stations_seen, 1);
        assert!(summary.late_stations.is_empty());

        let updates = store.lock().unwrap();
        assert_eq!(updates.updates.len(), 1);
        assert_eq!(updates.updates[0].0, "VMT");
        assert!(updates.updates[0].1.contains_key("MEDIUM"));
        assert!(updates.updates[0].2, "MEDIUM band means system status is on");
    }

    #[test]
    fn stale_latency_row_is_flagged_late() {
        let dir = tempfile::tempdir().unwrap();
        let now = Epoch::from_unix_seconds(1000.0);
        write_latency(&dir, "VMT", now - 500.0.seconds());

        let store = Arc::new(Mutex::new(RecordingStatusStore::default()));
        let mut watcher = HistoryWatcher::new(
            dir.path().to_path_buf(),
            10.0,
            60.0.seconds(),
            60.0,
            Box::new(SharedStatusStore(store)),
        );
        let summary = watcher.tick(now).unwrap();
        assert_eq!(summary.late_stations, vec!["VMT".to_string()]);
    }

    #[test]
    fn missing_output_dir_is_not_an_error() {
        let store = RecordingStatusStore::default();
        let mut watcher = HistoryWatcher::new(
            PathBuf::from("/no/such/directory/quakewatch-test"),
            10.0,
            60.0.seconds(),
            60.0,
            Box::new(store),
        );
        let summary = watcher.tick(Epoch::from_unix_seconds(0.0)).unwrap();
        assert_eq!(summary.stations_seen, 0);
    }

    #[test]
    fn off_band_yields_system_status_false() {
        let dir = tempfile::tempdir().unwrap();
        write_threshold(&dir, "PS04", 0.05, crate::threshold::OFF);
        let store = Arc::new(Mutex::new(RecordingStatusStore::default()));
        let mut watcher = HistoryWatcher::new(
            dir.path().to_path_buf(),
            10.0,
            60.0.seconds(),
            60.0,
            Box::new(SharedStatusStore(store.clone())),
        );
        watcher.tick(Epoch::from_unix_seconds(0.0)).unwrap();
        assert!(!store.lock().unwrap().updates[0].2);
    }
}
