//! Concrete, file-backed [`WaveformIndex`] for [`QuerySource`](super::query::QuerySource).
//!
//! This is the crate's stand-in for `datascope2obspy.py::DatascopeClient`
//! (a local archive reader) without claiming any particular production
//! database format: it reads a flat JSON array of pre-cut trace windows,
//! keyed by station pattern and start time, from the path named by
//! `Config::datasource`.

use super::query::WaveformIndex;
use super::{Error, StreamIdPattern};
use crate::packet::Trace;
use crate::stream_id::{station_matches, StreamId};
use hifitime::prelude::*;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct ArchivedWindow {
    network: String,
    station: String,
    location: String,
    channel: String,
    start_unix_seconds: f64,
    delta_seconds: f64,
    samples: Vec<f64>,
    #[serde(default)]
    load_offset_seconds: f64,
}

/// Every window this archive file holds, loaded once at startup.
pub struct JsonFileWaveformIndex {
    windows: Vec<ArchivedWindow>,
}

impl JsonFileWaveformIndex {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Transient(format!("reading archive file {path:?}: {e}")))?;
        let windows: Vec<ArchivedWindow> = serde_json::from_str(&text)
            .map_err(|e| Error::Transient(format!("parsing archive file {path:?}: {e}")))?;
        Ok(Self { windows })
    }
}

impl WaveformIndex for JsonFileWaveformIndex {
    fn query(&mut self, pattern: &StreamIdPattern, start: Epoch, end: Epoch) -> Result<Vec<Trace>, Error> {
        let mut traces = Vec::new();
        for window in &self.windows {
            if !station_matches(&pattern.network, &window.network)
                || !station_matches(&pattern.station, &window.station)
                || !station_matches(&pattern.location, &window.location)
                || !station_matches(&pattern.channel, &window.channel)
            {
                continue;
            }
            let window_start = Epoch::from_unix_seconds(window.start_unix_seconds);
            if window_start < start || window_start >= end {
                continue;
            }
            let id = StreamId::new(window.network.clone(), window.station.clone(), window.location.clone(), window.channel.clone());
            let delta = window.delta_seconds.seconds();
            let load_time = window_start + window.load_offset_seconds.seconds();
            traces.push(Trace::new(id, window_start, delta, window.samples.clone(), load_time));
        }
        Ok(traces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pattern() -> StreamIdPattern {
        StreamIdPattern { network: "AK".into(), station: "VMT".into(), location: "--".into(), channel: "HNZ".into() }
    }

    #[test]
    fn loads_and_matches_a_window_inside_the_query_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"[{{"network":"AK","station":"VMT","location":"--","channel":"HNZ","start_unix_seconds":0.0,"delta_seconds":0.01,"samples":[0.1,0.2]}}]"#
        )
        .unwrap();
        let mut index = JsonFileWaveformIndex::load(file.path()).unwrap();
        let traces = index.query(&pattern(), Epoch::from_unix_seconds(0.0), Epoch::from_unix_seconds(1.0)).unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].samples, vec![0.1, 0.2]);
    }

    #[test]
    fn window_outside_range_is_not_returned() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"[{{"network":"AK","station":"VMT","location":"--","channel":"HNZ","start_unix_seconds":5.0,"delta_seconds":0.01,"samples":[0.1]}}]"#
        )
        .unwrap();
        let mut index = JsonFileWaveformIndex::load(file.path()).unwrap();
        let traces = index.query(&pattern(), Epoch::from_unix_seconds(0.0), Epoch::from_unix_seconds(1.0)).unwrap();
        assert!(traces.is_empty());
    }

    #[test]
    fn wildcard_station_pattern_matches() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"[{{"network":"AK","station":"PS04","location":"--","channel":"HNZ","start_unix_seconds":0.0,"delta_seconds":0.01,"samples":[1.0]}}]"#
        )
        .unwrap();
        let mut index = JsonFileWaveformIndex::load(file.path()).unwrap();
        let mut pattern = pattern();
        pattern.station = "PS??".to_string();
        let traces = index.query(&pattern, Epoch::from_unix_seconds(0.0), Epoch::from_unix_seconds(1.0)).unwrap();
        assert_eq!(traces.len(), 1);
    }
}
