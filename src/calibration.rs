//! Per-stream calibration lookup: gain, canonical units, sample rate.
//!
//! Grounded on `data_ingestion.py::calibrate_Stream`.

use crate::dsp;
use crate::stream_id::StreamId;
use hifitime::prelude::*;
use std::collections::HashMap;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no calibration record for stream {0}")]
    NotFound(StreamId),
    #[error("calibration catalogue refresh failed: {0}")]
    RefreshFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRecord {
    pub gain: f64,
    pub units: String,
    pub samprate: f64,
    pub updated_at: Epoch,
}

pub trait CalibrationProvider {
    /// Most recent record with `time <= at_time` (or the newest, if no
    /// time is given) wins.
    fn gain_for(&self, id: &StreamId, at_time: Option<Epoch>) -> Result<CalibrationRecord, Error>;

    /// Refresh the catalogue if older than `response_update_interval`, or
    /// on first use.
    fn refresh_if_stale(&mut self, now: Epoch) -> Result<(), Error>;

    /// Full instrument-response removal: recovers acceleration (m/s^2)
    /// directly rather than the plain scalar-gain calibration `gain_for`
    /// implies, mirroring `calib2obspy.py::remove_response`'s `output='ACC'`
    /// path. A velocity-unit record is differentiated after the scalar
    /// divide; an acceleration-unit record is left as-is. Stations whose
    /// catalogue entry carries neither unit are passed through unchanged,
    /// same as the scalar path would leave them.
    fn remove_response(
        &self,
        id: &StreamId,
        at_time: Option<Epoch>,
        delta_secs: f64,
        samples: &[f64],
    ) -> Result<(Vec<f64>, String), Error> {
        let rec = self.gain_for(id, at_time)?;
        let gain = if rec.gain != 0.0 { rec.gain } else { 1.0 };
        let scaled: Vec<f64> = samples.iter().map(|s| s / gain).collect();
        if rec.units == "m/s" {
            Ok((dsp::differentiate(&scaled, delta_secs), "m/s**2".to_string()))
        } else {
            Ok((scaled, rec.units))
        }
    }
}

/// Catalogue entry before unit-normalisation rules are applied.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RawCalibrationEntry {
    pub stream: String,
    pub gain: f64,
    pub units: String,
    pub samprate: f64,
    /// Calibration period in seconds; non-positive values are normalised to 1.0.
    #[serde(default)]
    pub calib_period_secs: f64,
    /// `V` (velocity) or `A` (acceleration), used only when `units` is blank.
    #[serde(default)]
    pub segtype: Option<String>,
    pub time_unix_secs: f64,
}

fn normalize(mut entry: RawCalibrationEntry) -> (StreamId, CalibrationRecord, f64) {
    if entry.units.contains("nm") {
        entry.gain /= 1e9;
        entry.units = entry.units.replace("nm", "m");
    }
    if entry.units.trim().is_empty() {
        entry.units = match entry.segtype.as_deref() {
            Some("V") => "m/s".to_string(),
            Some("A") => "m/s**2".to_string(),
            _ => entry.units,
        };
    }
    let calib_period = if entry.calib_period_secs <= 0.0 {
        1.0
    } else {
        entry.calib_period_secs
    };
    let id: StreamId = entry.stream.parse().unwrap_or_else(|_| StreamId::new("", &entry.stream, "", ""));
    (
        id,
        CalibrationRecord {
            gain: entry.gain,
            units: entry.units,
            samprate: entry.samprate,
            updated_at: Epoch::from_unix_seconds(entry.time_unix_secs),
        },
        calib_period,
    )
}

type Loader = Box<dyn Fn() -> Result<Vec<RawCalibrationEntry>, Error> + Send>;

/// A calibration provider backed by a reloadable, injectable table.
pub struct TableCalibrationProvider {
    records: HashMap<StreamId, Vec<CalibrationRecord>>,
    last_refresh: Option<Epoch>,
    response_update_interval: Duration,
    loader: Loader,
}

impl TableCalibrationProvider {
    pub fn new(response_update_interval: Duration, loader: Loader) -> Self {
        Self {
            records: HashMap::new(),
            last_refresh: None,
            response_update_interval,
            loader,
        }
    }

    fn load_table(&mut self, now: Epoch) -> Result<(), Error> {
        let raw = (self.loader)()?;
        let mut records: HashMap<StreamId, Vec<CalibrationRecord>> = HashMap::new();
        for entry in raw {
            let (id, record, _calib_period) = normalize(entry);
            records.entry(id).or_default().push(record);
        }
        for list in records.values_mut() {
            list.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        }
        self.records = records;
        self.last_refresh = Some(now);
        Ok(())
    }
}

impl CalibrationProvider for TableCalibrationProvider {
    fn gain_for(&self, id: &StreamId, at_time: Option<Epoch>) -> Result<CalibrationRecord, Error> {
        let list = self.records.get(id).ok_or_else(|| Error::NotFound(id.clone()))?;
        let chosen = match at_time {
            Some(t) => list.iter().filter(|r| r.updated_at <= t).next_back(),
            None => list.last(),
        };
        chosen.cloned().ok_or_else(|| Error::NotFound(id.clone()))
    }

    fn refresh_if_stale(&mut self, now: Epoch) -> Result<(), Error> {
        let stale = match self.last_refresh {
            None => true,
            Some(last) => (now - last) >= self.response_update_interval,
        };
        if stale {
            if let Err(e) = self.load_table(now) {
                tracing::warn!(error = %e, "calibration refresh failed; continuing with stale values");
                return Err(e);
            }
        }
        Ok(())
    }
}
