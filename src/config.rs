//! serde/toml configuration loading, CLI-override merge, and the
//! g-level -> m/s^2 threshold conversion.
//!
//! Grounded on `data_ingestion.py::get_params` (archive/realtime mode
//! derivation from `endtime`, CLI-overrides-file merge) and
//! `threshold_monitor.py::MyDataClient.__init__` (g-level conversion).

use crate::dsp::{FilterKind, FilterSpec};
use crate::errors::FatalError;
use crate::threshold::ThresholdBandSet;
use hifitime::prelude::*;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Standard gravity, m/s^2. Threshold g-levels are multiplied by this at
/// load time (spec.md section 6).
pub const G: f64 = 9.80665;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Api {
    Query,
    Broker,
    Stream,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterDefConfig {
    pub kind: String,
    /// `freq[1]` is only read when `kind == "bandpass"`.
    pub freq: Vec<f64>,
    #[serde(default = "default_filter_order")]
    pub order: usize,
    #[serde(default)]
    pub zerophase: bool,
}

fn default_filter_order() -> usize {
    4
}

impl FilterDefConfig {
    pub fn to_spec(&self, sample_rate_hz: f64) -> FilterSpec {
        let kind = match self.kind.to_lowercase().as_str() {
            "highpass" => FilterKind::Highpass,
            "lowpass" => FilterKind::Lowpass,
            _ => FilterKind::Bandpass,
        };
        let freqs = [
            self.freq.first().copied().unwrap_or(0.0),
            self.freq.get(1).copied().unwrap_or(0.0),
        ];
        FilterSpec::new(kind, self.order, freqs, sample_rate_hz, self.zerophase)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MysqlInfo {
    pub user: String,
    pub password: String,
    pub host: String,
    pub database: String,
}

impl MysqlInfo {
    pub fn url(&self) -> String {
        format!("mysql://{}:{}@{}/{}", self.user, self.password, self.host, self.database)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub nslc: String,
    pub api: Api,
    #[serde(default)]
    pub datasource: String,
    #[serde(default)]
    pub xmlfile: Option<PathBuf>,
    /// station -> band -> g-level as a decimal string.
    pub thresholds: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub filterdef: Option<FilterDefConfig>,
    #[serde(default = "default_buffer_secs")]
    pub buffer_secs: f64,
    #[serde(default = "default_seconds_per_packet")]
    pub seconds_per_packet: f64,
    #[serde(default = "default_maximum_latency")]
    pub maximum_latency: f64,
    #[serde(default = "default_latency_alarm_timeout")]
    pub latency_alarm_timeout: f64,
    #[serde(default = "default_threshold_alarm_timeout")]
    pub threshold_alarm_timeout: f64,
    #[serde(default = "default_response_update_interval")]
    pub response_update_interval: f64,
    #[serde(default)]
    pub remove_instrument_response: bool,
    #[serde(default)]
    pub email_list: Vec<String>,
    #[serde(default = "default_outputdir")]
    pub outputdir: PathBuf,
    #[serde(default)]
    pub mysql_info: Option<MysqlInfo>,
    #[serde(default)]
    pub starttime: Option<String>,
    #[serde(default)]
    pub endtime: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default = "default_seconds_to_keep")]
    pub seconds_to_keep: f64,
}

fn default_buffer_secs() -> f64 {
    0.0
}
fn default_seconds_per_packet() -> f64 {
    1.0
}
fn default_maximum_latency() -> f64 {
    10.0
}
fn default_latency_alarm_timeout() -> f64 {
    60.0
}
fn default_threshold_alarm_timeout() -> f64 {
    300.0
}
fn default_response_update_interval() -> f64 {
    600.0
}
fn default_outputdir() -> PathBuf {
    PathBuf::from(".")
}
fn default_seconds_to_keep() -> f64 {
    60.0
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, FatalError> {
        let text = std::fs::read_to_string(path).map_err(|e| FatalError::ConfigRead(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| FatalError::ConfigParse(path.to_path_buf(), Box::new(e)))
    }

    /// Merge CLI overrides (anything `Some`/non-default on `overrides` wins
    /// over the file value), mirroring `get_params`'s CLI-overrides-file
    /// behaviour.
    pub fn merge_cli(mut self, overrides: &crate::args::CliOverrides) -> Self {
        if let Some(nslc) = &overrides.nslc {
            self.nslc = nslc.clone();
        }
        if let Some(outputdir) = &overrides.output_dir {
            self.outputdir = outputdir.clone();
        }
        if let Some(start) = &overrides.start_time {
            self.starttime = Some(start.clone());
        }
        if let Some(end) = &overrides.end_time {
            self.endtime = Some(end.clone());
        }
        if overrides.latency_off {
            self.maximum_latency = 0.0;
        }
        self
    }

    /// Resolve the list of configured station names (the keys of
    /// `thresholds`), sorted for deterministic iteration.
    pub fn configured_stations(&self) -> Vec<String> {
        let mut stations: Vec<String> = self.thresholds.keys().cloned().collect();
        stations.sort();
        stations
    }

    /// The station portion of `nslc`, e.g. `AK.PS??.--.HN?` -> `PS??`.
    pub fn station_pattern(&self) -> &str {
        self.nslc.split('.').nth(1).unwrap_or(&self.nslc)
    }

    /// g-level strings, multiplied by [`G`] and uppercased into a
    /// [`ThresholdBandSet`], for one station.
    pub fn resolved_bands(&self, station: &str) -> Result<ThresholdBandSet, FatalError> {
        let raw = self.thresholds.get(station).cloned().unwrap_or_default();
        let mut bands = ThresholdBandSet::new();
        for (band, value) in raw {
            let g: f64 = value.trim().parse().map_err(|source| FatalError::BadThresholdLevel {
                station: station.to_string(),
                band: band.clone(),
                value: value.clone(),
                source,
            })?;
            bands.insert(band.to_uppercase(), g * G);
        }
        Ok(bands)
    }

    pub fn start_epoch(&self) -> Epoch {
        self.starttime
            .as_deref()
            .and_then(|s| Epoch::from_str(s).ok())
            .unwrap_or_else(Epoch::now_or_unix_epoch)
    }

    /// `endtime` resolves from an explicit value, or `starttime + duration`,
    /// or +infinity (represented as the far future) if neither is given.
    pub fn end_epoch(&self) -> Epoch {
        if let Some(end) = self.endtime.as_deref().and_then(|s| Epoch::from_str(s).ok()) {
            return end;
        }
        if let Some(duration) = self.duration {
            return self.start_epoch() + duration.seconds();
        }
        Epoch::from_unix_seconds(i64::MAX as f64 / 2.0)
    }

    /// Archive mode if `endtime` already lies in the past; realtime
    /// otherwise (spec.md section 4.7 / section 9).
    pub fn is_archive(&self, now: Epoch) -> bool {
        self.end_epoch() < now
    }
}

trait EpochNowFallback {
    fn now_or_unix_epoch() -> Epoch;
}

impl EpochNowFallback for Epoch {
    fn now_or_unix_epoch() -> Epoch {
        Epoch::now().unwrap_or(Epoch::from_unix_seconds(0.0))
    }
}
