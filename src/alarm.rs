//! Highest-value-wins alarm selection, cooldown/escalation suppression, and
//! best-effort side effects.
//!
//! Grounded on `threshold_monitor.py::thresholddetections2alarms`/
//! `send_alarm`.

use crate::history_log::HistoryLog;
use crate::notify::Notifier;
use crate::status_store::StatusStore;
use crate::threshold::{ThresholdBandSet, ThresholdDetection};
use hifitime::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
struct AlarmState {
    last_band: Option<String>,
    last_value: f64,
    last_peak_time: Option<Epoch>,
    last_alarm_at: Option<Epoch>,
}

/// Per-station alarm suppression and best-effort fan-out to the alarm
/// history log, an on-disk artifact, the notifier, and the status store.
pub struct AlarmDispatcher {
    station: String,
    bands: ThresholdBandSet,
    threshold_alarm_timeout: Duration,
    output_dir: PathBuf,
    state: AlarmState,
    recipients: Vec<String>,
}

impl AlarmDispatcher {
    pub fn new(
        station: impl Into<String>,
        bands: ThresholdBandSet,
        threshold_alarm_timeout: Duration,
        output_dir: impl Into<PathBuf>,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            station: station.into(),
            bands,
            threshold_alarm_timeout,
            output_dir: output_dir.into(),
            state: AlarmState::default(),
            recipients,
        }
    }

    fn band_level(&self, band: &str) -> f64 {
        self.bands.get(band).copied().unwrap_or(f64::NEG_INFINITY)
    }

    /// Pick the highest-value detection and, unless suppressed, fire every
    /// side effect. Each side effect is isolated: a failure is logged and
    /// swallowed rather than aborting the others or propagating upward.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &mut self,
        detections: &[ThresholdDetection],
        now: Epoch,
        alarm_log: &HistoryLog,
        notifier: &dyn Notifier,
        status_store: &mut dyn StatusStore,
    ) {
        let Some(best) = detections.iter().max_by(|a, b| a.value.partial_cmp(&b.value).unwrap()) else {
            return;
        };

        let cooldown_elapsed = match self.state.last_alarm_at {
            None => true,
            Some(last) => (now - last).to_seconds() >= self.threshold_alarm_timeout.to_seconds(),
        };
        let escalated = best.value > self.state.last_value
            && self.band_level(&best.band) > self.state.last_band.as_deref().map(|b| self.band_level(b)).unwrap_or(f64::NEG_INFINITY);

        if !(cooldown_elapsed || escalated) {
            return;
        }

        self.state.last_alarm_at = Some(now);
        self.state.last_band = Some(best.band.clone());
        self.state.last_value = best.value;
        self.state.last_peak_time = Some(best.peak_time);

        if let Err(e) = alarm_log.append(&format!(
            "{},{},{},{},{}",
            best.stream, best.peak_time, best.value, best.band, self.station
        )) {
            tracing::warn!(error = %e, station = %self.station, "failed to append alarm history row");
        }

        let artifact_path = match write_alarm_artifact(&self.output_dir, &self.station, best.peak_time, &best.band, best.value) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, station = %self.station, "failed to write alarm artifact");
                None
            }
        };

        let subject = format!("{} threshold alarm: {}", self.station, best.band);
        let body = format!(
            "station={} stream={} band={} value={:.4} peak_time={}",
            self.station, best.stream, best.band, best.value, best.peak_time
        );
        if let Err(e) = notifier.send(&subject, &body, &self.recipients, artifact_path.as_deref()) {
            tracing::warn!(error = %e, station = %self.station, "failed to send alarm notification");
        }

        let mut flags: BTreeMap<String, bool> = self.bands.keys().map(|b| (b.clone(), b == &best.band)).collect();
        flags.entry(best.band.clone()).or_insert(true);
        if let Err(e) = status_store.update(&self.station, &flags, true) {
            tracing::warn!(error = %e, station = %self.station, "failed to update status store");
        }
    }
}

fn write_alarm_artifact(dir: &Path, station: &str, peak_time: Epoch, band: &str, value: f64) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("alarm_{peak_time}_{station}_{band}.txt"));
    std::fs::write(&path, format!("station={station}\npeak_time={peak_time}\nband={band}\nvalue={value:.6}\n"))?;
    Ok(path)
}
