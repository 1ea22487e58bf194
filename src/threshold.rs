//! Peak-ground-acceleration computation and threshold-band classification.
//!
//! Grounded on `threshold_monitor.py::thresholdHistory` and
//! `MyDataClient.computePGA`/`PGA2thresholddetections`.

use crate::history_log::HistoryLog;
use crate::packet::Trace;
use crate::stream_id::StreamId;
use hifitime::prelude::*;
use std::collections::{BTreeMap, VecDeque};

/// Band label -> level in m/s². Compared by numeric level, never by
/// insertion/iteration order.
pub type ThresholdBandSet = BTreeMap<String, f64>;

pub const OFF: &str = "OFF";

/// `peak = max(|x|)`, `peak_time = start + argmax * delta`.
pub fn compute_pga(trace: &Trace) -> (f64, Epoch) {
    let mut peak = 0.0;
    let mut peak_idx = 0usize;
    for (i, &s) in trace.samples.iter().enumerate() {
        let abs = s.abs();
        if abs > peak {
            peak = abs;
            peak_idx = i;
        }
    }
    (peak, trace.start + trace.delta * peak_idx as f64)
}

/// The numerically greatest level `v` with `peak > v`; `OFF` if none.
pub fn classify(peak: f64, bands: &ThresholdBandSet) -> String {
    bands
        .iter()
        .filter(|(_, &level)| peak > level)
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .map(|(label, _)| label.clone())
        .unwrap_or_else(|| OFF.to_string())
}

#[derive(Debug, Clone)]
pub struct ThresholdRow {
    pub rownum: u64,
    pub stream: StreamId,
    pub start: Epoch,
    pub end: Epoch,
    pub peak_time: Epoch,
    pub peak_value: f64,
    pub band: String,
}

#[derive(Debug, Clone)]
pub struct ThresholdDetection {
    pub stream: StreamId,
    pub peak_time: Epoch,
    pub value: f64,
    pub band: String,
}

/// Per-stream rolling history plus upward-transition-only detection.
pub struct ThresholdHistory {
    window_seconds: f64,
    rownum: u64,
    rows: VecDeque<ThresholdRow>,
    last_band: Option<String>,
    last_value: f64,
}

impl ThresholdHistory {
    pub fn new(window_seconds: f64) -> Self {
        Self {
            window_seconds,
            rownum: 0,
            rows: VecDeque::new(),
            last_band: None,
            last_value: f64::NEG_INFINITY,
        }
    }

    /// Appends a history row unconditionally, both in memory and to `log`
    /// (a lock-timeout here is fatal to the worker, per the log-contention
    /// handling spec.md section 7 lays out); emits a [`ThresholdDetection`]
    /// only on a strictly upward transition (value up AND band changed). An
    /// `OFF` classification always resets the per-stream memory.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        stream: &StreamId,
        start: Epoch,
        end: Epoch,
        peak_time: Epoch,
        peak_value: f64,
        bands: &ThresholdBandSet,
        log: &HistoryLog,
    ) -> Result<Option<ThresholdDetection>, crate::history_log::Error> {
        let band = classify(peak_value, bands);

        self.rownum += 1;
        log.append(&format!(
            "{},{},{},{},{},{:.6},{}",
            self.rownum, stream, start, end, peak_time, peak_value, band
        ))?;
        self.rows.push_back(ThresholdRow {
            rownum: self.rownum,
            stream: stream.clone(),
            start,
            end,
            peak_time,
            peak_value,
            band: band.clone(),
        });
        self.trim(end);

        let detection = if band != OFF {
            let upward = peak_value > self.last_value && self.last_band.as_deref() != Some(band.as_str());
            upward.then(|| ThresholdDetection {
                stream: stream.clone(),
                peak_time,
                value: peak_value,
                band: band.clone(),
            })
        } else {
            None
        };

        if band == OFF {
            self.last_band = None;
            self.last_value = f64::NEG_INFINITY;
        } else {
            self.last_band = Some(band);
            self.last_value = peak_value;
        }

        Ok(detection)
    }

    fn trim(&mut self, now: Epoch) {
        while let Some(front) = self.rows.front() {
            if (now - front.end).to_seconds() > self.window_seconds {
                self.rows.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &ThresholdRow> {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_id::StreamId;
    use tempfile::tempdir;

    fn bands() -> ThresholdBandSet {
        let mut b = ThresholdBandSet::new();
        b.insert("HIGH".to_string(), 2.0);
        b.insert("LOW".to_string(), 0.5);
        b.insert("MEDIUM".to_string(), 1.0);
        b
    }

    fn id() -> StreamId {
        StreamId::new("AK", "VMT", "--", "HNZ")
    }

    fn log(dir: &tempfile::TempDir) -> HistoryLog {
        HistoryLog::new(dir.path().join("threshold.csv"), crate::history_log::THRESHOLD_HEADER, 60.0)
    }

    #[test]
    fn classify_picks_numerically_greatest_level_not_insertion_order() {
        assert_eq!(classify(1.5, &bands()), "MEDIUM");
        assert_eq!(classify(0.1, &bands()), OFF);
        assert_eq!(classify(3.0, &bands()), "HIGH");
    }

    #[test]
    fn pga_finds_peak_and_its_time() {
        let start = Epoch::from_unix_seconds(0.0);
        let delta = 1.0.seconds();
        let tr = Trace::new(id(), start, delta, vec![0.1, -0.9, 0.3], start);
        let (peak, peak_time) = compute_pga(&tr);
        assert!((peak - 0.9).abs() < 1e-9);
        assert_eq!(peak_time, start + delta);
    }

    #[test]
    fn upward_transition_required_for_detection() {
        let dir = tempdir().unwrap();
        let log = log(&dir);
        let mut hist = ThresholdHistory::new(60.0);
        let start = Epoch::from_unix_seconds(0.0);
        let end = start + 1.0.seconds();
        let d1 = hist.update(&id(), start, end, start, 0.6, &bands(), &log).unwrap();
        assert!(d1.is_some(), "first non-OFF classification should detect");
        let d2 = hist.update(&id(), start, end, start, 0.7, &bands(), &log).unwrap();
        assert!(d2.is_none(), "same band, no transition");
        let d3 = hist.update(&id(), start, end, start, 1.2, &bands(), &log).unwrap();
        assert!(d3.is_some(), "band increased and value increased");
    }

    #[test]
    fn off_resets_memory_so_next_nonoff_always_detects() {
        let dir = tempdir().unwrap();
        let log = log(&dir);
        let mut hist = ThresholdHistory::new(60.0);
        let start = Epoch::from_unix_seconds(0.0);
        let end = start + 1.0.seconds();
        hist.update(&id(), start, end, start, 1.5, &bands(), &log).unwrap();
        hist.update(&id(), start, end, start, 0.1, &bands(), &log).unwrap();
        let detection = hist.update(&id(), start, end, start, 0.6, &bands(), &log).unwrap();
        assert!(detection.is_some(), "memory was reset by the OFF reading");
    }

    #[test]
    fn higher_value_same_band_does_not_detect() {
        let dir = tempdir().unwrap();
        let log = log(&dir);
        let mut hist = ThresholdHistory::new(60.0);
        let start = Epoch::from_unix_seconds(0.0);
        let end = start + 1.0.seconds();
        hist.update(&id(), start, end, start, 1.1, &bands(), &log).unwrap();
        let detection = hist.update(&id(), start, end, start, 1.9, &bands(), &log).unwrap();
        assert!(detection.is_none(), "still MEDIUM, band unchanged");
    }
}
