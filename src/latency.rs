//! Per-trace arrival latency tracking with rising-edge alarm detection.
//!
//! Grounded on `data_ingestion.py::latency`.

use crate::history_log::HistoryLog;
use crate::packet::Packet;
use crate::stream_id::StreamId;
use hifitime::prelude::*;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct LatencyRow {
    pub rownum: u64,
    pub stream: StreamId,
    pub load_time: Epoch,
    pub start: Epoch,
    pub end: Epoch,
    pub latency: Duration,
    pub duration: Duration,
}

/// Result of feeding one packet to the tracker.
#[derive(Debug, Clone, Default)]
pub struct LatencyUpdate {
    /// Streams that are late in *this* packet (latency exceeds
    /// `maximum_latency` and grew by >= 0.5s), regardless of alarm cooldown.
    /// The Worker skips PGA analysis for the packet when this is non-empty.
    pub late_ids: Vec<StreamId>,
    /// The subset of `late_ids` that should actually raise an alarm right
    /// now, gated by `alarm_timeout`.
    pub alarm_ids: Vec<StreamId>,
}

impl LatencyUpdate {
    pub fn is_late(&self) -> bool {
        !self.late_ids.is_empty()
    }
}

/// Per-trace arrival latency, rolling history, and rising-edge late alarms.
///
/// Disabled entirely in archive mode (`enabled = false`), and inert when
/// `maximum_latency <= 0`.
pub struct LatencyTracker {
    maximum_latency_secs: f64,
    alarm_timeout: Duration,
    window_seconds: f64,
    enabled: bool,
    rownum: u64,
    rows: VecDeque<LatencyRow>,
    last_max_latency: HashMap<StreamId, f64>,
    last_alarm_at: Option<Epoch>,
}

impl LatencyTracker {
    pub fn new(maximum_latency_secs: f64, alarm_timeout: Duration, window_seconds: f64, enabled: bool) -> Self {
        Self {
            maximum_latency_secs,
            alarm_timeout,
            window_seconds,
            enabled,
            rownum: 0,
            rows: VecDeque::new(),
            last_max_latency: HashMap::new(),
            last_alarm_at: None,
        }
    }

    /// Records latency/duration for every trace in `packet`, both in memory
    /// and to `log` (a lock timeout there is fatal to the worker). `late_ids`
    /// reflects the raw per-packet rising-edge condition (used by the
    /// Worker to decide whether to skip PGA analysis); `alarm_ids` is the
    /// cooldown-gated subset that should actually page someone.
    pub fn update(&mut self, packet: &Packet, now: Epoch, log: &HistoryLog) -> Result<LatencyUpdate, crate::history_log::Error> {
        if !self.enabled || self.maximum_latency_secs <= 0.0 {
            return Ok(LatencyUpdate::default());
        }

        let mut late_ids = Vec::new();
        for trace in &packet.traces {
            let end = trace.end_time();
            let latency_secs = (trace.load_time - end).to_seconds();
            let duration_secs = (end - trace.start).to_seconds() + trace.delta.to_seconds();

            self.rownum += 1;
            log.append(&format!(
                "{},{},{},{},{},{:.6},{:.6}",
                self.rownum, trace.id, trace.load_time, trace.start, end, latency_secs, duration_secs
            ))?;
            self.rows.push_back(LatencyRow {
                rownum: self.rownum,
                stream: trace.id.clone(),
                load_time: trace.load_time,
                start: trace.start,
                end,
                latency: latency_secs.seconds(),
                duration: duration_secs.seconds(),
            });

            let prev_max = *self.last_max_latency.get(&trace.id).unwrap_or(&0.0);
            if latency_secs > self.maximum_latency_secs && latency_secs > prev_max + 0.5 {
                late_ids.push(trace.id.clone());
            }
            self.last_max_latency
                .insert(trace.id.clone(), prev_max.max(latency_secs));
        }

        self.trim(now);

        if late_ids.is_empty() {
            return Ok(LatencyUpdate::default());
        }

        let can_alarm = match self.last_alarm_at {
            None => true,
            Some(last) => (now - last).to_seconds() >= self.alarm_timeout.to_seconds(),
        };
        let alarm_ids = if can_alarm {
            self.last_alarm_at = Some(now);
            late_ids.clone()
        } else {
            Vec::new()
        };

        Ok(LatencyUpdate { late_ids, alarm_ids })
    }

    fn trim(&mut self, now: Epoch) {
        while let Some(front) = self.rows.front() {
            if (now - front.load_time).to_seconds() > self.window_seconds {
                self.rows.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &LatencyRow> {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Trace;
    use tempfile::tempdir;

    fn id() -> StreamId {
        StreamId::new("AK", "VMT", "--", "HNZ")
    }

    fn packet_with_latency(load_offset_secs: f64) -> Packet {
        let start = Epoch::from_unix_seconds(0.0);
        let delta = 1.0.seconds();
        let end = start + delta * 9.0;
        let load_time = end + load_offset_secs.seconds();
        Packet::single(Trace::new(id(), start, delta, vec![0.0; 10], load_time))
    }

    fn log(dir: &tempfile::TempDir) -> HistoryLog {
        HistoryLog::new(dir.path().join("latency.csv"), crate::history_log::LATENCY_HEADER, 60.0)
    }

    #[test]
    fn disabled_tracker_never_flags_late() {
        let dir = tempdir().unwrap();
        let log = log(&dir);
        let mut t = LatencyTracker::new(1.0, 30.0.seconds(), 60.0, false);
        let upd = t.update(&packet_with_latency(100.0), Epoch::from_unix_seconds(200.0), &log).unwrap();
        assert!(!upd.is_late());
        assert!(upd.alarm_ids.is_empty());
    }

    #[test]
    fn first_breach_of_maximum_latency_is_flagged() {
        let dir = tempdir().unwrap();
        let log = log(&dir);
        let mut t = LatencyTracker::new(1.0, 30.0.seconds(), 60.0, true);
        let upd = t.update(&packet_with_latency(5.0), Epoch::from_unix_seconds(200.0), &log).unwrap();
        assert_eq!(upd.late_ids.len(), 1);
        assert_eq!(upd.alarm_ids.len(), 1);
    }

    #[test]
    fn repeated_similar_latency_is_not_reflagged() {
        let dir = tempdir().unwrap();
        let log = log(&dir);
        let mut t = LatencyTracker::new(1.0, 0.0.seconds(), 60.0, true);
        t.update(&packet_with_latency(5.0), Epoch::from_unix_seconds(200.0), &log).unwrap();
        let upd = t.update(&packet_with_latency(5.1), Epoch::from_unix_seconds(210.0), &log).unwrap();
        assert!(!upd.is_late(), "latency grew by less than 0.5s, should not re-flag");
    }

    #[test]
    fn cooldown_suppresses_alarm_but_not_the_late_skip_signal() {
        let dir = tempdir().unwrap();
        let log = log(&dir);
        let mut t = LatencyTracker::new(1.0, 100.0.seconds(), 60.0, true);
        let first = t.update(&packet_with_latency(5.0), Epoch::from_unix_seconds(200.0), &log).unwrap();
        assert_eq!(first.alarm_ids.len(), 1);
        let second = t.update(&packet_with_latency(20.0), Epoch::from_unix_seconds(210.0), &log).unwrap();
        assert!(second.is_late(), "still late this packet, Worker should still skip analysis");
        assert!(second.alarm_ids.is_empty(), "within alarm_timeout, alarm itself should be suppressed");
    }

    #[test]
    fn maximum_latency_non_positive_disables_alarms() {
        let dir = tempdir().unwrap();
        let log = log(&dir);
        let mut t = LatencyTracker::new(0.0, 30.0.seconds(), 60.0, true);
        let upd = t.update(&packet_with_latency(999.0), Epoch::from_unix_seconds(1000.0), &log).unwrap();
        assert!(!upd.is_late());
    }
}
