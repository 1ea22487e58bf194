//! Coalesce single-channel packets from a per-channel-packet source into
//! one multi-trace [`Packet`] per station.
//!
//! Ported from `orb2obspy.py::group_packets_by_time`, including the
//! three-stale-packets flush branch: see DESIGN.md for why that branch is
//! kept as-specified rather than redesigned.

use crate::packet::{Packet, Trace};
use hifitime::prelude::*;

/// Accumulation state machine for one station's packet stream.
pub struct PacketGrouper {
    seconds_per_packet: f64,
    building: Vec<Trace>,
    first_time: Option<Epoch>,
    stale: Vec<Trace>,
    stale_run: usize,
}

impl PacketGrouper {
    pub fn new(seconds_per_packet: f64) -> Self {
        Self {
            seconds_per_packet,
            building: Vec::new(),
            first_time: None,
            stale: Vec::new(),
            stale_run: 0,
        }
    }

    /// Feed one single-channel trace. Returns `Some(packet)` when a bundle
    /// is ready: either the building group reached 3 channels, a too-new
    /// packet closed it out, or 3 stale packets in a row forced a flush.
    pub fn push(&mut self, trace: Trace) -> Option<Packet> {
        let half = self.seconds_per_packet / 2.0;

        let Some(first) = self.first_time else {
            self.first_time = Some(trace.start);
            self.building.push(trace);
            return None;
        };

        let dt = (trace.start - first).to_seconds();
        if dt.abs() <= half {
            self.building.push(trace);
            if self.building.len() >= 3 {
                return Some(self.flush_building());
            }
            None
        } else if dt > half {
            let completed = if self.building.is_empty() {
                None
            } else {
                Some(Packet {
                    traces: std::mem::take(&mut self.building),
                })
            };
            self.first_time = Some(trace.start);
            self.building.push(trace);
            self.stale.clear();
            self.stale_run = 0;
            completed
        } else {
            self.stale.push(trace);
            self.stale_run += 1;
            if self.stale_run >= 3 {
                tracing::warn!(
                    station_packets = self.stale.len(),
                    "grouping: flushing stale bundle after three consecutive stale packets; \
                     the in-progress bundle is kept building for the next call and may mix epochs"
                );
                let bundle = Packet {
                    traces: std::mem::take(&mut self.stale),
                };
                self.stale_run = 0;
                return Some(bundle);
            }
            None
        }
    }

    fn flush_building(&mut self) -> Packet {
        self.stale.clear();
        self.stale_run = 0;
        let traces = std::mem::take(&mut self.building);
        self.first_time = None;
        Packet { traces }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_id::StreamId;

    fn trace(channel: &str, start_secs: f64) -> Trace {
        let start = Epoch::from_unix_seconds(start_secs);
        Trace::new(
            StreamId::new("AK", "VMT", "--", channel),
            start,
            0.01.seconds(),
            vec![0.0; 10],
            start,
        )
    }

    #[test]
    fn three_same_time_channels_flush_a_bundle() {
        let mut g = PacketGrouper::new(1.0);
        assert!(g.push(trace("HNZ", 0.0)).is_none());
        assert!(g.push(trace("HNN", 0.01)).is_none());
        let bundle = g.push(trace("HNE", 0.02)).expect("third channel flushes");
        assert_eq!(bundle.traces.len(), 3);
    }

    #[test]
    fn too_new_packet_closes_out_partial_bundle() {
        let mut g = PacketGrouper::new(1.0);
        assert!(g.push(trace("HNZ", 0.0)).is_none());
        let bundle = g.push(trace("HNN", 5.0)).expect("too-new packet closes partial bundle");
        assert_eq!(bundle.traces.len(), 1);
    }

    #[test]
    fn three_stale_packets_force_a_flush() {
        let mut g = PacketGrouper::new(1.0);
        g.push(trace("HNZ", 10.0));
        assert!(g.push(trace("HNN", 8.0)).is_none());
        assert!(g.push(trace("HNE", 8.0)).is_none());
        let bundle = g.push(trace("HHZ", 8.0)).expect("third stale packet flushes");
        assert_eq!(bundle.traces.len(), 3);
    }
}
