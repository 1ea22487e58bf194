//! Pull-based archive/realtime query source.
//!
//! Ported from `datascope2obspy.py::DatascopeClient.nextpacket2Stream`: in
//! archive mode an empty window advances the cursor rather than blocking;
//! in realtime mode the caller (the Worker's Acquiring loop) retries.

use super::{Error, PacketSource, StreamIdPattern};
use crate::packet::{Packet, Trace};
use hifitime::prelude::*;

/// Injectable waveform backend. A real implementation would talk to a
/// time-series archive or live server; tests supply an in-memory fixture.
pub trait WaveformIndex {
    fn query(&mut self, pattern: &StreamIdPattern, start: Epoch, end: Epoch) -> Result<Vec<Trace>, Error>;
}

pub struct QuerySource<B: WaveformIndex> {
    backend: B,
    pattern: Option<StreamIdPattern>,
    seconds_per_packet: f64,
    cursor: Epoch,
    /// `None` means realtime (never advances past "now" on its own).
    archive_end: Option<Epoch>,
}

impl<B: WaveformIndex> QuerySource<B> {
    pub fn new(backend: B, start: Epoch, archive_end: Option<Epoch>, seconds_per_packet: f64) -> Self {
        Self {
            backend,
            pattern: None,
            seconds_per_packet,
            cursor: start,
            archive_end,
        }
    }

    fn archive_mode(&self) -> bool {
        self.archive_end.is_some()
    }
}

impl<B: WaveformIndex> PacketSource for QuerySource<B> {
    fn select(&mut self, pattern: StreamIdPattern) {
        self.pattern = Some(pattern);
    }

    fn next_packet(&mut self, starttime_hint: Option<Epoch>) -> Result<Packet, Error> {
        let pattern = self
            .pattern
            .clone()
            .ok_or_else(|| Error::Transient("no pattern selected".to_string()))?;
        let start = starttime_hint.unwrap_or(self.cursor);
        let end = start + self.seconds_per_packet.seconds();

        let mut traces = self.backend.query(&pattern, start, end).map_err(|e| {
            tracing::warn!(error = %e, "transient source error, will retry");
            e
        })?;

        let realtime = !self.archive_mode();
        for tr in traces.iter_mut() {
            tr.sanitize(realtime);
        }
        let mut packet = Packet { traces };
        packet.drop_non_finite_traces();

        if packet.is_empty() {
            if self.archive_mode() {
                self.cursor = self.cursor + self.seconds_per_packet.seconds();
            }
            return Err(Error::NoData);
        }

        self.cursor = start + self.seconds_per_packet.seconds();
        Ok(packet)
    }

    fn close(&mut self) {}
}
