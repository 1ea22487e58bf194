//! Trace/Packet data model (§3 of the spec).

use crate::stream_id::StreamId;
use hifitime::prelude::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("trace {0} has no samples")]
    EmptyTrace(StreamId),
    #[error("multi-trace packet start times diverge beyond packet_seconds/2: {0} vs {1}")]
    StartTimeDivergence(Epoch, Epoch),
}

/// One channel's worth of samples sharing a start time and sample rate.
#[derive(Debug, Clone)]
pub struct Trace {
    pub id: StreamId,
    pub start: Epoch,
    pub delta: Duration,
    pub samples: Vec<f64>,
    /// Wall-clock instant this trace's packet arrived.
    pub load_time: Epoch,
    /// Scalar gain attached by the source, if any (counts -> physical units).
    pub gain: Option<f64>,
    pub units: Option<String>,
}

impl Trace {
    pub fn new(id: StreamId, start: Epoch, delta: Duration, samples: Vec<f64>, load_time: Epoch) -> Self {
        Self {
            id,
            start,
            delta,
            samples,
            load_time,
            gain: None,
            units: None,
        }
    }

    pub fn npts(&self) -> usize {
        self.samples.len()
    }

    /// `end_time = start_time + (npts - 1) * delta`.
    pub fn end_time(&self) -> Epoch {
        if self.samples.is_empty() {
            return self.start;
        }
        self.start + self.delta * (self.samples.len() as f64 - 1.0)
    }

    /// Trace duration including the span of the last sample, `end - start + delta`.
    pub fn duration(&self) -> Duration {
        self.end_time() - self.start + self.delta
    }

    pub fn sample_rate_hz(&self) -> f64 {
        let secs = self.delta.to_seconds();
        if secs > 0.0 {
            1.0 / secs
        } else {
            0.0
        }
    }

    /// Does this trace contain at least one finite sample?
    pub fn has_any_finite(&self) -> bool {
        self.samples.iter().any(|x| x.is_finite())
    }

    /// Median of the finite samples (NaN if none).
    fn finite_median(&self) -> f64 {
        let mut finite: Vec<f64> = self.samples.iter().copied().filter(|x| x.is_finite()).collect();
        if finite.is_empty() {
            return 0.0;
        }
        finite.sort_by(|a, b| a.total_cmp(b));
        let mid = finite.len() / 2;
        if finite.len() % 2 == 0 {
            (finite[mid - 1] + finite[mid]) / 2.0
        } else {
            finite[mid]
        }
    }

    /// Replace interior non-finite samples with the trace median; in
    /// realtime mode additionally trim trailing non-finite samples.
    ///
    /// Ported from `data_ingestion.py::updateCurrentPacket` /
    /// `datascope2obspy.py::nextpacket2Stream`.
    pub fn sanitize(&mut self, realtime: bool) {
        if realtime {
            while matches!(self.samples.last(), Some(x) if !x.is_finite()) {
                self.samples.pop();
            }
        }
        let median = self.finite_median();
        for x in self.samples.iter_mut() {
            if !x.is_finite() {
                *x = median;
            }
        }
    }

    /// Widen integer-typed counts into floating point at the source boundary.
    pub fn from_counts(
        id: StreamId,
        start: Epoch,
        delta: Duration,
        counts: &[i32],
        load_time: Epoch,
    ) -> Self {
        Self::new(
            id,
            start,
            delta,
            counts.iter().map(|&c| c as f64).collect(),
            load_time,
        )
    }
}

/// A bundle of one or more traces sharing an approximate start time.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub traces: Vec<Trace>,
}

impl Packet {
    pub fn new() -> Self {
        Self { traces: Vec::new() }
    }

    pub fn single(trace: Trace) -> Self {
        Self { traces: vec![trace] }
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Push a trace, enforcing the multi-trace start-time invariant:
    /// `|start_i - start_j| <= packet_seconds / 2`.
    pub fn push_trace(&mut self, trace: Trace, packet_seconds: f64) -> Result<(), Error> {
        if let Some(first) = self.traces.first() {
            let diff = (trace.start - first.start).to_seconds().abs();
            if diff > packet_seconds / 2.0 {
                return Err(Error::StartTimeDivergence(first.start, trace.start));
            }
        }
        self.traces.push(trace);
        Ok(())
    }

    /// Drop every trace containing no finite sample at all.
    pub fn drop_non_finite_traces(&mut self) {
        self.traces.retain(|tr| tr.has_any_finite());
    }

    pub fn min_start(&self) -> Option<Epoch> {
        self.traces.iter().map(|t| t.start).min()
    }

    pub fn max_end(&self) -> Option<Epoch> {
        self.traces.iter().map(|t| t.end_time()).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> StreamId {
        StreamId::new("AK", "VMT", "--", "HNZ")
    }

    #[test]
    fn end_time_matches_invariant() {
        let start = Epoch::from_unix_seconds(1000.0);
        let delta = 0.01.seconds();
        let tr = Trace::new(id(), start, delta, vec![0.0; 100], start);
        let expected = start + delta * 99.0;
        assert!((tr.end_time() - expected).to_seconds().abs() < 1e-9);
    }

    #[test]
    fn sanitize_trims_trailing_nonfinite_in_realtime() {
        let start = Epoch::from_unix_seconds(0.0);
        let delta = 1.0.seconds();
        let mut tr = Trace::new(id(), start, delta, vec![1.0, 2.0, f64::NAN, f64::NAN], start);
        tr.sanitize(true);
        assert_eq!(tr.samples, vec![1.0, 2.0]);
    }

    #[test]
    fn sanitize_fills_interior_with_median() {
        let start = Epoch::from_unix_seconds(0.0);
        let delta = 1.0.seconds();
        let mut tr = Trace::new(id(), start, delta, vec![1.0, f64::NAN, 3.0], start);
        tr.sanitize(false);
        assert_eq!(tr.samples, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn packet_rejects_divergent_start_times() {
        let start = Epoch::from_unix_seconds(1000.0);
        let delta = 1.0.seconds();
        let mut pkt = Packet::new();
        pkt.push_trace(Trace::new(id(), start, delta, vec![0.0], start), 1.0)
            .unwrap();
        let far = Trace::new(id(), start + 10.0.seconds(), delta, vec![0.0], start);
        assert!(pkt.push_trace(far, 1.0).is_err());
    }

    #[test]
    fn drop_non_finite_traces_removes_all_nan() {
        let start = Epoch::from_unix_seconds(0.0);
        let delta = 1.0.seconds();
        let mut pkt = Packet::new();
        pkt.traces.push(Trace::new(id(), start, delta, vec![f64::NAN, f64::NAN], start));
        pkt.traces.push(Trace::new(id(), start, delta, vec![1.0, 2.0], start));
        pkt.drop_non_finite_traces();
        assert_eq!(pkt.traces.len(), 1);
    }
}
