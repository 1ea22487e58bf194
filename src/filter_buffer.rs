//! Per-stream sliding buffer: detrend/taper/filter then slice back the
//! "stabilised" packet window.
//!
//! Grounded on `data_ingestion.py::Buffer` and `RealTimeDataClient.process`.

use crate::dsp::{self, FilterSpec};
use crate::packet::{Packet, Trace};
use crate::stream_id::StreamId;
use hifitime::prelude::*;
use std::collections::HashMap;

/// Minimum buffer length implied by a filter's low corner, `2 / f_low`.
pub fn required_seconds(filter: Option<&FilterSpec>, configured: f64) -> f64 {
    match filter {
        Some(f) if f.freqs[0] > 0.0 => configured.max(2.0 / f.freqs[0]),
        _ => configured,
    }
}

struct StreamBuffer {
    start: Epoch,
    delta: Duration,
    raw: Vec<f64>,
}

impl StreamBuffer {
    fn end_time(&self) -> Epoch {
        if self.raw.is_empty() {
            self.start
        } else {
            self.start + self.delta * (self.raw.len() as f64 - 1.0)
        }
    }
}

/// Per-station raw-sample window with detrend/taper/filter stabilisation.
pub struct SlidingBuffer {
    buffer_seconds: f64,
    filter: Option<FilterSpec>,
    streams: HashMap<StreamId, StreamBuffer>,
}

impl SlidingBuffer {
    pub fn new(buffer_seconds: f64, filter: Option<FilterSpec>) -> Self {
        Self {
            buffer_seconds,
            filter,
            streams: HashMap::new(),
        }
    }

    /// Ingest a packet and return its stabilised (attached) or
    /// constant-detrended (detached) counterpart, trace by trace.
    pub fn process(&mut self, packet: &Packet) -> Packet {
        let mut out = Packet::new();
        for trace in &packet.traces {
            let attached = self.ingest_trace(trace);
            if attached {
                match self.stabilise_and_trim(trace) {
                    Some(stabilised) => out.traces.push(stabilised),
                    None => out.traces.push(trace.clone()),
                }
            } else {
                let mut detached = trace.clone();
                dsp::detrend_constant(&mut detached.samples);
                out.traces.push(detached);
            }
            self.trim_seconds(&trace.id);
        }
        out
    }

    /// Returns true if the packet was merged into an existing, temporally
    /// connected buffer ("attached"); false if processed standalone.
    ///
    /// Connected means the trace starts at or before `buffer.end + delta`
    /// (contiguous or overlapping); a trace that starts further out than
    /// that leaves a temporal gap at the buffer edge and is detached
    /// instead, per spec.md's "Gap -> detached" scenario. A detached trace
    /// still seeds a fresh buffer for itself, same as a brand-new stream,
    /// so a later contiguous packet can attach to it.
    fn ingest_trace(&mut self, trace: &Trace) -> bool {
        match self.streams.get_mut(&trace.id) {
            Some(buf) if buf.delta == trace.delta => {
                let delta_secs = buf.delta.to_seconds();
                let gap = (trace.start - buf.end_time()).to_seconds();
                if gap <= delta_secs + 1e-9 {
                    merge_overlay_with_gap(buf, trace);
                    true
                } else {
                    tracing::debug!(stream = %trace.id, gap_seconds = gap, "temporal gap at buffer edge; packet is detached");
                    self.streams.insert(
                        trace.id.clone(),
                        StreamBuffer {
                            start: trace.start,
                            delta: trace.delta,
                            raw: trace.samples.clone(),
                        },
                    );
                    false
                }
            }
            Some(_) => {
                tracing::error!(stream = %trace.id, "sample-spacing mismatch on merge; treating packet as detached");
                self.streams.insert(
                    trace.id.clone(),
                    StreamBuffer {
                        start: trace.start,
                        delta: trace.delta,
                        raw: trace.samples.clone(),
                    },
                );
                false
            }
            None => {
                self.streams.insert(
                    trace.id.clone(),
                    StreamBuffer {
                        start: trace.start,
                        delta: trace.delta,
                        raw: trace.samples.clone(),
                    },
                );
                false
            }
        }
    }

    fn stabilise_and_trim(&mut self, trace: &Trace) -> Option<Trace> {
        let buf = self.streams.get(&trace.id)?;
        let mut tmp = buf.raw.clone();
        dsp::detrend_linear(&mut tmp);

        if let Some(spec) = &self.filter {
            let min_len = required_seconds(Some(spec), self.buffer_seconds) / buf.delta.to_seconds();
            if (tmp.len() as f64) >= min_len {
                let padded = dsp::mirror_pad(&tmp);
                let mut padded = padded;
                dsp::taper_cosine(&mut padded, 0.25);
                let sos = spec.design();
                let filtered = sos.apply(&padded, spec.zero_phase);
                tmp = dsp::unpad(&filtered);
            }
        }

        let start = buf.start;
        let delta = buf.delta;
        let delta_secs = delta.to_seconds();
        let lo = ((trace.start - start).to_seconds() / delta_secs).round().max(0.0) as usize;
        let hi = (((trace.end_time() - start).to_seconds() / delta_secs).round() as usize + 1).min(tmp.len());
        if lo >= hi {
            return None;
        }
        Some(Trace::new(
            trace.id.clone(),
            trace.start,
            trace.delta,
            tmp[lo..hi].to_vec(),
            trace.load_time,
        ))
    }

    fn trim_seconds(&mut self, id: &StreamId) {
        if let Some(buf) = self.streams.get_mut(id) {
            let delta_secs = buf.delta.to_seconds();
            if delta_secs <= 0.0 {
                return;
            }
            let max_samples = (self.buffer_seconds / delta_secs).ceil() as usize;
            if buf.raw.len() > max_samples {
                let drop = buf.raw.len() - max_samples;
                buf.raw.drain(0..drop);
                buf.start = buf.start + buf.delta * drop as f64;
            }
        }
    }
}

/// Merge `trace` into `buf`: overlapping samples are replaced by the newer
/// data; a gap between the buffer's current end and the trace's start is
/// filled by linear interpolation.
fn merge_overlay_with_gap(buf: &mut StreamBuffer, trace: &Trace) {
    let delta_secs = buf.delta.to_seconds();
    let offset = ((trace.start - buf.start).to_seconds() / delta_secs).round();
    if offset < 0.0 {
        let skip = (-offset) as usize;
        if skip >= trace.samples.len() {
            return;
        }
        overlay(buf, 0, &trace.samples[skip..]);
        return;
    }
    let offset = offset as usize;
    if offset <= buf.raw.len() {
        overlay(buf, offset, &trace.samples);
    } else {
        let gap = offset - buf.raw.len();
        let last = *buf.raw.last().unwrap_or(&trace.samples[0]);
        let first = trace.samples[0];
        for g in 1..=gap {
            let t = g as f64 / (gap + 1) as f64;
            buf.raw.push(last + (first - last) * t);
        }
        buf.raw.extend_from_slice(&trace.samples);
    }
    let _ = buf.end_time();
}

fn overlay(buf: &mut StreamBuffer, offset: usize, samples: &[f64]) {
    for (i, &s) in samples.iter().enumerate() {
        let idx = offset + i;
        if idx < buf.raw.len() {
            buf.raw[idx] = s;
        } else {
            buf.raw.push(s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> StreamId {
        StreamId::new("AK", "VMT", "--", "HNZ")
    }

    fn trace_at(start_secs: f64, samples: Vec<f64>) -> Trace {
        let start = Epoch::from_unix_seconds(start_secs);
        Trace::new(id(), start, 1.0.seconds(), samples, start)
    }

    #[test]
    fn first_packet_is_detached() {
        let mut buf = SlidingBuffer::new(10.0, None);
        let pkt = Packet::single(trace_at(0.0, vec![1.0, 2.0, 3.0]));
        let out = buf.process(&pkt);
        assert_eq!(out.traces.len(), 1);
    }

    #[test]
    fn second_contiguous_packet_attaches_and_extends() {
        let mut buf = SlidingBuffer::new(10.0, None);
        buf.process(&Packet::single(trace_at(0.0, vec![1.0; 5])));
        let out = buf.process(&Packet::single(trace_at(5.0, vec![2.0; 5])));
        assert_eq!(out.traces.len(), 1);
        assert_eq!(out.traces[0].npts(), 5);
    }

    #[test]
    fn detached_packet_is_only_constant_detrended() {
        let mut buf = SlidingBuffer::new(10.0, None);
        buf.process(&Packet::single(trace_at(0.0, vec![1.0; 5])));
        let out = buf.process(&Packet::single(trace_at(500.0, vec![10.0, 12.0, 8.0])));
        let mean: f64 = out.traces[0].samples.iter().sum::<f64>() / out.traces[0].samples.len() as f64;
        assert!(mean.abs() < 1e-9);
    }
}
