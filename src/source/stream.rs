//! Streaming (seedlink-style) source: decode frames off a byte `Read` and
//! coalesce them with [`grouping::PacketGrouper`].

use super::grouping::PacketGrouper;
use super::{Error, PacketSource, StreamIdPattern};
use crate::packet::{Packet, Trace};
use hifitime::prelude::*;
use std::io::Read;

/// Decodes one trace-worth of samples from a streaming connection.
/// Protocol-specific; the crate ships no concrete decoder.
pub trait FrameDecoder {
    fn decode_next(&mut self, reader: &mut dyn Read) -> Result<Option<Trace>, Error>;
}

pub struct StreamSource<R: Read, D: FrameDecoder> {
    reader: R,
    decoder: D,
    grouper: PacketGrouper,
    pattern: Option<StreamIdPattern>,
}

impl<R: Read, D: FrameDecoder> StreamSource<R, D> {
    pub fn new(reader: R, decoder: D, seconds_per_packet: f64) -> Self {
        Self {
            reader,
            decoder,
            grouper: PacketGrouper::new(seconds_per_packet),
            pattern: None,
        }
    }
}

impl<R: Read, D: FrameDecoder> PacketSource for StreamSource<R, D> {
    fn select(&mut self, pattern: StreamIdPattern) {
        self.pattern = Some(pattern);
    }

    fn next_packet(&mut self, _starttime_hint: Option<Epoch>) -> Result<Packet, Error> {
        match self.decoder.decode_next(&mut self.reader)? {
            Some(mut trace) => {
                trace.sanitize(true);
                if !trace.has_any_finite() {
                    return Err(Error::NoData);
                }
                match self.grouper.push(trace) {
                    Some(mut bundle) => {
                        bundle.drop_non_finite_traces();
                        if bundle.is_empty() {
                            Err(Error::NoData)
                        } else {
                            Ok(bundle)
                        }
                    }
                    None => Err(Error::NoData),
                }
            }
            None => Err(Error::Terminated),
        }
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_id::StreamId;
    use std::io::Cursor;

    struct FixedDecoder {
        channel_starts: Vec<(&'static str, f64)>,
        idx: usize,
    }

    impl FrameDecoder for FixedDecoder {
        fn decode_next(&mut self, _reader: &mut dyn Read) -> Result<Option<Trace>, Error> {
            if self.idx >= self.channel_starts.len() {
                return Ok(None);
            }
            let (channel, start_secs) = self.channel_starts[self.idx];
            self.idx += 1;
            let start = Epoch::from_unix_seconds(start_secs);
            Ok(Some(Trace::new(
                StreamId::new("AK", "VMT", "--", channel),
                start,
                0.01.seconds(),
                vec![0.0; 5],
                start,
            )))
        }
    }

    #[test]
    fn coalesces_three_channels_into_one_bundle() {
        let decoder = FixedDecoder {
            channel_starts: vec![("HNZ", 0.0), ("HNN", 0.0), ("HNE", 0.0)],
            idx: 0,
        };
        let mut src = StreamSource::new(Cursor::new(Vec::new()), decoder, 1.0);
        assert!(matches!(src.next_packet(None), Err(Error::NoData)));
        assert!(matches!(src.next_packet(None), Err(Error::NoData)));
        let bundle = src.next_packet(None).unwrap();
        assert_eq!(bundle.traces.len(), 3);
    }

    #[test]
    fn exhausted_decoder_terminates() {
        let decoder = FixedDecoder {
            channel_starts: vec![],
            idx: 0,
        };
        let mut src = StreamSource::new(Cursor::new(Vec::new()), decoder, 1.0);
        assert!(matches!(src.next_packet(None), Err(Error::Terminated)));
    }
}
