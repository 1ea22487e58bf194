//! Push-based source: a subscriber thread feeds packets in over a channel.

use super::{Error, PacketSource, StreamIdPattern};
use crate::packet::Packet;
use hifitime::prelude::*;
use std::sync::mpsc::{Receiver, TryRecvError};

pub struct BrokerSource {
    rx: Receiver<Packet>,
    pattern: Option<StreamIdPattern>,
}

impl BrokerSource {
    pub fn new(rx: Receiver<Packet>) -> Self {
        Self { rx, pattern: None }
    }
}

impl PacketSource for BrokerSource {
    fn select(&mut self, pattern: StreamIdPattern) {
        self.pattern = Some(pattern);
    }

    fn next_packet(&mut self, _starttime_hint: Option<Epoch>) -> Result<Packet, Error> {
        match self.rx.try_recv() {
            Ok(mut packet) => {
                for tr in packet.traces.iter_mut() {
                    tr.sanitize(true);
                }
                packet.drop_non_finite_traces();
                if packet.is_empty() {
                    Err(Error::NoData)
                } else {
                    Ok(packet)
                }
            }
            Err(TryRecvError::Empty) => Err(Error::NoData),
            Err(TryRecvError::Disconnected) => Err(Error::Terminated),
        }
    }

    fn close(&mut self) {}
}
