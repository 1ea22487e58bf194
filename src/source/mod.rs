//! Packet sources: the pluggable boundary between the wire/archive and the
//! rest of the pipeline.

pub mod archive_file;
pub mod broker;
pub mod grouping;
pub mod query;
pub mod stream;

use crate::packet::Packet;
use hifitime::prelude::*;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("transient source error: {0}")]
    Transient(String),
    #[error("no data available in the current window")]
    NoData,
    #[error("source terminated")]
    Terminated,
}

/// A (possibly wildcarded) station selector; network/location/channel are
/// typically fixed while `station` may carry `?`/`*` wildcards.
#[derive(Debug, Clone)]
pub struct StreamIdPattern {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

/// The packet-delivery contract every concrete source implementation
/// satisfies, regardless of wire protocol.
pub trait PacketSource {
    fn select(&mut self, pattern: StreamIdPattern);

    /// Pull (or drain) the next packet. Transient and no-data conditions are
    /// returned as errors for the caller's Acquiring loop to retry; only
    /// [`Error::Terminated`] ends the session.
    fn next_packet(&mut self, starttime_hint: Option<Epoch>) -> Result<Packet, Error>;

    fn close(&mut self);
}
