//! Startup-fatal error types.
//!
//! Per-packet failures (transient source errors, stale calibration, bad
//! samples, log contention) are handled inline by the subsystem that
//! produces them and never reach this enum. This type exists for the
//! handful of conditions that abort a binary before it starts processing:
//! unreadable configuration, an unmatched station pattern, or a
//! configuration value that is structurally invalid.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum FatalError {
    #[error("failed to read configuration file {0:?}: {1}")]
    ConfigRead(PathBuf, #[source] std::io::Error),
    #[error("failed to parse configuration file {0:?}: {1}")]
    ConfigParse(PathBuf, #[source] Box<toml::de::Error>),
    #[error("station pattern {0:?} matched no configured station")]
    NoStationMatch(String),
    #[error("bad threshold level {value:?} for station {station:?} band {band:?}: {source}")]
    BadThresholdLevel {
        station: String,
        band: String,
        value: String,
        #[source]
        source: std::num::ParseFloatError,
    },
    #[error("endtime {0:?} is before starttime {1:?}")]
    EndBeforeStart(String, String),
    #[error("nslc pattern {0:?} must have four dot-separated fields (network.station.location.channel)")]
    BadStreamPattern(String),
    #[error("api {0:?} has no wired backend in this binary (no concrete wire-protocol client is shipped; supply one via the library and a custom binary)")]
    BackendNotConfigured(String),
}
