//! The four-tuple stream identifier and wildcard-capable matching.

use regex::Regex;
use std::fmt;
use std::str::FromStr;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("malformed stream id {0:?}, expected NET.STA.LOC.CHAN")]
    Malformed(String),
}

/// Uniquely names a trace: network, station, location, channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl StreamId {
    pub fn new(
        network: impl Into<String>,
        station: impl Into<String>,
        location: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            station: station.into(),
            location: location.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

impl FromStr for StreamId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 {
            return Err(Error::Malformed(s.to_owned()));
        }
        Ok(Self::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

/// Translate a SEED-style wildcard pattern (`?`, `*`) into an anchored regex.
///
/// Mirrors `orb2obspy.py::replace_wildcard`.
pub fn wildcard_to_regex(pattern: &str) -> Regex {
    let translated = pattern.replace('*', ".*").replace('?', ".");
    Regex::new(&format!("^{translated}$")).expect("wildcard pattern always compiles")
}

/// Does `candidate` match the (possibly wildcarded) `pattern`?
pub fn station_matches(pattern: &str, candidate: &str) -> bool {
    wildcard_to_regex(pattern).is_match(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_four_tuple() {
        let id: StreamId = "AK.VMT.--.HNZ".parse().unwrap();
        assert_eq!(id.station, "VMT");
        assert_eq!(id.to_string(), "AK.VMT.--.HNZ");
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!("AK.VMT.HNZ".parse::<StreamId>().is_err());
    }

    #[test]
    fn wildcard_question_mark() {
        assert!(station_matches("PS??", "PS04"));
        assert!(!station_matches("PS??", "PS004"));
    }

    #[test]
    fn wildcard_star() {
        assert!(station_matches("PS*", "PS04"));
        assert!(station_matches("PS*", "PS"));
        assert!(!station_matches("PS*", "VMT"));
    }

    #[test]
    fn exact_match_without_wildcards() {
        assert!(station_matches("VMT", "VMT"));
        assert!(!station_matches("VMT", "VMT2"));
    }
}
