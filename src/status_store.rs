//! External status-store mirror: per-station band flags and the overall
//! system-status bit.
//!
//! Grounded on `threshold_monitor.py::MyDataClient.send_alarm`'s
//! `UPDATE occ_display ...` and `watch_threshold_monitor.py::df2mysql`.

use std::collections::BTreeMap;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("status store error: {0}")]
    Backend(String),
}

pub trait StatusStore {
    /// Non-transactional per-row upsert of this station's band flags plus
    /// the system-status bit.
    fn update(&mut self, station: &str, band_flags: &BTreeMap<String, bool>, system_status: bool) -> Result<(), Error>;
}

pub struct MySqlStatusStore {
    pool: mysql::Pool,
}

impl MySqlStatusStore {
    pub fn new(url: &str) -> Result<Self, Error> {
        let pool = mysql::Pool::new(url).map_err(|e| Error::Backend(e.to_string()))?;
        Ok(Self { pool })
    }

    /// `VMT` is hard-mapped to `sta_id = 13`; every other station uses the
    /// numeric suffix of its code, exactly as `MyDataClient.send_alarm` does.
    fn sta_id(station: &str) -> i64 {
        if station.eq_ignore_ascii_case("VMT") {
            return 13;
        }
        let suffix: String = station.chars().rev().take(2).collect::<Vec<_>>().into_iter().rev().collect();
        suffix.parse().unwrap_or(0)
    }
}

impl StatusStore for MySqlStatusStore {
    fn update(&mut self, station: &str, band_flags: &BTreeMap<String, bool>, system_status: bool) -> Result<(), Error> {
        use mysql::prelude::Queryable;

        let mut conn = self.pool.get_conn().map_err(|e| Error::Backend(e.to_string()))?;
        let sta_id = Self::sta_id(station);
        for (band, &flag) in band_flags {
            let column = format!("band_{}", band.to_lowercase());
            conn.exec_drop(
                format!("UPDATE occ_display SET {column} = :flag WHERE sta_id = :sta_id"),
                mysql::params! { "flag" => flag, "sta_id" => sta_id },
            )
            .map_err(|e| Error::Backend(e.to_string()))?;
        }
        conn.exec_drop(
            "UPDATE occ_display SET system_status = :status WHERE sta_id = :sta_id",
            mysql::params! { "status" => system_status, "sta_id" => sta_id },
        )
        .map_err(|e| Error::Backend(e.to_string()))?;
        Ok(())
    }
}

/// Logs updates instead of writing them anywhere, mirroring
/// `watch_threshold_monitor.py`'s behaviour when `mysql.connector` isn't
/// installed: fall back to printing the summary rather than upserting.
#[derive(Default)]
pub struct LoggingStatusStore;

impl StatusStore for LoggingStatusStore {
    fn update(&mut self, station: &str, band_flags: &BTreeMap<String, bool>, system_status: bool) -> Result<(), Error> {
        tracing::info!(station, ?band_flags, system_status, "status update (no mysql_info configured)");
        Ok(())
    }
}

/// An in-memory store used in tests and dry-runs.
#[derive(Default)]
pub struct RecordingStatusStore {
    pub updates: Vec<(String, BTreeMap<String, bool>, bool)>,
}

impl StatusStore for RecordingStatusStore {
    fn update(&mut self, station: &str, band_flags: &BTreeMap<String, bool>, system_status: bool) -> Result<(), Error> {
        self.updates.push((station.to_string(), band_flags.clone(), system_status));
        Ok(())
    }
}
