//! Shared append-only CSV-shaped log with advisory exclusive locking.
//!
//! Grounded on `data_ingestion.py::append_to_csvfile`/`trim_csvfile`
//! (`fcntl.flock`-based locking with bounded retry-sleep), re-expressed
//! with `fs2`'s cross-platform advisory locks.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("advisory lock on {0:?} timed out")]
    LockTimeout(PathBuf),
    #[error("io error on {0:?}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

/// An append-only, header-plus-rows text log, trimmed to
/// `3 * seconds_to_keep` lines (assumes 3 channels at 1 packet/second).
pub struct HistoryLog {
    path: PathBuf,
    header: String,
    retention_lines: usize,
    lock_retry: Duration,
    lock_bound: Duration,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>, header: impl Into<String>, seconds_to_keep: f64) -> Self {
        Self {
            path: path.into(),
            header: header.into(),
            retention_lines: (seconds_to_keep * 3.0).ceil().max(1.0) as usize,
            lock_retry: Duration::from_millis(50),
            lock_bound: Duration::from_millis(300),
        }
    }

    pub fn append(&self, row: &str) -> Result<(), Error> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::Io(self.path.clone(), e))?;
        self.lock(&file)?;

        let result = self.append_locked(&mut file, row);
        let _ = fs2::FileExt::unlock(&file);
        result
    }

    fn append_locked(&self, file: &mut File, row: &str) -> Result<(), Error> {
        let is_new = file.metadata().map(|m| m.len() == 0).unwrap_or(true);
        if is_new {
            writeln!(file, "{}", self.header).map_err(|e| Error::Io(self.path.clone(), e))?;
        }
        writeln!(file, "{}", row).map_err(|e| Error::Io(self.path.clone(), e))?;
        self.trim(file)
    }

    fn lock(&self, file: &File) -> Result<(), Error> {
        let start = Instant::now();
        loop {
            if file.try_lock_exclusive().is_ok() {
                return Ok(());
            }
            if start.elapsed() > self.lock_bound {
                return Err(Error::LockTimeout(self.path.clone()));
            }
            std::thread::sleep(self.lock_retry);
        }
    }

    fn trim(&self, file: &mut File) -> Result<(), Error> {
        file.seek(SeekFrom::Start(0)).map_err(|e| Error::Io(self.path.clone(), e))?;
        let lines: Vec<String> = BufReader::new(&*file)
            .lines()
            .collect::<Result<_, _>>()
            .map_err(|e| Error::Io(self.path.clone(), e))?;
        if lines.len() <= self.retention_lines + 1 {
            return Ok(());
        }
        let body = &lines[lines.len() - self.retention_lines..];
        file.set_len(0).map_err(|e| Error::Io(self.path.clone(), e))?;
        file.seek(SeekFrom::Start(0)).map_err(|e| Error::Io(self.path.clone(), e))?;
        writeln!(file, "{}", self.header).map_err(|e| Error::Io(self.path.clone(), e))?;
        for line in body {
            writeln!(file, "{}", line).map_err(|e| Error::Io(self.path.clone(), e))?;
        }
        Ok(())
    }

    /// Read the last `n` data rows (header excluded), used by the history
    /// watcher to compute cross-station summaries.
    pub fn tail(&self, n: usize) -> Result<Vec<String>, Error> {
        let file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .map_err(|e| Error::Io(self.path.clone(), e))?;
        self.lock(&file)?;
        let lines: Result<Vec<String>, _> = BufReader::new(&file).lines().collect();
        let _ = fs2::FileExt::unlock(&file);
        let lines = lines.map_err(|e| Error::Io(self.path.clone(), e))?;
        let body = if lines.is_empty() { &[][..] } else { &lines[1..] };
        Ok(body.iter().rev().take(n).rev().cloned().collect())
    }
}

pub const THRESHOLD_HEADER: &str = "rownum,seed_id,starttime,endtime,peaktime,value,status";
pub const LATENCY_HEADER: &str = "rownum,seed_id,time,starttime,endtime,latency,duration";

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_writes_header_once() {
        let dir = tempdir().unwrap();
        let log = HistoryLog::new(dir.path().join("threshold.csv"), THRESHOLD_HEADER, 60.0);
        log.append("1,AK.VMT.--.HNZ,t0,t1,t2,0.5,LOW").unwrap();
        log.append("2,AK.VMT.--.HNZ,t0,t1,t2,0.6,LOW").unwrap();
        let contents = std::fs::read_to_string(dir.path().join("threshold.csv")).unwrap();
        assert_eq!(contents.matches(THRESHOLD_HEADER).count(), 1);
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn trim_keeps_only_recent_rows() {
        let dir = tempdir().unwrap();
        let log = HistoryLog::new(dir.path().join("latency.csv"), LATENCY_HEADER, 1.0);
        for i in 0..10 {
            log.append(&format!("{i},AK.VMT.--.HNZ,t,t,t,0.1,1.0")).unwrap();
        }
        let contents = std::fs::read_to_string(dir.path().join("latency.csv")).unwrap();
        assert_eq!(contents.lines().count(), 4);
    }

    #[test]
    fn tail_returns_last_n_rows() {
        let dir = tempdir().unwrap();
        let log = HistoryLog::new(dir.path().join("threshold.csv"), THRESHOLD_HEADER, 60.0);
        for i in 0..5 {
            log.append(&format!("{i},AK.VMT.--.HNZ,t,t,t,0.1,LOW")).unwrap();
        }
        let tail = log.tail(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[1].starts_with('4'));
    }
}
