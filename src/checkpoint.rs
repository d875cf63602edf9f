//! Persistence of the last-applied oplog position.
//!
//! The checkpoint file is exactly 8 bytes: little-endian `u32` seconds followed by
//! little-endian `u32` counter. It is overwritten in place; durability is best-effort. An
//! absent or short file means "no checkpoint". The replayer is the only writer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::oper::Optime;
use crate::{Error, Result};

/// The default gap between checkpoint writes while tailing.
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Reads the checkpoint from `path`, if one was persisted.
pub fn read_optime(path: &Path) -> Result<Option<Optime>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Checkpoint(e)),
    };

    let mut buf = [0u8; 8];
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(Some(decode(&buf))),
        // A short file is treated the same as a missing one.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(Error::Checkpoint(e)),
    }
}

fn decode(buf: &[u8; 8]) -> Optime {
    let seconds = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let counter = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Optime::new(seconds, counter)
}

fn encode(optime: Optime) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..4].copy_from_slice(&optime.seconds.to_le_bytes());
    buf[4..].copy_from_slice(&optime.counter.to_le_bytes());
    buf
}

/// The writable checkpoint file, held open for the lifetime of the replayer.
pub struct OptimeLog {
    path: PathBuf,
    file: File,
    interval: Duration,
    last_write: Option<Instant>,
}

impl OptimeLog {
    /// Opens (or creates) the checkpoint file for writing with the default interval.
    pub fn open(path: &Path) -> Result<OptimeLog> {
        OptimeLog::with_interval(path, DEFAULT_LOG_INTERVAL)
    }

    /// Opens (or creates) the checkpoint file with an explicit write interval.
    pub fn with_interval(path: &Path, interval: Duration) -> Result<OptimeLog> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .map_err(Error::Checkpoint)?;

        Ok(OptimeLog {
            path: path.to_path_buf(),
            file,
            interval,
            last_write: None,
        })
    }

    /// The path the checkpoint is persisted at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unconditionally persist `optime`, overwriting the previous value in place.
    pub fn write(&mut self, optime: Optime) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(&encode(optime)))
            .and_then(|_| self.file.flush())
            .map_err(Error::Checkpoint)?;

        self.last_write = Some(Instant::now());
        Ok(())
    }

    /// Persist `optime` if the previous write is older than the configured interval. Returns
    /// whether a write happened. Called on every flush boundary.
    pub fn maybe_write(&mut self, optime: Optime) -> Result<bool> {
        let due = match self.last_write {
            None => true,
            Some(at) => at.elapsed() >= self.interval,
        };

        if due {
            self.write(optime)?;
        }
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_means_no_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("optime");

        assert!(read_optime(&path).unwrap().is_none());
    }

    #[test]
    fn short_file_means_no_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("optime");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        assert!(read_optime(&path).unwrap().is_none());
    }

    #[test]
    fn layout_is_little_endian_seconds_then_counter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("optime");
        std::fs::write(&path, [1u8, 0, 0, 0, 2, 0, 0, 0]).unwrap();

        assert_eq!(read_optime(&path).unwrap(), Some(Optime::new(1, 2)));
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("optime");

        let mut log = OptimeLog::open(&path).unwrap();
        log.write(Optime::new(1479561394, 42)).unwrap();

        assert_eq!(
            read_optime(&path).unwrap(),
            Some(Optime::new(1479561394, 42))
        );
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
    }

    #[test]
    fn overwrite_keeps_the_file_at_eight_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("optime");

        let mut log = OptimeLog::open(&path).unwrap();
        log.write(Optime::new(100, 5)).unwrap();
        log.write(Optime::new(100, 6)).unwrap();

        assert_eq!(read_optime(&path).unwrap(), Some(Optime::new(100, 6)));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
    }

    #[test]
    fn maybe_write_is_interval_gated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("optime");

        let mut log = OptimeLog::with_interval(&path, Duration::from_secs(3600)).unwrap();
        assert!(log.maybe_write(Optime::new(1, 0)).unwrap());
        assert!(!log.maybe_write(Optime::new(2, 0)).unwrap());
        assert_eq!(read_optime(&path).unwrap(), Some(Optime::new(1, 0)));

        log.write(Optime::new(2, 0)).unwrap();
        assert_eq!(read_optime(&path).unwrap(), Some(Optime::new(2, 0)));
    }
}
