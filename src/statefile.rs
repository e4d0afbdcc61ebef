//! Crash-safe persistence of the facade's migration decision.
//!
//! The record is a small fixed-layout big-endian file: magic cookie, format
//! version, target count, signed active index, then one wall-clock
//! milliseconds-since-epoch value for the standalone backend and each target
//! (0 encodes "never active"). Writes go through a temp file in the same
//! directory, fsync, then atomic rename, so a reader sees either the prior
//! complete record or the new complete record and never a torn one.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const STATE_FILE_COOKIE: u32 = 0xE2BD_1A96;
const CURRENT_FORMAT_VERSION: u32 = 1;

/// The record persisted after every successful migration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedState {
    /// Index into the fallback target list, or -1 for standalone mode.
    pub active_index: i32,
    /// Last time the standalone backend was active.
    pub standalone_last_active: Option<DateTime<Utc>>,
    /// Last-active times per target, in configured order.
    pub target_last_active: Vec<Option<DateTime<Utc>>>,
}

/// Reader/writer for the persistent state record at a fixed path.
#[derive(Clone, Debug)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read and validate the record.
    ///
    /// A target count that disagrees with `expected_targets` means the
    /// configuration changed since the file was written; the file is ignored
    /// with a warning rather than migrated. Cookie, version, truncation or
    /// range failures are hard errors.
    pub fn read(&self, expected_targets: usize) -> Result<Option<PersistedState>> {
        let bytes = fs::read(&self.path)?;
        let mut cursor = Cursor::new(&self.path, &bytes);

        let cookie = cursor.read_u32()?;
        if cookie != STATE_FILE_COOKIE {
            return Err(self.invalid(format!("incorrect header 0x{cookie:08x}")));
        }
        let version = cursor.read_u32()?;
        if version != CURRENT_FORMAT_VERSION {
            return Err(self.invalid(format!(
                "format version {version} (expecting {CURRENT_FORMAT_VERSION})"
            )));
        }
        let num_targets = cursor.read_u32()? as usize;
        if num_targets != expected_targets {
            tracing::warn!(
                path = %self.path.display(),
                stored = num_targets,
                configured = expected_targets,
                "state file target count differs from configuration, ignoring file"
            );
            return Ok(None);
        }
        let active_index = cursor.read_i32()?;
        if active_index < -1 || active_index >= num_targets as i32 {
            return Err(self.invalid(format!("active index {active_index} out of range")));
        }
        let standalone_last_active = decode_time(&self.path, cursor.read_i64()?)?;
        let mut target_last_active = Vec::with_capacity(num_targets);
        for _ in 0..num_targets {
            target_last_active.push(decode_time(&self.path, cursor.read_i64()?)?);
        }

        Ok(Some(PersistedState {
            active_index,
            standalone_last_active,
            target_last_active,
        }))
    }

    /// Atomically replace the record on disk.
    pub fn write(&self, state: &PersistedState) -> Result<()> {
        let mut bytes = Vec::with_capacity(24 + 8 * state.target_last_active.len());
        bytes.extend_from_slice(&STATE_FILE_COOKIE.to_be_bytes());
        bytes.extend_from_slice(&CURRENT_FORMAT_VERSION.to_be_bytes());
        bytes.extend_from_slice(&(state.target_last_active.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&state.active_index.to_be_bytes());
        bytes.extend_from_slice(&encode_time(state.standalone_last_active).to_be_bytes());
        for last_active in &state.target_last_active {
            bytes.extend_from_slice(&encode_time(*last_active).to_be_bytes());
        }

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(&bytes)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn invalid(&self, reason: String) -> Error {
        Error::StateFile {
            path: self.path.clone(),
            reason,
        }
    }
}

fn encode_time(time: Option<DateTime<Utc>>) -> i64 {
    time.map(|t| t.timestamp_millis()).unwrap_or(0)
}

fn decode_time(path: &Path, millis: i64) -> Result<Option<DateTime<Utc>>> {
    if millis == 0 {
        return Ok(None);
    }
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(Some)
        .ok_or_else(|| Error::StateFile {
            path: path.to_path_buf(),
            reason: format!("unrepresentable timestamp {millis}"),
        })
}

/// Big-endian reader over the raw file bytes.
struct Cursor<'a> {
    path: &'a Path,
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(path: &'a Path, bytes: &'a [u8]) -> Self {
        Self {
            path,
            bytes,
            offset: 0,
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.offset + N;
        let slice = self.bytes.get(self.offset..end).ok_or(Error::StateFile {
            path: self.path.to_path_buf(),
            reason: format!("truncated at offset {}", self.offset),
        })?;
        self.offset = end;
        Ok(slice.try_into().expect("slice length checked"))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take()?))
    }
}
