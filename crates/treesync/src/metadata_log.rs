//! Metadata log kept during a metadata-only transfer.
//!
//! Every incoming record is appended in wire form, whether or not it passed
//! the metadata filter, so the full tree can be replayed later without asking
//! the sender again. Layout: repeated `u32` little-endian length followed by
//! the JSON-encoded `Stat`.

use std::io;
use std::path::{Path, PathBuf};

use treesync_core::wire::WireError;
use treesync_core::Stat;

use crate::error::{Error, IoContext, Result};

/// File name of the persisted log at the destination root. Never accepted as
/// a transferred entry.
pub const METADATA_LOG_NAME: &str = ".treesync-metadata";

#[derive(Debug, Default, Clone)]
pub struct MetadataLog {
    buf: Vec<u8>,
    records: usize,
}

impl MetadataLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, stat: &Stat) -> Result<()> {
        let record = serde_json::to_vec(stat).map_err(WireError::from)?;
        let len = u32::try_from(record.len()).map_err(|_| {
            Error::io(
                "append metadata record",
                io::Error::new(io::ErrorKind::InvalidInput, "record too large"),
            )
        })?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        self.buf.extend_from_slice(&record);
        self.records += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Write the log as `<dest_root>/.treesync-metadata`, replacing whatever
    /// is there. Returns the written path.
    pub fn persist(&self, dest_root: &Path) -> Result<PathBuf> {
        let path = dest_root.join(METADATA_LOG_NAME);
        match std::fs::symlink_metadata(&path) {
            Ok(md) if md.is_dir() => {
                std::fs::remove_dir_all(&path).io_context(|| format!("remove {}", path.display()))?
            }
            Ok(_) => std::fs::remove_file(&path).io_context(|| format!("remove {}", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io(format!("stat {}", path.display()), e)),
        }
        std::fs::write(&path, &self.buf).io_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Read a log file back into its records.
    pub fn load(path: &Path) -> Result<Vec<Stat>> {
        let bytes = std::fs::read(path).io_context(|| format!("read {}", path.display()))?;
        Self::parse(&bytes).map_err(|e| match e {
            Error::Io { source, .. } => Error::io(format!("parse {}", path.display()), source),
            other => other,
        })
    }

    /// Records persisted at `dest_root` by an earlier transfer.
    pub fn replay(dest_root: &Path) -> Result<Vec<Stat>> {
        Self::load(&dest_root.join(METADATA_LOG_NAME))
    }

    pub fn parse(mut bytes: &[u8]) -> Result<Vec<Stat>> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let Some((len, rest)) = bytes.split_first_chunk::<4>() else {
                return Err(truncated());
            };
            let len = u32::from_le_bytes(*len) as usize;
            if rest.len() < len {
                return Err(truncated());
            }
            let (record, rest) = rest.split_at(len);
            out.push(serde_json::from_slice(record).map_err(WireError::from)?);
            bytes = rest;
        }
        Ok(out)
    }
}

fn truncated() -> Error {
    Error::io(
        "parse metadata log",
        io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record"),
    )
}
