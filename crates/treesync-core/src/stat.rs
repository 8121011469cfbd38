//! Metadata record for a single tree entry.
//!
//! `Stat` is what travels in a STAT packet and what the metadata log stores.
//! The `mode` field uses the POSIX `st_mode` layout on every platform so two
//! peers agree on file types regardless of where they run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ── Mode bits ─────────────────────────────────────────────────────────────────

/// Mask selecting the file-type bits of `mode`.
pub const S_IFMT: u32 = 0o170_000;
pub const S_IFSOCK: u32 = 0o140_000;
pub const S_IFLNK: u32 = 0o120_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFBLK: u32 = 0o060_000;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFCHR: u32 = 0o020_000;
pub const S_IFIFO: u32 = 0o010_000;

/// Permission, setuid/setgid and sticky bits.
pub const PERM_MASK: u32 = 0o7777;

/// File type carried in the high bits of `Stat::mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Dir,
    File,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFDIR => Some(Self::Dir),
            S_IFREG => Some(Self::File),
            S_IFLNK => Some(Self::Symlink),
            S_IFIFO => Some(Self::Fifo),
            S_IFCHR => Some(Self::CharDevice),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFSOCK => Some(Self::Socket),
            _ => None,
        }
    }

    pub fn type_bits(self) -> u32 {
        match self {
            Self::Dir => S_IFDIR,
            Self::File => S_IFREG,
            Self::Symlink => S_IFLNK,
            Self::Fifo => S_IFIFO,
            Self::CharDevice => S_IFCHR,
            Self::BlockDevice => S_IFBLK,
            Self::Socket => S_IFSOCK,
        }
    }
}

// ── Stat ──────────────────────────────────────────────────────────────────────

/// Metadata for one entry of a transferred tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stat {
    /// Relative path. Wire form on the stream, native form once received.
    pub path: String,
    /// File type and permission bits, POSIX layout.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Size in bytes. Zero for directories and for hardlinks to an earlier entry.
    pub size: u64,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mod_time: i64,
    /// Symlink target, or the path of the entry a hardlink points at.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub linkname: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub devmajor: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub devminor: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Stat {
    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.mode)
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == Some(FileKind::Dir)
    }

    pub fn is_symlink(&self) -> bool {
        self.kind() == Some(FileKind::Symlink)
    }

    pub fn is_regular(&self) -> bool {
        self.kind() == Some(FileKind::File)
    }

    /// A hardlink is any non-directory, non-symlink entry with a link target.
    pub fn is_hardlink(&self) -> bool {
        !self.linkname.is_empty() && !self.is_dir() && !self.is_symlink()
    }

    /// Only regular files carry content that a receiver may request.
    pub fn can_request_data(&self) -> bool {
        self.is_regular()
    }

    pub fn permissions(&self) -> u32 {
        self.mode & PERM_MASK
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
