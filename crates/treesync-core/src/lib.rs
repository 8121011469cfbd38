//! treesync-core: entry metadata, path conversion, wire format and config.
//! The protocol crate and the daemon both depend on this one.

pub mod config;
pub mod path;
pub mod stat;
pub mod wire;

pub use config::{DiffMode, TreesyncConfig};
pub use stat::{FileKind, Stat};
pub use wire::{Packet, PacketKind, PacketReader, PacketWriter, WireError};
