//! treesync: directory tree transfer over a bidirectional byte stream.
//!
//! The sender walks a tree and announces every entry; the receiver diffs the
//! announcements against its destination and pulls content only for files it
//! actually needs.

pub mod change;
mod conn;
pub mod diff;
pub mod disk_writer;
pub mod error;
pub mod metadata_log;
mod progress;
pub mod receiver;
pub mod sender;
pub mod stack;
pub mod validator;
pub mod walker;

pub use change::{Change, ChangeConsumer, ChangeKind};
pub use diff::{Blake3Comparator, ContentComparator, DiffStream};
pub use disk_writer::{DiskWriter, NotifyFn};
pub use error::{Error, ProtocolError, Result};
pub use metadata_log::{MetadataLog, METADATA_LOG_NAME};
pub use progress::ProgressFn;
pub use receiver::{receive, receive_with, ContentRequester, ContentSink, MetadataFilterFn, ReceiveOpt};
pub use sender::{send, Baseline, SendOpt};
pub use validator::{HardlinkValidator, Observer, OrderValidator, ValidationError};
pub use walker::{spawn_walk, Entry, FilterFn, WalkOpt, Walker};

pub use treesync_core::{DiffMode, FileKind, Stat};
