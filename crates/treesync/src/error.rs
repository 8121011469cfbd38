//! Error taxonomy for a transfer.
//!
//! Every failure is fatal to the transfer it occurs in. Nothing here is
//! retried; callers that want retries re-run the whole transfer.

use std::io;

use treesync_core::path::PathError;
use treesync_core::wire::{PacketKind, WireError};

use crate::validator::ValidationError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("invalid entry: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Wire(#[from] WireError),

    /// The remote side sent an ERROR packet.
    #[error("peer error: {0}")]
    Peer(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("transfer cancelled")]
    Cancelled,
}

impl Error {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Error::Cancelled
        } else {
            Error::io("background task failed", io::Error::other(e.to_string()))
        }
    }
}

/// Attach a context string to an `io::Result`.
pub(crate) trait IoContext<T> {
    fn io_context(self, f: impl FnOnce() -> String) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context(self, f: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| Error::io(f(), e))
    }
}

/// Violations of the packet sequence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid file request {0}")]
    UnknownFileId(u32),

    #[error("invalid file request for {0}: unknown path or already requested")]
    InvalidFileRequest(String),

    #[error("invalid data message for file {0}")]
    UnknownDataId(u32),

    #[error("data for file {0} after end of content")]
    DataAfterEof(u32),

    #[error("duplicate end of metadata")]
    DuplicateStatEof,

    #[error("metadata record after end of metadata")]
    StatAfterEof,

    #[error("finish before end of metadata")]
    FinishBeforeStatEof,

    #[error("unexpected {0} packet")]
    UnexpectedPacket(PacketKind),

    #[error("connection closed before finish")]
    ConnectionClosed,
}
