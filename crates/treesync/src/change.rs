//! Changes handed to a change consumer.

use std::future::Future;
use std::path::PathBuf;

use treesync_core::Stat;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChangeKind::Add => "add",
            ChangeKind::Modify => "modify",
            ChangeKind::Delete => "delete",
        })
    }
}

/// One difference between the incoming tree and the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    /// Native path relative to the destination root.
    pub path: PathBuf,
    /// Incoming record, or the destination record for `Delete`.
    pub stat: Stat,
    /// Destination record replaced by a `Modify`.
    pub previous: Option<Stat>,
}

/// Applies changes to a destination.
///
/// `handle_change` is called in path order. It must not wait for file content
/// itself: content pulls depend on the same connection that delivers further
/// changes. Start pulls in the background and join them in `wait`, which runs
/// once after the last change and before the receiver sends FINISH.
pub trait ChangeConsumer: Send {
    fn handle_change(&mut self, change: Change) -> impl Future<Output = Result<()>> + Send;

    fn wait(&mut self) -> impl Future<Output = Result<()>> + Send;
}
