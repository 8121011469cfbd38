//! Entry validators run on every incoming record before it is forwarded.
//!
//! Both keep just enough state to reject a record on its own: the ordering
//! validator tracks the chain of open directories, the hardlink validator
//! tracks which paths may be linked to.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use treesync_core::Stat;

use crate::change::ChangeKind;

/// A check applied to each entry in stream order.
pub trait Observer {
    fn observe(&mut self, kind: ChangeKind, path: &Path, stat: &Stat) -> Result<(), ValidationError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unclean path {path:?}")]
    UncleanPath { path: String },

    #[error("{path:?} does not sort after {previous:?}")]
    OutOfOrder { path: String, previous: String },

    #[error("parent directory of {path:?} was not seen")]
    MissingParent { path: String },

    #[error("hardlink {path:?} points at unseen entry {target:?}")]
    InvalidHardlink { path: String, target: String },
}

// ── Ordering ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct OpenDir {
    dir: PathBuf,
    last: Option<OsString>,
}

/// Rejects unclean paths, out-of-order siblings and orphaned entries.
#[derive(Debug)]
pub struct OrderValidator {
    // Bottom is the transfer root (empty path).
    open: Vec<OpenDir>,
}

impl Default for OrderValidator {
    fn default() -> Self {
        Self {
            open: vec![OpenDir {
                dir: PathBuf::new(),
                last: None,
            }],
        }
    }
}

impl OrderValidator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Observer for OrderValidator {
    fn observe(&mut self, _kind: ChangeKind, path: &Path, stat: &Stat) -> Result<(), ValidationError> {
        if !is_clean(path) {
            return Err(ValidationError::UncleanPath {
                path: path.display().to_string(),
            });
        }
        let (Some(parent), Some(base)) = (path.parent(), path.file_name()) else {
            return Err(ValidationError::UncleanPath {
                path: path.display().to_string(),
            });
        };

        while self.open.len() > 1 && !parent.starts_with(&self.open[self.open.len() - 1].dir) {
            self.open.pop();
        }
        let Some(top) = self.open.last_mut() else {
            return Err(ValidationError::MissingParent {
                path: path.display().to_string(),
            });
        };
        if top.dir != parent {
            return Err(ValidationError::MissingParent {
                path: path.display().to_string(),
            });
        }
        if let Some(last) = &top.last {
            if last.as_os_str() >= base {
                return Err(ValidationError::OutOfOrder {
                    path: path.display().to_string(),
                    previous: top.dir.join(last).display().to_string(),
                });
            }
        }
        top.last = Some(base.to_os_string());

        if stat.is_dir() {
            self.open.push(OpenDir {
                dir: path.to_path_buf(),
                last: None,
            });
        }
        Ok(())
    }
}

/// Relative, non-empty, only normal components, and spelled canonically.
fn is_clean(path: &Path) -> bool {
    if path.as_os_str().is_empty() {
        return false;
    }
    let mut rebuilt = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => rebuilt.push(name),
            _ => return false,
        }
    }
    rebuilt.as_os_str() == path.as_os_str()
}

// ── Hardlinks ─────────────────────────────────────────────────────────────────

/// Rejects hardlinks whose target was not seen earlier as a regular file.
#[derive(Debug, Default)]
pub struct HardlinkValidator {
    targets: HashSet<PathBuf>,
}

impl HardlinkValidator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Observer for HardlinkValidator {
    fn observe(&mut self, kind: ChangeKind, path: &Path, stat: &Stat) -> Result<(), ValidationError> {
        if kind == ChangeKind::Delete {
            return Ok(());
        }
        if stat.is_hardlink() {
            if !self.targets.contains(Path::new(&stat.linkname)) {
                return Err(ValidationError::InvalidHardlink {
                    path: path.display().to_string(),
                    target: stat.linkname.clone(),
                });
            }
            return Ok(());
        }
        if stat.can_request_data() {
            self.targets.insert(path.to_path_buf());
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
