//! Diff engine: merge two ordered entry streams into changes.
//!
//! `lower` is the tree being updated (the destination), `upper` the tree it
//! should become. Both must be in component-wise path order.

use std::cmp::Ordering;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use treesync_core::DiffMode;

use crate::change::{Change, ChangeKind};
use crate::error::{IoContext, Result};
use crate::walker::{Entry, FilterFn};

/// Decides whether two regular files with equal metadata hold the same bytes.
pub trait ContentComparator: Send + Sync {
    fn same_content(&self, lower: &Entry, upper: &Entry) -> Result<bool>;
}

/// Compares BLAKE3 digests of files under two local roots.
pub struct Blake3Comparator {
    lower_root: PathBuf,
    upper_root: PathBuf,
}

impl Blake3Comparator {
    pub fn new(lower_root: impl Into<PathBuf>, upper_root: impl Into<PathBuf>) -> Self {
        Self {
            lower_root: lower_root.into(),
            upper_root: upper_root.into(),
        }
    }
}

impl ContentComparator for Blake3Comparator {
    fn same_content(&self, lower: &Entry, upper: &Entry) -> Result<bool> {
        let a = hash_file(&self.lower_root.join(&lower.path))?;
        let b = hash_file(&self.upper_root.join(&upper.path))?;
        Ok(a == b)
    }
}

pub fn hash_file(path: &Path) -> Result<blake3::Hash> {
    let mut file = std::fs::File::open(path).io_context(|| format!("open {}", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).io_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

// ── Sources ───────────────────────────────────────────────────────────────────

struct Source {
    rx: mpsc::Receiver<Result<Entry>>,
    head: Option<Entry>,
    done: bool,
    pruned: Option<PathBuf>,
}

impl Source {
    fn new(rx: mpsc::Receiver<Result<Entry>>) -> Self {
        Self {
            rx,
            head: None,
            done: false,
            pruned: None,
        }
    }

    /// Fill `head` with the next entry that passes the filter.
    async fn fill(&mut self, filter: Option<&FilterFn>) -> Result<()> {
        while self.head.is_none() && !self.done {
            let mut entry = match self.rx.recv().await {
                None => {
                    self.done = true;
                    break;
                }
                Some(item) => item?,
            };
            if let Some(dir) = &self.pruned {
                if entry.path.starts_with(dir) {
                    continue;
                }
                self.pruned = None;
            }
            if let Some(filter) = filter {
                if !filter(&entry.path, &mut entry.stat) {
                    if entry.stat.is_dir() {
                        self.pruned = Some(entry.path);
                    }
                    continue;
                }
            }
            self.head = Some(entry);
        }
        Ok(())
    }
}

// ── DiffStream ────────────────────────────────────────────────────────────────

pub struct DiffStream {
    lower: Source,
    upper: Source,
    mode: DiffMode,
    filter: Option<FilterFn>,
    comparator: Option<Arc<dyn ContentComparator>>,
}

impl DiffStream {
    pub fn new(
        lower: mpsc::Receiver<Result<Entry>>,
        upper: mpsc::Receiver<Result<Entry>>,
        mode: DiffMode,
    ) -> Self {
        Self {
            lower: Source::new(lower),
            upper: Source::new(upper),
            mode,
            filter: None,
            comparator: None,
        }
    }

    /// Apply `filter` to both sides. A rejected directory hides its subtree.
    pub fn with_filter(mut self, filter: Option<FilterFn>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_comparator(mut self, comparator: Option<Arc<dyn ContentComparator>>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Next change, or `None` once both sides are exhausted.
    pub async fn next(&mut self) -> Result<Option<Change>> {
        loop {
            self.lower.fill(self.filter.as_ref()).await?;
            self.upper.fill(self.filter.as_ref()).await?;

            let order = match (&self.lower.head, &self.upper.head) {
                (None, None) => return Ok(None),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(l), Some(u)) => l.path.cmp(&u.path),
            };

            match order {
                Ordering::Less => {
                    let Some(lower) = self.lower.head.take() else { continue };
                    return Ok(Some(Change {
                        kind: ChangeKind::Delete,
                        path: lower.path,
                        stat: lower.stat,
                        previous: None,
                    }));
                }
                Ordering::Greater => {
                    let Some(upper) = self.upper.head.take() else { continue };
                    return Ok(Some(Change {
                        kind: ChangeKind::Add,
                        path: upper.path,
                        stat: upper.stat,
                        previous: None,
                    }));
                }
                Ordering::Equal => {
                    let (Some(lower), Some(upper)) = (self.lower.head.take(), self.upper.head.take())
                    else {
                        continue;
                    };
                    if self.same_file(&lower, &upper).await? {
                        continue;
                    }
                    return Ok(Some(Change {
                        kind: ChangeKind::Modify,
                        path: upper.path,
                        stat: upper.stat,
                        previous: Some(lower.stat),
                    }));
                }
            }
        }
    }

    async fn same_file(&self, lower: &Entry, upper: &Entry) -> Result<bool> {
        if self.mode == DiffMode::None {
            return Ok(false);
        }
        let (l, u) = (&lower.stat, &upper.stat);
        if l.kind() != u.kind() {
            return Ok(false);
        }
        if !u.is_dir() && (l.size != u.size || l.mod_time != u.mod_time) {
            return Ok(false);
        }
        if l.mode != u.mode
            || l.uid != u.uid
            || l.gid != u.gid
            || l.devmajor != u.devmajor
            || l.devminor != u.devminor
            || l.linkname != u.linkname
        {
            return Ok(false);
        }
        if self.mode == DiffMode::Content && u.is_regular() && !u.is_hardlink() {
            let Some(comparator) = self.comparator.clone() else {
                return Ok(false);
            };
            let (lower, upper) = (lower.clone(), upper.clone());
            return tokio::task::spawn_blocking(move || comparator.same_content(&lower, &upper)).await?;
        }
        Ok(true)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
