//! Tree walker: ordered `(path, Stat)` entries for a local directory.
//!
//! Entries come out depth-first with each directory's children sorted by
//! file name, which is the component-wise order of `Path`. The root itself is
//! never emitted. Record paths and link targets are already in wire form.

use std::collections::{HashMap, VecDeque};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use treesync_core::path::{link_to_wire, to_wire};
use treesync_core::Stat;
use walkdir::WalkDir;

use crate::error::{Error, IoContext, Result};
use crate::stack::AncestorStack;

/// Decides whether an entry is kept. May rewrite the record. A rejected
/// directory drops its whole subtree.
pub type FilterFn = Arc<dyn Fn(&Path, &mut Stat) -> bool + Send + Sync>;

/// A native relative path and its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: PathBuf,
    pub stat: Stat,
}

#[derive(Clone)]
pub struct WalkOpt {
    /// Globs over the wire path. When non-empty, only entries matching one of
    /// them, or lying under a matching directory, are emitted, together with
    /// the directories leading to them.
    pub include_patterns: Vec<String>,
    /// Globs over the wire path. Matching entries and their subtrees are skipped.
    pub exclude_patterns: Vec<String>,
    pub filter: Option<FilterFn>,
    /// Emit later links to an already emitted inode as hardlinks.
    pub detect_hardlinks: bool,
}

impl Default for WalkOpt {
    fn default() -> Self {
        Self {
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            filter: None,
            detect_hardlinks: true,
        }
    }
}

pub struct Walker {
    root: PathBuf,
    opt: WalkOpt,
}

impl Walker {
    pub fn new(root: impl Into<PathBuf>, opt: WalkOpt) -> Self {
        Self {
            root: root.into(),
            opt,
        }
    }

    /// Start a fresh walk. A missing root produces no entries.
    pub fn entries(&self) -> Result<WalkIter> {
        let includes = build_globset(&self.opt.include_patterns)?;
        let excludes = build_globset(&self.opt.exclude_patterns)?;
        let inner = match std::fs::symlink_metadata(&self.root) {
            Ok(_) => Some(
                WalkDir::new(&self.root)
                    .min_depth(1)
                    .follow_links(false)
                    .sort_by_file_name()
                    .into_iter(),
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::io(format!("stat {}", self.root.display()), e)),
        };
        Ok(WalkIter {
            root: self.root.clone(),
            inner,
            includes,
            excludes,
            filter: self.opt.filter.clone(),
            links: self.opt.detect_hardlinks.then(HashMap::new),
            ancestors: AncestorStack::new(),
            ready: VecDeque::new(),
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for p in patterns {
        builder.add(Glob::new(p)?);
    }
    Ok(Some(builder.build()?))
}

pub struct WalkIter {
    root: PathBuf,
    inner: Option<walkdir::IntoIter>,
    includes: Option<GlobSet>,
    excludes: Option<GlobSet>,
    filter: Option<FilterFn>,
    links: Option<HashMap<(u64, u64), String>>,
    ancestors: AncestorStack<Entry>,
    ready: VecDeque<Entry>,
}

impl Iterator for WalkIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Result<Entry>> {
        loop {
            if let Some(entry) = self.ready.pop_front() {
                return Some(Ok(entry));
            }
            match self.advance() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.inner = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl WalkIter {
    /// Consume one directory entry. Returns false when the walk is over.
    fn advance(&mut self) -> Result<bool> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(false);
        };
        let dent = match inner.next() {
            None => return Ok(false),
            Some(Ok(d)) => d,
            Some(Err(e)) => {
                if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) {
                    debug!(error = %e, "entry vanished during walk");
                    return Ok(true);
                }
                let context = match e.path() {
                    Some(p) => format!("walk {}", p.display()),
                    None => "walk".to_string(),
                };
                return Err(Error::io(context, e.into()));
            }
        };

        let full = dent.path();
        let rel = match full.strip_prefix(&self.root) {
            Ok(r) => r.to_path_buf(),
            Err(_) => return Ok(true),
        };
        let wire = to_wire(&rel)?;
        let is_dir = dent.file_type().is_dir();

        if self.excludes.as_ref().is_some_and(|g| g.is_match(&wire)) {
            if is_dir {
                inner.skip_current_dir();
            }
            return Ok(true);
        }

        let metadata = match dent.metadata() {
            Ok(m) => m,
            Err(e) if e.io_error().map(|io| io.kind()) == Some(io::ErrorKind::NotFound) => {
                return Ok(true);
            }
            Err(e) => return Err(Error::io(format!("stat {}", full.display()), e.into())),
        };
        let mut stat = stat_from_metadata(full, wire, &metadata)?;

        if let Some(filter) = &self.filter {
            if !filter(&rel, &mut stat) {
                if is_dir {
                    inner.skip_current_dir();
                }
                return Ok(true);
            }
        }

        self.ancestors.truncate_while(|a| !rel.starts_with(&a.path));

        let included = match &self.includes {
            None => true,
            Some(globs) => is_included(globs, &stat.path),
        };
        if !included {
            if is_dir {
                self.ancestors.push(Entry { path: rel, stat });
            }
            return Ok(true);
        }

        if let Some(links) = self.links.as_mut() {
            mark_hardlink(links, &metadata, &mut stat);
        }
        self.ready.extend(self.ancestors.drain());
        self.ready.push_back(Entry { path: rel, stat });
        Ok(true)
    }
}

/// An entry is included when it or any of its ancestors matches.
fn is_included(globs: &GlobSet, wire: &str) -> bool {
    if globs.is_match(wire) {
        return true;
    }
    wire.match_indices('/').any(|(i, _)| globs.is_match(&wire[..i]))
}

#[cfg(unix)]
fn mark_hardlink(links: &mut HashMap<(u64, u64), String>, metadata: &Metadata, stat: &mut Stat) {
    use std::os::unix::fs::MetadataExt;

    if !metadata.is_file() || metadata.nlink() < 2 {
        return;
    }
    match links.get(&(metadata.dev(), metadata.ino())) {
        Some(first) => {
            stat.linkname = first.clone();
            stat.size = 0;
        }
        None => {
            links.insert((metadata.dev(), metadata.ino()), stat.path.clone());
        }
    }
}

#[cfg(not(unix))]
fn mark_hardlink(_links: &mut HashMap<(u64, u64), String>, _metadata: &Metadata, _stat: &mut Stat) {}

/// Build the record for the entry at `root/rel` without walking.
pub fn entry_at(root: &Path, rel: &Path) -> Result<Entry> {
    let full = root.join(rel);
    let metadata = std::fs::symlink_metadata(&full).io_context(|| format!("stat {}", full.display()))?;
    let stat = stat_from_metadata(&full, to_wire(rel)?, &metadata)?;
    Ok(Entry {
        path: rel.to_path_buf(),
        stat,
    })
}

// ── Metadata ──────────────────────────────────────────────────────────────────

#[cfg(unix)]
fn stat_from_metadata(full: &Path, wire: String, md: &Metadata) -> Result<Stat> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let ft = md.file_type();
    let mut stat = Stat {
        path: wire,
        mode: md.mode(),
        uid: md.uid(),
        gid: md.gid(),
        size: if ft.is_file() { md.size() } else { 0 },
        mod_time: md.mtime() * 1_000_000_000 + md.mtime_nsec(),
        ..Default::default()
    };
    if ft.is_symlink() {
        let target = std::fs::read_link(full).io_context(|| format!("readlink {}", full.display()))?;
        stat.linkname = link_to_wire(&target.to_string_lossy());
    }
    if ft.is_block_device() || ft.is_char_device() {
        let rdev = md.rdev() as libc::dev_t;
        #[allow(unused_unsafe)]
        let (major, minor) = unsafe { (libc::major(rdev), libc::minor(rdev)) };
        stat.devmajor = major as u64;
        stat.devminor = minor as u64;
    }
    stat.xattrs = read_xattrs(full);
    Ok(stat)
}

#[cfg(unix)]
fn read_xattrs(path: &Path) -> std::collections::BTreeMap<String, Vec<u8>> {
    let mut out = std::collections::BTreeMap::new();
    let names = match xattr::list(path) {
        Ok(names) => names,
        Err(_) => return out,
    };
    for name in names {
        let Some(key) = name.to_str() else { continue };
        if let Ok(Some(value)) = xattr::get(path, &name) {
            out.insert(key.to_string(), value);
        }
    }
    out
}

#[cfg(not(unix))]
fn stat_from_metadata(full: &Path, wire: String, md: &Metadata) -> Result<Stat> {
    use std::time::UNIX_EPOCH;
    use treesync_core::stat::{S_IFDIR, S_IFLNK, S_IFREG};

    let ft = md.file_type();
    let (type_bits, perm) = if ft.is_dir() {
        (S_IFDIR, 0o755)
    } else if ft.is_symlink() {
        (S_IFLNK, 0o777)
    } else {
        (S_IFREG, 0o644)
    };
    let perm = if md.permissions().readonly() { perm & !0o222 } else { perm };
    let mod_time = md
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default();
    let mut stat = Stat {
        path: wire,
        mode: type_bits | perm,
        size: if ft.is_file() { md.len() } else { 0 },
        mod_time,
        ..Default::default()
    };
    if ft.is_symlink() {
        let target = std::fs::read_link(full).io_context(|| format!("readlink {}", full.display()))?;
        stat.linkname = link_to_wire(&target.to_string_lossy());
    }
    Ok(stat)
}

// ── Async bridge ──────────────────────────────────────────────────────────────

/// Walk `root` on a blocking thread, delivering entries through a bounded
/// channel. The walk stops at the first error, when the receiver is dropped,
/// or when `cancel` fires.
pub fn spawn_walk(
    root: PathBuf,
    opt: WalkOpt,
    capacity: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<Result<Entry>> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::task::spawn_blocking(move || {
        let entries = match Walker::new(&root, opt).entries() {
            Ok(it) => it,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };
        for item in entries {
            if cancel.is_cancelled() {
                return;
            }
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                return;
            }
        }
        debug!(root = %root.display(), "walk complete");
    });
    rx
}

// ── Tests ─────────────────────────────────────────────────────────────────────
