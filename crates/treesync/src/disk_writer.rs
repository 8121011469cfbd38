//! DiskWriter: applies changes to a destination directory.
//!
//! Regular files are written to a hidden temporary sibling and renamed into
//! place once their content and metadata are complete, so a reader never sees
//! a half-written file under its final name. Content pulls run as background
//! tasks. `wait` joins them, creates hardlinks (their targets may have been
//! among the pulls) and finally fixes up directory metadata deepest first.

use std::cmp::Reverse;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use filetime::FileTime;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use treesync_core::{FileKind, Stat};

use crate::change::{Change, ChangeConsumer, ChangeKind};
use crate::error::{Error, IoContext, Result};
use crate::receiver::{ContentRequester, ContentSink};

/// Called for every applied change, with the BLAKE3 digest of the written
/// content for regular files.
pub type NotifyFn = Arc<dyn Fn(&Change, Option<&blake3::Hash>) + Send + Sync>;

pub struct DiskWriter {
    dest: PathBuf,
    requester: ContentRequester,
    notify: Option<NotifyFn>,
    tasks: JoinSet<Result<()>>,
    dirs: Vec<(PathBuf, Stat)>,
    /// Deferred hardlinks: (link path, existing path, change).
    links: Vec<(PathBuf, PathBuf, Change)>,
    next_tmp: u64,
}

impl DiskWriter {
    pub fn new(dest: impl Into<PathBuf>, requester: ContentRequester) -> Self {
        Self {
            dest: dest.into(),
            requester,
            notify: None,
            tasks: JoinSet::new(),
            dirs: Vec::new(),
            links: Vec::new(),
            next_tmp: 0,
        }
    }

    pub fn with_notify(mut self, notify: Option<NotifyFn>) -> Self {
        self.notify = notify;
        self
    }

    fn notify(&self, change: &Change, digest: Option<&blake3::Hash>) {
        if let Some(n) = &self.notify {
            n(change, digest);
        }
    }

    fn write_file(&mut self, change: Change, target: PathBuf) -> Result<()> {
        if change.stat.size == 0 {
            // A fresh inode, so other links to the old file keep their content.
            remove_entry(&target)?;
            File::create(&target).io_context(|| format!("create {}", target.display()))?;
            rewrite_metadata(&target, &change.stat)?;
            self.notify(&change, Some(&blake3::hash(b"")));
            return Ok(());
        }

        let tmp = temp_sibling(&target, self.next_tmp);
        self.next_tmp += 1;
        let requester = self.requester.clone();
        let notify = self.notify.clone();
        let hashing = notify.is_some();

        self.tasks.spawn(async move {
            let file = File::create(&tmp).io_context(|| format!("create {}", tmp.display()))?;
            let sink = FileSink::new(file, hashing);
            let digest = sink.digest.clone();

            if let Err(e) = requester.request(&change.path, Box::new(sink)).await {
                let _ = std::fs::remove_file(&tmp);
                return Err(e);
            }
            rewrite_metadata(&tmp, &change.stat)?;
            std::fs::rename(&tmp, &target).io_context(|| format!("rename {}", target.display()))?;

            debug!(path = %change.path.display(), bytes = change.stat.size, "file written");
            if let Some(n) = &notify {
                n(&change, digest.get());
            }
            Ok(())
        });
        Ok(())
    }
}

impl ChangeConsumer for DiskWriter {
    async fn handle_change(&mut self, change: Change) -> Result<()> {
        let target = self.dest.join(&change.path);

        if change.kind == ChangeKind::Delete {
            remove_entry(&target)?;
            debug!(path = %change.path.display(), "removed");
            self.notify(&change, None);
            return Ok(());
        }

        let stat = &change.stat;
        let kind = stat
            .kind()
            .ok_or_else(|| Error::io(format!("apply {}", change.path.display()), invalid_mode(stat.mode)))?;
        clear_for(&target, kind)?;

        if stat.is_hardlink() {
            let existing = self.dest.join(&stat.linkname);
            self.links.push((target, existing, change));
            return Ok(());
        }

        match kind {
            FileKind::Dir => {
                if !target.is_dir() {
                    std::fs::create_dir(&target).io_context(|| format!("mkdir {}", target.display()))?;
                }
                self.dirs.push((target, stat.clone()));
                self.notify(&change, None);
            }
            FileKind::File => return self.write_file(change, target),
            FileKind::Symlink => {
                make_symlink(&stat.linkname, &target)?;
                rewrite_metadata(&target, stat)?;
                self.notify(&change, None);
            }
            FileKind::Fifo | FileKind::CharDevice | FileKind::BlockDevice | FileKind::Socket => {
                make_special(&target, stat)?;
                rewrite_metadata(&target, stat)?;
                self.notify(&change, None);
            }
        }
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.join_next().await {
            joined??;
        }
        for (target, existing, change) in std::mem::take(&mut self.links) {
            remove_entry(&target)?;
            std::fs::hard_link(&existing, &target)
                .io_context(|| format!("link {} to {}", target.display(), existing.display()))?;
            self.notify(&change, None);
        }
        let mut dirs = std::mem::take(&mut self.dirs);
        dirs.sort_by_key(|(p, _)| Reverse(p.components().count()));
        for (path, stat) in &dirs {
            rewrite_metadata(path, stat)?;
        }
        Ok(())
    }
}

// ── Content sink ──────────────────────────────────────────────────────────────

struct FileSink {
    out: BufWriter<File>,
    hasher: Option<blake3::Hasher>,
    digest: Arc<OnceLock<blake3::Hash>>,
}

impl FileSink {
    fn new(file: File, hashing: bool) -> Self {
        Self {
            out: BufWriter::new(file),
            hasher: hashing.then(blake3::Hasher::new),
            digest: Arc::new(OnceLock::new()),
        }
    }
}

impl ContentSink for FileSink {
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if let Some(h) = self.hasher.as_mut() {
            h.update(data);
        }
        self.out.write_all(data)
    }

    fn close(&mut self) -> io::Result<()> {
        self.out.flush()?;
        if let Some(h) = self.hasher.take() {
            let _ = self.digest.set(h.finalize());
        }
        Ok(())
    }
}

// ── Filesystem helpers ────────────────────────────────────────────────────────

fn temp_sibling(target: &Path, n: u64) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.treesync-{n}"))
}

fn invalid_mode(mode: u32) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("unknown file type in mode {mode:o}"))
}

/// Remove a file, link or directory tree. Missing is fine.
fn remove_entry(path: &Path) -> Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(Error::io(format!("remove {}", path.display()), e)),
        _ => Ok(()),
    }
}

/// Make room for a new entry of `kind`. Existing directories stay when a
/// directory is wanted; regular files stay for the rename to replace.
fn clear_for(target: &Path, kind: FileKind) -> Result<()> {
    let existing = match std::fs::symlink_metadata(target) {
        Ok(md) => md,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(format!("stat {}", target.display()), e)),
    };
    let keep = match kind {
        FileKind::Dir => existing.is_dir(),
        FileKind::File => existing.is_file(),
        _ => false,
    };
    if keep {
        return Ok(());
    }
    remove_entry(target)
}

#[cfg(unix)]
fn make_symlink(link: &str, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target).io_context(|| format!("symlink {}", target.display()))
}

#[cfg(windows)]
fn make_symlink(link: &str, target: &Path) -> Result<()> {
    std::os::windows::fs::symlink_file(link, target).io_context(|| format!("symlink {}", target.display()))
}

#[cfg(unix)]
fn make_special(target: &Path, stat: &Stat) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(target.as_os_str().as_bytes())
        .map_err(|e| Error::io(format!("mknod {}", target.display()), io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    #[allow(unused_unsafe)]
    let dev = unsafe { libc::makedev(stat.devmajor as _, stat.devminor as _) };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mknod(c_path.as_ptr(), stat.mode as libc::mode_t, dev) };
    if rc != 0 {
        return Err(Error::io(format!("mknod {}", target.display()), io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_special(target: &Path, _stat: &Stat) -> Result<()> {
    Err(Error::io(
        format!("create {}", target.display()),
        io::Error::new(io::ErrorKind::Unsupported, "special files are not supported on this platform"),
    ))
}

/// Apply ownership, permissions, xattrs and mtime from `stat` to `path`
/// without following a final symlink.
fn rewrite_metadata(path: &Path, stat: &Stat) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if let Err(e) = std::os::unix::fs::lchown(path, Some(stat.uid), Some(stat.gid)) {
            if e.kind() != io::ErrorKind::PermissionDenied {
                return Err(Error::io(format!("chown {}", path.display()), e));
            }
            debug!(path = %path.display(), uid = stat.uid, gid = stat.gid, "ownership not applied");
        }
        if !stat.is_symlink() {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(stat.permissions()))
                .io_context(|| format!("chmod {}", path.display()))?;
        }
        for (name, value) in &stat.xattrs {
            if let Err(e) = xattr::set(path, name, value) {
                warn!(path = %path.display(), name = %name, error = %e, "xattr not applied");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if !stat.is_symlink() {
            let mut perms = std::fs::metadata(path)
                .io_context(|| format!("stat {}", path.display()))?
                .permissions();
            perms.set_readonly(stat.permissions() & 0o222 == 0);
            std::fs::set_permissions(path, perms).io_context(|| format!("chmod {}", path.display()))?;
        }
    }

    let mtime = FileTime::from_unix_time(
        stat.mod_time.div_euclid(1_000_000_000),
        stat.mod_time.rem_euclid(1_000_000_000) as u32,
    );
    filetime::set_symlink_file_times(path, mtime, mtime).io_context(|| format!("set times on {}", path.display()))
}
