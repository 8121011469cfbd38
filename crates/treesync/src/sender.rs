//! Sending side of a transfer.
//!
//! The metadata emitter and the request server run concurrently:
//!
//!   emit   walk (or diff against a baseline) → STAT per entry → empty STAT
//!   serve  REQUEST → stream the file as DATA chunks plus an empty chunk;
//!          FINISH → wait for open streams, answer FINISH, close the stream
//!
//! Ids are implicit. Both sides count records in stream order from zero, so
//! the n-th STAT sent is file n.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use treesync_core::config::TuningConfig;
use treesync_core::wire::{Packet, PacketReader, MAX_PAYLOAD};
use treesync_core::DiffMode;

use crate::change::ChangeKind;
use crate::conn::Conn;
use crate::diff::{ContentComparator, DiffStream};
use crate::error::{Error, IoContext, ProtocolError, Result};
use crate::metadata_log::METADATA_LOG_NAME;
use crate::progress::{Progress, ProgressFn};
use crate::stack::AncestorStack;
use crate::walker::{entry_at, spawn_walk, Entry, WalkOpt};

/// A local tree the receiver is known to hold already. Only entries that
/// differ from it are sent.
#[derive(Clone)]
pub struct Baseline {
    pub root: PathBuf,
    pub mode: DiffMode,
    pub comparator: Option<Arc<dyn ContentComparator>>,
}

pub struct SendOpt {
    pub walk: WalkOpt,
    pub baseline: Option<Baseline>,
    /// Bytes per DATA packet.
    pub chunk_size: usize,
    pub walk_queue_depth: usize,
    /// Maximum files streamed at once.
    pub stream_workers: usize,
    pub progress: Option<ProgressFn>,
    pub cancel: CancellationToken,
}

impl Default for SendOpt {
    fn default() -> Self {
        Self::from_config(&TuningConfig::default())
    }
}

impl SendOpt {
    pub fn from_config(tuning: &TuningConfig) -> Self {
        Self {
            walk: WalkOpt::default(),
            baseline: None,
            chunk_size: tuning.chunk_size,
            walk_queue_depth: tuning.walk_queue_depth,
            stream_workers: tuning.stream_workers,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Send the tree under `root` to the peer on `reader`/`writer`.
pub async fn send<R, W>(reader: R, writer: W, root: impl AsRef<Path>, opt: SendOpt) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let root = root.as_ref().to_path_buf();
    let conn = Conn::new(writer);
    let cancel = opt.cancel.child_token();
    let _guard = cancel.clone().drop_guard();

    info!(root = %root.display(), baseline = opt.baseline.is_some(), "sending tree");
    let sender = Sender {
        root: root.clone(),
        conn: conn.clone(),
        files: Arc::new(DashMap::new()),
        chunk_size: opt.chunk_size.clamp(1, MAX_PAYLOAD),
        workers: Arc::new(Semaphore::new(opt.stream_workers.max(1))),
        progress: Arc::new(Progress::new(opt.progress.clone())),
    };

    let mut reader = PacketReader::new(reader);
    let transfer = async {
        tokio::try_join!(
            sender.emit(&opt, &cancel),
            sender.serve(&mut reader)
        )
    };
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        r = transfer => r.map(|(sent, ())| sent),
    };

    match result {
        Ok(sent) => {
            sender.progress.done();
            info!(root = %root.display(), entries = sent, "send complete");
            Ok(())
        }
        Err(e) => {
            warn!(root = %root.display(), error = %e, "send failed");
            conn.send_error(&e).await;
            Err(e)
        }
    }
}

struct Sender {
    root: PathBuf,
    conn: Conn,
    /// Content-eligible ids not yet requested.
    files: Arc<DashMap<u32, PathBuf>>,
    chunk_size: usize,
    workers: Arc<Semaphore>,
    progress: Arc<Progress>,
}

impl Sender {
    // ── Metadata ──────────────────────────────────────────────────────────────

    /// Send every record, then the end-of-metadata marker. Returns the count.
    async fn emit(&self, opt: &SendOpt, cancel: &CancellationToken) -> Result<u32> {
        let mut next_id = 0u32;
        let mut walk = opt.walk.clone();
        walk.exclude_patterns.push(METADATA_LOG_NAME.to_string());
        let upper = spawn_walk(self.root.clone(), walk.clone(), opt.walk_queue_depth, cancel.clone());

        match &opt.baseline {
            None => {
                let mut upper = upper;
                while let Some(entry) = upper.recv().await {
                    self.send_entry(entry?, &mut next_id).await?;
                }
            }
            Some(baseline) => {
                let lower = spawn_walk(baseline.root.clone(), walk, opt.walk_queue_depth, cancel.clone());
                let mut diff = DiffStream::new(lower, upper, baseline.mode)
                    .with_comparator(baseline.comparator.clone());
                let mut sent_dirs: AncestorStack<PathBuf> = AncestorStack::new();
                // Wire paths of regular files announced so far.
                let mut sent_files: HashSet<String> = HashSet::new();

                while let Some(change) = diff.next().await? {
                    if change.kind == ChangeKind::Delete {
                        continue;
                    }
                    // Unchanged directories above a change still have to be
                    // announced, or the receiver sees an orphan.
                    sent_dirs.truncate_while(|d| !change.path.starts_with(d));
                    let mut missing: Vec<PathBuf> = change
                        .path
                        .ancestors()
                        .skip(1)
                        .take_while(|a| !a.as_os_str().is_empty() && sent_dirs.peek().map_or(true, |top| *a != top.as_path()))
                        .map(Path::to_path_buf)
                        .collect();
                    missing.reverse();
                    for dir in missing {
                        let entry = entry_at(&self.root, &dir)?;
                        self.send_entry(entry, &mut next_id).await?;
                        sent_dirs.push(dir);
                    }

                    if change.stat.is_dir() {
                        sent_dirs.push(change.path.clone());
                    }
                    let mut stat = change.stat;
                    if stat.is_hardlink() && !sent_files.contains(&stat.linkname) {
                        // The target is unchanged and was not announced, so
                        // the link goes out as a file with its own content.
                        debug!(path = %stat.path, target = %stat.linkname, "hardlink target not sent");
                        stat.linkname.clear();
                        stat.size = entry_at(&self.root, &change.path)?.stat.size;
                    }
                    let entry = Entry {
                        path: change.path,
                        stat,
                    };
                    if entry.stat.can_request_data() && !entry.stat.is_hardlink() {
                        sent_files.insert(entry.stat.path.clone());
                    }
                    self.send_entry(entry, &mut next_id).await?;
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.conn.send(Packet::Stat(None)).await?;
        debug!(entries = next_id, "end of metadata");
        Ok(next_id)
    }

    async fn send_entry(&self, entry: Entry, next_id: &mut u32) -> Result<()> {
        let id = *next_id;
        *next_id += 1;
        if entry.stat.can_request_data() {
            self.files.insert(id, self.root.join(&entry.path));
        }
        debug!(id, path = %entry.stat.path, "stat");
        let n = self.conn.send(Packet::Stat(Some(entry.stat))).await?;
        self.progress.add(n);
        Ok(())
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    async fn serve<R: AsyncRead + Unpin>(&self, reader: &mut PacketReader<R>) -> Result<()> {
        let mut streams: JoinSet<Result<()>> = JoinSet::new();
        loop {
            tokio::select! {
                Some(joined) = streams.join_next() => joined??,
                packet = reader.recv() => match packet? {
                    None => return Err(ProtocolError::ConnectionClosed.into()),
                    Some(Packet::Request { id }) => {
                        let (_, path) = self.files.remove(&id).ok_or(ProtocolError::UnknownFileId(id))?;
                        debug!(id, path = %path.display(), "content requested");
                        streams.spawn(stream_file(
                            self.conn.clone(),
                            self.workers.clone(),
                            self.progress.clone(),
                            id,
                            path,
                            self.chunk_size,
                        ));
                    }
                    Some(Packet::Finish) => {
                        while let Some(joined) = streams.join_next().await {
                            joined??;
                        }
                        self.conn.send(Packet::Finish).await?;
                        self.conn.shutdown().await?;
                        return Ok(());
                    }
                    Some(Packet::Error(msg)) => return Err(Error::Peer(msg)),
                    Some(other) => return Err(ProtocolError::UnexpectedPacket(other.kind()).into()),
                },
            }
        }
    }
}

async fn stream_file(
    conn: Conn,
    workers: Arc<Semaphore>,
    progress: Arc<Progress>,
    id: u32,
    path: PathBuf,
    chunk_size: usize,
) -> Result<()> {
    let _permit = workers.acquire_owned().await.map_err(|_| Error::Cancelled)?;
    let mut file = tokio::fs::File::open(&path)
        .await
        .io_context(|| format!("open {}", path.display()))?;

    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .io_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        total += n as u64;
        let sent = conn
            .send(Packet::Data {
                id,
                data: Bytes::copy_from_slice(&buf[..n]),
            })
            .await?;
        progress.add(sent);
    }
    let sent = conn.send(Packet::Data { id, data: Bytes::new() }).await?;
    progress.add(sent);
    debug!(id, bytes = total, "content sent");
    Ok(())
}
