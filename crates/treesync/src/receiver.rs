//! Receiving side of a transfer.
//!
//! Two phases run concurrently and fail fast:
//!
//!   diff      destination walk vs. incoming records → change consumer,
//!             then `consumer.wait()`, then FINISH to the peer
//!   dispatch  every incoming packet: STAT records are validated and fed to
//!             the diff phase, DATA is routed to the sink opened for its id
//!
//! Content is pulled lazily. The consumer calls `ContentRequester::request`
//! for the paths it needs; that sends REQUEST and runs the sink on the
//! blocking pool, fed by the dispatch phase, until the empty chunk closes it.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use treesync_core::config::{ReceiveConfig, TuningConfig};
use treesync_core::path::{from_wire, link_from_wire};
use treesync_core::wire::{Packet, PacketKind, PacketReader};
use treesync_core::{DiffMode, Stat};

use crate::change::{ChangeConsumer, ChangeKind};
use crate::conn::Conn;
use crate::diff::{ContentComparator, DiffStream};
use crate::disk_writer::{DiskWriter, NotifyFn};
use crate::error::{Error, IoContext, ProtocolError, Result};
use crate::metadata_log::{MetadataLog, METADATA_LOG_NAME};
use crate::progress::{Progress, ProgressFn};
use crate::stack::AncestorStack;
use crate::validator::{HardlinkValidator, Observer, OrderValidator};
use crate::walker::{spawn_walk, Entry, FilterFn, WalkOpt};

/// Acceptance test for metadata-only transfers.
pub type MetadataFilterFn = Arc<dyn Fn(&Path, &Stat) -> bool + Send + Sync>;

pub struct ReceiveOpt {
    pub diff: DiffMode,
    /// Keep destination entries the sender does not have.
    pub merge: bool,
    /// Applied to both the destination walk and the incoming records.
    pub filter: Option<FilterFn>,
    /// Enables metadata-only mode: only accepted entries (and the directories
    /// leading to them) reach the consumer, and every record is logged.
    pub metadata_only: Option<MetadataFilterFn>,
    pub comparator: Option<Arc<dyn ContentComparator>>,
    /// Passed to the default `DiskWriter`.
    pub notify: Option<NotifyFn>,
    pub progress: Option<ProgressFn>,
    pub walk_queue_depth: usize,
    pub feed_queue_depth: usize,
    pub cancel: CancellationToken,
}

impl Default for ReceiveOpt {
    fn default() -> Self {
        Self::from_config(&ReceiveConfig::default(), &TuningConfig::default())
    }
}

impl ReceiveOpt {
    pub fn from_config(receive: &ReceiveConfig, tuning: &TuningConfig) -> Self {
        Self {
            diff: receive.diff,
            merge: receive.merge,
            filter: None,
            metadata_only: None,
            comparator: None,
            notify: None,
            progress: None,
            walk_queue_depth: tuning.walk_queue_depth,
            feed_queue_depth: tuning.feed_queue_depth,
            cancel: CancellationToken::new(),
        }
    }
}

// ── Content pull ──────────────────────────────────────────────────────────────

/// Chunks buffered per open sink before the dispatch phase waits.
const SINK_QUEUE_DEPTH: usize = 16;

/// Destination for the content of one file. Called from a blocking thread.
pub trait ContentSink: Send + Sync {
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

#[derive(Default)]
struct Shared {
    /// Content-eligible paths not yet requested.
    pending: DashMap<PathBuf, u32>,
    /// Requested files still receiving data. An empty chunk ends the file.
    sinks: DashMap<u32, mpsc::Sender<Bytes>>,
    /// Files whose content has ended.
    closed: DashSet<u32>,
}

/// Handle a change consumer uses to pull file content from the sender.
#[derive(Clone)]
pub struct ContentRequester {
    shared: Arc<Shared>,
    conn: Conn,
    cancel: CancellationToken,
}

impl ContentRequester {
    /// Request the content of `path` and stream it into `sink`. Returns once
    /// the sink has been closed. Each path can be requested once.
    ///
    /// If the transfer stops first, the sink is dropped without `close`.
    pub async fn request(&self, path: &Path, mut sink: Box<dyn ContentSink>) -> Result<()> {
        let id = self
            .shared
            .pending
            .remove(path)
            .map(|(_, id)| id)
            .ok_or_else(|| ProtocolError::InvalidFileRequest(path.display().to_string()))?;

        let (chunks, mut incoming) = mpsc::channel::<Bytes>(SINK_QUEUE_DEPTH);
        self.shared.sinks.insert(id, chunks);
        debug!(id, path = %path.display(), "requesting content");
        self.conn.send(Packet::Request { id }).await?;

        // Ok(false): the queue closed before the end of content.
        let writer = tokio::task::spawn_blocking(move || -> io::Result<bool> {
            while let Some(chunk) = incoming.blocking_recv() {
                if chunk.is_empty() {
                    sink.close()?;
                    return Ok(true);
                }
                sink.write_chunk(&chunk)?;
            }
            Ok(false)
        });
        let finished = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            r = writer => r?,
        };
        if finished.io_context(|| format!("write content of {}", path.display()))? {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }
}

// ── Entry points ──────────────────────────────────────────────────────────────

/// Receive a tree into `dest`, writing it with a `DiskWriter`.
pub async fn receive<R, W>(reader: R, writer: W, dest: impl AsRef<Path>, opt: ReceiveOpt) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let root = dest.as_ref().to_path_buf();
    let notify = opt.notify.clone();
    receive_with(reader, writer, dest, opt, move |requester| {
        Ok(DiskWriter::new(root, requester).with_notify(notify))
    })
    .await
}

/// Receive a tree, applying changes through a custom consumer built from the
/// transfer's `ContentRequester`.
pub async fn receive_with<R, W, C, F>(
    reader: R,
    writer: W,
    dest: impl AsRef<Path>,
    opt: ReceiveOpt,
    make_consumer: F,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
    C: ChangeConsumer,
    F: FnOnce(ContentRequester) -> Result<C>,
{
    let dest = dest.as_ref().to_path_buf();
    let conn = Conn::new(writer);
    let cancel = opt.cancel.child_token();
    let _guard = cancel.clone().drop_guard();

    info!(dest = %dest.display(), diff = ?opt.diff, merge = opt.merge, "receiving tree");
    let result = run(PacketReader::new(reader), conn.clone(), &dest, opt, cancel, make_consumer).await;
    match &result {
        Ok(()) => info!(dest = %dest.display(), "receive complete"),
        Err(e) => {
            warn!(dest = %dest.display(), error = %e, "receive failed");
            conn.send_error(e).await;
        }
    }
    result
}

async fn run<R, C, F>(
    mut reader: PacketReader<R>,
    conn: Conn,
    dest: &Path,
    opt: ReceiveOpt,
    cancel: CancellationToken,
    make_consumer: F,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    C: ChangeConsumer,
    F: FnOnce(ContentRequester) -> Result<C>,
{
    tokio::fs::create_dir_all(dest)
        .await
        .io_context(|| format!("create {}", dest.display()))?;

    let shared = Arc::new(Shared::default());
    let mut consumer = make_consumer(ContentRequester {
        shared: shared.clone(),
        conn: conn.clone(),
        cancel: cancel.clone(),
    })?;

    let (feed, incoming) = mpsc::channel(opt.feed_queue_depth.max(1));
    let lower = if opt.merge {
        let (_, empty) = mpsc::channel(1);
        empty
    } else {
        let walk = WalkOpt {
            exclude_patterns: vec![METADATA_LOG_NAME.to_string()],
            ..Default::default()
        };
        spawn_walk(dest.to_path_buf(), walk, opt.walk_queue_depth, cancel.clone())
    };
    let diff = DiffStream::new(lower, incoming, opt.diff)
        .with_filter(opt.filter.clone())
        .with_comparator(opt.comparator.clone());

    let progress = Progress::new(opt.progress.clone());
    let mut dispatch = Dispatch {
        shared,
        feed: Some(feed),
        next_id: 0,
        order: OrderValidator::new(),
        links: HardlinkValidator::new(),
        metadata: opt.metadata_only.clone().map(|filter| MetadataOnly {
            filter,
            log: MetadataLog::new(),
            ancestors: AncestorStack::new(),
        }),
        progress: &progress,
    };

    let transfer = async {
        tokio::try_join!(
            apply_changes(diff, &mut consumer, &conn),
            dispatch.run(&mut reader)
        )
    };
    tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        r = transfer => { r?; }
    }

    if let Some(m) = &dispatch.metadata {
        let path = m.log.persist(dest)?;
        debug!(path = %path.display(), records = m.log.len(), "metadata log written");
    }
    progress.done();
    Ok(())
}

async fn apply_changes<C: ChangeConsumer>(mut diff: DiffStream, consumer: &mut C, conn: &Conn) -> Result<()> {
    let mut applied = 0usize;
    while let Some(change) = diff.next().await? {
        debug!(kind = %change.kind, path = %change.path.display(), "change");
        consumer.handle_change(change).await?;
        applied += 1;
    }
    consumer.wait().await?;
    conn.send(Packet::Finish).await?;
    debug!(changes = applied, "diff phase complete");
    Ok(())
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

struct MetadataOnly {
    filter: MetadataFilterFn,
    log: MetadataLog,
    ancestors: AncestorStack<Entry>,
}

struct Dispatch<'a> {
    shared: Arc<Shared>,
    /// Dropped at end of metadata, which ends the diff phase's input.
    feed: Option<mpsc::Sender<Result<Entry>>>,
    next_id: u32,
    order: OrderValidator,
    links: HardlinkValidator,
    metadata: Option<MetadataOnly>,
    progress: &'a Progress,
}

impl Dispatch<'_> {
    async fn run<R: AsyncRead + Unpin>(&mut self, reader: &mut PacketReader<R>) -> Result<()> {
        let mut stat_eof = false;
        loop {
            let before = reader.bytes_read();
            let packet = reader.recv().await?;
            self.progress.add(reader.bytes_read() - before);

            match packet {
                None => return Err(ProtocolError::ConnectionClosed.into()),
                Some(Packet::Stat(Some(stat))) => {
                    if stat_eof {
                        return Err(ProtocolError::StatAfterEof.into());
                    }
                    self.handle_stat(stat).await?;
                }
                Some(Packet::Stat(None)) => {
                    if stat_eof {
                        return Err(ProtocolError::DuplicateStatEof.into());
                    }
                    stat_eof = true;
                    self.feed = None;
                    debug!(entries = self.next_id, "end of metadata");
                }
                Some(Packet::Data { id, data }) => self.handle_data(id, data).await?,
                Some(Packet::Finish) => {
                    if !stat_eof {
                        return Err(ProtocolError::FinishBeforeStatEof.into());
                    }
                    // The peer may still be flushing; discard until it closes.
                    while reader.recv().await?.is_some() {}
                    return Ok(());
                }
                Some(Packet::Error(msg)) => return Err(Error::Peer(msg)),
                Some(Packet::Request { .. }) => {
                    return Err(ProtocolError::UnexpectedPacket(PacketKind::Request).into())
                }
            }
        }
    }

    async fn handle_stat(&mut self, mut stat: Stat) -> Result<()> {
        let wire = self.metadata.is_some().then(|| stat.clone());

        let path = from_wire(&stat.path)?;
        stat.linkname = link_from_wire(&stat.linkname)?;
        stat.path = path.to_string_lossy().into_owned();

        let id = self.next_id;
        self.next_id += 1;

        // The id is still spent so later records keep their numbering.
        if path == Path::new(METADATA_LOG_NAME) {
            debug!(id, "skipping reserved entry");
            return Ok(());
        }

        let accepted = match (&mut self.metadata, wire) {
            (Some(m), Some(wire)) => {
                m.log.append(&wire)?;
                (m.filter)(&path, &stat)
            }
            _ => true,
        };

        self.order.observe(ChangeKind::Add, &path, &stat)?;
        // Rejected entries never reach the consumer, so they are not link targets.
        if accepted {
            self.links.observe(ChangeKind::Add, &path, &stat)?;
        }

        if accepted && stat.can_request_data() {
            self.shared.pending.insert(path.clone(), id);
        }
        debug!(id, path = %path.display(), accepted, "stat");

        let entry = Entry { path, stat };
        let ready: Vec<Entry> = match &mut self.metadata {
            None => vec![entry],
            Some(m) => {
                m.ancestors.truncate_while(|a| !entry.path.starts_with(&a.path));
                if !accepted {
                    if entry.stat.is_dir() {
                        m.ancestors.push(entry);
                    }
                    return Ok(());
                }
                m.ancestors.drain().chain(std::iter::once(entry)).collect()
            }
        };
        for entry in ready {
            self.forward(entry).await?;
        }
        Ok(())
    }

    async fn forward(&self, entry: Entry) -> Result<()> {
        let Some(feed) = &self.feed else {
            return Err(ProtocolError::StatAfterEof.into());
        };
        feed.send(Ok(entry)).await.map_err(|_| Error::Cancelled)
    }

    async fn handle_data(&self, id: u32, data: Bytes) -> Result<()> {
        if self.shared.closed.contains(&id) {
            return Err(ProtocolError::DataAfterEof(id).into());
        }
        let end = data.is_empty();
        let chunks = if end {
            self.shared.sinks.remove(&id).map(|(_, tx)| tx)
        } else {
            self.shared.sinks.get(&id).map(|tx| tx.clone())
        }
        .ok_or(ProtocolError::UnknownDataId(id))?;
        if end {
            self.shared.closed.insert(id);
        }

        // A closed queue means the sink already failed; its writer reports why.
        chunks.send(data).await.map_err(|_| {
            Error::io(
                format!("write content of file {id}"),
                io::Error::new(io::ErrorKind::BrokenPipe, "content sink stopped"),
            )
        })?;
        if end {
            debug!(id, "content complete");
        }
        Ok(())
    }
}
