use crate::*;

use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use treesync::{Error, ProtocolError, ValidationError, METADATA_LOG_NAME};
use treesync_core::path::{PathError, PathStyle};
use treesync_core::stat::{S_IFDIR, S_IFREG};
use treesync_core::wire::Packet;

fn dir(path: &str) -> Stat {
    Stat {
        path: path.into(),
        mode: S_IFDIR | 0o755,
        mod_time: 1,
        ..Default::default()
    }
}

fn file(path: &str, size: u64) -> Stat {
    Stat {
        path: path.into(),
        mode: S_IFREG | 0o644,
        size,
        mod_time: 1,
        ..Default::default()
    }
}

/// Run a receiver with a fetching `RecordingConsumer` against a raw sender.
fn spawn_receiver(
    reader: Reader,
    writer: Writer,
    dest: &Path,
    opt: ReceiveOpt,
) -> (JoinHandle<treesync::Result<()>>, Recording) {
    let recording = Recording::default();
    let rec = recording.clone();
    let dest = dest.to_path_buf();
    let handle = tokio::spawn(async move {
        treesync::receive_with(reader, writer, &dest, opt, move |requester| {
            Ok(RecordingConsumer::new(rec, requester, true))
        })
        .await
    });
    (handle, recording)
}

/// Feed `packets` to a fresh receiver and return its error.
async fn receiver_error(packets: &[Packet]) -> Result<(Error, RawPeer)> {
    let dest = tempfile::tempdir()?;
    let (mut peer, r, w) = raw_peer();
    let (receiver, _) = spawn_receiver(r, w, dest.path(), ReceiveOpt::default());
    for packet in packets {
        peer.writer.send(packet).await?;
    }
    let err = receiver.await?.expect_err("receiver should fail");
    Ok((err, peer))
}

// ── Sender side ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sender_wire_sequence() -> Result<()> {
    let src = tempfile::tempdir()?;
    write_file(src.path(), "a/f", "xyz")?;

    let (mut peer, r, w) = raw_peer();
    let root = src.path().to_path_buf();
    let sender = tokio::spawn(async move { treesync::send(r, w, &root, SendOpt::default()).await });

    let Some(Packet::Stat(Some(a))) = peer.reader.recv().await? else {
        panic!("expected STAT for a");
    };
    assert_eq!(a.path, "a");
    assert!(a.is_dir());
    let Some(Packet::Stat(Some(f))) = peer.reader.recv().await? else {
        panic!("expected STAT for a/f");
    };
    assert_eq!(f.path, "a/f");
    assert_eq!(f.size, 3);
    assert!(f.is_regular());
    assert_eq!(peer.reader.recv().await?, Some(Packet::Stat(None)));

    peer.writer.send(&Packet::Request { id: 1 }).await?;
    assert_eq!(
        peer.reader.recv().await?,
        Some(Packet::Data { id: 1, data: Bytes::from_static(b"xyz") })
    );
    assert_eq!(peer.reader.recv().await?, Some(Packet::Data { id: 1, data: Bytes::new() }));

    peer.writer.send(&Packet::Finish).await?;
    assert_eq!(peer.reader.recv().await?, Some(Packet::Finish));
    assert_eq!(peer.reader.recv().await?, None);
    sender.await??;
    Ok(())
}

#[tokio::test]
async fn test_sender_rejects_unknown_request() -> Result<()> {
    let src = tempfile::tempdir()?;
    write_file(src.path(), "a/f", "xyz")?;

    let (mut peer, r, w) = raw_peer();
    let root = src.path().to_path_buf();
    let sender = tokio::spawn(async move { treesync::send(r, w, &root, SendOpt::default()).await });

    while peer.reader.recv().await? != Some(Packet::Stat(None)) {}
    // Id 0 is the directory, which has no content.
    peer.writer.send(&Packet::Request { id: 0 }).await?;

    let err = sender.await?.expect_err("sender should fail");
    assert!(matches!(err, Error::Protocol(ProtocolError::UnknownFileId(0))), "{err}");
    assert!(matches!(peer.reader.recv().await?, Some(Packet::Error(_))));
    Ok(())
}

#[tokio::test]
async fn test_sender_surfaces_peer_error() -> Result<()> {
    let src = tempfile::tempdir()?;
    write_file(src.path(), "f", "x")?;

    let (mut peer, r, w) = raw_peer();
    let root = src.path().to_path_buf();
    let sender = tokio::spawn(async move { treesync::send(r, w, &root, SendOpt::default()).await });

    peer.writer.send(&Packet::Error("disk on fire".into())).await?;
    let err = sender.await?.expect_err("sender should fail");
    assert!(matches!(&err, Error::Peer(msg) if msg == "disk on fire"), "{err}");
    Ok(())
}

// ── Receiver side ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_receiver_pulls_announced_content() -> Result<()> {
    let dest = tempfile::tempdir()?;
    let (mut peer, r, w) = raw_peer();
    let (receiver, recording) = spawn_receiver(r, w, dest.path(), ReceiveOpt::default());

    peer.writer.send(&Packet::Stat(Some(dir("a")))).await?;
    peer.writer.send(&Packet::Stat(Some(file("a/f", 3)))).await?;
    peer.writer.send(&Packet::Stat(None)).await?;

    assert_eq!(peer.reader.recv().await?, Some(Packet::Request { id: 1 }));
    peer.writer
        .send(&Packet::Data { id: 1, data: Bytes::from_static(b"xy") })
        .await?;
    peer.writer
        .send(&Packet::Data { id: 1, data: Bytes::from_static(b"z") })
        .await?;
    peer.writer.send(&Packet::Data { id: 1, data: Bytes::new() }).await?;

    assert_eq!(peer.reader.recv().await?, Some(Packet::Finish));
    peer.writer.send(&Packet::Finish).await?;
    peer.writer.shutdown().await?;
    receiver.await??;

    assert_eq!(recording.paths(), vec!["a", "a/f"]);
    let contents = recording.contents.lock().unwrap();
    assert_eq!(contents.get(Path::new("a/f")).map(Vec::as_slice), Some(&b"xyz"[..]));
    Ok(())
}

#[tokio::test]
async fn test_reserved_entry_is_skipped_but_numbered() -> Result<()> {
    let dest = tempfile::tempdir()?;
    let (mut peer, r, w) = raw_peer();
    let (receiver, recording) = spawn_receiver(r, w, dest.path(), ReceiveOpt::default());

    peer.writer.send(&Packet::Stat(Some(file(METADATA_LOG_NAME, 3)))).await?;
    peer.writer.send(&Packet::Stat(Some(file("x", 1)))).await?;
    peer.writer.send(&Packet::Stat(None)).await?;

    assert_eq!(peer.reader.recv().await?, Some(Packet::Request { id: 1 }));
    peer.writer
        .send(&Packet::Data { id: 1, data: Bytes::from_static(b"x") })
        .await?;
    peer.writer.send(&Packet::Data { id: 1, data: Bytes::new() }).await?;

    assert_eq!(peer.reader.recv().await?, Some(Packet::Finish));
    peer.writer.send(&Packet::Finish).await?;
    peer.writer.shutdown().await?;
    receiver.await??;

    assert_eq!(recording.paths(), vec!["x"]);
    Ok(())
}

#[tokio::test]
async fn test_out_of_order_entries_are_rejected() -> Result<()> {
    let (err, mut peer) = receiver_error(&[Packet::Stat(Some(dir("b"))), Packet::Stat(Some(dir("a")))]).await?;
    assert!(matches!(err, Error::Validation(ValidationError::OutOfOrder { .. })), "{err}");

    match peer.reader.recv().await? {
        Some(Packet::Error(msg)) => assert!(msg.contains("does not sort after"), "{msg}"),
        other => panic!("expected ERROR, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_entry_without_parent_is_rejected() -> Result<()> {
    let (err, _peer) = receiver_error(&[Packet::Stat(Some(file("a/b", 0)))]).await?;
    assert!(matches!(err, Error::Validation(ValidationError::MissingParent { .. })), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_unclean_path_is_rejected() -> Result<()> {
    let (err, _peer) = receiver_error(&[Packet::Stat(Some(file("../escape", 0)))]).await?;
    assert!(matches!(err, Error::Validation(ValidationError::UncleanPath { .. })), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_hardlink_to_unseen_entry_is_rejected() -> Result<()> {
    let link = Stat {
        linkname: "missing".into(),
        ..file("link", 0)
    };
    let (err, _peer) = receiver_error(&[Packet::Stat(Some(link))]).await?;
    assert!(matches!(err, Error::Validation(ValidationError::InvalidHardlink { .. })), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_accepted_hardlink_to_rejected_file_is_rejected() -> Result<()> {
    let dest = tempfile::tempdir()?;
    let (mut peer, r, w) = raw_peer();
    let opt = ReceiveOpt {
        metadata_only: Some(Arc::new(|p: &Path, _: &Stat| p == Path::new("b"))),
        ..Default::default()
    };
    let (receiver, _) = spawn_receiver(r, w, dest.path(), opt);

    let link = Stat {
        linkname: "a".into(),
        ..file("b", 0)
    };
    peer.writer.send(&Packet::Stat(Some(file("a", 3)))).await?;
    peer.writer.send(&Packet::Stat(Some(link))).await?;

    let err = receiver.await?.expect_err("receiver should fail");
    assert!(
        matches!(&err, Error::Validation(ValidationError::InvalidHardlink { target, .. }) if target == "a"),
        "{err}"
    );
    Ok(())
}

#[tokio::test]
async fn test_unrepresentable_path_is_rejected() -> Result<()> {
    let (err, _peer) = receiver_error(&[Packet::Stat(Some(file("a\0b", 0)))]).await?;
    assert!(matches!(err, Error::Path(PathError::Unrepresentable { .. })), "{err}");

    assert!(matches!(
        PathStyle::Windows.from_wire("foo/bar\\baz"),
        Err(PathError::Unrepresentable { .. })
    ));
    assert_eq!(PathStyle::Windows.from_wire("foo/bar").as_deref(), Ok("foo\\bar"));
    Ok(())
}

#[tokio::test]
async fn test_data_after_eof_is_rejected() -> Result<()> {
    let dest = tempfile::tempdir()?;
    let (mut peer, r, w) = raw_peer();
    let (receiver, _) = spawn_receiver(r, w, dest.path(), ReceiveOpt::default());

    peer.writer.send(&Packet::Stat(Some(file("f", 3)))).await?;
    peer.writer.send(&Packet::Stat(None)).await?;
    assert_eq!(peer.reader.recv().await?, Some(Packet::Request { id: 0 }));
    peer.writer
        .send(&Packet::Data { id: 0, data: Bytes::from_static(b"abc") })
        .await?;
    peer.writer.send(&Packet::Data { id: 0, data: Bytes::new() }).await?;
    peer.writer
        .send(&Packet::Data { id: 0, data: Bytes::from_static(b"x") })
        .await?;

    let err = receiver.await?.expect_err("receiver should fail");
    assert!(matches!(err, Error::Protocol(ProtocolError::DataAfterEof(0))), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_data_for_unrequested_id_is_rejected() -> Result<()> {
    let (err, _peer) = receiver_error(&[
        Packet::Stat(None),
        Packet::Data { id: 5, data: Bytes::from_static(b"zz") },
    ])
    .await?;
    assert!(matches!(err, Error::Protocol(ProtocolError::UnknownDataId(5))), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_metadata_stream_violations() -> Result<()> {
    let (err, _peer) = receiver_error(&[Packet::Stat(None), Packet::Stat(None)]).await?;
    assert!(matches!(err, Error::Protocol(ProtocolError::DuplicateStatEof)), "{err}");

    let (err, _peer) = receiver_error(&[Packet::Stat(None), Packet::Stat(Some(dir("late")))]).await?;
    assert!(matches!(err, Error::Protocol(ProtocolError::StatAfterEof)), "{err}");

    let (err, _peer) = receiver_error(&[Packet::Finish]).await?;
    assert!(matches!(err, Error::Protocol(ProtocolError::FinishBeforeStatEof)), "{err}");

    let (err, _peer) = receiver_error(&[Packet::Request { id: 0 }]).await?;
    assert!(matches!(err, Error::Protocol(ProtocolError::UnexpectedPacket(_))), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_receiver_surfaces_peer_error() -> Result<()> {
    let (err, mut peer) = receiver_error(&[Packet::Error("disk on fire".into())]).await?;
    assert!(matches!(&err, Error::Peer(msg) if msg == "disk on fire"), "{err}");
    // A peer's own error is not echoed back.
    assert_eq!(peer.reader.recv().await?, None);
    Ok(())
}

#[tokio::test]
async fn test_close_before_finish_is_an_error() -> Result<()> {
    let dest = tempfile::tempdir()?;
    let (mut peer, r, w) = raw_peer();
    let (receiver, _) = spawn_receiver(r, w, dest.path(), ReceiveOpt::default());

    peer.writer.send(&Packet::Stat(None)).await?;
    peer.writer.shutdown().await?;

    let err = receiver.await?.expect_err("receiver should fail");
    assert!(matches!(err, Error::Protocol(ProtocolError::ConnectionClosed)), "{err}");
    Ok(())
}

#[tokio::test]
async fn test_cancellation_stops_receiver() -> Result<()> {
    let dest = tempfile::tempdir()?;
    let (_peer, r, w) = raw_peer();
    let cancel = CancellationToken::new();
    let opt = ReceiveOpt {
        cancel: cancel.clone(),
        ..Default::default()
    };
    let (receiver, _) = spawn_receiver(r, w, dest.path(), opt);

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();
    let err = receiver.await?.expect_err("receiver should fail");
    assert!(err.is_cancelled(), "{err}");
    Ok(())
}
