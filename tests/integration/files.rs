use crate::*;

use filetime::FileTime;
use treesync::{Baseline, Blake3Comparator, DiffMode, METADATA_LOG_NAME};

/// Nested directories, an empty file, a multi-chunk file, and on Unix a
/// symlink, a hardlink and non-default permissions.
fn sample_tree(root: &Path) -> Result<()> {
    write_file(root, "a/f", "xyz")?;
    write_file(root, "a/sub/big", pattern(200_000))?;
    write_file(root, "empty", "")?;
    write_file(root, "z/deep/er/leaf", "leaf")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::os::unix::fs::symlink("a/f", root.join("link"))?;
        std::fs::hard_link(root.join("a/f"), root.join("hard"))?;
        std::fs::set_permissions(root.join("a/sub/big"), std::fs::Permissions::from_mode(0o640))?;
        std::fs::set_permissions(root.join("z/deep"), std::fs::Permissions::from_mode(0o750))?;
    }
    Ok(())
}

fn no_diff() -> ReceiveOpt {
    ReceiveOpt {
        diff: DiffMode::None,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_full_transfer_reproduces_tree() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    sample_tree(src.path())?;

    let (sent, received) = transfer(src.path(), dest.path(), SendOpt::default(), no_diff()).await;
    sent?;
    received?;

    assert_eq!(snapshot(dest.path())?, snapshot(src.path())?);
    assert_eq!(contents(dest.path())?, contents(src.path())?);
    Ok(())
}

#[tokio::test]
async fn test_small_chunks_reassemble() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    write_file(src.path(), "data", pattern(10_000))?;

    let send = SendOpt {
        chunk_size: 7,
        stream_workers: 1,
        ..Default::default()
    };
    let (sent, received) = transfer(src.path(), dest.path(), send, ReceiveOpt::default()).await;
    sent?;
    received?;

    assert_eq!(std::fs::read(dest.path().join("data"))?, pattern(10_000));
    Ok(())
}

#[tokio::test]
async fn test_second_run_changes_nothing() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    sample_tree(src.path())?;

    let (sent, received) = transfer(src.path(), dest.path(), SendOpt::default(), ReceiveOpt::default()).await;
    sent?;
    received?;

    let (sent, received, recording) =
        transfer_recorded(src.path(), dest.path(), SendOpt::default(), ReceiveOpt::default(), false).await;
    sent?;
    received?;
    assert_eq!(recording.paths(), Vec::<String>::new());
    Ok(())
}

#[tokio::test]
async fn test_reserved_log_name_is_not_transferred() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    write_file(src.path(), METADATA_LOG_NAME, "not a log")?;
    write_file(src.path(), "x", "x")?;

    let (sent, received) = transfer(src.path(), dest.path(), SendOpt::default(), ReceiveOpt::default()).await;
    sent?;
    received?;
    assert!(!dest.path().join(METADATA_LOG_NAME).exists());
    assert_eq!(std::fs::read(dest.path().join("x"))?, b"x");

    let (sent, received, recording) =
        transfer_recorded(src.path(), dest.path(), SendOpt::default(), ReceiveOpt::default(), false).await;
    sent?;
    received?;
    assert_eq!(recording.paths(), Vec::<String>::new());
    Ok(())
}

#[tokio::test]
async fn test_content_is_written_off_the_runtime_thread() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    write_file(src.path(), "f", pattern(1_000))?;

    let (sent, received, recording) =
        transfer_recorded(src.path(), dest.path(), SendOpt::default(), ReceiveOpt::default(), true).await;
    sent?;
    received?;

    let runtime = std::thread::current().id();
    let threads = recording.writer_threads.lock().unwrap();
    assert!(!threads.is_empty());
    assert!(threads.iter().all(|t| *t != runtime));
    Ok(())
}

#[tokio::test]
async fn test_modified_file_is_replaced() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    write_file(src.path(), "a/f", "xyz")?;
    write_file(src.path(), "a/g", "unchanged")?;

    let (sent, received) = transfer(src.path(), dest.path(), SendOpt::default(), ReceiveOpt::default()).await;
    sent?;
    received?;

    write_file(src.path(), "a/f", "a longer body")?;
    let (sent, received, recording) =
        transfer_recorded(src.path(), dest.path(), SendOpt::default(), ReceiveOpt::default(), false).await;
    sent?;
    received?;
    assert_eq!(recording.paths(), vec!["a/f"]);
    assert_eq!(recording.changes.lock().unwrap()[0].kind, ChangeKind::Modify);

    let (sent, received) = transfer(src.path(), dest.path(), SendOpt::default(), ReceiveOpt::default()).await;
    sent?;
    received?;
    assert_eq!(std::fs::read(dest.path().join("a/f"))?, b"a longer body");
    assert_eq!(std::fs::read(dest.path().join("a/g"))?, b"unchanged");
    Ok(())
}

#[tokio::test]
async fn test_entries_missing_from_source_are_deleted() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    write_file(src.path(), "keep", "k")?;
    write_file(dest.path(), "old/x", "x")?;
    write_file(dest.path(), "stale", "s")?;

    let (sent, received) = transfer(src.path(), dest.path(), SendOpt::default(), ReceiveOpt::default()).await;
    sent?;
    received?;

    assert!(dest.path().join("keep").exists());
    assert!(!dest.path().join("old").exists());
    assert!(!dest.path().join("stale").exists());
    Ok(())
}

#[tokio::test]
async fn test_merge_keeps_destination_entries() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    write_file(src.path(), "keep", "k")?;
    write_file(dest.path(), "stale", "s")?;

    let recv = ReceiveOpt {
        merge: true,
        ..Default::default()
    };
    let (sent, received) = transfer(src.path(), dest.path(), SendOpt::default(), recv).await;
    sent?;
    received?;

    assert_eq!(std::fs::read(dest.path().join("keep"))?, b"k");
    assert_eq!(std::fs::read(dest.path().join("stale"))?, b"s");
    Ok(())
}

#[tokio::test]
async fn test_content_mode_catches_same_size_edit() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    write_file(src.path(), "f", "xyz")?;

    let (sent, received) = transfer(src.path(), dest.path(), SendOpt::default(), ReceiveOpt::default()).await;
    sent?;
    received?;

    // Same size and mtime, different bytes.
    let mtime = FileTime::from_last_modification_time(&std::fs::metadata(src.path().join("f"))?);
    std::fs::write(dest.path().join("f"), "abc")?;
    filetime::set_file_mtime(dest.path().join("f"), mtime)?;

    let (sent, received, recording) =
        transfer_recorded(src.path(), dest.path(), SendOpt::default(), ReceiveOpt::default(), false).await;
    sent?;
    received?;
    assert!(recording.paths().is_empty(), "metadata diff cannot see the edit");

    let recv = ReceiveOpt {
        diff: DiffMode::Content,
        comparator: Some(Arc::new(Blake3Comparator::new(dest.path(), src.path()))),
        ..Default::default()
    };
    let (sent, received) = transfer(src.path(), dest.path(), SendOpt::default(), recv).await;
    sent?;
    received?;
    assert_eq!(std::fs::read(dest.path().join("f"))?, b"xyz");
    Ok(())
}

#[tokio::test]
async fn test_notify_reports_content_digest() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    write_file(src.path(), "a/f", "xyz")?;
    write_file(src.path(), "a/nothing", "")?;

    let seen: Arc<Mutex<HashMap<String, Option<blake3::Hash>>>> = Arc::default();
    let sink = seen.clone();
    let recv = ReceiveOpt {
        notify: Some(Arc::new(move |change: &Change, digest: Option<&blake3::Hash>| {
            sink.lock()
                .unwrap()
                .insert(change.stat.path.replace('\\', "/"), digest.copied());
        })),
        ..Default::default()
    };
    let (sent, received) = transfer(src.path(), dest.path(), SendOpt::default(), recv).await;
    sent?;
    received?;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.get("a"), Some(&None));
    assert_eq!(seen.get("a/f"), Some(&Some(blake3::hash(b"xyz"))));
    assert_eq!(seen.get("a/nothing"), Some(&Some(blake3::hash(b""))));
    Ok(())
}

#[tokio::test]
async fn test_progress_reports_completion() -> Result<()> {
    let src = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    write_file(src.path(), "f", pattern(5_000))?;

    let sender_calls: Arc<Mutex<Vec<(u64, bool)>>> = Arc::default();
    let receiver_calls: Arc<Mutex<Vec<(u64, bool)>>> = Arc::default();
    let (s, r) = (sender_calls.clone(), receiver_calls.clone());
    let send = SendOpt {
        progress: Some(Arc::new(move |bytes, done| s.lock().unwrap().push((bytes, done)))),
        ..Default::default()
    };
    let recv = ReceiveOpt {
        progress: Some(Arc::new(move |bytes, done| r.lock().unwrap().push((bytes, done)))),
        ..Default::default()
    };
    let (sent, received) = transfer(src.path(), dest.path(), send, recv).await;
    sent?;
    received?;

    for calls in [sender_calls, receiver_calls] {
        let calls = calls.lock().unwrap();
        let (total, done) = *calls.last().expect("progress reported");
        assert!(done);
        assert!(total > 5_000);
    }
    Ok(())
}

#[tokio::test]
async fn test_baseline_sends_changed_entries_with_ancestors() -> Result<()> {
    let src = tempfile::tempdir()?;
    let base = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    write_file(src.path(), "d/e/changed", "before")?;
    write_file(src.path(), "d/same", "same")?;
    write_file(src.path(), "top", "top")?;

    let (sent, received) = transfer(src.path(), base.path(), SendOpt::default(), no_diff()).await;
    sent?;
    received?;

    write_file(src.path(), "d/e/changed", "after, and longer")?;
    let send = SendOpt {
        baseline: Some(Baseline {
            root: base.path().to_path_buf(),
            mode: DiffMode::Metadata,
            comparator: None,
        }),
        ..Default::default()
    };
    let recv = ReceiveOpt {
        merge: true,
        ..no_diff()
    };
    let (sent, received, recording) = transfer_recorded(src.path(), out.path(), send, recv, true).await;
    sent?;
    received?;

    assert_eq!(recording.paths(), vec!["d", "d/e", "d/e/changed"]);
    let contents = recording.contents.lock().unwrap();
    assert_eq!(contents.get(Path::new("d/e/changed")).map(Vec::as_slice), Some(&b"after, and longer"[..]));
    assert_eq!(contents.len(), 1);
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_baseline_link_to_unchanged_file_is_sent_as_file() -> Result<()> {
    let src = tempfile::tempdir()?;
    let base = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    write_file(src.path(), "a", "xyz")?;

    let (sent, received) = transfer(src.path(), base.path(), SendOpt::default(), no_diff()).await;
    sent?;
    received?;

    std::fs::hard_link(src.path().join("a"), src.path().join("b"))?;
    let send = SendOpt {
        baseline: Some(Baseline {
            root: base.path().to_path_buf(),
            mode: DiffMode::Metadata,
            comparator: None,
        }),
        ..Default::default()
    };
    let recv = ReceiveOpt {
        merge: true,
        ..no_diff()
    };
    let (sent, received, recording) = transfer_recorded(src.path(), out.path(), send, recv, true).await;
    sent?;
    received?;

    assert_eq!(recording.paths(), vec!["b"]);
    {
        let changes = recording.changes.lock().unwrap();
        assert!(!changes[0].stat.is_hardlink());
        assert_eq!(changes[0].stat.size, 3);
    }
    let contents = recording.contents.lock().unwrap();
    assert_eq!(contents.get(Path::new("b")).map(Vec::as_slice), Some(&b"xyz"[..]));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_baseline_link_to_changed_file_stays_a_link() -> Result<()> {
    let src = tempfile::tempdir()?;
    let base = tempfile::tempdir()?;
    let out = tempfile::tempdir()?;
    write_file(src.path(), "a", "xyz")?;

    let (sent, received) = transfer(src.path(), base.path(), SendOpt::default(), no_diff()).await;
    sent?;
    received?;

    write_file(src.path(), "a", "longer body")?;
    std::fs::hard_link(src.path().join("a"), src.path().join("b"))?;
    let send = SendOpt {
        baseline: Some(Baseline {
            root: base.path().to_path_buf(),
            mode: DiffMode::Metadata,
            comparator: None,
        }),
        ..Default::default()
    };
    let recv = ReceiveOpt {
        merge: true,
        ..no_diff()
    };
    let (sent, received) = transfer(src.path(), out.path(), send, recv).await;
    sent?;
    received?;

    use std::os::unix::fs::MetadataExt;
    let a = std::fs::metadata(out.path().join("a"))?;
    let b = std::fs::metadata(out.path().join("b"))?;
    assert_eq!(a.ino(), b.ino());
    assert_eq!(std::fs::read(out.path().join("b"))?, b"longer body");
    Ok(())
}
