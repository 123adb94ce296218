//! Durability and recovery tests against real files.

use bytes::Bytes;
use quill_core::Position;
use quill_journal::{Journal, JournalConfig, JournalError, TokioStorage};

fn config(dir: &std::path::Path) -> JournalConfig {
    JournalConfig::new(dir).with_segment_size(64 * 1024)
}

#[tokio::test]
async fn test_flushed_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let (flushed, payloads) = {
        let mut journal = Journal::recover(TokioStorage::new(), config(dir.path()))
            .await
            .unwrap();
        let payloads = vec![
            Bytes::from("alpha"),
            Bytes::from("beta"),
            Bytes::from(vec![42u8; 4096]),
        ];
        journal.append(&payloads).await.unwrap();
        let flushed = journal.flush().await.unwrap();
        (flushed, payloads)
    };

    let journal = Journal::recover(TokioStorage::new(), config(dir.path()))
        .await
        .unwrap();
    assert_eq!(journal.max(), flushed);
    assert_eq!(journal.flushed(), journal.max());

    let mut position = Position::new(0);
    for expected in &payloads {
        let (payload, next) = journal.read_record(position).await.unwrap();
        assert_eq!(&payload, expected);
        position = next;
    }
    assert_eq!(position, journal.max());
}

#[tokio::test]
async fn test_torn_write_truncated_on_recovery() {
    let dir = tempfile::tempdir().unwrap();

    let good_max = {
        let mut journal = Journal::recover(TokioStorage::new(), config(dir.path()))
            .await
            .unwrap();
        journal.append(&[Bytes::from("committed")]).await.unwrap();
        journal.flush().await.unwrap();
        let good = journal.max();
        journal.append(&[Bytes::from("in flight")]).await.unwrap();
        good
    };

    // Simulate a crash mid-write by chopping bytes off the segment tail.
    let segment = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().is_some_and(|e| e == "jnl"))
        .unwrap();
    let len = std::fs::metadata(&segment).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&segment)
        .unwrap();
    file.set_len(len - 3).unwrap();

    let journal = Journal::recover(TokioStorage::new(), config(dir.path()))
        .await
        .unwrap();
    assert_eq!(journal.max(), good_max);

    let (payload, _) = journal.read_record(Position::new(0)).await.unwrap();
    assert_eq!(payload, Bytes::from("committed"));
}

#[tokio::test]
async fn test_recovery_spans_segments() {
    let dir = tempfile::tempdir().unwrap();
    let payload = Bytes::from(vec![9u8; 24 * 1024]);

    let max = {
        let mut journal = Journal::recover(TokioStorage::new(), config(dir.path()))
            .await
            .unwrap();
        for _ in 0..8 {
            journal.append(&[payload.clone()]).await.unwrap();
        }
        journal.flush().await.unwrap();
        journal.max()
    };

    let segment_count = std::fs::read_dir(dir.path())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .path()
                .extension()
                .is_some_and(|x| x == "jnl")
        })
        .count();
    assert!(segment_count > 1, "expected rotation across segments");

    let journal = Journal::recover(TokioStorage::new(), config(dir.path()))
        .await
        .unwrap();
    assert_eq!(journal.max(), max);

    let mut position = Position::new(0);
    let mut records = 0;
    while position < journal.max() {
        let (p, next) = journal.read_record(position).await.unwrap();
        assert_eq!(p.len(), payload.len());
        position = next;
        records += 1;
    }
    assert_eq!(records, 8);
}

#[tokio::test]
async fn test_shrink_then_read_below_min_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut journal = Journal::recover(TokioStorage::new(), config(dir.path()))
        .await
        .unwrap();

    let payload = Bytes::from(vec![5u8; 24 * 1024]);
    for _ in 0..8 {
        journal.append(&[payload.clone()]).await.unwrap();
    }
    journal.flush().await.unwrap();

    let given_min = Position::new(journal.max().get() / 2);
    let new_min = journal.shrink(given_min).await.unwrap();
    assert!(new_min <= given_min);
    assert_eq!(journal.min(), new_min);

    // Everything at and above the new min stays readable.
    let (p, _) = journal.read_record(new_min).await.unwrap();
    assert_eq!(p.len(), payload.len());

    // Positions below the new min are gone.
    if new_min.get() > 0 {
        let result = journal.read(Position::new(new_min.get() - 1), 10).await;
        assert!(matches!(result, Err(JournalError::OutOfRange { .. })));
    }
}

#[tokio::test]
async fn test_truncate_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let cut = {
        let mut journal = Journal::recover(TokioStorage::new(), config(dir.path()))
            .await
            .unwrap();
        journal.append(&[Bytes::from("keep")]).await.unwrap();
        let cut = journal.max();
        journal.append(&[Bytes::from("discard")]).await.unwrap();
        journal.flush().await.unwrap();
        journal.truncate(cut).await.unwrap();
        cut
    };

    let journal = Journal::recover(TokioStorage::new(), config(dir.path()))
        .await
        .unwrap();
    assert_eq!(journal.max(), cut);

    let (payload, _) = journal.read_record(Position::new(0)).await.unwrap();
    assert_eq!(payload, Bytes::from("keep"));
}
