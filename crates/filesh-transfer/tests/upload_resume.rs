//! Upload state machine: interruption, resume, retries and failure budgets
//!
//! Sizes are scaled down (KiB instead of MiB); chunk arithmetic is the same.

mod common;

use bytes::Bytes;
use common::{content, test_config, FakeApi, UNIT};
use filesh_crypto::STREAM_OVERHEAD;
use filesh_transfer::{
    BatchStatus, ChunkStatus, DownloadManager, Spool, TransferError, TransferStore, UploadManager,
    UploadSource,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn source(name: &str, data: Vec<u8>) -> UploadSource {
    UploadSource::Bytes {
        name: name.into(),
        mime_type: "application/octet-stream".into(),
        data: Bytes::from(data),
    }
}

async fn completed(store: &TransferStore, batch_id: &str) -> usize {
    store
        .chunks_for(batch_id)
        .await
        .iter()
        .filter(|c| c.status == ChunkStatus::Completed)
        .count()
}

/// 25 "MB" file in 5 "MB" chunks; stop after two chunks, restart the
/// process, resume: only the last three chunks travel again.
#[tokio::test]
async fn interrupted_upload_resumes_with_remaining_chunks_only() {
    let tmp = TempDir::new().unwrap();
    let state_path = tmp.path().join("state.json");
    let spool_dir = tmp.path().join("spool");
    let cfg = test_config(5 * UNIT, 1);

    let api = Arc::new(FakeApi::new());
    let original = content(25 * UNIT - STREAM_OVERHEAD);

    // first process
    let batch_id = {
        let store = TransferStore::open_json(&state_path).unwrap();
        let manager = UploadManager::new(api.clone(), store.clone(), Spool::new(&spool_dir), cfg.clone());

        let prepared = manager.prepare(vec![source("big.bin", original.clone())]).await.unwrap();
        assert_eq!(store.chunks_for(&prepared.batch_id).await.len(), 5);

        api.hang_after(Some(2));
        let running = {
            let manager = manager.clone();
            let batch_id = prepared.batch_id.clone();
            tokio::spawn(async move { manager.run(&batch_id).await })
        };

        tokio::time::timeout(Duration::from_secs(10), async {
            while completed(&store, &prepared.batch_id).await < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("two chunks complete");

        assert!(manager.pause(&prepared.batch_id));
        let result = running.await.unwrap();
        assert!(matches!(result, Err(TransferError::Paused(_))));

        let upload = store.get_upload(&prepared.batch_id).await.unwrap();
        assert_eq!(upload.status, BatchStatus::Paused);
        assert_eq!(upload.uploaded_size, 10 * UNIT as u64);
        prepared.batch_id
    };

    // restart: fresh store loaded from disk, fresh manager
    api.hang_after(None);
    let calls_before = api.uploads().len();

    let store = TransferStore::open_json(&state_path).unwrap();
    let chunks = store.chunks_for(&batch_id).await;
    assert_eq!(chunks.iter().filter(|c| c.uploaded).count(), 2);
    assert!(chunks.iter().all(|c| c.status != ChunkStatus::Uploading));

    let manager = UploadManager::new(api.clone(), store.clone(), Spool::new(&spool_dir), cfg.clone());
    let summary = manager.resume(&batch_id).await.unwrap();
    assert_eq!(summary.transferred, 3);

    let mut resent: Vec<u32> = api.uploads()[calls_before..].to_vec();
    resent.sort_unstable();
    assert_eq!(resent, vec![2, 3, 4]);

    let upload = store.get_upload(&batch_id).await.unwrap();
    assert_eq!(upload.status, BatchStatus::Completed);
    assert_eq!(upload.uploaded_size, upload.total_size);

    let link = manager.share_link(&batch_id, "https://share.test").await.unwrap();
    let received = DownloadManager::new(api.clone(), cfg).receive(&link).await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].plaintext, original);
}

#[tokio::test]
async fn resume_of_completed_batch_sends_nothing() {
    let tmp = TempDir::new().unwrap();
    let api = Arc::new(FakeApi::new());
    let manager = UploadManager::new(
        api.clone(),
        TransferStore::in_memory(),
        Spool::new(tmp.path()),
        test_config(4 * UNIT, 3),
    );

    let summary = manager
        .upload(vec![source("a.bin", content(10 * UNIT))])
        .await
        .unwrap();
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.transferred, 3);
    assert_eq!(api.uploads().len(), 3);

    for _ in 0..2 {
        let again = manager.resume(&summary.batch_id).await.unwrap();
        assert_eq!(again.transferred, 0);
    }
    assert_eq!(api.uploads().len(), 3);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let tmp = TempDir::new().unwrap();
    let api = Arc::new(FakeApi::new());
    let store = TransferStore::in_memory();
    let manager = UploadManager::new(api.clone(), store.clone(), Spool::new(tmp.path()), test_config(2 * UNIT, 2));

    api.fail_times(1, 2);
    let summary = tokio_test::assert_ok!(manager.upload(vec![source("f", content(5 * UNIT))]).await);
    assert_eq!(summary.chunks, 3);

    // chunk 1 took three attempts, the others one
    assert_eq!(api.uploads().len(), 5);
    let attempts: Vec<u32> = store
        .chunks_for(&summary.batch_id)
        .await
        .iter()
        .map(|c| c.attempts)
        .collect();
    assert_eq!(attempts, vec![1, 3, 1]);
}

#[tokio::test]
async fn too_many_permanent_failures_exhaust_the_batch() {
    let tmp = TempDir::new().unwrap();
    let api = Arc::new(FakeApi::new());
    let store = TransferStore::in_memory();
    let manager = UploadManager::new(api.clone(), store.clone(), Spool::new(tmp.path()), test_config(UNIT, 1));

    // 10 chunks; 2 permanent failures exceed the 10% budget
    for index in [3, 6] {
        api.reject(index);
    }
    let prepared = manager
        .prepare(vec![source("f", content(10 * UNIT - STREAM_OVERHEAD))])
        .await
        .unwrap();
    let err = manager.run(&prepared.batch_id).await.unwrap_err();

    match err {
        TransferError::BatchExhausted { failed, total, .. } => {
            assert_eq!((failed, total), (2, 10));
        }
        other => panic!("expected exhaustion, got {other}"),
    }

    let upload = store.get_upload(&prepared.batch_id).await.unwrap();
    assert_eq!(upload.status, BatchStatus::Error);
    assert!(upload.last_error.unwrap().contains("filesh resume"));

    // chunks behind the failure were never attempted
    let chunks = store.chunks_for(&prepared.batch_id).await;
    assert!(chunks.iter().skip(7).all(|c| c.status == ChunkStatus::Pending));
}

#[tokio::test]
async fn single_permanent_failure_leaves_batch_resumable() {
    let tmp = TempDir::new().unwrap();
    let api = Arc::new(FakeApi::new());
    let store = TransferStore::in_memory();
    let cfg = test_config(UNIT, 4);
    let manager = UploadManager::new(api.clone(), store.clone(), Spool::new(tmp.path()), cfg.clone());

    // 1 of 20 chunks is within budget: the run finishes with one gap
    api.reject(4);
    let original = content(20 * UNIT - STREAM_OVERHEAD);
    let prepared = manager.prepare(vec![source("f", original.clone())]).await.unwrap();
    let err = manager.run(&prepared.batch_id).await.unwrap_err();
    assert!(matches!(&err, TransferError::Incomplete { failed, .. } if failed == &vec![4]));

    let chunks = store.chunks_for(&prepared.batch_id).await;
    assert_eq!(chunks[4].status, ChunkStatus::Error);
    assert_eq!(chunks.iter().filter(|c| c.uploaded).count(), 19);
    assert_eq!(store.get_upload(&prepared.batch_id).await.unwrap().status, BatchStatus::Error);

    api.clear_failures();
    let before = api.uploads().len();
    let summary = manager.resume(&prepared.batch_id).await.unwrap();
    assert_eq!(summary.transferred, 1);
    assert_eq!(api.uploads()[before..], [4]);

    let link = manager.share_link(&prepared.batch_id, "https://share.test").await.unwrap();
    let received = DownloadManager::new(api, cfg).receive(&link).await.unwrap();
    assert_eq!(received[0].plaintext, original);
}

#[tokio::test]
async fn multi_file_batch_uses_consecutive_chunk_ranges() {
    let tmp = TempDir::new().unwrap();
    let api = Arc::new(FakeApi::new());
    let store = TransferStore::in_memory();
    let cfg = test_config(2 * UNIT, 3);
    let manager = UploadManager::new(api.clone(), store.clone(), Spool::new(tmp.path()), cfg.clone());

    let a = content(3 * UNIT);
    let b = b"short note".to_vec();
    let summary = manager
        .upload(vec![source("a.bin", a.clone()), source("b.txt", b.clone())])
        .await
        .unwrap();

    let upload = store.get_upload(&summary.batch_id).await.unwrap();
    let spans: Vec<_> = upload.metadata.iter().map(|m| m.chunk_span().unwrap().unwrap()).collect();
    assert_eq!(spans, vec![0..2, 2..3]);
    assert_eq!(upload.metadata[1].size, b.len() as u64);

    let link = manager.share_link(&summary.batch_id, "https://share.test").await.unwrap();
    let received = DownloadManager::new(api, cfg).receive(&link).await.unwrap();
    assert_eq!(received[0].plaintext, a);
    assert_eq!(received[1].plaintext, b);
    assert_eq!(received[1].metadata.name, "b.txt");
}

#[tokio::test]
async fn cancel_forgets_batch_and_spool() {
    let tmp = TempDir::new().unwrap();
    let api = Arc::new(FakeApi::new());
    let store = TransferStore::in_memory();
    let spool = Spool::new(tmp.path());
    let manager = UploadManager::new(api, store.clone(), spool.clone(), test_config(UNIT, 1));

    let prepared = manager.prepare(vec![source("f", content(UNIT))]).await.unwrap();
    let file_id = prepared.file_ids[0].clone();
    assert!(spool.path(&prepared.batch_id, &file_id).exists());

    assert!(manager.cancel(&prepared.batch_id).await.unwrap());
    assert!(store.get_upload(&prepared.batch_id).await.is_none());
    assert!(!spool.path(&prepared.batch_id, &file_id).exists());
    assert!(matches!(
        manager.resume(&prepared.batch_id).await,
        Err(TransferError::NotFound(_))
    ));
}

#[tokio::test]
async fn concurrent_run_of_same_batch_is_refused() {
    let tmp = TempDir::new().unwrap();
    let api = Arc::new(FakeApi::new());
    let manager = UploadManager::new(api.clone(), TransferStore::in_memory(), Spool::new(tmp.path()), test_config(UNIT, 1));

    let prepared = manager.prepare(vec![source("f", content(3 * UNIT))]).await.unwrap();
    api.hang_after(Some(0));
    let running = {
        let manager = manager.clone();
        let batch_id = prepared.batch_id.clone();
        tokio::spawn(async move { manager.run(&batch_id).await })
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        while !manager.registry().is_active(&prepared.batch_id) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();

    tokio_test::assert_err!(manager.resume(&prepared.batch_id).await);
    assert!(manager.pause(&prepared.batch_id));
    assert!(matches!(running.await.unwrap(), Err(TransferError::Paused(_))));
}
