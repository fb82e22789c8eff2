//! Write path: ordering, transaction state, and result re-resolution.

mod common;

use frostline::{EngineErrorKind, Error, ErrorCategory, MemoryEngine, Row, VersionId};
use serde_json::json;

use common::{create_items, open_session, row};

#[tokio::test]
async fn test_read_after_write_sees_every_write() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "ordering").await;

    for key in 1..=10 {
        let version = create_items(&session, &[key]).await;
        assert_eq!(version, VersionId::from_raw(1 + key as u64));

        let keys = session.results("Item").unwrap().keys().unwrap();
        assert_eq!(keys.len(), key as usize, "write {key} not visible or previewed early");
        assert_eq!(keys.last().unwrap().as_raw(), key);
    }
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_write_returns_entity_frozen_at_committed_version() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "frozen-result").await;

    let item = session
        .write(|tx| tx.create("Item", 7, row(&[("name", json!("seven"))])))
        .await
        .unwrap()
        .expect("created item exists at the committed version");

    assert!(item.is_managed());
    assert!(item.is_frozen());
    assert_eq!(item.version().unwrap(), session.version().unwrap());
    assert_eq!(item.value("name").unwrap(), Some(json!("seven")));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_entity_deleted_inside_block_comes_back_as_none() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "deleted-result").await;

    let gone = session
        .write(|tx| {
            let item = tx.create("Item", 1, Row::new())?;
            item.clone().delete()?;
            Ok(item)
        })
        .await
        .unwrap();
    assert!(gone.is_none());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_commit_twice_fails_without_corrupting_session() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "commit-twice").await;

    let result = session
        .write(|tx| {
            tx.create("Item", 1, Row::new())?;
            tx.commit()?;
            tx.commit()
        })
        .await;
    assert!(matches!(result, Err(Error::NoTransaction)));

    // the first commit is still published and the writer is usable
    assert_eq!(session.results("Item").unwrap().len().unwrap(), 1);
    assert!(!session.is_in_transaction());
    create_items(&session, &[2]).await;
    assert_eq!(session.results("Item").unwrap().len().unwrap(), 2);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_failing_block_rolls_back() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "rollback").await;
    let before = session.version().unwrap();

    let result = session
        .write(|tx| {
            tx.create("Item", 1, Row::new())?;
            Err::<(), _>(Error::InvalidState("abort".into()))
        })
        .await;
    assert!(matches!(result, Err(Error::InvalidState(_))));
    assert_eq!(session.version().unwrap(), before);
    assert_eq!(engine.latest_version(), before);
    assert!(session.results("Item").unwrap().is_empty().unwrap());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_cancel_discards_writes() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "cancel").await;

    let still_in_tx = session
        .write(|tx| {
            tx.create("Item", 1, Row::new())?;
            tx.cancel()?;
            Ok(tx.is_in_transaction())
        })
        .await
        .unwrap();
    assert!(!still_in_tx);
    assert!(session.results("Item").unwrap().is_empty().unwrap());
    assert_eq!(engine.latest_version(), VersionId::INITIAL);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_commit_failure_is_propagated_after_rollback() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "commit-failure").await;

    engine.inject_commit_failure(EngineErrorKind::ResourceExhausted);
    let err = session
        .write(|tx| tx.create("Item", 1, Row::new()).map(|_| ()))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Unrecoverable);
    assert!(!err.is_recoverable());
    assert!(!session.is_in_transaction());

    // nothing leaked into the next transaction
    create_items(&session, &[2]).await;
    let keys = session.results("Item").unwrap().keys().unwrap();
    assert_eq!(keys.iter().map(|k| k.as_raw()).collect::<Vec<_>>(), vec![2]);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_panicking_block_rolls_back_and_frees_the_writer() {
    let engine = MemoryEngine::shared();
    let a = open_session(&engine, "panics").await;
    let b = open_session(&engine, "bystander").await;

    let task = {
        let a = a.clone();
        tokio::spawn(async move {
            a.write(|tx| {
                tx.create("Item", 1, Row::new())?;
                let fail = true;
                if fail {
                    panic!("boom");
                }
                Ok(())
            })
            .await
        })
    };
    let err = task.await.unwrap_err();
    assert!(err.is_panic());

    // rolled back and out of the transaction
    assert!(!a.is_in_transaction());
    assert_eq!(engine.latest_version(), VersionId::INITIAL);
    assert!(a.results("Item").unwrap().is_empty().unwrap());

    // the engine write lock was released for other sessions
    let version = tokio::time::timeout(common::RECV_TIMEOUT, create_items(&b, &[2]))
        .await
        .expect("engine write lock still held");
    assert_eq!(version, VersionId::INITIAL.next());

    // the same writer keeps serving
    create_items(&a, &[3]).await;
    assert_eq!(a.results("Item").unwrap().len().unwrap(), 2);

    a.close().await.unwrap();
    b.close().await.unwrap();
    assert_eq!(engine.open_snapshot_count(), 0);
}

#[tokio::test]
async fn test_panic_after_explicit_commit_keeps_the_commit() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "panic-after-commit").await;

    let task = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .write(|tx| {
                    tx.create("Item", 1, Row::new())?;
                    tx.commit()?;
                    let fail = true;
                    if fail {
                        panic!("after commit");
                    }
                    Ok(())
                })
                .await
        })
    };
    assert!(task.await.unwrap_err().is_panic());

    assert!(!session.is_in_transaction());
    assert_eq!(session.results("Item").unwrap().len().unwrap(), 1);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_key_is_an_argument_error() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "duplicate").await;
    create_items(&session, &[1]).await;

    let err = session
        .write(|tx| tx.create("Item", 1, Row::new()).map(|_| ()))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Argument);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_mutation_outside_transaction_is_invalid_state() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "outside-tx").await;
    create_items(&session, &[1]).await;

    // frozen entity
    let mut frozen = session.object("Item", 1).unwrap().unwrap();
    assert!(matches!(frozen.set("n", json!(1)), Err(Error::InvalidState(_))));

    // live entity after an explicit commit
    let result = session
        .write(|tx| {
            let mut item = tx.object("Item", 1)?.expect("item exists");
            tx.commit()?;
            item.set("n", json!(2))
        })
        .await;
    assert!(matches!(result, Err(Error::InvalidState(_))));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_find_latest_round_trip() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "round-trip").await;

    let frozen = session
        .write(|tx| {
            let item = tx.create("Item", 1, row(&[("n", json!(1))]))?;
            item.list("tags")?.push(json!("a"))?;
            Ok(item)
        })
        .await
        .unwrap()
        .unwrap();

    let thawed_fields = {
        let frozen = frozen.clone();
        session
            .write(move |tx| {
                let live = tx.find_latest(&frozen)?.expect("still exists");
                assert!(!live.is_frozen());
                live.fields()
            })
            .await
            .unwrap()
    };
    assert_eq!(thawed_fields, frozen.fields().unwrap());

    // after deletion the thaw yields the deletion signal
    common::delete_item(&session, 1).await;
    let after_delete = {
        let frozen = frozen.clone();
        session
            .write(move |tx| Ok(tx.find_latest(&frozen)?.is_none()))
            .await
            .unwrap()
    };
    assert!(after_delete);
    // the old frozen view is unaffected
    assert_eq!(frozen.value("n").unwrap(), Some(json!(1)));
    session.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_during_transaction_is_rejected() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "close-mid-tx").await;

    let (started_tx, started_rx) = tokio::sync::oneshot::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let writer = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .write(move |tx| {
                    let _ = started_tx.send(());
                    let _ = release_rx.recv();
                    tx.create("Item", 1, Row::new()).map(|_| ())
                })
                .await
        })
    };

    started_rx.await.unwrap();
    assert!(session.is_in_transaction());
    assert!(matches!(session.close().await, Err(Error::CloseDuringTransaction)));
    assert!(!session.is_closed());

    release_tx.send(()).unwrap();
    writer.await.unwrap().unwrap();
    session.close().await.unwrap();
    assert!(session.is_closed());
}

#[tokio::test]
async fn test_writes_from_two_sessions_are_serialized() {
    let engine = MemoryEngine::shared();
    let a = open_session(&engine, "a").await;
    let b = open_session(&engine, "b").await;

    let (ra, rb) = tokio::join!(create_items(&a, &[1, 2]), create_items(&b, &[3, 4]));
    assert_ne!(ra, rb);
    assert_eq!(engine.latest_version(), VersionId::from_raw(3));

    let latest = if ra > rb { &a } else { &b };
    assert_eq!(latest.results("Item").unwrap().len().unwrap(), 4);

    a.close().await.unwrap();
    b.close().await.unwrap();
    assert_eq!(engine.open_snapshot_count(), 0);
}
