//! Change notifications: initial/update/delete ordering, cancellation,
//! backpressure, and external commits.

mod common;

use std::time::Duration;

use frostline::engine::RawChange;
use futures::FutureExt;
use frostline::{
    CollectionChange, Error, MapChange, MemoryEngine, ObjectChange, ObjectRef, Observable, Row,
    SessionConfig,
};
use serde_json::json;

use common::{
    create_items, delete_item, eventually, open_session, open_with, recv, recv_ok, row,
    wait_for_version,
};

#[tokio::test]
async fn test_collection_initial_insert_delete_scenario() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "scenario").await;
    create_items(&session, &[1]).await;

    let mut sub = session.results("Item").unwrap().subscribe().await.unwrap();

    match recv_ok(&mut sub).await {
        CollectionChange::Initial(results) => {
            assert!(results.is_frozen());
            assert_eq!(results.len().unwrap(), 1);
        }
        other => panic!("expected initial event, got {other:?}"),
    }

    create_items(&session, &[2]).await;
    match recv_ok(&mut sub).await {
        CollectionChange::Updated { collection, changes } => {
            assert_eq!(changes.insertions(), &[1]);
            assert!(changes.deletions().is_empty());
            assert_eq!(collection.len().unwrap(), 2);
        }
        other => panic!("expected update, got {other:?}"),
    }

    delete_item(&session, 1).await;
    match recv_ok(&mut sub).await {
        CollectionChange::Updated { collection, changes } => {
            assert_eq!(changes.deletions(), &[0]);
            assert!(changes.insertions().is_empty());
            assert_eq!(collection.keys().unwrap()[0].as_raw(), 2);
        }
        other => panic!("expected update, got {other:?}"),
    }
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_event_indices_match_event_snapshot() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "indices").await;
    create_items(&session, &[1, 2, 3]).await;

    let mut sub = session.results("Item").unwrap().subscribe().await.unwrap();
    recv_ok(&mut sub).await;

    session
        .write(|tx| {
            tx.object("Item", 2)?.expect("exists").set("n", json!(1))?;
            tx.create("Item", 4, Row::new())?;
            Ok(())
        })
        .await
        .unwrap();

    let CollectionChange::Updated { collection, changes } = recv_ok(&mut sub).await else {
        panic!("expected update");
    };
    assert_eq!(changes.changes(), &[1]);
    assert_eq!(changes.changes_after(), &[1]);
    assert_eq!(changes.insertions(), &[3]);
    // the event's collection is the version the indices describe
    let keys = collection.keys().unwrap();
    assert_eq!(keys[changes.insertions()[0]].as_raw(), 4);
    assert_eq!(keys[changes.changes_after()[0]].as_raw(), 2);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_object_changes_report_fields() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "object").await;
    let item = session
        .write(|tx| tx.create("Item", 1, row(&[("name", json!("a")), ("n", json!(0))])))
        .await
        .unwrap()
        .unwrap();

    let mut sub = item.subscribe().await.unwrap();
    let ObjectChange::Initial(initial) = recv_ok(&mut sub).await else {
        panic!("expected initial event");
    };
    assert_eq!(initial.value("name").unwrap(), Some(json!("a")));

    session
        .write(|tx| {
            let mut item = tx.object("Item", 1)?.expect("exists");
            item.set("name", json!("b"))
        })
        .await
        .unwrap();

    match recv_ok(&mut sub).await {
        ObjectChange::Updated {
            object,
            changed_fields,
        } => {
            assert_eq!(changed_fields, vec!["name".to_string()]);
            assert_eq!(object.value("name").unwrap(), Some(json!("b")));
            assert_eq!(object.value("n").unwrap(), Some(json!(0)));
        }
        other => panic!("expected update, got {other:?}"),
    }
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_deletion_is_terminal() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "delete").await;
    let item = session
        .write(|tx| tx.create("Item", 9, Row::new()))
        .await
        .unwrap()
        .unwrap();

    let mut object_sub = item.subscribe().await.unwrap();
    let mut list_sub = item.list("tags").unwrap().subscribe().await.unwrap();
    assert!(matches!(recv_ok(&mut object_sub).await, ObjectChange::Initial(_)));
    assert!(matches!(recv_ok(&mut list_sub).await, CollectionChange::Initial(_)));

    delete_item(&session, 9).await;

    match recv_ok(&mut object_sub).await {
        ObjectChange::Deleted { key } => assert_eq!(key.as_raw(), 9),
        other => panic!("expected deletion, got {other:?}"),
    }
    assert!(matches!(recv_ok(&mut list_sub).await, CollectionChange::Deleted));

    // exactly one terminal event, even if more commits follow
    create_items(&session, &[10]).await;
    assert!(recv(&mut object_sub).await.is_none());
    assert!(recv(&mut list_sub).await.is_none());
    assert!(object_sub.token().is_cancelled());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_list_and_map_change_sets() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "collections").await;
    let item = session
        .write(|tx| {
            let item = tx.create("Item", 1, Row::new())?;
            let mut tags = item.list("tags")?;
            tags.push(json!("a"))?;
            tags.push(json!("c"))?;
            item.map("attrs")?.insert("color", json!("red"))?;
            Ok(item)
        })
        .await
        .unwrap()
        .unwrap();

    let mut tags = item.list("tags").unwrap().subscribe().await.unwrap();
    let mut attrs = item.map("attrs").unwrap().subscribe().await.unwrap();
    recv_ok(&mut tags).await;
    let MapChange::Initial(map) = recv_ok(&mut attrs).await else {
        panic!("expected initial map event");
    };
    assert_eq!(map.get("color").unwrap(), Some(json!("red")));

    session
        .write(|tx| {
            let item = tx.object("Item", 1)?.expect("exists");
            item.list("tags")?.insert(1, json!("b"))?;
            let mut attrs = item.map("attrs")?;
            attrs.insert("color", json!("blue"))?;
            attrs.insert("size", json!(3))?;
            Ok(())
        })
        .await
        .unwrap();

    match recv_ok(&mut tags).await {
        CollectionChange::Updated { collection, changes } => {
            assert_eq!(changes.insertions(), &[1]);
            assert_eq!(
                collection.to_vec().unwrap(),
                vec![json!("a"), json!("b"), json!("c")]
            );
        }
        other => panic!("expected list update, got {other:?}"),
    }
    match recv_ok(&mut attrs).await {
        MapChange::Updated { changes, .. } => {
            assert_eq!(changes.insertions, vec!["size".to_string()]);
            assert_eq!(changes.changes, vec!["color".to_string()]);
            assert!(changes.deletions.is_empty());
        }
        other => panic!("expected map update, got {other:?}"),
    }
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelling_one_subscription_keeps_the_other() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "two-subs").await;
    create_items(&session, &[1]).await;

    let results = session.results("Item").unwrap();
    let mut first = results.subscribe().await.unwrap();
    let mut second = results.subscribe().await.unwrap();
    recv_ok(&mut first).await;
    recv_ok(&mut second).await;
    assert_eq!(engine.registration_count(), 2);

    first.cancel();
    // cancelling again is harmless
    first.token().cancel();
    assert_eq!(engine.registration_count(), 1);

    create_items(&session, &[2]).await;
    assert!(matches!(
        recv_ok(&mut second).await,
        CollectionChange::Updated { .. }
    ));
    assert!(first.next().await.is_none());
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_dropping_a_subscription_releases_its_registration() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "drop-sub").await;
    create_items(&session, &[1]).await;

    let sub = session.results("Item").unwrap().subscribe().await.unwrap();
    assert_eq!(engine.registration_count(), 1);
    drop(sub);
    assert_eq!(engine.registration_count(), 0);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_slow_subscriber_fails_with_insufficient_buffer() {
    let engine = MemoryEngine::shared();
    let config = SessionConfig::default()
        .with_name("slow")
        .with_delivery_buffer_capacity(2);
    let session = open_with(&engine, config).await;

    let mut sub = session.results("Item").unwrap().subscribe().await.unwrap();
    let mut versions = session.version_changes().unwrap();

    // one commit per notifier refresh, never draining the subscription
    for key in 1..=4 {
        let version = create_items(&session, &[key]).await;
        wait_for_version(&mut versions, version).await;
    }

    assert!(matches!(recv_ok(&mut sub).await, CollectionChange::Initial(_)));
    assert!(matches!(recv_ok(&mut sub).await, CollectionChange::Updated { .. }));
    match recv(&mut sub).await {
        Some(Err(Error::InsufficientBuffer { capacity })) => assert_eq!(capacity, 2),
        other => panic!("expected insufficient buffer, got {other:?}"),
    }
    assert!(recv(&mut sub).await.is_none());
    assert!(sub.token().is_cancelled());
    assert_eq!(engine.registration_count(), 0);
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_subscribe_rejects_unmanaged_and_deleted_entities() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "rejects").await;

    let unmanaged = ObjectRef::unmanaged("Item", 1, Row::new());
    assert!(matches!(unmanaged.subscribe().await, Err(Error::InvalidState(_))));
    assert!(matches!(
        session.subscribe(&unmanaged).await,
        Err(Error::InvalidState(_))
    ));

    create_items(&session, &[1]).await;
    let frozen = session.object("Item", 1).unwrap().unwrap();
    assert!(matches!(
        frozen.register_for_notification(Box::new(|_: &RawChange| {})),
        Err(Error::InvalidState(_))
    ));

    delete_item(&session, 1).await;
    assert!(matches!(
        frozen.subscribe().await,
        Err(Error::DeletedReference)
    ));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_external_commit_reaches_other_session() {
    let engine = MemoryEngine::shared();
    let writer = open_session(&engine, "writer").await;
    let reader = open_session(&engine, "reader").await;

    let mut sub = reader.results("Item").unwrap().subscribe().await.unwrap();
    assert!(matches!(recv_ok(&mut sub).await, CollectionChange::Initial(_)));

    let version = create_items(&writer, &[1, 2]).await;
    match recv_ok(&mut sub).await {
        CollectionChange::Updated { changes, .. } => assert_eq!(changes.insertions(), &[0, 1]),
        other => panic!("expected update, got {other:?}"),
    }

    // the reader's current version follows the notifier
    eventually(Duration::from_secs(5), Duration::from_millis(10), || {
        (reader.version().ok()? >= version).then_some(())
    })
    .await;
    assert_eq!(reader.results("Item").unwrap().len().unwrap(), 2);

    writer.close().await.unwrap();
    reader.close().await.unwrap();
}

#[tokio::test]
async fn test_version_changes_yield_latest_first() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "versions").await;
    for key in 1..=3 {
        create_items(&session, &[key]).await;
    }
    let latest = engine.latest_version();

    let mut versions = session.version_changes().unwrap();
    let first = versions.next().await.unwrap();
    assert!(first.is_frozen());
    assert_eq!(first.version().unwrap(), latest);

    let next = create_items(&session, &[4]).await;
    wait_for_version(&mut versions, next).await;

    session.close().await.unwrap();
    assert!(versions.next().await.is_none());
}

#[tokio::test]
async fn test_version_is_published_before_its_change_event() {
    let engine = MemoryEngine::shared();
    let session = open_session(&engine, "ordering").await;

    let mut sub = session.results("Item").unwrap().subscribe().await.unwrap();
    recv_ok(&mut sub).await;
    let mut versions = session.version_changes().unwrap();
    versions.next().await.unwrap();

    for key in 1..=3 {
        create_items(&session, &[key]).await;
        let collection = match recv_ok(&mut sub).await {
            CollectionChange::Updated { collection, .. } => collection,
            other => panic!("expected an update, got {other:?}"),
        };
        let event_version = collection.version().unwrap();

        // already in the version stream, no waiting needed
        let published = versions
            .next()
            .now_or_never()
            .flatten()
            .expect("version not published before its event");
        assert!(published.version().unwrap() >= event_version);
    }
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_eager_notifier_starts_on_open() {
    let engine = MemoryEngine::shared();
    let lazy = open_session(&engine, "lazy").await;
    let eager = open_with(
        &engine,
        SessionConfig::default()
            .with_name("eager")
            .with_lazy_notifier(false),
    )
    .await;

    assert!(!lazy.is_notifier_started());
    assert!(eager.is_notifier_started());
    // lazy: writer + current; eager: writer + notifier + current + notifier's frozen
    eventually(Duration::from_secs(5), Duration::from_millis(10), || {
        (engine.open_snapshot_count() == 6).then_some(())
    })
    .await;

    lazy.close().await.unwrap();
    eager.close().await.unwrap();
    assert_eq!(engine.open_snapshot_count(), 0);
}
