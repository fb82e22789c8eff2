#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use frostline::{
    FieldValue, MemoryEngine, NativeEngine, Result, Row, Session, SessionConfig, Subscription,
    VersionChanges, VersionId,
};
use serde_json::Value;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn open_session(engine: &Arc<MemoryEngine>, name: &str) -> Session {
    open_with(engine, SessionConfig::default().with_name(name)).await
}

pub async fn open_with(engine: &Arc<MemoryEngine>, config: SessionConfig) -> Session {
    let shared: Arc<dyn NativeEngine> = engine.clone();
    Session::open(shared, config).await.expect("open session")
}

pub fn row(fields: &[(&str, Value)]) -> Row {
    fields
        .iter()
        .map(|(name, value)| (name.to_string(), FieldValue::Value(value.clone())))
        .collect()
}

/// Creates `Item` objects with the given keys in one transaction.
pub async fn create_items(session: &Session, keys: &[i64]) -> VersionId {
    let keys = keys.to_vec();
    session
        .write(move |tx| {
            for key in keys {
                tx.create("Item", key, Row::new())?;
            }
            Ok(())
        })
        .await
        .expect("create items");
    session.version().expect("version")
}

pub async fn delete_item(session: &Session, key: i64) {
    session
        .write(move |tx| {
            if let Some(object) = tx.object("Item", key)? {
                object.delete()?;
            }
            Ok(())
        })
        .await
        .expect("delete item");
}

/// Next event, failing the test if nothing arrives in time.
pub async fn recv<E>(sub: &mut Subscription<E>) -> Option<Result<E>> {
    tokio::time::timeout(RECV_TIMEOUT, sub.next())
        .await
        .expect("timed out waiting for an event")
}

/// Next event, which must be `Ok`.
pub async fn recv_ok<E: std::fmt::Debug>(sub: &mut Subscription<E>) -> E {
    match recv(sub).await {
        Some(Ok(event)) => event,
        other => panic!("expected an event, got {other:?}"),
    }
}

/// Waits until the notifier has published `version` or newer.
pub async fn wait_for_version(versions: &mut VersionChanges, version: VersionId) {
    loop {
        let handle = tokio::time::timeout(RECV_TIMEOUT, versions.next())
            .await
            .expect("timed out waiting for a version")
            .expect("version stream ended");
        if handle.version().expect("version") >= version {
            return;
        }
    }
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
