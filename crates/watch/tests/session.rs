#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use freightline_core::{ChangeType, Event, Kind, Resource, Scope};
use freightline_store::ResourceCache;
use freightline_watch::{
    ChannelSource, EventSource, ReplaySource, SessionEnd, SourceError, WatchError, WatchRegistry, WatchSession,
};
use futures::StreamExt;

fn stage(name: &str, rev: &str) -> Resource {
    Resource::new("demo", Kind::Stage, name, serde_json::json!({ "rev": rev }))
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn events_flow_into_cache_and_callback() {
    let cache = Arc::new(ResourceCache::new());
    let src = ChannelSource::new();
    let scope = Scope::new("demo");
    let seen: Arc<Mutex<Vec<(ChangeType, String, usize)>>> = Arc::default();
    let seen_cb = Arc::clone(&seen);
    let handle = WatchSession::new(Arc::clone(&cache), scope.clone(), Kind::Stage)
        .on_resource(move |r| seen_cb.lock().unwrap().push((r.change, r.resource.name.clone(), r.snapshot.len())))
        .open(&src)
        .await
        .unwrap();
    let tx = src.sender(&scope, Kind::Stage);
    tx.unbounded_send(Ok(Event::added(stage("A", "1")))).unwrap();
    tx.unbounded_send(Ok(Event::modified(stage("A", "2")))).unwrap();
    tx.unbounded_send(Ok(Event::deleted(stage("A", "2")))).unwrap();
    eventually(|| seen.lock().unwrap().len() == 3).await;

    assert!(cache.get(&scope, Kind::Stage).is_empty());
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (ChangeType::Added, "A".to_string(), 1),
            (ChangeType::Modified, "A".to_string(), 1),
            (ChangeType::Deleted, "A".to_string(), 0),
        ]
    );
    let summary = handle.cancel().await.unwrap();
    assert_eq!(summary.end, SessionEnd::Cancelled);
    assert_eq!(summary.stats.applied, 3);
}

#[tokio::test]
async fn replay_stream_completes_and_reports_stats() {
    let cache = Arc::new(ResourceCache::new());
    let scope = Scope::new("demo");
    let src = ReplaySource::new(vec![
        Event::added(stage("a", "1").with_version("10")),
        // same resourceVersion: suppressed before the reducer
        Event::modified(stage("a", "1").with_version("10")),
        Event::modified(stage("a", "2").with_version("11")),
        // ill-formed
        Event::added(Resource::new("demo", Kind::Stage, "", serde_json::json!({}))),
    ]);
    let handle = WatchSession::new(Arc::clone(&cache), scope.clone(), Kind::Stage).open(&src).await.unwrap();
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.end, SessionEnd::Completed);
    assert_eq!(summary.stats.applied, 2);
    assert_eq!(summary.stats.deduped, 1);
    assert_eq!(summary.stats.dropped, 1);
    let snap = cache.get(&scope, Kind::Stage);
    assert_eq!(snap.len(), 1);
    assert_eq!(snap.items[0].version.as_deref(), Some("11"));
}

#[tokio::test]
async fn events_for_other_partitions_are_dropped() {
    let cache = Arc::new(ResourceCache::new());
    let scope = Scope::new("demo");
    let stray = Resource::new("demo", Kind::Freight, "f1", serde_json::json!({}));
    let foreign = Resource::new("other", Kind::Stage, "x", serde_json::json!({}));
    let events = vec![Event::added(stray), Event::added(foreign), Event::added(stage("ok", "1"))];
    let handle = WatchSession::new(Arc::clone(&cache), scope.clone(), Kind::Stage)
        .spawn(futures::stream::iter(events.into_iter().map(Ok)).boxed());
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.stats.dropped, 2);
    assert_eq!(cache.get(&scope, Kind::Stage).names().collect::<Vec<_>>(), vec!["ok"]);
    assert!(cache.get(&scope, Kind::Freight).is_empty());
}

#[tokio::test]
async fn no_cache_writes_after_cancel_returns() {
    let cache = Arc::new(ResourceCache::new());
    let src = ChannelSource::new();
    let scope = Scope::new("demo");
    let handle = WatchSession::new(Arc::clone(&cache), scope.clone(), Kind::Stage).open(&src).await.unwrap();
    let tx = src.sender(&scope, Kind::Stage);
    tx.unbounded_send(Ok(Event::added(stage("a", "1")))).unwrap();
    eventually(|| cache.get(&scope, Kind::Stage).len() == 1).await;

    handle.cancel().await.unwrap();
    let epoch = cache.get(&scope, Kind::Stage).epoch;
    // receiver is gone with the session
    assert!(tx.unbounded_send(Ok(Event::added(stage("b", "1")))).is_err());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let snap = cache.get(&scope, Kind::Stage);
    assert_eq!(snap.epoch, epoch);
    assert_eq!(snap.names().collect::<Vec<_>>(), vec!["a"]);
}

#[tokio::test]
async fn cancel_stops_a_slow_stream_quickly() {
    let cache = Arc::new(ResourceCache::new());
    let s = async_stream::stream! {
        let mut i = 0u32;
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            i += 1;
            yield Ok::<Event, SourceError>(Event::added(stage(&format!("s{i}"), "1")));
        }
    };
    let handle = WatchSession::new(Arc::clone(&cache), Scope::new("demo"), Kind::Stage).spawn(s.boxed());
    tokio::time::sleep(Duration::from_millis(120)).await;
    let summary = tokio::time::timeout(Duration::from_secs(1), handle.cancel())
        .await
        .expect("session did not stop")
        .unwrap();
    assert_eq!(summary.end, SessionEnd::Cancelled);
    assert!(summary.stats.applied >= 1);
}

#[tokio::test]
async fn dropping_the_handle_cancels() {
    let cache = Arc::new(ResourceCache::new());
    let src = ChannelSource::new();
    let scope = Scope::new("demo");
    let handle = WatchSession::new(Arc::clone(&cache), scope.clone(), Kind::Warehouse).open(&src).await.unwrap();
    let tx = src.sender(&scope, Kind::Warehouse);
    drop(handle);
    eventually(|| tx.is_closed()).await;
}

#[tokio::test]
async fn stream_error_is_surfaced_and_stops_session() {
    let cache = Arc::new(ResourceCache::new());
    let src = Arc::new(ChannelSource::new());
    let scope = Scope::new("demo");
    let registry = WatchRegistry::new(Arc::clone(&cache), Arc::clone(&src) as Arc<dyn EventSource>);
    registry.open(&scope, Kind::Freight, None).await.unwrap();
    let tx = src.sender(&scope, Kind::Freight);
    tx.unbounded_send(Ok(Event::added(Resource::new("demo", Kind::Freight, "f1", serde_json::json!({}))))).unwrap();
    tx.unbounded_send(Err(SourceError::Transport("connection reset".into()))).unwrap();
    tx.unbounded_send(Ok(Event::added(Resource::new("demo", Kind::Freight, "f2", serde_json::json!({}))))).unwrap();

    match registry.join(&scope, Kind::Freight).await {
        Some(Err(WatchError::Stream { applied, source, .. })) => {
            assert_eq!(applied, 1);
            assert!(source.to_string().contains("connection reset"));
        }
        other => panic!("expected stream error, got {:?}", other),
    }
    assert_eq!(cache.get(&scope, Kind::Freight).names().collect::<Vec<_>>(), vec!["f1"]);
    assert!(!registry.is_active(&scope, Kind::Freight).await);
}

#[tokio::test]
async fn reopening_a_partition_replaces_the_session() {
    let cache = Arc::new(ResourceCache::new());
    let src = Arc::new(ChannelSource::new());
    let scope = Scope::new("demo");
    let registry = WatchRegistry::new(Arc::clone(&cache), Arc::clone(&src) as Arc<dyn EventSource>);

    registry.open(&scope, Kind::Stage, None).await.unwrap();
    let first_tx = src.sender(&scope, Kind::Stage);
    registry.open(&scope, Kind::Stage, None).await.unwrap();
    assert!(first_tx.is_closed(), "first session must be gone");

    let second_tx = src.sender(&scope, Kind::Stage);
    second_tx.unbounded_send(Ok(Event::added(stage("b", "1")))).unwrap();
    eventually(|| cache.get(&scope, Kind::Stage).len() == 1).await;
    assert_eq!(registry.partitions().await.len(), 1);

    registry.open(&scope, Kind::Warehouse, None).await.unwrap();
    assert_eq!(registry.cancel_scope(&scope).await, 2);
    assert!(registry.partitions().await.is_empty());
}

#[tokio::test]
async fn subscribe_failure_is_reported() {
    struct Down;
    #[async_trait::async_trait]
    impl EventSource for Down {
        async fn subscribe(&self, _scope: &Scope, _kind: Kind) -> Result<freightline_watch::EventStream, SourceError> {
            Err(SourceError::Unavailable("no route".into()))
        }
        async fn list(&self, _scope: &Scope, _kind: Kind) -> Result<Vec<Resource>, SourceError> { Ok(Vec::new()) }
    }
    let registry = WatchRegistry::new(Arc::new(ResourceCache::new()), Arc::new(Down));
    let err = registry.open(&Scope::new("demo"), Kind::Stage, None).await.unwrap_err();
    assert!(matches!(err, WatchError::Subscribe { .. }));
    assert!(registry.partitions().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_relist_is_never_overwritten_by_a_stale_list() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let cache = Arc::new(ResourceCache::new());
    let scope = Scope::new("demo");
    let listed = Arc::new(Resource::new("demo", Kind::Freight, "f9", serde_json::json!({})));
    let stop = Arc::new(AtomicBool::new(false));
    cache.set(&scope, Kind::Freight, vec![Arc::clone(&listed)]);
    let relister = {
        let (cache, scope, stop, listed) = (Arc::clone(&cache), scope.clone(), Arc::clone(&stop), Arc::clone(&listed));
        tokio::spawn(async move {
            while !stop.load(Ordering::Relaxed) {
                cache.set(&scope, Kind::Freight, vec![Arc::clone(&listed)]);
                tokio::task::yield_now().await;
            }
        })
    };

    let events: Vec<_> = (0..500)
        .map(|i| Ok::<_, SourceError>(Event::added(Resource::new("demo", Kind::Freight, format!("f{i}-new"), serde_json::json!({})))))
        .collect();
    let summary = WatchSession::new(Arc::clone(&cache), scope.clone(), Kind::Freight)
        .spawn(futures::stream::iter(events).boxed())
        .join()
        .await
        .unwrap();
    stop.store(true, Ordering::Relaxed);
    relister.await.unwrap();

    assert_eq!(summary.stats.applied, 500);
    // every session write builds on the newest list, so the relisted item survives
    assert!(cache.get(&scope, Kind::Freight).contains("f9"));
}
