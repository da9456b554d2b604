//! One subscription bridging an event stream into one cache partition.

use std::sync::Arc;

use freightline_core::{ChangeType, Event, Kind, PartitionKey, Resource, Scope};
use freightline_store::{apply, PartitionSnapshot, ResourceCache};
use futures::StreamExt;
use metrics::counter;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::source::{EventSource, EventStream, SourceError};

/// Resource resolved by one applied event, handed to `on_resource` callbacks.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub change: ChangeType,
    pub resource: Arc<Resource>,
    /// Partition list after the event was applied.
    pub snapshot: Arc<PartitionSnapshot>,
}

pub type OnResource = Arc<dyn Fn(&Resolved) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Cancelled,
    /// The transport closed the stream without error.
    Completed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub applied: u64,
    pub dropped: u64,
    pub deduped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub end: SessionEnd,
    pub stats: SessionStats,
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("subscribe {partition}: {source}")]
    Subscribe {
        partition: PartitionKey,
        #[source]
        source: SourceError,
    },
    #[error("stream {partition} failed after {applied} events: {source}")]
    Stream {
        partition: PartitionKey,
        applied: u64,
        #[source]
        source: SourceError,
    },
    #[error("session task: {0}")]
    Join(String),
}

/// Handle to a running session. Dropping it cancels the session.
pub struct WatchHandle {
    key: PartitionKey,
    cancel_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<SessionSummary, WatchError>>>,
}

impl WatchHandle {
    pub fn partition(&self) -> &PartitionKey { &self.key }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Ask the consumer to stop after the event it is applying, without waiting.
    pub fn signal(&mut self) {
        if let Some(tx) = self.cancel_tx.take() { let _ = tx.send(()); }
    }

    /// Cancel and wait for the consumer to exit. No cache write happens after this returns.
    pub async fn cancel(mut self) -> Result<SessionSummary, WatchError> {
        self.signal();
        self.join_inner().await
    }

    /// Wait for the session to end on its own (stream closed or failed).
    pub async fn join(mut self) -> Result<SessionSummary, WatchError> {
        self.join_inner().await
    }

    async fn join_inner(&mut self) -> Result<SessionSummary, WatchError> {
        match self.task.take() {
            Some(task) => task.await.map_err(|e| WatchError::Join(e.to_string()))?,
            None => Err(WatchError::Join("session already joined".into())),
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) { self.signal(); }
}

/// Consumer for one `(scope, kind)` partition.
pub struct WatchSession {
    key: PartitionKey,
    cache: Arc<ResourceCache>,
    on_resource: Option<OnResource>,
}

impl WatchSession {
    pub fn new(cache: Arc<ResourceCache>, scope: Scope, kind: Kind) -> Self {
        Self { key: PartitionKey::new(scope, kind), cache, on_resource: None }
    }

    pub fn on_resource(mut self, f: impl Fn(&Resolved) + Send + Sync + 'static) -> Self {
        self.on_resource = Some(Arc::new(f));
        self
    }

    pub fn with_callback(mut self, f: Option<OnResource>) -> Self {
        self.on_resource = f;
        self
    }

    /// Subscribe through `source` and spawn the consumer task.
    pub async fn open(self, source: &dyn EventSource) -> Result<WatchHandle, WatchError> {
        self.cache.ensure(&self.key.scope, self.key.kind);
        let stream = source
            .subscribe(&self.key.scope, self.key.kind)
            .await
            .map_err(|source| WatchError::Subscribe { partition: self.key.clone(), source })?;
        Ok(self.spawn(stream))
    }

    /// Spawn the consumer over an already-open stream.
    pub fn spawn(self, stream: EventStream) -> WatchHandle {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let key = self.key.clone();
        let task = tokio::spawn(self.consume(stream, cancel_rx));
        WatchHandle { key, cancel_tx: Some(cancel_tx), task: Some(task) }
    }

    async fn consume(self, mut stream: EventStream, mut cancel_rx: oneshot::Receiver<()>) -> Result<SessionSummary, WatchError> {
        let (scope, kind) = (self.key.scope.clone(), self.key.kind);
        info!(scope = %scope, kind = %kind, "watch: session started");
        let mut stats = SessionStats::default();
        let end = loop {
            tokio::select! {
                biased;
                // a dropped handle resolves this branch too
                _ = &mut cancel_rx => break SessionEnd::Cancelled,
                next = stream.next() => match next {
                    Some(Ok(ev)) => self.handle(&ev, &mut stats),
                    Some(Err(source)) => {
                        warn!(scope = %scope, kind = %kind, error = %source, applied = stats.applied, "watch: stream error");
                        return Err(WatchError::Stream { partition: self.key.clone(), applied: stats.applied, source });
                    }
                    None => break SessionEnd::Completed,
                },
            }
        };
        info!(scope = %scope, kind = %kind, end = ?end, applied = stats.applied, dropped = stats.dropped, deduped = stats.deduped, "watch: session ended");
        Ok(SessionSummary { end, stats })
    }

    /// Apply one event synchronously: get, reduce, set, then notify.
    fn handle(&self, ev: &Event, stats: &mut SessionStats) {
        let kind = self.key.kind;
        if ev.resource.kind != kind || ev.resource.scope != self.key.scope {
            stats.dropped += 1;
            counter!("freightline_events_dropped_total", 1u64, "kind" => kind.as_str());
            debug!(partition = %self.key, got_scope = %ev.resource.scope, got_kind = %ev.resource.kind, "watch: event outside partition dropped");
            return;
        }
        // retry against the newer list if another writer (a refetch) swapped it meanwhile
        let (resource, snapshot) = loop {
            let current = self.cache.get(&self.key.scope, kind);
            if ev.change_type != ChangeType::Deleted {
                if let Some(v) = ev.resource.version.as_deref() {
                    let cached = current.get(&ev.resource.name).and_then(|r| r.version.as_deref());
                    if cached == Some(v) {
                        stats.deduped += 1;
                        counter!("freightline_events_deduped_total", 1u64, "kind" => kind.as_str());
                        return;
                    }
                }
            }
            let reduced = apply(&current.items, ev);
            let Some(resource) = reduced.resource else {
                stats.dropped += 1;
                counter!("freightline_events_dropped_total", 1u64, "kind" => kind.as_str());
                debug!(partition = %self.key, "watch: ill-formed event dropped");
                return;
            };
            if !reduced.changed {
                break (resource, current);
            }
            match self.cache.set_if(&self.key.scope, kind, current.epoch, reduced.next) {
                Ok(published) => break (resource, published),
                Err(winner) => {
                    debug!(partition = %self.key, stale = current.epoch, epoch = winner.epoch, "watch: partition replaced concurrently, reapplying");
                }
            }
        };
        stats.applied += 1;
        counter!("freightline_events_applied_total", 1u64, "kind" => kind.as_str());
        debug!(partition = %self.key, change = ?ev.change_type, name = %resource.name, epoch = snapshot.epoch, "watch: event applied");
        if let Some(cb) = &self.on_resource {
            cb(&Resolved { change: ev.change_type, resource, snapshot });
        }
    }
}
