//! Event source boundary and the in-process sources shipped with the crate.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use freightline_core::{decode_events, Event, Kind, PartitionKey, Resource, Scope};
use futures::channel::mpsc;
use futures::stream::{self, BoxStream, StreamExt};
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Live change stream for one partition. Delivery is at-least-once and unordered across names.
pub type EventStream = BoxStream<'static, Result<Event, SourceError>>;

/// Transport that can stream and list resources for a `(scope, kind)` partition.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a change stream. Dropping the stream releases the subscription.
    async fn subscribe(&self, scope: &Scope, kind: Kind) -> Result<EventStream, SourceError>;

    /// Full listing, used to repopulate a partition after missed events.
    async fn list(&self, scope: &Scope, kind: Kind) -> Result<Vec<Resource>, SourceError>;
}

fn into_owned(r: Arc<Resource>) -> Resource {
    Arc::try_unwrap(r).unwrap_or_else(|shared| (*shared).clone())
}

/// Replays a recorded event log. `list` returns the state the log reduces to.
#[derive(Debug, Clone, Default)]
pub struct ReplaySource {
    events: Vec<Event>,
    skipped: usize,
}

impl ReplaySource {
    pub fn new(events: Vec<Event>) -> Self { Self { events, skipped: 0 } }

    /// Build from newline-delimited JSON events. Malformed lines are dropped
    /// and counted in [`ReplaySource::skipped`].
    pub fn from_jsonl(text: &str) -> Self {
        let decoded = decode_events(text);
        if !decoded.skipped.is_empty() {
            debug!(skipped = decoded.skipped.len(), kept = decoded.events.len(), "replay: malformed lines dropped");
        }
        Self { events: decoded.events, skipped: decoded.skipped.len() }
    }

    /// Lines of the source log that failed to decode.
    pub fn skipped(&self) -> usize { self.skipped }

    pub fn len(&self) -> usize { self.events.len() }
    pub fn is_empty(&self) -> bool { self.events.is_empty() }

    /// Scopes mentioned by the log, in first-seen order.
    pub fn scopes(&self) -> Vec<Scope> {
        let mut out: Vec<Scope> = Vec::new();
        for ev in &self.events {
            if !ev.resource.scope.is_empty() && !out.contains(&ev.resource.scope) {
                out.push(ev.resource.scope.clone());
            }
        }
        out
    }

    fn events_for<'a>(&'a self, scope: &'a Scope, kind: Kind) -> impl Iterator<Item = &'a Event> + 'a {
        self.events.iter().filter(move |e| e.resource.kind == kind && &e.resource.scope == scope)
    }
}

#[async_trait]
impl EventSource for ReplaySource {
    async fn subscribe(&self, scope: &Scope, kind: Kind) -> Result<EventStream, SourceError> {
        let evs: Vec<Result<Event, SourceError>> = self.events_for(scope, kind).cloned().map(Ok).collect();
        debug!(scope = %scope, kind = %kind, events = evs.len(), "replay: subscribe");
        Ok(stream::iter(evs).boxed())
    }

    async fn list(&self, scope: &Scope, kind: Kind) -> Result<Vec<Resource>, SourceError> {
        let list = freightline_store::apply_all(&[], self.events_for(scope, kind));
        Ok(list.into_iter().map(into_owned).collect())
    }
}

type Sender = mpsc::UnboundedSender<Result<Event, SourceError>>;
type Receiver = mpsc::UnboundedReceiver<Result<Event, SourceError>>;

#[derive(Default)]
struct Channels {
    senders: FxHashMap<PartitionKey, Sender>,
    parked: FxHashMap<PartitionKey, Receiver>,
    listings: FxHashMap<PartitionKey, Vec<Resource>>,
}

/// Push-driven source: callers feed events through per-partition senders.
///
/// Each `subscribe` hands out the receiver parked by an earlier `sender` call,
/// or opens a fresh channel. `sender` always returns the sender of the most
/// recent channel for the partition.
#[derive(Default)]
pub struct ChannelSource {
    inner: Mutex<Channels>,
}

impl ChannelSource {
    pub fn new() -> Self { Self::default() }

    pub fn sender(&self, scope: &Scope, kind: Kind) -> Sender {
        let key = PartitionKey::new(scope.clone(), kind);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = inner.senders.get(&key) {
            if !tx.is_closed() { return tx.clone(); }
        }
        let (tx, rx) = mpsc::unbounded();
        inner.senders.insert(key.clone(), tx.clone());
        inner.parked.insert(key, rx);
        tx
    }

    /// Listing returned by `list` for the partition.
    pub fn set_listing(&self, scope: &Scope, kind: Kind, items: Vec<Resource>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.listings.insert(PartitionKey::new(scope.clone(), kind), items);
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn subscribe(&self, scope: &Scope, kind: Kind) -> Result<EventStream, SourceError> {
        let key = PartitionKey::new(scope.clone(), kind);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let rx = match inner.parked.remove(&key) {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::unbounded();
                inner.senders.insert(key, tx);
                rx
            }
        };
        Ok(rx.boxed())
    }

    async fn list(&self, scope: &Scope, kind: Kind) -> Result<Vec<Resource>, SourceError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.listings.get(&PartitionKey::new(scope.clone(), kind)).cloned().unwrap_or_default())
    }
}
