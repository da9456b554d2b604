//! freightline API façade (in-process).
//!
//! [`SyncEngine`] is what frontends depend on: it opens the per-kind watch
//! sessions of a scope against one [`EventSource`], keeps the distance matrix
//! current from stage updates, and runs the consistency backstop.

#![forbid(unsafe_code)]

pub mod backstop;
pub mod config;

use std::sync::Arc;
use std::time::Instant;

use freightline_core::{ChangeType, Kind, PartitionKey, Resource, Scope};
use freightline_distance::{DistanceMatrix, DistanceMatrixMaintainer, Observation};
use freightline_store::{PartitionSnapshot, ResourceCache};
use freightline_watch::{EventSource, OnResource, Resolved, SessionOutcome, SourceError, WatchError, WatchRegistry};
use metrics::histogram;
use tracing::{debug, info, warn};

pub use backstop::{ConsistencyBackstop, Reconcile, RefetchGuard, RefetchTrigger};
pub use config::SyncConfig;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error("list: {0}")]
    Source(#[from] SourceError),
}

/// Kinds opened per scope, in order. Freight first so stages find their
/// references already cached whenever the transport allows.
const OPEN_ORDER: [Kind; 3] = [Kind::Freight, Kind::Warehouse, Kind::Stage];

/// Publish a full listing. Returns the item count and the new epoch.
fn store(cache: &ResourceCache, scope: &Scope, kind: Kind, items: Vec<Resource>, started: Instant) -> (usize, u64) {
    let n = items.len();
    let epoch = cache.set(scope, kind, items.into_iter().map(Arc::new).collect());
    let ms = started.elapsed().as_millis() as u64;
    histogram!("freightline_refetch_ms", ms as f64, "kind" => kind.as_str());
    info!(scope = %scope, kind = %kind, items = n, epoch, ms, "api: partition refetched");
    (n, epoch)
}

/// Repopulates partitions from a full listing in a background task.
struct SourceRefetcher {
    source: Arc<dyn EventSource>,
    cache: Arc<ResourceCache>,
}

impl RefetchTrigger for SourceRefetcher {
    fn request_refetch(&self, scope: &Scope, kind: Kind, guard: RefetchGuard) {
        let source = Arc::clone(&self.source);
        let cache = Arc::clone(&self.cache);
        let scope = scope.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            match source.list(&scope, kind).await {
                // a scope closed while listing must not be resurrected
                Ok(_) if !cache.scopes().contains(&scope) => {
                    debug!(scope = %scope, kind = %kind, "api: refetch discarded, scope closed");
                }
                Ok(items) => {
                    let (_, epoch) = store(&cache, &scope, kind, items, started);
                    guard.settle(epoch);
                }
                Err(e) => warn!(scope = %scope, kind = %kind, error = %e, "api: refetch failed"),
            }
        });
    }
}

pub struct SyncEngine {
    cache: Arc<ResourceCache>,
    matrix: Arc<DistanceMatrixMaintainer>,
    backstop: Arc<ConsistencyBackstop>,
    registry: WatchRegistry,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(source: Arc<dyn EventSource>, config: SyncConfig) -> Self {
        let cache = Arc::new(ResourceCache::new());
        let matrix = Arc::new(DistanceMatrixMaintainer::with_max_distance(config.max_distance));
        let trigger = Arc::new(SourceRefetcher { source: Arc::clone(&source), cache: Arc::clone(&cache) });
        let backstop = Arc::new(ConsistencyBackstop::new(trigger));
        let registry = WatchRegistry::new(Arc::clone(&cache), source);
        info!(backstop = config.backstop, max_distance = ?config.max_distance, "api: sync engine ready");
        Self { cache, matrix, backstop, registry, config }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> { &self.cache }
    pub fn matrix(&self) -> &Arc<DistanceMatrixMaintainer> { &self.matrix }
    pub fn backstop(&self) -> &Arc<ConsistencyBackstop> { &self.backstop }
    pub fn config(&self) -> &SyncConfig { &self.config }

    pub fn snapshot(&self, scope: &Scope, kind: Kind) -> Arc<PartitionSnapshot> {
        self.cache.get(scope, kind)
    }

    pub fn distances(&self, scope: &Scope) -> Arc<DistanceMatrix> {
        self.matrix.get(scope)
    }

    pub async fn open_scope(&self, scope: &Scope) -> Result<(), SyncError> {
        self.open_scope_with(scope, None).await
    }

    /// Open one session per kind for `scope`, replacing any already running.
    /// `on_change` sees every applied event of every kind.
    pub async fn open_scope_with(&self, scope: &Scope, on_change: Option<OnResource>) -> Result<(), SyncError> {
        let started = Instant::now();
        for kind in OPEN_ORDER {
            let cb = match kind {
                Kind::Stage => Some(self.stage_callback(scope, on_change.clone())),
                _ => on_change.clone(),
            };
            if let Err(e) = self.registry.open(scope, kind, cb).await {
                warn!(scope = %scope, kind = %kind, error = %e, "api: open failed, closing scope");
                self.close_scope(scope).await;
                return Err(e.into());
            }
        }
        info!(scope = %scope, ms = started.elapsed().as_millis() as u64, "api: scope opened");
        Ok(())
    }

    fn stage_callback(&self, scope: &Scope, on_change: Option<OnResource>) -> OnResource {
        let scope = scope.clone();
        let matrix = Arc::clone(&self.matrix);
        let backstop = Arc::clone(&self.backstop);
        let cache = Arc::clone(&self.cache);
        let check = self.config.backstop;
        Arc::new(move |r: &Resolved| {
            if r.change != ChangeType::Deleted {
                if let Observation::Updated { promoted, .. } = matrix.observe_stage(&scope, &r.resource) {
                    debug!(scope = %scope, stage = %r.resource.name, promoted, "api: promotion recorded");
                }
            }
            if check {
                let freight = cache.get(&scope, Kind::Freight);
                backstop.reconcile(&scope, &r.snapshot, &freight);
            }
            if let Some(f) = &on_change {
                f(r);
            }
        })
    }

    /// Cancel every session of `scope` and drop its cached state and matrix.
    pub async fn close_scope(&self, scope: &Scope) {
        let stopped = self.registry.cancel_scope(scope).await;
        let partitions = self.cache.drop_scope(scope);
        self.matrix.drop_scope(scope);
        info!(scope = %scope, stopped, partitions, "api: scope closed");
    }

    /// Replace a partition with a full listing from the source, now.
    pub async fn refetch(&self, scope: &Scope, kind: Kind) -> Result<usize, SyncError> {
        let started = Instant::now();
        let items = self.registry.source().list(scope, kind).await?;
        Ok(store(&self.cache, scope, kind, items, started).0)
    }

    /// Wait for every session of `scope` to end on its own.
    pub async fn wait_scope(&self, scope: &Scope) -> Vec<(Kind, SessionOutcome)> {
        let mut out = Vec::with_capacity(OPEN_ORDER.len());
        for kind in OPEN_ORDER {
            if let Some(res) = self.registry.join(scope, kind).await {
                out.push((kind, res));
            }
        }
        out
    }

    /// Collect sessions that ended by themselves (stream closed or failed).
    pub async fn reap(&self) -> Vec<(PartitionKey, SessionOutcome)> {
        self.registry.reap().await
    }

    pub async fn shutdown(&self) {
        self.registry.cancel_all().await;
        info!("api: all sessions cancelled");
    }
}
