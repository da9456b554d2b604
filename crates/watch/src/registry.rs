//! At most one live session per partition.

use std::sync::Arc;

use freightline_core::{Kind, PartitionKey, Scope};
use freightline_store::ResourceCache;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::info;

use crate::session::{OnResource, SessionSummary, WatchError, WatchHandle, WatchSession};
use crate::source::EventSource;

pub type SessionOutcome = Result<SessionSummary, WatchError>;

/// Owns the sessions writing into one cache. Opening a partition that already
/// has a session cancels (and awaits) the old one first.
pub struct WatchRegistry {
    cache: Arc<ResourceCache>,
    source: Arc<dyn EventSource>,
    sessions: Mutex<FxHashMap<PartitionKey, WatchHandle>>,
}

impl WatchRegistry {
    pub fn new(cache: Arc<ResourceCache>, source: Arc<dyn EventSource>) -> Self {
        Self { cache, source, sessions: Mutex::new(FxHashMap::default()) }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> { &self.cache }
    pub fn source(&self) -> &Arc<dyn EventSource> { &self.source }

    pub async fn open(&self, scope: &Scope, kind: Kind, on_resource: Option<OnResource>) -> Result<(), WatchError> {
        let key = PartitionKey::new(scope.clone(), kind);
        // held across the whole replacement so two opens cannot interleave
        let mut sessions = self.sessions.lock().await;
        if let Some(prev) = sessions.remove(&key) {
            let res = prev.cancel().await;
            info!(partition = %key, previous = ?res.as_ref().map(|s| s.end), "watch: replaced existing session");
        }
        let handle = WatchSession::new(Arc::clone(&self.cache), scope.clone(), kind)
            .with_callback(on_resource)
            .open(self.source.as_ref())
            .await?;
        sessions.insert(key, handle);
        Ok(())
    }

    /// Cancel one partition's session; `None` if there was none.
    pub async fn cancel(&self, scope: &Scope, kind: Kind) -> Option<SessionOutcome> {
        let handle = self.sessions.lock().await.remove(&PartitionKey::new(scope.clone(), kind))?;
        Some(handle.cancel().await)
    }

    /// Cancel every session of `scope`. Returns how many were stopped.
    pub async fn cancel_scope(&self, scope: &Scope) -> usize {
        let handles: Vec<WatchHandle> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<PartitionKey> = sessions.keys().filter(|k| &k.scope == scope).cloned().collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };
        let n = handles.len();
        for h in handles {
            let _ = h.cancel().await;
        }
        n
    }

    pub async fn cancel_all(&self) {
        let handles: Vec<WatchHandle> = self.sessions.lock().await.drain().map(|(_, h)| h).collect();
        for h in handles {
            let _ = h.cancel().await;
        }
    }

    /// Wait for a partition's session to end on its own.
    pub async fn join(&self, scope: &Scope, kind: Kind) -> Option<SessionOutcome> {
        let handle = self.sessions.lock().await.remove(&PartitionKey::new(scope.clone(), kind))?;
        Some(handle.join().await)
    }

    /// Remove sessions that already ended and return their outcomes.
    pub async fn reap(&self) -> Vec<(PartitionKey, SessionOutcome)> {
        let finished: Vec<WatchHandle> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<PartitionKey> = sessions.iter().filter(|(_, h)| h.is_finished()).map(|(k, _)| k.clone()).collect();
            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };
        let mut out = Vec::with_capacity(finished.len());
        for h in finished {
            let key = h.partition().clone();
            out.push((key, h.join().await));
        }
        out
    }

    pub async fn is_active(&self, scope: &Scope, kind: Kind) -> bool {
        self.sessions
            .lock()
            .await
            .get(&PartitionKey::new(scope.clone(), kind))
            .is_some_and(|h| !h.is_finished())
    }

    pub async fn partitions(&self) -> Vec<PartitionKey> {
        let mut out: Vec<PartitionKey> = self.sessions.lock().await.keys().cloned().collect();
        out.sort();
        out
    }
}
