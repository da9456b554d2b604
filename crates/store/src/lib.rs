//! freightline store: per-scope resource cache with copy-on-write snapshots.
//!
//! Every `(scope, kind)` partition holds an immutable [`PartitionSnapshot`]
//! behind an `ArcSwap`. Writers replace the whole list; readers holding an
//! older `Arc` keep a valid view.

#![forbid(unsafe_code)]

pub mod reduce;

use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use freightline_core::{Kind, PartitionKey, Resource, Scope};
use metrics::gauge;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info};

pub use reduce::{apply, apply_all, Reduced};

/// Immutable list of resources for one partition.
#[derive(Debug, Clone, Default)]
pub struct PartitionSnapshot {
    /// Number of list replacements observed by this partition.
    pub epoch: u64,
    pub items: Vec<Arc<Resource>>,
}

impl PartitionSnapshot {
    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn get(&self, name: &str) -> Option<&Arc<Resource>> {
        self.items.iter().find(|r| r.name == name)
    }

    pub fn contains(&self, name: &str) -> bool { self.get(name).is_some() }

    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.items.iter().map(|r| r.name.as_str())
    }
}

struct Partition {
    snap: ArcSwap<PartitionSnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl Partition {
    fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { snap: ArcSwap::from_pointee(PartitionSnapshot::default()), epoch_tx }
    }
}

/// Per-scope, per-kind cache. Shared by handle (`Arc<ResourceCache>`).
#[derive(Default)]
pub struct ResourceCache {
    partitions: RwLock<FxHashMap<PartitionKey, Arc<Partition>>>,
}

impl ResourceCache {
    pub fn new() -> Self { Self::default() }

    fn partition(&self, key: &PartitionKey) -> Option<Arc<Partition>> {
        let map = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        map.get(key).cloned()
    }

    fn partition_or_insert(&self, key: PartitionKey) -> Arc<Partition> {
        if let Some(p) = self.partition(&key) { return p; }
        let mut map = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(key).or_insert_with(|| {
            debug!("cache: partition created");
            Arc::new(Partition::new())
        }))
    }

    /// Current snapshot for `(scope, kind)`; empty when the partition does not exist.
    pub fn get(&self, scope: &Scope, kind: Kind) -> Arc<PartitionSnapshot> {
        match self.partition(&PartitionKey::new(scope.clone(), kind)) {
            Some(p) => p.snap.load_full(),
            None => Arc::new(PartitionSnapshot::default()),
        }
    }

    /// Atomically replace the list for `(scope, kind)`. Returns the new epoch.
    pub fn set(&self, scope: &Scope, kind: Kind, items: Vec<Arc<Resource>>) -> u64 {
        let p = self.partition_or_insert(PartitionKey::new(scope.clone(), kind));
        let len = items.len();
        let prev = p.snap.rcu(|cur| PartitionSnapshot { epoch: cur.epoch.saturating_add(1), items: items.clone() });
        let epoch = prev.epoch.saturating_add(1);
        p.epoch_tx.send_replace(epoch);
        gauge!("freightline_cache_items", len as f64, "kind" => kind.as_str());
        epoch
    }

    /// Replace the list only if the partition is still at epoch `expected`.
    ///
    /// Returns the published snapshot, or the newer snapshot that won when
    /// another writer got there first. The caller re-reduces against it.
    pub fn set_if(
        &self,
        scope: &Scope,
        kind: Kind,
        expected: u64,
        items: Vec<Arc<Resource>>,
    ) -> Result<Arc<PartitionSnapshot>, Arc<PartitionSnapshot>> {
        let p = self.partition_or_insert(PartitionKey::new(scope.clone(), kind));
        let cur = p.snap.load_full();
        if cur.epoch != expected {
            return Err(cur);
        }
        let len = items.len();
        let next = Arc::new(PartitionSnapshot { epoch: expected.saturating_add(1), items });
        let prev = p.snap.compare_and_swap(&cur, Arc::clone(&next));
        if !Arc::ptr_eq(&prev, &cur) {
            return Err(p.snap.load_full());
        }
        p.epoch_tx.send_replace(next.epoch);
        gauge!("freightline_cache_items", len as f64, "kind" => kind.as_str());
        Ok(next)
    }

    /// Create the partition if missing (first subscription).
    pub fn ensure(&self, scope: &Scope, kind: Kind) {
        let _ = self.partition_or_insert(PartitionKey::new(scope.clone(), kind));
    }

    /// Epoch notifications for `(scope, kind)`, fired after every `set`.
    pub fn subscribe(&self, scope: &Scope, kind: Kind) -> watch::Receiver<u64> {
        self.partition_or_insert(PartitionKey::new(scope.clone(), kind)).epoch_tx.subscribe()
    }

    /// Scopes with at least one partition, sorted.
    pub fn scopes(&self) -> Vec<Scope> {
        let map = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Scope> = map.keys().map(|k| k.scope.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Tear down every partition of `scope`. Returns the number removed.
    pub fn drop_scope(&self, scope: &Scope) -> usize {
        let mut map = self.partitions.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|k, _| &k.scope != scope);
        let removed = before - map.len();
        info!(scope = %scope, removed, "cache: scope dropped");
        removed
    }
}
