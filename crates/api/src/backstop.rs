//! Detects freight referenced by stages but absent from the freight cache.
//!
//! A stage can point at freight whose `Added` event was delivered before the
//! freight watch opened. When that happens the freight partition is refetched
//! from a full listing.

use std::sync::{Arc, Mutex};

use freightline_core::promotion::referenced_freight;
use freightline_core::{Kind, PartitionKey, Scope};
use freightline_store::PartitionSnapshot;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

type InFlight = Arc<Mutex<FxHashSet<PartitionKey>>>;
type Settled = Arc<Mutex<FxHashMap<PartitionKey, u64>>>;

/// Marks a refetch as in flight until dropped.
pub struct RefetchGuard {
    key: PartitionKey,
    in_flight: InFlight,
    settled: Settled,
}

impl RefetchGuard {
    pub fn partition(&self) -> &PartitionKey { &self.key }

    /// Record the epoch the full listing was published at. Until the partition
    /// moves past it, references the listing lacked do not trigger another refetch.
    pub fn settle(self, epoch: u64) {
        self.settled.lock().unwrap_or_else(|e| e.into_inner()).insert(self.key.clone(), epoch);
    }
}

impl Drop for RefetchGuard {
    fn drop(&mut self) {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).remove(&self.key);
    }
}

/// Performs the actual repopulation of a partition.
pub trait RefetchTrigger: Send + Sync {
    /// Start repopulating `(scope, kind)`. Call [`RefetchGuard::settle`] once the
    /// listing is published; drop the guard if the attempt failed.
    fn request_refetch(&self, scope: &Scope, kind: Kind, guard: RefetchGuard);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    Consistent,
    Refetching { missing: usize },
    /// References are missing but a refetch for the partition is already running.
    AlreadyInFlight { missing: usize },
    /// References are missing from a listing that is still current.
    Unresolved { missing: usize },
}

pub struct ConsistencyBackstop {
    trigger: Arc<dyn RefetchTrigger>,
    in_flight: InFlight,
    settled: Settled,
}

impl ConsistencyBackstop {
    pub fn new(trigger: Arc<dyn RefetchTrigger>) -> Self {
        Self { trigger, in_flight: Arc::default(), settled: Arc::default() }
    }

    /// True when any referenced name is absent from `cached`.
    pub fn check<'a>(scope: &Scope, referenced: impl IntoIterator<Item = &'a str>, cached: &PartitionSnapshot) -> bool {
        let present: FxHashSet<&str> = cached.names().collect();
        let mut needs = false;
        for name in referenced {
            if !present.contains(name) {
                debug!(scope = %scope, freight = %name, "backstop: referenced freight missing from cache");
                needs = true;
            }
        }
        needs
    }

    /// Compare every stage's freight references with the freight partition
    /// and request a refetch on a miss.
    pub fn reconcile(&self, scope: &Scope, stages: &PartitionSnapshot, freight: &PartitionSnapshot) -> Reconcile {
        let referenced: Vec<String> = stages.items.iter().flat_map(|s| referenced_freight(s)).collect();
        if !Self::check(scope, referenced.iter().map(|s| s.as_str()), freight) {
            return Reconcile::Consistent;
        }
        let missing = referenced.iter().filter(|n| !freight.contains(n)).count();
        let key = PartitionKey::new(scope.clone(), Kind::Freight);
        let settled_at = self.settled.lock().unwrap_or_else(|e| e.into_inner()).get(&key).copied();
        if settled_at == Some(freight.epoch) {
            debug!(scope = %scope, missing, epoch = freight.epoch, "backstop: listing already current, not refetching");
            return Reconcile::Unresolved { missing };
        }
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(key.clone()) {
                return Reconcile::AlreadyInFlight { missing };
            }
        }
        counter!("freightline_backstop_refetch_total", 1u64);
        info!(scope = %scope, missing, "backstop: requesting freight refetch");
        let guard = RefetchGuard { key, in_flight: Arc::clone(&self.in_flight), settled: Arc::clone(&self.settled) };
        self.trigger.request_refetch(scope, Kind::Freight, guard);
        Reconcile::Refetching { missing }
    }

    pub fn in_flight(&self, scope: &Scope, kind: Kind) -> bool {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).contains(&PartitionKey::new(scope.clone(), kind))
    }
}
