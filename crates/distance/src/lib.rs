//! freightline distance: per-scope matrix of promotion hops between artifact
//! versions and stages, maintained incrementally from successful promotions.
//!
//! `distance == 0` marks the version currently active at a stage. Every later
//! successful promotion of another version of the same repo into that stage
//! ages the other tracked versions by one.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use freightline_core::promotion::{promotion_signal, ArtifactRef, PromotionPhase};
use freightline_core::{Resource, Scope};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, info};

type StageDistances = BTreeMap<String, u32>;

/// `repo -> tag -> stage -> distance`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DistanceMatrix {
    repos: BTreeMap<String, BTreeMap<String, StageDistances>>,
}

/// One flattened matrix cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cell {
    pub repo: String,
    pub tag: String,
    pub stage: String,
    pub distance: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct PromoteStats {
    aged: usize,
    evicted: usize,
}

impl DistanceMatrix {
    pub fn is_empty(&self) -> bool { self.repos.is_empty() }

    pub fn distance(&self, repo: &str, tag: &str, stage: &str) -> Option<u32> {
        self.repos.get(repo)?.get(tag)?.get(stage).copied()
    }

    /// Tag currently active (distance 0) for `(repo, stage)`.
    pub fn current(&self, repo: &str, stage: &str) -> Option<&str> {
        self.repos
            .get(repo)?
            .iter()
            .find(|(_, stages)| stages.get(stage) == Some(&0))
            .map(|(tag, _)| tag.as_str())
    }

    pub fn repos(&self) -> impl Iterator<Item = &str> + '_ { self.repos.keys().map(|s| s.as_str()) }

    pub fn tags<'a>(&'a self, repo: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.repos.get(repo).into_iter().flat_map(|tags| tags.keys().map(|s| s.as_str()))
    }

    /// All cells ordered by repo, tag, stage.
    pub fn cells(&self) -> Vec<Cell> {
        let mut out = Vec::new();
        for (repo, tags) in &self.repos {
            for (tag, stages) in tags {
                for (stage, d) in stages {
                    out.push(Cell { repo: repo.clone(), tag: tag.clone(), stage: stage.clone(), distance: *d });
                }
            }
        }
        out
    }

    fn is_current(&self, artifact: &ArtifactRef, stage: &str) -> bool {
        self.distance(&artifact.repo, &artifact.tag, stage) == Some(0)
    }

    /// Make `artifact` current at `stage`, aging every sibling tag tracked for that stage.
    fn promote(&mut self, artifact: &ArtifactRef, stage: &str, max_distance: Option<u32>) -> PromoteStats {
        let mut stats = PromoteStats::default();
        let tags = self.repos.entry(artifact.repo.clone()).or_default();
        for (tag, stages) in tags.iter_mut() {
            if tag == &artifact.tag { continue; }
            if let Some(d) = stages.get_mut(stage) {
                *d = d.saturating_add(1);
                stats.aged += 1;
                if max_distance.is_some_and(|max| *d > max) {
                    stages.remove(stage);
                    stats.evicted += 1;
                }
            }
        }
        tags.retain(|_, stages| !stages.is_empty());
        tags.entry(artifact.tag.clone()).or_default().insert(stage.to_string(), 0);
        stats
    }
}

/// Why an observation left the matrix untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    /// Stage payload carries no last promotion.
    NoSignal,
    /// Promotion did not succeed (failed, aborted, still running, ...).
    NotSucceeded,
    /// Succeeded without any artifact reference.
    NoFreight,
    /// Every referenced version is already current at the stage.
    AlreadyCurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Ignored(Ignored),
    Updated { promoted: usize, aged: usize, evicted: usize },
}

/// Maintains one [`DistanceMatrix`] per scope.
#[derive(Default)]
pub struct DistanceMatrixMaintainer {
    matrices: RwLock<FxHashMap<Scope, Arc<ArcSwap<DistanceMatrix>>>>,
    max_distance: Option<u32>,
}

impl DistanceMatrixMaintainer {
    pub fn new() -> Self { Self::default() }

    /// Evict tags whose distance at a stage grows beyond `max`. `None` keeps everything.
    pub fn with_max_distance(max: Option<u32>) -> Self {
        Self { matrices: RwLock::new(FxHashMap::default()), max_distance: max }
    }

    fn slot(&self, scope: &Scope) -> Option<Arc<ArcSwap<DistanceMatrix>>> {
        self.matrices.read().unwrap_or_else(|e| e.into_inner()).get(scope).cloned()
    }

    fn slot_or_insert(&self, scope: &Scope) -> Arc<ArcSwap<DistanceMatrix>> {
        if let Some(s) = self.slot(scope) { return s; }
        let mut map = self.matrices.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(scope.clone()).or_insert_with(|| {
            info!(scope = %scope, "distance: matrix created");
            Arc::new(ArcSwap::from_pointee(DistanceMatrix::default()))
        }))
    }

    /// Current matrix for `scope` (empty if no successful promotion was observed yet).
    pub fn get(&self, scope: &Scope) -> Arc<DistanceMatrix> {
        match self.slot(scope) {
            Some(s) => s.load_full(),
            None => Arc::new(DistanceMatrix::default()),
        }
    }

    pub fn drop_scope(&self, scope: &Scope) -> bool {
        self.matrices.write().unwrap_or_else(|e| e.into_inner()).remove(scope).is_some()
    }

    /// Record that `freight` was promoted into `stage` with `phase`.
    pub fn observe_promotion(
        &self,
        scope: &Scope,
        stage: &str,
        phase: &PromotionPhase,
        freight: Option<&[ArtifactRef]>,
    ) -> Observation {
        if !phase.is_success() {
            return Observation::Ignored(Ignored::NotSucceeded);
        }
        let artifacts = match freight {
            Some(a) if !a.is_empty() => a,
            _ => {
                debug!(scope = %scope, stage = %stage, "distance: succeeded promotion without freight");
                return Observation::Ignored(Ignored::NoFreight);
            }
        };
        if let Some(existing) = self.slot(scope) {
            let m = existing.load();
            if artifacts.iter().all(|a| m.is_current(a, stage)) {
                return Observation::Ignored(Ignored::AlreadyCurrent);
            }
        }

        let max_distance = self.max_distance;
        let mut outcome = Observation::Ignored(Ignored::AlreadyCurrent);
        let slot = self.slot_or_insert(scope);
        slot.rcu(|cur| {
            let mut next = (**cur).clone();
            let (mut promoted, mut aged, mut evicted) = (0usize, 0usize, 0usize);
            for a in artifacts {
                if next.is_current(a, stage) { continue; }
                let stats = next.promote(a, stage, max_distance);
                promoted += 1;
                aged += stats.aged;
                evicted += stats.evicted;
            }
            outcome = if promoted == 0 {
                Observation::Ignored(Ignored::AlreadyCurrent)
            } else {
                Observation::Updated { promoted, aged, evicted }
            };
            next
        });
        if let Observation::Updated { promoted, aged, evicted } = outcome {
            counter!("freightline_matrix_updates_total", 1u64);
            debug!(scope = %scope, stage = %stage, promoted, aged, evicted, "distance: matrix updated");
        }
        outcome
    }

    /// Extract the last-promotion signal from a stage resource and observe it.
    pub fn observe_stage(&self, scope: &Scope, stage: &Resource) -> Observation {
        match promotion_signal(stage) {
            Some(sig) => self.observe_promotion(scope, &sig.stage, &sig.phase, sig.freight.as_deref()),
            None => Observation::Ignored(Ignored::NoSignal),
        }
    }
}
