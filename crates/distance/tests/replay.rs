use freightline_core::{Event, Kind, Resource, Scope};
use freightline_distance::{DistanceMatrixMaintainer, Ignored, Observation};
use freightline_store::{apply, ResourceCache};
use serde_json::json;

fn stage(name: &str, phase: &str, tag: &str) -> Resource {
    Resource::new(
        "demo",
        Kind::Stage,
        name,
        json!({
            "status": {
                "lastPromotion": {
                    "status": { "phase": phase },
                    "freight": { "images": [{ "repoURL": "nginx", "tag": tag }] }
                }
            }
        }),
    )
}

/// Apply stage events to the cache and hand each resolved stage to the maintainer,
/// in the same order a watch session would.
fn replay(events: &[Event]) -> (ResourceCache, DistanceMatrixMaintainer, Vec<Observation>) {
    let cache = ResourceCache::new();
    let matrix = DistanceMatrixMaintainer::new();
    let scope = Scope::new("demo");
    let mut seen = Vec::new();
    for ev in events {
        let current = cache.get(&scope, Kind::Stage);
        let reduced = apply(&current.items, ev);
        if reduced.changed {
            cache.set(&scope, Kind::Stage, reduced.next);
        }
        if let Some(r) = reduced.resource {
            seen.push(matrix.observe_stage(&scope, &r));
        }
    }
    (cache, matrix, seen)
}

#[test]
fn stage_stream_drives_matrix_through_all_scenarios() {
    let events = vec![
        Event::added(stage("prod", "Succeeded", "1.0")),
        Event::modified(stage("prod", "Succeeded", "2.0")),
        // re-delivery of the previous event
        Event::modified(stage("prod", "Succeeded", "2.0")),
        Event::modified(stage("prod", "Failed", "3.0")),
    ];
    let (cache, matrix, seen) = replay(&events);
    let scope = Scope::new("demo");
    let mx = matrix.get(&scope);
    assert_eq!(mx.distance("nginx", "2.0", "prod"), Some(0));
    assert_eq!(mx.distance("nginx", "1.0", "prod"), Some(1));
    assert_eq!(mx.distance("nginx", "3.0", "prod"), None);
    assert_eq!(seen[2], Observation::Ignored(Ignored::AlreadyCurrent));
    assert_eq!(seen[3], Observation::Ignored(Ignored::NotSucceeded));
    assert_eq!(cache.get(&scope, Kind::Stage).len(), 1);
}

#[test]
fn running_then_succeeded_counts_once() {
    let events = vec![
        Event::added(stage("test", "Succeeded", "1.0")),
        Event::modified(stage("test", "Running", "2.0")),
        Event::modified(stage("test", "Succeeded", "2.0")),
        Event::modified(stage("test", "Succeeded", "2.0")),
    ];
    let (_cache, matrix, _) = replay(&events);
    let mx = matrix.get(&Scope::new("demo"));
    assert_eq!(mx.distance("nginx", "1.0", "test"), Some(1));
    assert_eq!(mx.cells().len(), 2);
}
