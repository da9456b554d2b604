//! Pure merge of one change event into a partition list.

use std::sync::Arc;

use freightline_core::{ChangeType, Event, Resource};

/// Outcome of applying one event.
#[derive(Debug, Clone)]
pub struct Reduced {
    /// Resolved resource; `None` when the event was ill-formed and dropped.
    pub resource: Option<Arc<Resource>>,
    pub next: Vec<Arc<Resource>>,
    /// False when `next` is identical to the input (delete of an unknown name, dropped event).
    pub changed: bool,
}

/// Apply `event` to `current`.
///
/// Added and Modified are handled identically: replace in place when the
/// identity is present, append otherwise. Deleting an unknown identity is a
/// no-op. Applying the same event twice yields the same list.
pub fn apply(current: &[Arc<Resource>], event: &Event) -> Reduced {
    let incoming = &event.resource;
    if !incoming.is_well_formed() {
        return Reduced { resource: None, next: current.to_vec(), changed: false };
    }
    let pos = current.iter().position(|r| r.same_identity(incoming));
    let resolved = Arc::new(incoming.clone());
    match (event.change_type, pos) {
        (ChangeType::Deleted, Some(idx)) => {
            let mut next = current.to_vec();
            next.remove(idx);
            Reduced { resource: Some(resolved), next, changed: true }
        }
        (ChangeType::Deleted, None) => Reduced { resource: Some(resolved), next: current.to_vec(), changed: false },
        (ChangeType::Added | ChangeType::Modified, Some(idx)) => {
            let mut next = current.to_vec();
            next[idx] = Arc::clone(&resolved);
            Reduced { resource: Some(resolved), next, changed: true }
        }
        (ChangeType::Added | ChangeType::Modified, None) => {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&resolved));
            Reduced { resource: Some(resolved), next, changed: true }
        }
    }
}

/// Fold a batch of events, in order.
pub fn apply_all<'a>(current: &[Arc<Resource>], events: impl IntoIterator<Item = &'a Event>) -> Vec<Arc<Resource>> {
    let mut list = current.to_vec();
    for ev in events {
        let r = apply(&list, ev);
        if r.changed { list = r.next; }
    }
    list
}
