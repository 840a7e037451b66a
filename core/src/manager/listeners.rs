use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::model::entity::Entity;
use crate::model::identifier::Identifier;
use crate::model::query::{sort_entities, Query};

/// Per-entity predicate deciding whether a result may appear in a continuous
/// listener emission.
pub type Contract<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// One continuous observer: its query, the value it last observed, the
/// channel it receives on and an optional contract gating inclusion.
pub(super) struct ListenerEntry<E> {
    pub query: Query,
    pub current: Vec<E>,
    pub sink: mpsc::Sender<Vec<E>>,
    pub contract: Option<Contract<E>>,
}

/// The registry of active listeners. Entries whose subscriber dropped are
/// pruned at the next dispatch, which releases the query cache entry.
pub(super) struct ListenerSet<E> {
    entries: Vec<ListenerEntry<E>>,
}

impl<E: Entity> ListenerSet<E> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(&mut self, entry: ListenerEntry<E>) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn prune_closed(&mut self) {
        self.entries.retain(|entry| !entry.sink.is_closed());
    }

    /// Computes the emission for every listener affected by an update. The
    /// sends themselves happen outside the registry lock, on the event
    /// queue.
    pub fn collect_update_emissions(
        &mut self,
        performed: &Query,
        results: &[E],
        complete: bool,
    ) -> Vec<(mpsc::Sender<Vec<E>>, Vec<E>)> {
        self.prune_closed();
        let mut emissions = Vec::new();
        for entry in &mut self.entries {
            let mut next = next_value(entry, performed, results, complete);
            if let Some(contract) = &entry.contract {
                next.retain(|e| contract(e));
            }
            if next != entry.current {
                entry.current = next.clone();
                emissions.push((entry.sink.clone(), next));
            }
        }
        emissions
    }

    /// Computes the emission for every listener holding a deleted entity.
    pub fn collect_delete_emissions(
        &mut self,
        deleted: &[Identifier],
    ) -> Vec<(mpsc::Sender<Vec<E>>, Vec<E>)> {
        self.prune_closed();
        let deleted: HashSet<&Identifier> = deleted.iter().collect();
        let mut emissions = Vec::new();
        for entry in &mut self.entries {
            if !entry
                .current
                .iter()
                .any(|e| deleted.contains(&e.identifier()))
            {
                continue;
            }
            let next: Vec<E> = entry
                .current
                .iter()
                .filter(|e| !deleted.contains(&e.identifier()))
                .cloned()
                .collect();
            entry.current = next.clone();
            emissions.push((entry.sink.clone(), next));
        }
        emissions
    }
}

/// The update strategy of one listener relative to a performed query, per
/// the manager's delivery rules: same-or-match-all queries merge or replace,
/// filtered listeners union matches and subtract failures, everything else
/// merges by identifier. Only deterministic orders ever reorder.
fn next_value<E: Entity>(
    entry: &ListenerEntry<E>,
    performed: &Query,
    results: &[E],
    complete: bool,
) -> Vec<E> {
    let mut next = if *performed == entry.query || performed.matches_all() {
        if complete {
            results.to_vec()
        } else {
            merge_by_identifier(&entry.current, results)
        }
    } else if let Some(filter) = &entry.query.filter {
        let matching: Vec<E> = results.iter().filter(|e| filter.matches(*e)).cloned().collect();
        let failing: HashSet<Identifier> = results
            .iter()
            .filter(|e| !filter.matches(*e))
            .map(|e| e.identifier())
            .collect();
        let mut merged = merge_by_identifier(&entry.current, &matching);
        merged.retain(|e| !failing.contains(&e.identifier()));
        merged
    } else {
        merge_by_identifier(&entry.current, results)
    };
    if entry.query.order_is_deterministic() {
        sort_entities(&mut next, &entry.query.order);
    }
    next
}

/// Replaces entities of `current` by identifier and appends the rest of
/// `incoming` in its order.
fn merge_by_identifier<E: Entity>(current: &[E], incoming: &[E]) -> Vec<E> {
    let mut merged: Vec<E> = current.to_vec();
    for entity in incoming {
        match merged
            .iter_mut()
            .find(|e| e.identifier() == entity.identifier())
        {
            Some(slot) => *slot = entity.clone(),
            None => merged.push(entity.clone()),
        }
    }
    merged
}
