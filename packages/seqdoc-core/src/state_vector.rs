use std::collections::HashMap;

use crate::ids::{Clock, Id, ReplicaId};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Per-replica "next expected clock" (i.e. we've seen `0..clock` for that replica).
///
/// The block store never has holes, so unlike a gap-aware version vector a single
/// contiguous frontier per replica is enough to describe what a document knows.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StateVector {
    entries: HashMap<ReplicaId, Clock>,
}

impl StateVector {
    /// Create a new empty state vector.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Next expected clock for `replica`, or 0 if nothing has been seen.
    pub fn get(&self, replica: ReplicaId) -> Clock {
        self.entries.get(&replica).copied().unwrap_or(0)
    }

    pub fn set(&mut self, replica: ReplicaId, clock: Clock) {
        if clock == 0 {
            self.entries.remove(&replica);
        } else {
            self.entries.insert(replica, clock);
        }
    }

    /// Raise the frontier for `replica` to at least `clock`.
    pub fn set_max(&mut self, replica: ReplicaId, clock: Clock) {
        if clock > self.get(replica) {
            self.entries.insert(replica, clock);
        }
    }

    /// Whether the element `id` is covered.
    pub fn contains(&self, id: &Id) -> bool {
        id.clock < self.get(id.replica)
    }

    pub fn merge(&mut self, other: &StateVector) {
        for (&replica, &clock) in &other.entries {
            self.set_max(replica, clock);
        }
    }

    /// True when every element known to `other` is also known here.
    pub fn is_aware_of(&self, other: &StateVector) -> bool {
        other
            .entries
            .iter()
            .all(|(&replica, &clock)| self.get(replica) >= clock)
    }

    /// Check if this state vector is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Entries sorted by replica, so callers that serialize get a stable byte layout.
    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, Clock)> {
        let mut sorted: Vec<(ReplicaId, Clock)> =
            self.entries.iter().map(|(&r, &c)| (r, c)).collect();
        sorted.sort_unstable_by_key(|&(r, _)| r);
        sorted.into_iter()
    }
}

impl FromIterator<(ReplicaId, Clock)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ReplicaId, Clock)>>(iter: T) -> Self {
        let mut sv = StateVector::new();
        for (replica, clock) in iter {
            sv.set_max(replica, clock);
        }
        sv
    }
}
