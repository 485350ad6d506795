use std::collections::HashMap;

use crate::ids::{Clock, Id, ReplicaId};
use crate::state_vector::StateVector;
use crate::store::BlockStore;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Half-open clock range `[start, start + len)` on one replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClockRange {
    pub start: Clock,
    pub len: u32,
}

impl ClockRange {
    pub fn new(start: Clock, len: u32) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> Clock {
        self.start + self.len
    }
}

/// Compact set of ids, stored as per-replica clock ranges.
///
/// Invariant: for every replica the ranges are sorted by start, non-empty, and neither
/// overlap nor touch (touching ranges are coalesced on insert).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IdSet {
    entries: HashMap<ReplicaId, Vec<ClockRange>>,
}

/// Ranges of deleted ids. Exchanged with every update so deletions survive even when the
/// receiver never saw the inserted content in full.
pub type DeleteSet = IdSet;

impl IdSet {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Every id in `[before, after)` for each replica.
    pub fn difference(before: &StateVector, after: &StateVector) -> Self {
        let mut set = IdSet::new();
        for (replica, end) in after.iter() {
            let start = before.get(replica);
            if end > start {
                set.insert(Id::new(replica, start), end - start);
            }
        }
        set
    }

    pub fn insert(&mut self, id: Id, len: u32) {
        if len == 0 {
            return;
        }
        let ranges = self.entries.entry(id.replica).or_default();
        let start = id.clock;
        let end = id.clock + len;

        // First range whose end reaches `start`; everything before it is untouched.
        let mut idx = ranges.partition_point(|r| r.end() < start);
        if idx == ranges.len() || ranges[idx].start > end {
            ranges.insert(idx, ClockRange::new(start, len));
            return;
        }

        let merged_start = ranges[idx].start.min(start);
        let mut merged_end = ranges[idx].end().max(end);
        let first = idx;
        idx += 1;
        while idx < ranges.len() && ranges[idx].start <= merged_end {
            merged_end = merged_end.max(ranges[idx].end());
            idx += 1;
        }
        ranges.drain(first + 1..idx);
        ranges[first] = ClockRange::new(merged_start, merged_end - merged_start);
    }

    /// Ranges of every deleted block in `store`.
    pub fn from_store(store: &BlockStore) -> Self {
        store.deleted_ranges()
    }

    /// Re-sort and coalesce every replica's ranges.
    ///
    /// `insert` already keeps ranges normalized; this is for sets assembled through
    /// `push_unchecked`, e.g. by the update decoders.
    pub fn squash(&mut self) {
        for ranges in self.entries.values_mut() {
            ranges.retain(|r| r.len > 0);
            ranges.sort_unstable_by_key(|r| r.start);
            let mut out: Vec<ClockRange> = Vec::with_capacity(ranges.len());
            for range in ranges.drain(..) {
                match out.last_mut() {
                    Some(prev) if range.start <= prev.end() => {
                        let end = prev.end().max(range.end());
                        prev.len = end - prev.start;
                    }
                    _ => out.push(range),
                }
            }
            *ranges = out;
        }
        self.entries.retain(|_, r| !r.is_empty());
    }

    /// Append a range without normalizing; call `squash` afterwards.
    pub fn push_unchecked(&mut self, id: Id, len: u32) {
        self.entries
            .entry(id.replica)
            .or_default()
            .push(ClockRange::new(id.clock, len));
    }

    pub fn contains(&self, id: &Id) -> bool {
        let Some(ranges) = self.entries.get(&id.replica) else {
            return false;
        };
        let idx = ranges.partition_point(|r| r.end() <= id.clock);
        ranges
            .get(idx)
            .map(|r| r.start <= id.clock)
            .unwrap_or(false)
    }

    pub fn merge(&mut self, other: &IdSet) {
        for (&replica, ranges) in &other.entries {
            for range in ranges {
                self.insert(Id::new(replica, range.start), range.len);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|r| r.is_empty())
    }

    /// Ranges recorded for one replica, sorted by clock.
    pub fn ranges(&self, replica: ReplicaId) -> &[ClockRange] {
        self.entries.get(&replica).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Replicas with at least one range, sorted.
    pub fn replicas(&self) -> Vec<ReplicaId> {
        let mut replicas: Vec<ReplicaId> = self
            .entries
            .iter()
            .filter(|(_, r)| !r.is_empty())
            .map(|(&replica, _)| replica)
            .collect();
        replicas.sort_unstable();
        replicas
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, ClockRange)> + '_ {
        self.replicas()
            .into_iter()
            .flat_map(move |replica| self.ranges(replica).iter().map(move |r| (replica, *r)))
    }

    /// Total number of ids in the set.
    pub fn len(&self) -> u64 {
        self.entries
            .values()
            .flatten()
            .map(|r| r.len as u64)
            .sum()
    }

    /// Split into the part covered by `state` and the part beyond it.
    pub fn split_at_state(&self, state: &StateVector) -> (IdSet, IdSet) {
        let mut known = IdSet::new();
        let mut beyond = IdSet::new();
        for (replica, range) in self.iter() {
            let frontier = state.get(replica);
            if range.end() <= frontier {
                known.insert(Id::new(replica, range.start), range.len);
            } else if range.start >= frontier {
                beyond.insert(Id::new(replica, range.start), range.len);
            } else {
                known.insert(Id::new(replica, range.start), frontier - range.start);
                beyond.insert(Id::new(replica, frontier), range.end() - frontier);
            }
        }
        (known, beyond)
    }
}
