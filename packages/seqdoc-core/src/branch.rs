use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::block::{Block, BranchRef, Content, Item, Value};
use crate::ids::Id;
use crate::store::BlockStore;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A sequence/map container items are linked into.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Branch {
    /// First element of the sequence (including deleted items).
    pub start: Option<Id>,
    /// Latest item for each key, addressed by its last element.
    pub map: HashMap<Arc<str>, Id>,
    /// Item carrying this branch; `None` for roots.
    pub item: Option<Id>,
}

impl Branch {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn nested(item: Id) -> Self {
        Self {
            item: Some(item),
            ..Self::default()
        }
    }
}

/// Walks a sequence left to right through the store, deleted items included.
pub struct SequenceIter<'a> {
    store: &'a BlockStore,
    next: Option<Id>,
}

impl<'a> SequenceIter<'a> {
    pub fn new(store: &'a BlockStore, start: Option<Id>) -> Self {
        Self { store, next: start }
    }
}

impl<'a> Iterator for SequenceIter<'a> {
    type Item = &'a Item;

    fn next(&mut self) -> Option<&'a Item> {
        let id = self.next?;
        let item = self.store.get(&id).ok().and_then(Block::as_item)?;
        self.next = item.right;
        Some(item)
    }
}

/// Element of a materialized sequence.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Element {
    /// Consecutive characters, coalesced across item boundaries.
    Text(String),
    Value(Value),
    Branch(BranchSnapshot),
}

/// Materialized, replica-independent view of one branch.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BranchSnapshot {
    pub sequence: Vec<Element>,
    pub map: BTreeMap<String, Value>,
}

impl BranchSnapshot {
    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty() && self.map.is_empty()
    }
}

/// Materialized view of a whole document; two converged replicas produce equal snapshots.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DocSnapshot {
    pub roots: BTreeMap<String, BranchSnapshot>,
}

/// Every item linked into `branch`, deleted ones included: the sequence first, then
/// each key's chain of map values.
pub(crate) fn children(store: &BlockStore, branch: &Branch) -> Vec<Id> {
    let mut out: Vec<Id> = SequenceIter::new(store, branch.start)
        .map(|item| item.id)
        .collect();
    for last in branch.map.values() {
        let mut cursor = store.get(last).ok().and_then(Block::as_item);
        while let Some(item) = cursor {
            out.push(item.id);
            cursor = item
                .left
                .and_then(|left| store.get(&left).ok())
                .and_then(Block::as_item);
        }
    }
    out
}

pub(crate) fn visible_len(store: &BlockStore, branch: &Branch) -> u32 {
    SequenceIter::new(store, branch.start)
        .map(Item::visible_len)
        .sum()
}

pub(crate) fn text(store: &BlockStore, branch: &Branch) -> String {
    let mut out = String::new();
    for item in SequenceIter::new(store, branch.start) {
        if item.deleted {
            continue;
        }
        if let Content::String(s) = &item.content {
            out.push_str(s);
        }
    }
    out
}

pub(crate) fn values(store: &BlockStore, branch: &Branch) -> Vec<Value> {
    let mut out = Vec::new();
    for item in SequenceIter::new(store, branch.start) {
        if item.deleted {
            continue;
        }
        if let Content::Values(v) = &item.content {
            out.extend(v.iter().cloned());
        }
    }
    out
}

pub(crate) fn map_get(store: &BlockStore, branch: &Branch, key: &str) -> Option<Value> {
    let id = branch.map.get(key)?;
    let item = store.get(id).ok()?.as_item()?;
    if item.deleted {
        return None;
    }
    match &item.content {
        Content::Values(v) => v.last().cloned(),
        Content::String(s) => Some(Value::String(s.clone())),
        _ => None,
    }
}

pub(crate) fn snapshot(
    store: &BlockStore,
    branches: &HashMap<BranchRef, Branch>,
    branch: &Branch,
) -> BranchSnapshot {
    let mut snap = BranchSnapshot::default();
    for item in SequenceIter::new(store, branch.start) {
        if item.deleted {
            continue;
        }
        match &item.content {
            Content::String(s) => match snap.sequence.last_mut() {
                Some(Element::Text(prev)) => prev.push_str(s),
                _ => snap.sequence.push(Element::Text(s.clone())),
            },
            Content::Values(v) => snap
                .sequence
                .extend(v.iter().cloned().map(Element::Value)),
            Content::Branch => {
                let nested = branches
                    .get(&BranchRef::Nested(item.id))
                    .map(|b| snapshot(store, branches, b))
                    .unwrap_or_default();
                snap.sequence.push(Element::Branch(nested));
            }
            Content::Deleted(_) => {}
        }
    }
    for key in branch.map.keys() {
        if let Some(value) = map_get(store, branch, key) {
            snap.map.insert(key.to_string(), value);
        }
    }
    snap
}
