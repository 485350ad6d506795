//! YATA integration of a single block into the document.
//!
//! Every item remembers the neighbours it was created between (`origin` and
//! `right_origin`). When other items were inserted concurrently between the same
//! neighbours, the scan below orders them identically on every replica: items sharing
//! our origin are ordered by replica id (lower first), and items anchored on something
//! we already passed stay on our left unless they belong to the run we are still
//! competing with.

use std::collections::HashSet;

use tracing::trace;

use crate::block::{Block, BranchRef, Content, Gc, Item};
use crate::branch;
use crate::error::{Error, Result};
use crate::ids::{Clock, Id, ReplicaId};
use crate::transaction::Transaction;

impl Transaction<'_> {
    /// First causal dependency of `block` the store has not seen yet, as the replica and
    /// the clock its state must reach. `offset` elements at the front are already known,
    /// which makes the origin implicit.
    pub(crate) fn missing_dependency(
        &self,
        block: &Block,
        offset: u32,
    ) -> Option<(ReplicaId, Clock)> {
        let Block::Item(item) = block else {
            return None;
        };
        let store = &self.state.store;
        let origin = if offset == 0 { item.origin } else { None };
        let parent = match &item.parent {
            Some(BranchRef::Nested(id)) => Some(*id),
            _ => None,
        };
        [origin, item.right_origin, parent]
            .into_iter()
            .flatten()
            .find(|id| id.clock >= store.get_state(id.replica))
            .map(|id| (id.replica, id.clock + 1))
    }

    /// Append `block` to the store and link it into its branch, skipping the first
    /// `offset` elements.
    pub(crate) fn integrate_block(&mut self, block: Block, offset: u32) -> Result<()> {
        match block {
            Block::Gc(gc) => self.integrate_gc(gc.id.advance(offset), gc.len - offset),
            Block::Item(mut item) => {
                item.trim_front(offset);
                self.integrate_item(item)
            }
        }
    }

    fn integrate_gc(&mut self, id: Id, len: u32) -> Result<()> {
        self.state.store.add_block(Block::Gc(Gc { id, len }))?;
        self.delete_set.insert(id, len);
        Ok(())
    }

    fn integrate_item(&mut self, mut item: Item) -> Result<()> {
        let mut collected = false;
        let mut left: Option<Id> = None;
        let mut right: Option<Id> = None;
        let mut inherited = None;

        if let Some(origin) = item.origin {
            let idx = self.state.store.split_clean_end(&origin)?;
            self.merge_points.push(origin.advance(1));
            match self.state.store.blocks(origin.replica).get(idx) {
                Some(Block::Item(o)) => {
                    left = Some(origin);
                    inherited = Some((o.parent.clone(), o.parent_sub.clone()));
                }
                Some(Block::Gc(_)) => collected = true,
                None => return Err(Error::NotFound(origin)),
            }
        }
        if let Some(right_origin) = item.right_origin {
            let idx = self.state.store.split_clean_start(&right_origin)?;
            self.merge_points.push(right_origin);
            match self.state.store.blocks(right_origin.replica).get(idx) {
                Some(Block::Item(r)) => {
                    right = Some(right_origin);
                    if inherited.is_none() {
                        inherited = Some((r.parent.clone(), r.parent_sub.clone()));
                    }
                }
                Some(Block::Gc(_)) => collected = true,
                None => return Err(Error::NotFound(right_origin)),
            }
        }

        if item.parent.is_none() {
            match inherited {
                Some((parent, parent_sub)) => {
                    item.parent = parent;
                    item.parent_sub = parent_sub;
                }
                None if collected => {}
                None => {
                    return Err(Error::MalformedUpdate(format!(
                        "item {} has neither a parent nor origins",
                        item.id
                    )))
                }
            }
        }

        let parent = match item.parent.clone() {
            Some(parent) if !collected && self.branch_alive(&parent) => parent,
            _ => {
                trace!(
                    id = %item.id,
                    len = item.len,
                    "integrating item of a collected subtree as gc"
                );
                return self.integrate_gc(item.id, item.len);
            }
        };
        let (branch_start, key_last) = {
            let branch = self.state.branch_or_insert(&parent);
            let key_last = item
                .parent_sub
                .as_ref()
                .and_then(|key| branch.map.get(key).copied());
            (branch.start, key_last)
        };

        let needs_scan = match (left, right) {
            (None, None) => true,
            (None, Some(r)) => self.state.item(&r)?.left.is_some(),
            (Some(l), _) => self.state.item(&l)?.right != right,
        };
        if needs_scan {
            let mut cursor = match left {
                Some(l) => self.state.item(&l)?.right,
                None if item.parent_sub.is_some() => self.chain_start(key_last)?,
                None => branch_start,
            };
            let mut conflicting: HashSet<Id> = HashSet::new();
            let mut before_origin: HashSet<Id> = HashSet::new();
            while let Some(current) = cursor {
                if Some(current) == right {
                    break;
                }
                let other = self.state.item(&current)?;
                let (other_id, other_last) = (other.id, other.last_id());
                let (other_origin, other_right_origin) = (other.origin, other.right_origin);
                cursor = other.right;

                before_origin.insert(other_id);
                conflicting.insert(other_id);
                if other_origin == item.origin {
                    if other_id.replica < item.id.replica {
                        left = Some(other_last);
                        conflicting.clear();
                    } else if other_right_origin == item.right_origin {
                        break;
                    }
                    continue;
                }
                let anchor = other_origin
                    .and_then(|id| self.state.store.get(&id).ok())
                    .map(Block::id)
                    .filter(|anchor| before_origin.contains(anchor));
                match anchor {
                    Some(anchor) => {
                        if !conflicting.contains(&anchor) {
                            left = Some(other_last);
                            conflicting.clear();
                        }
                    }
                    None => break,
                }
            }
        }

        item.left = left;
        item.right = match left {
            Some(l) => {
                let left_item = self.state.item_mut(&l)?;
                let next = left_item.right;
                left_item.right = Some(item.id);
                next
            }
            None if item.parent_sub.is_some() => self.chain_start(key_last)?,
            None => self.state.set_branch_start(&parent, item.id)?,
        };

        let mut superseded = None;
        match (item.right, &item.parent_sub) {
            (Some(r), _) => {
                self.state.item_mut(&r)?.left = Some(item.last_id());
            }
            (None, Some(key)) => {
                self.state.set_map_entry(&parent, key, item.last_id());
                superseded = left;
            }
            (None, None) => {}
        }

        match item.content {
            Content::Branch => self.state.register_branch(item.id),
            Content::Deleted(_) => item.deleted = true,
            _ => {}
        }
        let parent_deleted = match &parent {
            BranchRef::Nested(pid) => self.state.item(pid)?.deleted,
            BranchRef::Root(_) => false,
        };
        let stale_value = item.parent_sub.is_some() && item.right.is_some();
        let (id, len, deleted) = (item.id, item.len, item.deleted);

        self.state.store.add_block(Block::Item(item))?;
        if deleted {
            self.delete_set.insert(id, len);
        }
        if let Some(previous) = superseded {
            self.delete_item(&previous)?;
        }
        if parent_deleted || stale_value {
            self.delete_item(&id)?;
        }
        Ok(())
    }

    /// A nested branch accepts new items while its carrier still holds branch content
    /// and the registry still knows it.
    fn branch_alive(&self, parent: &BranchRef) -> bool {
        match parent {
            BranchRef::Root(_) => true,
            BranchRef::Nested(id) => {
                self.state.branches.contains_key(parent)
                    && matches!(
                        self.state.store.get(id),
                        Ok(Block::Item(Item {
                            content: Content::Branch,
                            ..
                        }))
                    )
            }
        }
    }

    /// First item of the value chain ending at `last`.
    fn chain_start(&self, last: Option<Id>) -> Result<Option<Id>> {
        let Some(last) = last else {
            return Ok(None);
        };
        let mut item = self.state.item(&last)?;
        while let Some(left) = item.left {
            item = self.state.item(&left)?;
        }
        Ok(Some(item.id))
    }

    /// Mark the whole block containing `id` deleted. Branch content takes its children
    /// with it. Returns false when there was nothing left to delete.
    pub(crate) fn delete_item(&mut self, id: &Id) -> Result<bool> {
        let (start, len, is_branch) = match self.state.store.get(id)? {
            Block::Item(item) if !item.deleted => {
                (item.id, item.len, matches!(item.content, Content::Branch))
            }
            _ => return Ok(false),
        };
        self.state.item_mut(&start)?.deleted = true;
        self.delete_set.insert(start, len);
        if is_branch {
            let children = self
                .state
                .branches
                .get(&BranchRef::Nested(start))
                .map(|b| branch::children(&self.state.store, b))
                .unwrap_or_default();
            for child in children {
                self.delete_item(&child)?;
            }
        }
        Ok(true)
    }
}
