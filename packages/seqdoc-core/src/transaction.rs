use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::block::{Block, BranchRef, Content, Item, Value};
use crate::branch::{self, Branch};
use crate::doc::{DocState, Pending};
use crate::error::{Error, Result};
use crate::events::{Observers, TransactionEvent, UpdateEvent};
use crate::gc;
use crate::id_set::{DeleteSet, IdSet};
use crate::ids::{Id, ReplicaId};
use crate::options::DocOptions;
use crate::state_vector::StateVector;
use crate::update::Update;

/// A unit of work against a [`crate::Document`].
///
/// All mutations go through a transaction. `commit` runs GC, merges blocks, folds the
/// working delete set into the document and notifies listeners. Dropping a transaction
/// without committing puts the document back exactly as it was when the transaction
/// started.
pub struct Transaction<'doc> {
    pub(crate) state: &'doc mut DocState,
    pub(crate) options: &'doc DocOptions,
    observers: &'doc mut Observers,
    origin: Option<Arc<str>>,
    before_state: StateVector,
    /// Ids deleted by this transaction.
    pub(crate) delete_set: DeleteSet,
    /// Ids where a block may have been split; retried for merging on commit.
    pub(crate) merge_points: Vec<Id>,
    committed: bool,
}

impl<'doc> Transaction<'doc> {
    pub(crate) fn new(
        state: &'doc mut DocState,
        options: &'doc DocOptions,
        observers: &'doc mut Observers,
        origin: Option<Arc<str>>,
    ) -> Self {
        let before_state = state.store.state_vector();
        state.begin();
        Self {
            state,
            options,
            observers,
            origin,
            before_state,
            delete_set: DeleteSet::new(),
            merge_points: Vec::new(),
            committed: false,
        }
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn replica(&self) -> ReplicaId {
        self.options.replica
    }

    /// State vector of the document when the transaction began.
    pub fn before_state(&self) -> &StateVector {
        &self.before_state
    }

    fn next_id(&self) -> Id {
        let replica = self.options.replica;
        Id::new(replica, self.state.store.get_state(replica))
    }

    /// Branch a local mutation targets. Roots are created on first use.
    fn writable_branch(&mut self, parent: &BranchRef) -> Result<&Branch> {
        match parent {
            BranchRef::Root(_) => Ok(self.state.branch_or_insert(parent)),
            BranchRef::Nested(_) => self
                .state
                .branches
                .get(parent)
                .ok_or_else(|| Error::UnknownBranch(parent.to_string())),
        }
    }

    /// Resolve a visible index to `(origin, right_origin)`, splitting the item the index
    /// falls into.
    fn find_position(
        &mut self,
        parent: &BranchRef,
        index: u32,
    ) -> Result<(Option<Id>, Option<Id>)> {
        let start = self.writable_branch(parent)?.start;
        if index == 0 {
            return Ok((None, start));
        }
        let mut remaining = index;
        let mut cursor = start;
        while let Some(id) = cursor {
            let item = self.state.item(&id)?;
            let (visible, right) = (item.visible_len(), item.right);
            if visible > 0 {
                if remaining < visible {
                    let last = id.advance(remaining - 1);
                    self.state.store.split_clean_end(&last)?;
                    self.merge_points.push(last.advance(1));
                    return Ok((Some(last), Some(last.advance(1))));
                }
                if remaining == visible {
                    return Ok((Some(id.advance(visible - 1)), right));
                }
                remaining -= visible;
            }
            cursor = right;
        }
        Err(Error::InvalidOperation(format!(
            "index {index} out of bounds for {parent}"
        )))
    }

    /// Insert `content` at visible position `index` of `parent`.
    pub fn insert(&mut self, parent: &BranchRef, index: u32, content: Content) -> Result<Id> {
        if content.is_empty() {
            return Err(Error::InvalidOperation("cannot insert empty content".into()));
        }
        if !content.is_countable() {
            return Err(Error::InvalidOperation(
                "collapsed content cannot be inserted".into(),
            ));
        }
        let (origin, right_origin) = self.find_position(parent, index)?;
        let id = self.next_id();
        let item = Item::new(id, origin, right_origin, Some(parent.clone()), None, content);
        self.integrate_block(Block::Item(item), 0)?;
        Ok(id)
    }

    pub fn insert_text(&mut self, parent: &BranchRef, index: u32, text: &str) -> Result<Id> {
        self.insert(parent, index, Content::String(text.to_owned()))
    }

    pub fn insert_values(
        &mut self,
        parent: &BranchRef,
        index: u32,
        values: Vec<Value>,
    ) -> Result<Id> {
        self.insert(parent, index, Content::Values(values))
    }

    /// Insert a nested container and return a reference to it.
    pub fn insert_branch(&mut self, parent: &BranchRef, index: u32) -> Result<BranchRef> {
        let id = self.insert(parent, index, Content::Branch)?;
        Ok(BranchRef::Nested(id))
    }

    /// Delete `len` visible elements of `parent` starting at `index`.
    pub fn remove_range(&mut self, parent: &BranchRef, index: u32, len: u32) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let start = self.writable_branch(parent)?.start;
        let mut skip = index;
        let mut remaining = len;
        let mut cursor = start;
        while remaining > 0 {
            let Some(id) = cursor else {
                return Err(Error::InvalidOperation(format!(
                    "range {index}..{} out of bounds for {parent}",
                    index + len
                )));
            };
            let item = self.state.item(&id)?;
            let (visible, right) = (item.visible_len(), item.right);
            if visible == 0 || skip >= visible {
                skip -= skip.min(visible);
                cursor = right;
                continue;
            }
            let from = id.advance(skip);
            let count = (visible - skip).min(remaining);
            self.delete_range(from, count)?;
            remaining -= count;
            skip = 0;
            cursor = self.state.item(&from.advance(count - 1))?.right;
        }
        Ok(())
    }

    /// Delete every element in `[start, start + len)` by id.
    ///
    /// Elements already deleted are skipped. Deleting a branch item deletes its content
    /// recursively.
    pub fn delete_range(&mut self, start: Id, len: u32) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = start.clock + len;
        if end > self.state.store.get_state(start.replica) {
            return Err(Error::NotFound(Id::new(start.replica, end - 1)));
        }
        let targets: Vec<Id> = self
            .state
            .store
            .get_struct_range(start.replica, start.clock, len)?
            .iter()
            .filter(|block| !block.is_deleted())
            .map(Block::id)
            .collect();
        self.merge_points.push(start);
        self.merge_points.push(start.advance(len));
        for id in targets {
            self.delete_item(&id)?;
        }
        Ok(())
    }

    /// Set `key` of `parent` to `value`. The newest value in integration order wins.
    pub fn map_set(
        &mut self,
        parent: &BranchRef,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<Id> {
        let origin = self.writable_branch(parent)?.map.get(key).copied();
        let id = self.next_id();
        let item = Item::new(
            id,
            origin,
            None,
            Some(parent.clone()),
            Some(Arc::from(key)),
            Content::Values(vec![value.into()]),
        );
        self.integrate_block(Block::Item(item), 0)?;
        Ok(id)
    }

    /// Remove `key` from `parent`. Returns whether a live value was removed.
    pub fn map_remove(&mut self, parent: &BranchRef, key: &str) -> Result<bool> {
        let Some(last) = self
            .state
            .branches
            .get(parent)
            .and_then(|b| b.map.get(key))
            .copied()
        else {
            return Ok(false);
        };
        self.delete_item(&last)
    }

    pub fn len(&self, parent: &BranchRef) -> u32 {
        self.state
            .branches
            .get(parent)
            .map(|b| branch::visible_len(&self.state.store, b))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, parent: &BranchRef) -> bool {
        self.len(parent) == 0
    }

    pub fn text(&self, parent: &BranchRef) -> String {
        self.state
            .branches
            .get(parent)
            .map(|b| branch::text(&self.state.store, b))
            .unwrap_or_default()
    }

    pub fn values(&self, parent: &BranchRef) -> Vec<Value> {
        self.state
            .branches
            .get(parent)
            .map(|b| branch::values(&self.state.store, b))
            .unwrap_or_default()
    }

    pub fn map_get(&self, parent: &BranchRef, key: &str) -> Option<Value> {
        let b = self.state.branches.get(parent)?;
        branch::map_get(&self.state.store, b, key)
    }

    /// Integrate a decoded update.
    ///
    /// Blocks whose causal dependencies are missing are kept in the document's pending
    /// buffer together with delete ranges beyond the local state, and retried on the next
    /// call. Returns `UnresolvedDependency` when buffered blocks and delete ranges together
    /// would exceed `max_pending_blocks`; the caller's transaction must then be dropped.
    pub fn apply_update(&mut self, mut update: Update) -> Result<()> {
        if let Some(pending) = self.state.replace_pending(None) {
            update.merge(pending.update);
        }
        let (blocks, delete_set) = update.into_parts();
        let mut queues: BTreeMap<ReplicaId, VecDeque<Block>> = blocks
            .into_iter()
            .map(|(replica, blocks)| (replica, VecDeque::from(blocks)))
            .collect();

        loop {
            let mut progressed = false;
            for (&replica, queue) in queues.iter_mut() {
                while let Some(block) = queue.front() {
                    let state = self.state.store.get_state(replica);
                    if block.end() <= state {
                        queue.pop_front();
                        continue;
                    }
                    if block.id().clock > state {
                        break;
                    }
                    let offset = state - block.id().clock;
                    if self.missing_dependency(block, offset).is_some() {
                        break;
                    }
                    if let Some(block) = queue.pop_front() {
                        self.integrate_block(block, offset)?;
                        progressed = true;
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        let mut missing = StateVector::new();
        let mut leftover: BTreeMap<ReplicaId, Vec<Block>> = BTreeMap::new();
        for (replica, queue) in queues {
            let Some(first) = queue.front() else {
                continue;
            };
            let state = self.state.store.get_state(replica);
            if first.id().clock > state {
                missing.set_max(replica, first.id().clock);
            } else if let Some((dep, clock)) =
                self.missing_dependency(first, state - first.id().clock)
            {
                missing.set_max(dep, clock);
            }
            leftover.insert(replica, queue.into());
        }

        let (known, beyond) = delete_set.split_at_state(&self.state.store.state_vector());
        for (replica, range) in known.iter() {
            self.delete_range(Id::new(replica, range.start), range.len)?;
        }
        for (replica, range) in beyond.iter() {
            missing.set_max(replica, range.end());
        }

        if leftover.is_empty() && beyond.is_empty() {
            return Ok(());
        }
        let pending = Update::from_parts(leftover, beyond);
        let blocks = pending.block_count();
        let ranges = pending.delete_set().iter().count();
        if blocks + ranges > self.options.max_pending_blocks {
            return Err(Error::UnresolvedDependency { missing });
        }
        debug!(
            pending_blocks = blocks,
            pending_ranges = ranges,
            missing = ?missing,
            "deferring update with unmet dependencies"
        );
        self.state.replace_pending(Some(Pending {
            update: pending,
            missing,
        }));
        Ok(())
    }

    /// Finish the transaction: collect garbage, merge blocks, record deletions and
    /// notify listeners.
    pub fn commit(mut self) -> Result<TransactionEvent> {
        let after_state = self.state.store.state_vector();
        let added = IdSet::difference(&self.before_state, &after_state);

        if self.options.gc {
            gc::collect(self.state, &self.delete_set)?;
        }
        for (replica, range) in self.delete_set.iter().chain(added.iter()) {
            self.state.store.merge_range(replica, range.start, range.len);
        }
        for id in std::mem::take(&mut self.merge_points) {
            self.state.store.merge_range(id.replica, id.clock, 1);
        }
        self.state.delete_set.merge(&self.delete_set);

        let event = TransactionEvent {
            origin: self.origin.clone(),
            before_state: self.before_state.clone(),
            after_state,
            added,
            deleted: std::mem::take(&mut self.delete_set),
        };
        let changed = !event.added.is_empty() || !event.deleted.is_empty();
        let wants_update = self.observers.wants_v1() || self.observers.wants_v2();
        let (update_v1, update_v2) = if changed && wants_update {
            let diff = Update::from_store(
                &self.state.store,
                &event.before_state,
                event.deleted.clone(),
            );
            let v1 = self.observers.wants_v1().then(|| UpdateEvent {
                origin: self.origin.clone(),
                update: diff.encode_v1(),
            });
            let v2 = self.observers.wants_v2().then(|| UpdateEvent {
                origin: self.origin.clone(),
                update: diff.encode_v2(),
            });
            (v1, v2)
        } else {
            (None, None)
        };

        self.state.finish();
        self.committed = true;
        debug!(
            origin = ?event.origin,
            added = event.added.len(),
            deleted = event.deleted.len(),
            blocks = self.state.store.block_count(),
            "transaction committed"
        );
        self.observers.notify(&event, update_v1, update_v2);
        Ok(event)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            trace!(origin = ?self.origin, "transaction rolled back");
            self.state.rollback();
        }
    }
}
