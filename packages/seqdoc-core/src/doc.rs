use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::block::{Block, BranchRef, Item, Value};
use crate::branch::{self, Branch, DocSnapshot};
use crate::error::{Error, Result};
use crate::events::{Observers, Subscription, TransactionEvent, UpdateEvent};
use crate::gc;
use crate::id_set::DeleteSet;
use crate::ids::{Id, ReplicaId};
use crate::options::DocOptions;
use crate::state_vector::StateVector;
use crate::store::BlockStore;
use crate::transaction::Transaction;
use crate::update::{self, Update};

/// Decoded blocks and delete ranges waiting for causal dependencies.
#[derive(Clone, Debug)]
pub(crate) struct Pending {
    pub(crate) update: Update,
    /// Clocks the local state must reach before the update can make progress.
    pub(crate) missing: StateVector,
}

/// Inverse of one change to the branch registry or the pending buffer.
#[derive(Clone, Debug)]
enum Undo {
    Branch {
        key: BranchRef,
        previous: Option<Branch>,
    },
    Start {
        key: BranchRef,
        previous: Option<Id>,
    },
    MapEntry {
        key: BranchRef,
        sub: Arc<str>,
        previous: Option<Id>,
    },
    Pending(Option<Pending>),
}

/// Everything a transaction may change.
///
/// Between `begin` and `finish` every change is journaled, store included, so `rollback`
/// restores the state a transaction started from at a cost proportional to what the
/// transaction touched.
#[derive(Clone, Debug, Default)]
pub(crate) struct DocState {
    pub(crate) store: BlockStore,
    pub(crate) branches: HashMap<BranchRef, Branch>,
    /// Always equal to the deleted ranges of `store`.
    pub(crate) delete_set: DeleteSet,
    pub(crate) pending: Option<Pending>,
    journal: Option<Vec<Undo>>,
}

impl DocState {
    pub(crate) fn begin(&mut self) {
        self.store.begin_journal();
        self.journal = Some(Vec::new());
    }

    pub(crate) fn finish(&mut self) {
        self.store.commit_journal();
        self.journal = None;
    }

    pub(crate) fn rollback(&mut self) {
        self.store.rollback_journal();
        let Some(journal) = self.journal.take() else {
            return;
        };
        for undo in journal.into_iter().rev() {
            match undo {
                Undo::Branch { key, previous } => match previous {
                    Some(branch) => {
                        self.branches.insert(key, branch);
                    }
                    None => {
                        self.branches.remove(&key);
                    }
                },
                Undo::Start { key, previous } => {
                    if let Some(branch) = self.branches.get_mut(&key) {
                        branch.start = previous;
                    }
                }
                Undo::MapEntry { key, sub, previous } => {
                    if let Some(branch) = self.branches.get_mut(&key) {
                        match previous {
                            Some(last) => branch.map.insert(sub, last),
                            None => branch.map.remove(&sub),
                        };
                    }
                }
                Undo::Pending(previous) => self.pending = previous,
            }
        }
    }

    fn record(&mut self, undo: Undo) {
        if let Some(journal) = &mut self.journal {
            journal.push(undo);
        }
    }

    /// Item containing `id`. Tombstones have no item and report `NotFound`.
    pub(crate) fn item(&self, id: &Id) -> Result<&Item> {
        self.store
            .get(id)?
            .as_item()
            .ok_or(Error::NotFound(*id))
    }

    /// Item containing `id`, for relinking or marking it deleted.
    pub(crate) fn item_mut(&mut self, id: &Id) -> Result<&mut Item> {
        self.store.item_links_mut(id)
    }

    /// Branch registered under `key`, created empty when missing.
    pub(crate) fn branch_or_insert(&mut self, key: &BranchRef) -> &Branch {
        if !self.branches.contains_key(key) {
            self.record(Undo::Branch {
                key: key.clone(),
                previous: None,
            });
        }
        self.branches.entry(key.clone()).or_insert_with(Branch::root)
    }

    /// Register a nested branch carried by the item `id`.
    pub(crate) fn register_branch(&mut self, id: Id) {
        let key = BranchRef::Nested(id);
        let previous = self.branches.insert(key.clone(), Branch::nested(id));
        self.record(Undo::Branch { key, previous });
    }

    /// Drop a nested branch from the registry, returning every item that was linked into
    /// it.
    pub(crate) fn remove_branch(&mut self, key: &BranchRef) -> Option<Vec<Id>> {
        let removed = self.branches.remove(key)?;
        let children = branch::children(&self.store, &removed);
        self.record(Undo::Branch {
            key: key.clone(),
            previous: Some(removed),
        });
        Some(children)
    }

    /// Point the sequence of `key` at `start`, returning the previous first item.
    pub(crate) fn set_branch_start(&mut self, key: &BranchRef, start: Id) -> Result<Option<Id>> {
        let branch = self
            .branches
            .get_mut(key)
            .ok_or_else(|| Error::UnknownBranch(key.to_string()))?;
        let previous = branch.start.replace(start);
        self.record(Undo::Start {
            key: key.clone(),
            previous,
        });
        Ok(previous)
    }

    /// Make `last` the current value item of `sub` in `key`.
    pub(crate) fn set_map_entry(&mut self, key: &BranchRef, sub: &Arc<str>, last: Id) {
        let Some(branch) = self.branches.get_mut(key) else {
            return;
        };
        let previous = branch.map.insert(sub.clone(), last);
        self.record(Undo::MapEntry {
            key: key.clone(),
            sub: sub.clone(),
            previous,
        });
    }

    /// Swap the pending buffer, returning what was buffered before.
    pub(crate) fn replace_pending(&mut self, pending: Option<Pending>) -> Option<Pending> {
        let previous = std::mem::replace(&mut self.pending, pending);
        if self.journal.is_some() {
            self.record(Undo::Pending(previous.clone()));
        }
        previous
    }
}

/// A replicated document: named root branches holding text, values, maps and nested
/// branches.
///
/// Local edits go through [`Document::transact`]; remote edits arrive as encoded updates
/// through [`Document::apply_update`]. Two documents that have seen the same set of
/// updates, in any order, produce equal [`Document::snapshot`]s.
pub struct Document {
    options: DocOptions,
    state: DocState,
    observers: Observers,
}

impl Document {
    pub fn new(replica: ReplicaId) -> Self {
        Self::with_options(DocOptions::new(replica))
    }

    pub fn with_options(options: DocOptions) -> Self {
        Self {
            options,
            state: DocState::default(),
            observers: Observers::default(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.options.replica
    }

    pub fn options(&self) -> &DocOptions {
        &self.options
    }

    /// Open a transaction. It must be committed for its changes to stick.
    pub fn transaction(&mut self) -> Transaction<'_> {
        Transaction::new(&mut self.state, &self.options, &mut self.observers, None)
    }

    pub fn transaction_with_origin(&mut self, origin: &str) -> Transaction<'_> {
        Transaction::new(
            &mut self.state,
            &self.options,
            &mut self.observers,
            Some(Arc::from(origin)),
        )
    }

    /// Run `f` in a transaction, committing on `Ok` and rolling back on `Err`.
    pub fn transact<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut txn = self.transaction();
        let out = f(&mut txn)?;
        txn.commit()?;
        Ok(out)
    }

    pub fn transact_with_origin<T, F>(&mut self, origin: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut txn = self.transaction_with_origin(origin);
        let out = f(&mut txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Apply a V1-encoded update. The document is untouched when decoding fails or the
    /// pending buffer overflows.
    pub fn apply_update(&mut self, bytes: &[u8]) -> Result<()> {
        let update =
            Update::decode_v1(bytes).inspect_err(|e| warn!(error = %e, "rejected update"))?;
        self.apply_decoded(update, None)
    }

    pub fn apply_update_v2(&mut self, bytes: &[u8]) -> Result<()> {
        let update =
            Update::decode_v2(bytes).inspect_err(|e| warn!(error = %e, "rejected update"))?;
        self.apply_decoded(update, None)
    }

    pub fn apply_update_with_origin(&mut self, bytes: &[u8], origin: &str) -> Result<()> {
        let update =
            Update::decode_v1(bytes).inspect_err(|e| warn!(error = %e, "rejected update"))?;
        self.apply_decoded(update, Some(origin))
    }

    /// Apply an already decoded update.
    pub fn apply_decoded(&mut self, update: Update, origin: Option<&str>) -> Result<()> {
        let mut txn = match origin {
            Some(origin) => self.transaction_with_origin(origin),
            None => self.transaction(),
        };
        if let Err(err) = txn.apply_update(update) {
            warn!(error = %err, "rejected update");
            return Err(err);
        }
        txn.commit()?;
        Ok(())
    }

    /// Everything the holder of `known` has not seen, plus the whole delete set, as V1.
    pub fn encode_state_as_update(&self, known: Option<&StateVector>) -> Vec<u8> {
        self.diff(known).encode_v1()
    }

    pub fn encode_state_as_update_v2(&self, known: Option<&StateVector>) -> Vec<u8> {
        self.diff(known).encode_v2()
    }

    fn diff(&self, known: Option<&StateVector>) -> Update {
        let empty = StateVector::new();
        Update::from_store(
            &self.state.store,
            known.unwrap_or(&empty),
            self.state.delete_set.clone(),
        )
    }

    pub fn state_vector(&self) -> StateVector {
        self.state.store.state_vector()
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        update::encode_state_vector(&self.state_vector())
    }

    pub fn delete_set(&self) -> &DeleteSet {
        &self.state.delete_set
    }

    /// Clocks still needed to integrate buffered updates, if anything is buffered.
    pub fn pending_missing(&self) -> Option<&StateVector> {
        self.state.pending.as_ref().map(|p| &p.missing)
    }

    pub fn has_pending(&self) -> bool {
        self.state.pending.is_some()
    }

    /// Listen for V1-encoded diffs of every commit that changed something.
    pub fn on_update<F>(&mut self, f: F) -> Subscription
    where
        F: FnMut(&UpdateEvent) + Send + 'static,
    {
        self.observers.on_update_v1(Box::new(f))
    }

    pub fn on_update_v2<F>(&mut self, f: F) -> Subscription
    where
        F: FnMut(&UpdateEvent) + Send + 'static,
    {
        self.observers.on_update_v2(Box::new(f))
    }

    /// Listen for a summary of every commit.
    ///
    /// Listeners are `'static` and cannot hold on to the document, so they never run a
    /// transaction from inside a commit:
    ///
    /// ```compile_fail
    /// use seqdoc_core::{BranchRef, Document, ReplicaId};
    ///
    /// let mut doc = Document::new(ReplicaId::new(1));
    /// let inner = &mut doc;
    /// doc.observe(move |_| {
    ///     let text = BranchRef::root("t");
    ///     inner.transact(|txn| txn.insert_text(&text, 0, "x")).unwrap();
    /// });
    /// ```
    pub fn observe<F>(&mut self, f: F) -> Subscription
    where
        F: FnMut(&TransactionEvent) + Send + 'static,
    {
        self.observers.observe(Box::new(f))
    }

    pub fn unobserve(&mut self, subscription: Subscription) -> bool {
        self.observers.unobserve(subscription)
    }

    /// Collect every deleted block, regardless of `DocOptions::gc`.
    pub fn gc(&mut self) -> Result<()> {
        let deleted = self.state.delete_set.clone();
        self.state.begin();
        if let Err(err) = gc::collect(&mut self.state, &deleted) {
            self.state.rollback();
            return Err(err);
        }
        for (replica, range) in deleted.iter() {
            self.state.store.merge_range(replica, range.start, range.len);
        }
        self.state.finish();
        debug!(blocks = self.state.store.block_count(), "explicit gc pass");
        Ok(())
    }

    fn branch(&self, branch: &BranchRef) -> Option<&Branch> {
        self.state.branches.get(branch)
    }

    /// Text of a root branch.
    pub fn text(&self, root: &str) -> String {
        self.branch(&BranchRef::root(root))
            .map(|b| branch::text(&self.state.store, b))
            .unwrap_or_default()
    }

    pub fn values(&self, branch: &BranchRef) -> Vec<Value> {
        self.branch(branch)
            .map(|b| branch::values(&self.state.store, b))
            .unwrap_or_default()
    }

    pub fn len(&self, branch: &BranchRef) -> u32 {
        self.branch(branch)
            .map(|b| branch::visible_len(&self.state.store, b))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, branch: &BranchRef) -> bool {
        self.len(branch) == 0
    }

    pub fn map_get(&self, branch: &BranchRef, key: &str) -> Option<Value> {
        self.branch(branch)
            .and_then(|b| branch::map_get(&self.state.store, b, key))
    }

    /// Materialized view of every non-empty root.
    pub fn snapshot(&self) -> DocSnapshot {
        let mut roots = BTreeMap::new();
        for (key, b) in &self.state.branches {
            let BranchRef::Root(name) = key else {
                continue;
            };
            let snap = branch::snapshot(&self.state.store, &self.state.branches, b);
            if !snap.is_empty() {
                roots.insert(name.to_string(), snap);
            }
        }
        DocSnapshot { roots }
    }

    pub fn store(&self) -> &BlockStore {
        &self.state.store
    }

    /// The block containing `id`, if any.
    pub fn block(&self, id: &Id) -> Option<&Block> {
        self.state.store.get(id).ok()
    }

    pub fn block_count(&self) -> usize {
        self.state.store.block_count()
    }
}
