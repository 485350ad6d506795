use std::collections::HashMap;

use crate::block::{Block, Content, Gc, Item};
use crate::error::{Error, Result};
use crate::id_set::IdSet;
use crate::ids::{Clock, Id, ReplicaId};
use crate::state_vector::StateVector;

/// Inverse of one store mutation. Replayed newest first, each entry finds the log exactly
/// as the mutation left it.
#[derive(Clone, Debug)]
enum Undo {
    Push(ReplicaId),
    /// The block at `idx` was split in two.
    Split { replica: ReplicaId, idx: usize },
    /// The block at `idx + 1` was folded into the block at `idx`, which was `offset` long.
    Merge { replica: ReplicaId, idx: usize, offset: u32 },
    Links {
        replica: ReplicaId,
        idx: usize,
        left: Option<Id>,
        right: Option<Id>,
        deleted: bool,
    },
    Content { replica: ReplicaId, idx: usize, content: Content },
    Block { replica: ReplicaId, idx: usize, block: Block },
}

/// Per-replica append-only logs of blocks.
///
/// Invariant: each replica's vector covers `0..state` without gaps or overlaps and is
/// sorted by clock, so any id can be found by binary search.
///
/// While a journal is open every mutation records its inverse, so a failed transaction
/// undoes exactly what it changed.
#[derive(Clone, Debug, Default)]
pub struct BlockStore {
    logs: HashMap<ReplicaId, Vec<Block>>,
    journal: Option<Vec<Undo>>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin_journal(&mut self) {
        self.journal = Some(Vec::new());
    }

    pub(crate) fn commit_journal(&mut self) {
        self.journal = None;
    }

    /// Undo every mutation since `begin_journal` and close the journal.
    pub(crate) fn rollback_journal(&mut self) {
        let Some(journal) = self.journal.take() else {
            return;
        };
        for undo in journal.into_iter().rev() {
            self.undo(undo);
        }
        self.logs.retain(|_, log| !log.is_empty());
    }

    fn record(&mut self, undo: Undo) {
        if let Some(journal) = &mut self.journal {
            journal.push(undo);
        }
    }

    fn undo(&mut self, undo: Undo) {
        let replica = match &undo {
            Undo::Push(replica)
            | Undo::Split { replica, .. }
            | Undo::Merge { replica, .. }
            | Undo::Links { replica, .. }
            | Undo::Content { replica, .. }
            | Undo::Block { replica, .. } => *replica,
        };
        let Some(log) = self.logs.get_mut(&replica) else {
            return;
        };
        match undo {
            Undo::Push(_) => {
                log.pop();
            }
            Undo::Split { idx, .. } => {
                if idx + 1 < log.len() {
                    let right = log.remove(idx + 1);
                    log[idx].unsplit(right);
                }
            }
            Undo::Merge { idx, offset, .. } => {
                if let Some(block) = log.get_mut(idx) {
                    let right = block.split(offset);
                    log.insert(idx + 1, right);
                }
            }
            Undo::Links {
                idx,
                left,
                right,
                deleted,
                ..
            } => {
                if let Some(item) = log.get_mut(idx).and_then(Block::as_item_mut) {
                    item.left = left;
                    item.right = right;
                    item.deleted = deleted;
                }
            }
            Undo::Content { idx, content, .. } => {
                if let Some(item) = log.get_mut(idx).and_then(Block::as_item_mut) {
                    item.content = content;
                }
            }
            Undo::Block { idx, block, .. } => {
                if let Some(slot) = log.get_mut(idx) {
                    *slot = block;
                }
            }
        }
    }

    /// Next expected clock for `replica`.
    pub fn get_state(&self, replica: ReplicaId) -> Clock {
        self.logs
            .get(&replica)
            .and_then(|log| log.last())
            .map(Block::end)
            .unwrap_or(0)
    }

    pub fn state_vector(&self) -> StateVector {
        self.logs
            .keys()
            .map(|&replica| (replica, self.get_state(replica)))
            .collect()
    }

    pub fn replicas(&self) -> Vec<ReplicaId> {
        let mut replicas: Vec<ReplicaId> = self.logs.keys().copied().collect();
        replicas.sort_unstable();
        replicas
    }

    pub fn blocks(&self, replica: ReplicaId) -> &[Block] {
        self.logs.get(&replica).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Index of the block covering `(replica, clock)`.
    pub fn find_index(&self, replica: ReplicaId, clock: Clock) -> Result<usize> {
        let log = self
            .logs
            .get(&replica)
            .ok_or(Error::NotFound(Id::new(replica, clock)))?;
        let idx = log.partition_point(|b| b.end() <= clock);
        match log.get(idx) {
            Some(block) if block.id().clock <= clock => Ok(idx),
            _ => Err(Error::NotFound(Id::new(replica, clock))),
        }
    }

    pub fn get(&self, id: &Id) -> Result<&Block> {
        let idx = self.find_index(id.replica, id.clock)?;
        Ok(&self.logs[&id.replica][idx])
    }

    /// The item containing `id`, for relinking or marking it deleted. Nothing else may be
    /// changed through the returned reference.
    pub(crate) fn item_links_mut(&mut self, id: &Id) -> Result<&mut Item> {
        let idx = self.find_index(id.replica, id.clock)?;
        let (left, right, deleted) = match &self.logs[&id.replica][idx] {
            Block::Item(item) => (item.left, item.right, item.deleted),
            Block::Gc(_) => return Err(Error::NotFound(*id)),
        };
        self.record(Undo::Links {
            replica: id.replica,
            idx,
            left,
            right,
            deleted,
        });
        self.logs
            .get_mut(&id.replica)
            .and_then(|log| log.get_mut(idx))
            .and_then(Block::as_item_mut)
            .ok_or(Error::NotFound(*id))
    }

    /// Drop the content of the item starting at `id`, keeping its length.
    pub(crate) fn collapse_content(&mut self, id: &Id) -> Result<()> {
        let idx = self.find_index(id.replica, id.clock)?;
        let item = self
            .logs
            .get_mut(&id.replica)
            .and_then(|log| log.get_mut(idx))
            .and_then(Block::as_item_mut)
            .ok_or(Error::NotFound(*id))?;
        let content = std::mem::replace(&mut item.content, Content::Deleted(item.len));
        self.record(Undo::Content {
            replica: id.replica,
            idx,
            content,
        });
        Ok(())
    }

    /// Append a block at the end of its replica's log.
    pub fn add_block(&mut self, block: Block) -> Result<()> {
        let id = block.id();
        let expected = self.get_state(id.replica);
        if id.clock != expected {
            return Err(Error::OutOfOrder {
                expected,
                found: id.clock,
            });
        }
        self.logs.entry(id.replica).or_default().push(block);
        self.record(Undo::Push(id.replica));
        Ok(())
    }

    /// Make `id` the first element of its block, splitting if needed.
    ///
    /// Returns the index of the block that now starts at `id`.
    pub fn split_clean_start(&mut self, id: &Id) -> Result<usize> {
        let idx = self.find_index(id.replica, id.clock)?;
        let log = self
            .logs
            .get_mut(&id.replica)
            .ok_or(Error::NotFound(*id))?;
        let offset = id.clock - log[idx].id().clock;
        if offset == 0 {
            return Ok(idx);
        }
        let right = log[idx].split(offset);
        log.insert(idx + 1, right);
        self.record(Undo::Split {
            replica: id.replica,
            idx,
        });
        Ok(idx + 1)
    }

    /// Make `id` the last element of its block, splitting if needed.
    ///
    /// Returns the index of the block that now ends at `id`.
    pub fn split_clean_end(&mut self, id: &Id) -> Result<usize> {
        let idx = self.find_index(id.replica, id.clock)?;
        let log = self
            .logs
            .get_mut(&id.replica)
            .ok_or(Error::NotFound(*id))?;
        let offset = id.clock - log[idx].id().clock + 1;
        if offset < log[idx].len() {
            let right = log[idx].split(offset);
            log.insert(idx + 1, right);
            self.record(Undo::Split {
                replica: id.replica,
                idx,
            });
        }
        Ok(idx)
    }

    /// Blocks covering exactly `[clock, clock + len)`, splitting the boundary blocks.
    pub fn get_struct_range(
        &mut self,
        replica: ReplicaId,
        clock: Clock,
        len: u32,
    ) -> Result<&[Block]> {
        if len == 0 {
            return Ok(&[]);
        }
        let start = self.split_clean_start(&Id::new(replica, clock))?;
        let end = self.split_clean_end(&Id::new(replica, clock + len - 1))?;
        Ok(&self.blocks(replica)[start..=end])
    }

    /// Swap the block starting at `id` for a tombstone of the same range.
    pub fn replace_with_gc(&mut self, id: &Id) -> Result<()> {
        let idx = self.find_index(id.replica, id.clock)?;
        let slot = self
            .logs
            .get_mut(&id.replica)
            .and_then(|log| log.get_mut(idx))
            .ok_or(Error::NotFound(*id))?;
        debug_assert_eq!(slot.id(), *id);
        let tombstone = Block::Gc(Gc {
            id: slot.id(),
            len: slot.len(),
        });
        let block = std::mem::replace(slot, tombstone);
        self.record(Undo::Block {
            replica: id.replica,
            idx,
            block,
        });
        Ok(())
    }

    /// Try to fold the block at `idx` into the one before it.
    pub fn try_merge_with_left(&mut self, replica: ReplicaId, idx: usize) -> bool {
        let Some(log) = self.logs.get_mut(&replica) else {
            return false;
        };
        if idx == 0 || idx >= log.len() {
            return false;
        }
        let offset = log[idx - 1].len();
        let (head, tail) = log.split_at_mut(idx);
        if !head[idx - 1].try_merge(&tail[0]) {
            return false;
        }
        log.remove(idx);
        self.record(Undo::Merge {
            replica,
            idx: idx - 1,
            offset,
        });
        true
    }

    /// Merge every mergeable neighbour pair touching `[clock, clock + len]` on `replica`.
    pub fn merge_range(&mut self, replica: ReplicaId, clock: Clock, len: u32) {
        let Some(log) = self.logs.get(&replica) else {
            return;
        };
        if log.is_empty() {
            return;
        }
        let first = log.partition_point(|b| b.end() <= clock).max(1);
        let last_clock = clock.saturating_add(len);
        let mut idx = log
            .partition_point(|b| b.id().clock <= last_clock)
            .min(log.len() - 1);
        while idx >= first {
            self.try_merge_with_left(replica, idx);
            idx -= 1;
        }
    }

    /// Ids of every deleted element, as ranges.
    pub fn deleted_ranges(&self) -> IdSet {
        let mut set = IdSet::new();
        for log in self.logs.values() {
            for block in log.iter().filter(|b| b.is_deleted()) {
                set.insert(block.id(), block.len());
            }
        }
        set
    }

    /// Blocks not covered by `known`, with the first block of each replica trimmed so it
    /// starts exactly at the known frontier.
    pub fn blocks_since(&self, known: &StateVector) -> Vec<(ReplicaId, Vec<Block>)> {
        let mut out = Vec::new();
        for replica in self.replicas() {
            let from = known.get(replica);
            if self.get_state(replica) <= from {
                continue;
            }
            let log = &self.logs[&replica];
            let start = log.partition_point(|b| b.end() <= from);
            let mut blocks = Vec::with_capacity(log.len() - start);
            for block in &log[start..] {
                let offset = from.saturating_sub(block.id().clock);
                blocks.push(block.tail(offset));
            }
            out.push((replica, blocks));
        }
        out
    }

    pub fn block_count(&self) -> usize {
        self.logs.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BranchRef, Content, Item};

    const R: ReplicaId = ReplicaId(1);

    fn text(clock: Clock, s: &str) -> Block {
        Block::Item(Item::new(
            Id::new(R, clock),
            None,
            None,
            Some(BranchRef::root("t")),
            None,
            Content::String(s.into()),
        ))
    }

    #[test]
    fn add_block_rejects_gaps() {
        let mut store = BlockStore::new();
        store.add_block(text(0, "abc")).unwrap();
        assert_eq!(store.get_state(R), 3);
        let err = store.add_block(text(5, "x")).unwrap_err();
        assert_eq!(
            err,
            Error::OutOfOrder {
                expected: 3,
                found: 5
            }
        );
    }

    #[test]
    fn get_reports_not_found_outside_recorded_range() {
        let mut store = BlockStore::new();
        store.add_block(text(0, "ab")).unwrap();
        assert!(store.get(&Id::new(R, 1)).is_ok());
        assert_eq!(
            store.get(&Id::new(R, 2)).unwrap_err(),
            Error::NotFound(Id::new(R, 2))
        );
        assert!(matches!(
            store.get(&Id::new(ReplicaId(9), 0)),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn struct_range_splits_boundaries() {
        let mut store = BlockStore::new();
        store.add_block(text(0, "abcdef")).unwrap();
        let range = store.get_struct_range(R, 2, 3).unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range[0].id(), Id::new(R, 2));
        assert_eq!(range[0].len(), 3);
        assert_eq!(store.blocks(R).len(), 3);
        assert_eq!(store.get_state(R), 6);
    }

    #[test]
    fn merge_range_undoes_splits() {
        let mut store = BlockStore::new();
        store.add_block(text(0, "abcdef")).unwrap();
        store.get_struct_range(R, 1, 2).unwrap();
        assert_eq!(store.blocks(R).len(), 3);
        store.merge_range(R, 0, 6);
        assert_eq!(store.blocks(R), &[text(0, "abcdef")]);
    }

    #[test]
    fn rollback_journal_restores_every_mutation() {
        let mut store = BlockStore::new();
        store.add_block(text(0, "abcdef")).unwrap();
        let before = store.blocks(R).to_vec();

        store.begin_journal();
        store.split_clean_start(&Id::new(R, 2)).unwrap();
        store.split_clean_end(&Id::new(R, 3)).unwrap();
        store.item_links_mut(&Id::new(R, 2)).unwrap().deleted = true;
        store.collapse_content(&Id::new(R, 2)).unwrap();
        store.replace_with_gc(&Id::new(R, 4)).unwrap();
        store.add_block(text(6, "g")).unwrap();
        store.add_block(Block::Gc(Gc {
            id: Id::new(ReplicaId(2), 0),
            len: 3,
        }))
        .unwrap();
        store.merge_range(R, 0, 7);
        assert_ne!(store.blocks(R), before.as_slice());

        store.rollback_journal();
        assert_eq!(store.blocks(R), before.as_slice());
        assert_eq!(store.replicas(), vec![R]);
    }

    #[test]
    fn rollback_journal_splits_merged_blocks_again() {
        let mut store = BlockStore::new();
        store.add_block(text(0, "abcdef")).unwrap();
        store.split_clean_start(&Id::new(R, 2)).unwrap();
        let before = store.blocks(R).to_vec();

        store.begin_journal();
        store.merge_range(R, 0, 6);
        assert_eq!(store.blocks(R), &[text(0, "abcdef")]);
        store.rollback_journal();
        assert_eq!(store.blocks(R), before.as_slice());
    }

    #[test]
    fn committed_journal_keeps_changes() {
        let mut store = BlockStore::new();
        store.begin_journal();
        store.add_block(text(0, "ab")).unwrap();
        store.commit_journal();
        store.rollback_journal();
        assert_eq!(store.get_state(R), 2);
    }

    #[test]
    fn blocks_since_trims_the_first_block() {
        let mut store = BlockStore::new();
        store.add_block(text(0, "abcd")).unwrap();
        let known: StateVector = [(R, 1)].into_iter().collect();
        let diff = store.blocks_since(&known);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].1[0].id(), Id::new(R, 1));
        assert_eq!(diff[0].1[0].len(), 3);
        assert!(store.blocks_since(&store.state_vector()).is_empty());
    }
}
