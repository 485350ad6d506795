use std::collections::BTreeMap;

use crate::block::Block;
use crate::codec::{self, Reader, Writer};
use crate::error::Result;
use crate::id_set::DeleteSet;
use crate::ids::{Clock, ReplicaId};
use crate::state_vector::StateVector;
use crate::store::BlockStore;

/// A decoded batch of blocks plus the ranges they delete.
///
/// Blocks are kept per replica, sorted by clock and without overlaps. Gaps are allowed:
/// an update may carry blocks whose predecessors the receiver has not seen yet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    blocks: BTreeMap<ReplicaId, Vec<Block>>,
    delete_set: DeleteSet,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(
        blocks: BTreeMap<ReplicaId, Vec<Block>>,
        delete_set: DeleteSet,
    ) -> Self {
        let mut update = Self { blocks, delete_set };
        update.normalize();
        update
    }

    pub(crate) fn into_parts(self) -> (BTreeMap<ReplicaId, Vec<Block>>, DeleteSet) {
        (self.blocks, self.delete_set)
    }

    /// Blocks of `store` not covered by `known`, in the form the wire carries them.
    pub(crate) fn from_store(
        store: &BlockStore,
        known: &StateVector,
        delete_set: DeleteSet,
    ) -> Self {
        let blocks = store
            .blocks_since(known)
            .into_iter()
            .map(|(replica, blocks)| (replica, blocks.into_iter().map(wire_form).collect()))
            .collect();
        Self { blocks, delete_set }
    }

    pub fn decode_v1(bytes: &[u8]) -> Result<Self> {
        codec::v1::decode(bytes)
    }

    pub fn decode_v2(bytes: &[u8]) -> Result<Self> {
        codec::v2::decode(bytes)
    }

    pub fn encode_v1(&self) -> Vec<u8> {
        codec::v1::encode(self)
    }

    pub fn encode_v2(&self) -> Vec<u8> {
        codec::v2::encode(self)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.delete_set.is_empty()
    }

    /// Every block, grouped by replica (ascending) and ordered by clock.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values().flatten()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.values().map(Vec::len).sum()
    }

    pub fn delete_set(&self) -> &DeleteSet {
        &self.delete_set
    }

    /// Highest clock each replica's blocks reach.
    pub fn state_vector(&self) -> StateVector {
        self.blocks
            .iter()
            .filter_map(|(&replica, blocks)| blocks.last().map(|b| (replica, b.end())))
            .collect()
    }

    /// Fold `other` into this update. Where both carry the same clocks, the block already
    /// present wins.
    pub fn merge(&mut self, other: Update) {
        for (replica, blocks) in other.blocks {
            self.blocks.entry(replica).or_default().extend(blocks);
        }
        self.delete_set.merge(&other.delete_set);
        self.normalize();
    }

    /// Maximal clock-contiguous runs of blocks, per replica.
    pub(crate) fn runs(&self) -> Vec<&[Block]> {
        let mut runs = Vec::new();
        for blocks in self.blocks.values() {
            let mut start = 0;
            for idx in 1..=blocks.len() {
                if idx == blocks.len() || blocks[idx].id().clock != blocks[idx - 1].end() {
                    if idx > start {
                        runs.push(&blocks[start..idx]);
                    }
                    start = idx;
                }
            }
        }
        runs
    }

    fn normalize(&mut self) {
        for blocks in self.blocks.values_mut() {
            blocks.sort_by_key(|b| b.id().clock);
            let mut out: Vec<Block> = Vec::with_capacity(blocks.len());
            let mut covered: Option<Clock> = None;
            for block in blocks.drain(..) {
                match covered {
                    Some(end) if block.end() <= end => continue,
                    Some(end) if block.id().clock < end => {
                        out.push(block.tail(end - block.id().clock));
                    }
                    _ => out.push(block),
                }
                covered = out.last().map(Block::end);
            }
            *blocks = out;
        }
        self.blocks.retain(|_, blocks| !blocks.is_empty());
    }
}

/// Strip local-only state: links point back at the origins, deletion travels in the
/// delete set, and the parent is only carried when no origin implies it.
fn wire_form(block: Block) -> Block {
    match block {
        Block::Item(mut item) => {
            item.left = item.origin;
            item.right = item.right_origin;
            item.deleted = false;
            if item.origin.is_some() || item.right_origin.is_some() {
                item.parent = None;
                item.parent_sub = None;
            }
            Block::Item(item)
        }
        gc => gc,
    }
}

/// Combine several V1 updates into one.
pub fn merge_updates(updates: &[&[u8]]) -> Result<Vec<u8>> {
    let mut merged = Update::new();
    for bytes in updates {
        merged.merge(Update::decode_v1(bytes)?);
    }
    Ok(merged.encode_v1())
}

pub fn convert_v1_to_v2(bytes: &[u8]) -> Result<Vec<u8>> {
    Ok(Update::decode_v1(bytes)?.encode_v2())
}

pub fn convert_v2_to_v1(bytes: &[u8]) -> Result<Vec<u8>> {
    Ok(Update::decode_v2(bytes)?.encode_v1())
}

/// `var(entries) (var(replica) var(clock))*`, sorted by replica.
pub fn encode_state_vector(sv: &StateVector) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_var_usize(sv.len());
    for (replica, clock) in sv.iter() {
        w.write_var_u64(replica.get());
        w.write_var_u32(clock);
    }
    w.into_inner()
}

pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector> {
    let mut r = Reader::new(bytes);
    let entries = r.read_count()?;
    let mut sv = StateVector::new();
    for _ in 0..entries {
        let replica = ReplicaId(r.read_var_u64()?);
        let clock = r.read_var_u32()?;
        sv.set_max(replica, clock);
    }
    r.finish()?;
    Ok(sv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BranchRef, Content, Gc, Item};
    use crate::error::Error;
    use crate::ids::Id;

    const R: ReplicaId = ReplicaId(5);

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
    fn normalize_trims_overlaps_and_drops_duplicates() {
        let mut blocks = BTreeMap::new();
        blocks.insert(R, vec![text(2, "cdef"), text(0, "abc"), text(3, "d")]);
        let update = Update::from_parts(blocks, DeleteSet::new());
        let clocks: Vec<(Clock, u32)> = update.blocks().map(|b| (b.id().clock, b.len())).collect();
        assert_eq!(clocks, vec![(0, 3), (3, 3)]);
        assert_eq!(update.state_vector().get(R), 6);
    }

    #[test]
    fn runs_split_at_gaps() {
        let mut blocks = BTreeMap::new();
        blocks.insert(
            R,
            vec![
                text(0, "ab"),
                Block::Gc(Gc {
                    id: Id::new(R, 2),
                    len: 1,
                }),
                text(7, "x"),
            ],
        );
        let update = Update::from_parts(blocks, DeleteSet::new());
        let runs = update.runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].len(), 2);
        assert_eq!(runs[1][0].id(), Id::new(R, 7));
    }

    #[test]
    fn state_vector_codec_roundtrips_and_rejects_trailing_bytes() {
        let sv: StateVector = [(ReplicaId(1), 4), (ReplicaId(300), 70_000)]
            .into_iter()
            .collect();
        let mut bytes = encode_state_vector(&sv);
        assert_eq!(decode_state_vector(&bytes).unwrap(), sv);
        bytes.push(0);
        assert!(matches!(
            decode_state_vector(&bytes),
            Err(Error::MalformedUpdate(_))
        ));
    }
}
