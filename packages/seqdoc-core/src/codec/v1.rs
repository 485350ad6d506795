//! Verbose update format.
//!
//! ```text
//! update      := var(runs) run* delete_set
//! run         := var(count) var(replica) var(first clock) block{count}
//! block       := info origin? right_origin? parent_info? content
//! parent_info := (var(1) str(root name) | var(0) id) str(key)?
//! delete_set  := var(replicas) (var(replica) var(ranges) (var(clock) var(len))*)*
//! ```
//!
//! Parent information is only written when the item has neither origin; otherwise the
//! receiver takes it from the neighbour it integrates next to.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::block::{Block, BranchRef, Content, Gc, Item};
use crate::codec::{Reader, Writer};
use crate::error::{Error, Result};
use crate::id_set::DeleteSet;
use crate::ids::{Id, ReplicaId};
use crate::update::Update;

const TAG_GC: u8 = 0;
const TAG_DELETED: u8 = 1;
const TAG_STRING: u8 = 4;
const TAG_BRANCH: u8 = 7;
const TAG_VALUES: u8 = 8;
const TAG_MASK: u8 = 0x1f;

const HAS_ORIGIN: u8 = 0x80;
const HAS_RIGHT_ORIGIN: u8 = 0x40;
const HAS_PARENT_SUB: u8 = 0x20;

const PARENT_NESTED: u32 = 0;
const PARENT_ROOT: u32 = 1;

pub(crate) fn encode(update: &Update) -> Vec<u8> {
    let mut w = Writer::new();
    let runs = update.runs();
    w.write_var_usize(runs.len());
    for run in runs {
        let first = run[0].id();
        w.write_var_usize(run.len());
        w.write_var_u64(first.replica.get());
        w.write_var_u32(first.clock);
        for block in run {
            write_block(&mut w, block);
        }
    }
    write_delete_set(&mut w, update.delete_set());
    w.into_inner()
}

fn write_id(w: &mut Writer, id: Id) {
    w.write_var_u64(id.replica.get());
    w.write_var_u32(id.clock);
}

fn write_block(w: &mut Writer, block: &Block) {
    let item = match block {
        Block::Gc(gc) => {
            w.write_u8(TAG_GC);
            w.write_var_u32(gc.len);
            return;
        }
        Block::Item(item) => item,
    };
    let with_parent = item.origin.is_none() && item.right_origin.is_none();
    let mut info = match item.content {
        Content::Deleted(_) => TAG_DELETED,
        Content::String(_) => TAG_STRING,
        Content::Branch => TAG_BRANCH,
        Content::Values(_) => TAG_VALUES,
    };
    if item.origin.is_some() {
        info |= HAS_ORIGIN;
    }
    if item.right_origin.is_some() {
        info |= HAS_RIGHT_ORIGIN;
    }
    if with_parent && item.parent_sub.is_some() {
        info |= HAS_PARENT_SUB;
    }
    w.write_u8(info);
    if let Some(origin) = item.origin {
        write_id(w, origin);
    }
    if let Some(right_origin) = item.right_origin {
        write_id(w, right_origin);
    }
    if with_parent {
        match &item.parent {
            Some(BranchRef::Nested(id)) => {
                w.write_var_u32(PARENT_NESTED);
                write_id(w, *id);
            }
            Some(BranchRef::Root(name)) => {
                w.write_var_u32(PARENT_ROOT);
                w.write_str(name);
            }
            // Items reaching the encoder always know their parent or an origin.
            None => {
                w.write_var_u32(PARENT_ROOT);
                w.write_str("");
            }
        }
        if let Some(key) = &item.parent_sub {
            w.write_str(key);
        }
    }
    match &item.content {
        Content::String(s) => w.write_str(s),
        Content::Values(values) => {
            w.write_var_usize(values.len());
            for value in values {
                w.write_value(value);
            }
        }
        Content::Branch => w.write_u8(0),
        Content::Deleted(len) => w.write_var_u32(*len),
    }
}

fn write_delete_set(w: &mut Writer, ds: &DeleteSet) {
    let replicas = ds.replicas();
    w.write_var_usize(replicas.len());
    for replica in replicas {
        let ranges = ds.ranges(replica);
        w.write_var_u64(replica.get());
        w.write_var_usize(ranges.len());
        for range in ranges {
            w.write_var_u32(range.start);
            w.write_var_u32(range.len);
        }
    }
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Update> {
    let mut r = Reader::new(bytes);
    let mut blocks: BTreeMap<ReplicaId, Vec<Block>> = BTreeMap::new();
    let runs = r.read_count()?;
    for _ in 0..runs {
        let count = r.read_count()?;
        let replica = ReplicaId(r.read_var_u64()?);
        let mut clock = r.read_var_u32()?;
        let out = blocks.entry(replica).or_default();
        for _ in 0..count {
            let block = read_block(&mut r, Id::new(replica, clock))?;
            clock = clock.checked_add(block.len()).ok_or_else(|| {
                Error::MalformedUpdate(format!("clock overflow on replica {replica}"))
            })?;
            out.push(block);
        }
    }
    let delete_set = read_delete_set(&mut r)?;
    r.finish()?;
    Ok(Update::from_parts(blocks, delete_set))
}

fn read_id(r: &mut Reader<'_>) -> Result<Id> {
    let replica = ReplicaId(r.read_var_u64()?);
    let clock = r.read_var_u32()?;
    Ok(Id::new(replica, clock))
}

fn read_len(r: &mut Reader<'_>) -> Result<u32> {
    match r.read_var_u32()? {
        0 => Err(Error::MalformedUpdate("zero-length block".into())),
        len => Ok(len),
    }
}

fn read_block(r: &mut Reader<'_>, id: Id) -> Result<Block> {
    let info = r.read_u8()?;
    let tag = info & TAG_MASK;
    match tag {
        TAG_GC => {
            let len = read_len(r)?;
            return Ok(Block::Gc(Gc { id, len }));
        }
        TAG_DELETED | TAG_STRING | TAG_BRANCH | TAG_VALUES => {}
        other => return Err(Error::UnknownStructType(other)),
    }
    let origin = if info & HAS_ORIGIN != 0 {
        Some(read_id(r)?)
    } else {
        None
    };
    let right_origin = if info & HAS_RIGHT_ORIGIN != 0 {
        Some(read_id(r)?)
    } else {
        None
    };
    let (parent, parent_sub) = if origin.is_none() && right_origin.is_none() {
        let parent = match r.read_var_u32()? {
            PARENT_NESTED => BranchRef::Nested(read_id(r)?),
            PARENT_ROOT => BranchRef::Root(Arc::from(r.read_str()?)),
            kind => {
                return Err(Error::MalformedUpdate(format!("unknown parent kind {kind}")))
            }
        };
        let parent_sub = if info & HAS_PARENT_SUB != 0 {
            Some(Arc::from(r.read_str()?))
        } else {
            None
        };
        (Some(parent), parent_sub)
    } else {
        (None, None)
    };
    let content = match tag {
        TAG_DELETED => Content::Deleted(read_len(r)?),
        TAG_STRING => match r.read_str()? {
            "" => return Err(Error::MalformedUpdate("zero-length block".into())),
            s => Content::String(s.to_owned()),
        },
        TAG_VALUES => {
            let count = r.read_count()?;
            if count == 0 {
                return Err(Error::MalformedUpdate("zero-length block".into()));
            }
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(r.read_value()?);
            }
            Content::Values(values)
        }
        _ => match r.read_u8()? {
            0 => Content::Branch,
            kind => {
                return Err(Error::MalformedUpdate(format!("unknown branch kind {kind}")))
            }
        },
    };
    Ok(Block::Item(Item::new(
        id,
        origin,
        right_origin,
        parent,
        parent_sub,
        content,
    )))
}

fn read_delete_set(r: &mut Reader<'_>) -> Result<DeleteSet> {
    let mut ds = DeleteSet::new();
    let replicas = r.read_count()?;
    for _ in 0..replicas {
        let replica = ReplicaId(r.read_var_u64()?);
        let ranges = r.read_count()?;
        for _ in 0..ranges {
            let clock = r.read_var_u32()?;
            let len = read_len(r)?;
            if clock.checked_add(len).is_none() {
                return Err(Error::MalformedUpdate("delete range overflows".into()));
            }
            ds.push_unchecked(Id::new(replica, clock), len);
        }
    }
    ds.squash();
    Ok(ds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_content_tag_is_reported() {
        // one run, one block at (1, 0) with tag 9
        let bytes = [1u8, 1, 1, 0, 9];
        assert_eq!(decode(&bytes).unwrap_err(), Error::UnknownStructType(9));
    }

    #[test]
    fn zero_length_gc_is_malformed() {
        let bytes = [1u8, 1, 1, 0, TAG_GC, 0, 0];
        assert!(matches!(decode(&bytes), Err(Error::MalformedUpdate(_))));
    }

    #[test]
    fn empty_update_roundtrips() {
        let bytes = encode(&Update::new());
        assert_eq!(bytes, vec![0, 0]);
        assert!(decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn root_parent_and_key_survive() {
        let item = Item::new(
            Id::new(ReplicaId(3), 0),
            None,
            None,
            Some(BranchRef::root("meta")),
            Some(Arc::from("title")),
            Content::Values(vec!["hello".into()]),
        );
        let mut blocks = BTreeMap::new();
        blocks.insert(ReplicaId(3), vec![Block::Item(item.clone())]);
        let update = Update::from_parts(blocks, DeleteSet::new());
        let decoded = decode(&encode(&update)).unwrap();
        assert_eq!(decoded.blocks().next(), Some(&Block::Item(item)));
    }
}
