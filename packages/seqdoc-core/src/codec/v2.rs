//! Compact update format.
//!
//! ```text
//! update     := u8(features = 0) dictionary var(runs) run* delete_set
//! dictionary := var(n) var(replica){n}            sorted, unique
//! run        := var(dict idx) var(first clock) var(count) block{count}
//! block      := info zigzag(len - previous len) origin? right_origin? parent_info? content
//! delete_set := var(replicas) (var(dict idx) var(ranges) (var(gap) var(len))*)*
//! ```
//!
//! Replicas are written once and referenced by index. An origin that is the element
//! right before the block on its own replica is flagged and costs no bytes; so is a
//! right origin repeated from the previous block of the run. Content lengths are
//! implied by the block length.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::block::{Block, BranchRef, Content, Gc, Item};
use crate::codec::{Reader, Writer};
use crate::error::{Error, Result};
use crate::id_set::DeleteSet;
use crate::ids::{Clock, Id, ReplicaId};
use crate::update::Update;

const FEATURES: u8 = 0;

const TAG_GC: u8 = 0;
const TAG_DELETED: u8 = 1;
const TAG_STRING: u8 = 2;
const TAG_VALUES: u8 = 3;
const TAG_BRANCH: u8 = 4;
const TAG_MASK: u8 = 0x07;

const HAS_ORIGIN: u8 = 0x80;
const HAS_RIGHT_ORIGIN: u8 = 0x40;
const HAS_PARENT_SUB: u8 = 0x20;
const ORIGIN_PRECEDES: u8 = 0x10;
const RIGHT_ORIGIN_REPEATS: u8 = 0x08;

const PARENT_NESTED: u32 = 0;
const PARENT_ROOT: u32 = 1;

struct Dictionary {
    replicas: Vec<ReplicaId>,
}

impl Dictionary {
    fn build(update: &Update) -> Self {
        let mut set = BTreeSet::new();
        for block in update.blocks() {
            set.insert(block.id().replica);
            if let Block::Item(item) = block {
                set.extend(item.origin.map(|id| id.replica));
                set.extend(item.right_origin.map(|id| id.replica));
                if let Some(BranchRef::Nested(id)) = &item.parent {
                    set.insert(id.replica);
                }
            }
        }
        set.extend(update.delete_set().replicas());
        Self {
            replicas: set.into_iter().collect(),
        }
    }

    fn index(&self, replica: ReplicaId) -> usize {
        self.replicas
            .binary_search(&replica)
            .unwrap_or_else(|idx| idx)
    }

    /// Read a dictionary index and resolve it. Indices are bounded by the dictionary,
    /// not by the input left to read.
    fn read(&self, r: &mut Reader<'_>) -> Result<ReplicaId> {
        let idx = r.read_var_u64()?;
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.replicas.get(i))
            .copied()
            .ok_or_else(|| {
                Error::MalformedUpdate(format!(
                    "replica index {idx} out of range ({} entries)",
                    self.replicas.len()
                ))
            })
    }
}

/// The element right before `id` on its own replica.
fn preceding(id: Id) -> Option<Id> {
    id.clock.checked_sub(1).map(|clock| Id::new(id.replica, clock))
}

pub(crate) fn encode(update: &Update) -> Vec<u8> {
    let dict = Dictionary::build(update);
    let mut w = Writer::new();
    w.write_u8(FEATURES);
    w.write_var_usize(dict.replicas.len());
    for replica in &dict.replicas {
        w.write_var_u64(replica.get());
    }

    let runs = update.runs();
    w.write_var_usize(runs.len());
    for run in runs {
        let first = run[0].id();
        w.write_var_usize(dict.index(first.replica));
        w.write_var_u32(first.clock);
        w.write_var_usize(run.len());
        let mut prev_len = 0i64;
        let mut prev_right_origin = None;
        for block in run {
            let len = i64::from(block.len());
            match block {
                Block::Gc(_) => {
                    w.write_u8(TAG_GC);
                    w.write_var_i64(len - prev_len);
                    prev_right_origin = None;
                }
                Block::Item(item) => {
                    write_item(&mut w, &dict, item, len - prev_len, prev_right_origin);
                    prev_right_origin = item.right_origin;
                }
            }
            prev_len = len;
        }
    }

    let ds = update.delete_set();
    let replicas = ds.replicas();
    w.write_var_usize(replicas.len());
    for replica in replicas {
        let ranges = ds.ranges(replica);
        w.write_var_usize(dict.index(replica));
        w.write_var_usize(ranges.len());
        let mut prev_end: Clock = 0;
        for range in ranges {
            w.write_var_u32(range.start - prev_end);
            w.write_var_u32(range.len);
            prev_end = range.end();
        }
    }
    w.into_inner()
}

fn write_id(w: &mut Writer, dict: &Dictionary, id: Id) {
    w.write_var_usize(dict.index(id.replica));
    w.write_var_u32(id.clock);
}

fn write_item(
    w: &mut Writer,
    dict: &Dictionary,
    item: &Item,
    len_delta: i64,
    prev_right_origin: Option<Id>,
) {
    let origin_precedes = item.origin.is_some() && item.origin == preceding(item.id);
    let right_repeats = item.right_origin.is_some() && item.right_origin == prev_right_origin;
    let with_parent = item.origin.is_none() && item.right_origin.is_none();

    let mut info = match item.content {
        Content::Deleted(_) => TAG_DELETED,
        Content::String(_) => TAG_STRING,
        Content::Values(_) => TAG_VALUES,
        Content::Branch => TAG_BRANCH,
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
    if origin_precedes {
        info |= ORIGIN_PRECEDES;
    }
    if right_repeats {
        info |= RIGHT_ORIGIN_REPEATS;
    }
    w.write_u8(info);
    w.write_var_i64(len_delta);

    if let Some(origin) = item.origin.filter(|_| !origin_precedes) {
        write_id(w, dict, origin);
    }
    if let Some(right_origin) = item.right_origin.filter(|_| !right_repeats) {
        write_id(w, dict, right_origin);
    }
    if with_parent {
        match &item.parent {
            Some(BranchRef::Nested(id)) => {
                w.write_var_u32(PARENT_NESTED);
                write_id(w, dict, *id);
            }
            Some(BranchRef::Root(name)) => {
                w.write_var_u32(PARENT_ROOT);
                w.write_str(name);
            }
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
            for value in values {
                w.write_value(value);
            }
        }
        Content::Branch | Content::Deleted(_) => {}
    }
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Update> {
    let mut r = Reader::new(bytes);
    match r.read_u8()? {
        FEATURES => {}
        other => {
            return Err(Error::MalformedUpdate(format!(
                "unsupported feature byte {other}"
            )))
        }
    }
    let entries = r.read_count()?;
    let mut replicas = Vec::with_capacity(entries);
    for _ in 0..entries {
        replicas.push(ReplicaId(r.read_var_u64()?));
    }
    let dict = Dictionary { replicas };

    let mut blocks: BTreeMap<ReplicaId, Vec<Block>> = BTreeMap::new();
    let runs = r.read_count()?;
    for _ in 0..runs {
        let replica = dict.read(&mut r)?;
        let mut clock = r.read_var_u32()?;
        let count = r.read_count()?;
        let mut prev_len = 0i64;
        let mut prev_right_origin = None;
        let out = blocks.entry(replica).or_default();
        for _ in 0..count {
            let id = Id::new(replica, clock);
            let block = read_block(&mut r, &dict, id, &mut prev_len, &mut prev_right_origin)?;
            clock = clock.checked_add(block.len()).ok_or_else(|| {
                Error::MalformedUpdate(format!("clock overflow on replica {replica}"))
            })?;
            out.push(block);
        }
    }

    let mut delete_set = DeleteSet::new();
    let ds_replicas = r.read_count()?;
    for _ in 0..ds_replicas {
        let replica = dict.read(&mut r)?;
        let ranges = r.read_count()?;
        let mut prev_end: Clock = 0;
        for _ in 0..ranges {
            let gap = r.read_var_u32()?;
            let len = r.read_var_u32()?;
            let start = prev_end.checked_add(gap);
            let end = start.and_then(|s| s.checked_add(len));
            match (start, end) {
                (Some(start), Some(end)) if len > 0 => {
                    delete_set.push_unchecked(Id::new(replica, start), len);
                    prev_end = end;
                }
                _ => return Err(Error::MalformedUpdate("invalid delete range".into())),
            }
        }
    }
    delete_set.squash();
    r.finish()?;
    Ok(Update::from_parts(blocks, delete_set))
}

fn read_id(r: &mut Reader<'_>, dict: &Dictionary) -> Result<Id> {
    let replica = dict.read(r)?;
    let clock = r.read_var_u32()?;
    Ok(Id::new(replica, clock))
}

fn read_block(
    r: &mut Reader<'_>,
    dict: &Dictionary,
    id: Id,
    prev_len: &mut i64,
    prev_right_origin: &mut Option<Id>,
) -> Result<Block> {
    let info = r.read_u8()?;
    let tag = info & TAG_MASK;
    if tag > TAG_BRANCH {
        return Err(Error::UnknownStructType(tag));
    }
    let len = prev_len
        .checked_add(r.read_var_i64()?)
        .and_then(|len| u32::try_from(len).ok())
        .filter(|&len| len > 0)
        .ok_or_else(|| Error::MalformedUpdate("invalid block length".into()))?;
    *prev_len = i64::from(len);

    if tag == TAG_GC {
        *prev_right_origin = None;
        return Ok(Block::Gc(Gc { id, len }));
    }

    let origin = match (info & HAS_ORIGIN != 0, info & ORIGIN_PRECEDES != 0) {
        (false, _) => None,
        (true, true) => Some(preceding(id).ok_or_else(|| {
            Error::MalformedUpdate("preceding origin at clock 0".into())
        })?),
        (true, false) => Some(read_id(r, dict)?),
    };
    let right_origin = match (info & HAS_RIGHT_ORIGIN != 0, info & RIGHT_ORIGIN_REPEATS != 0) {
        (false, _) => None,
        (true, true) => Some(prev_right_origin.ok_or_else(|| {
            Error::MalformedUpdate("repeated right origin without a previous one".into())
        })?),
        (true, false) => Some(read_id(r, dict)?),
    };
    *prev_right_origin = right_origin;

    let (parent, parent_sub) = if origin.is_none() && right_origin.is_none() {
        let parent = match r.read_var_u32()? {
            PARENT_NESTED => BranchRef::Nested(read_id(r, dict)?),
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
        TAG_DELETED => Content::Deleted(len),
        TAG_STRING => {
            let s = r.read_str()?;
            if s.chars().count() != len as usize {
                return Err(Error::MalformedUpdate(format!(
                    "string of {} chars in a block of length {len}",
                    s.chars().count()
                )));
            }
            Content::String(s.to_owned())
        }
        TAG_VALUES => {
            if len as usize > r.remaining() {
                return Err(Error::MalformedUpdate(format!(
                    "{len} values exceed remaining input"
                )));
            }
            let mut values = Vec::with_capacity(len as usize);
            for _ in 0..len {
                values.push(r.read_value()?);
            }
            Content::Values(values)
        }
        _ => {
            if len != 1 {
                return Err(Error::MalformedUpdate(format!(
                    "branch block of length {len}"
                )));
            }
            Content::Branch
        }
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
