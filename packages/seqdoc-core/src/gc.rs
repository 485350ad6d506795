use tracing::trace;

use crate::block::{Block, BranchRef, Content};
use crate::doc::DocState;
use crate::error::Result;
use crate::id_set::DeleteSet;
use crate::ids::Id;

/// Drop the content of every deleted item in `deleted`.
///
/// Items in a live branch keep their links and origins and only lose their payload, so
/// they can still anchor concurrent inserts. A deleted nested branch is removed from
/// the registry and everything inside it becomes a tombstone.
pub(crate) fn collect(state: &mut DocState, deleted: &DeleteSet) -> Result<()> {
    let mut collapsed = 0usize;
    for (replica, range) in deleted.iter() {
        let mut clock = range.start;
        while clock < range.end() {
            let id = Id::new(replica, clock);
            let (start, next, is_branch) = match state.store.get(&id) {
                Ok(Block::Item(item))
                    if item.deleted && !matches!(item.content, Content::Deleted(_)) =>
                {
                    if parent_pending_collection(state, &item.parent) {
                        clock = item.id.clock + item.len;
                        continue;
                    }
                    (item.id, item.id.clock + item.len, matches!(item.content, Content::Branch))
                }
                Ok(block) => {
                    clock = block.end();
                    continue;
                }
                Err(_) => break,
            };
            if is_branch {
                collect_branch(state, start)?;
            }
            state.store.collapse_content(&start)?;
            collapsed += 1;
            clock = next;
        }
    }
    if collapsed > 0 {
        trace!(collapsed, "collapsed deleted content");
    }
    Ok(())
}

/// Items whose nested parent is itself deleted are collected together with that branch.
fn parent_pending_collection(state: &DocState, parent: &Option<BranchRef>) -> bool {
    match parent {
        Some(BranchRef::Nested(pid)) => state.item(pid).map(|p| p.deleted).unwrap_or(true),
        _ => false,
    }
}

/// Replace every deleted item inside the nested branch carried by `id` with a tombstone.
fn collect_branch(state: &mut DocState, id: Id) -> Result<()> {
    let Some(children) = state.remove_branch(&BranchRef::Nested(id)) else {
        return Ok(());
    };
    for child in children {
        let (deleted, is_branch) = match state.store.get(&child)? {
            Block::Item(item) => (item.deleted, matches!(item.content, Content::Branch)),
            Block::Gc(_) => continue,
        };
        if !deleted {
            continue;
        }
        if is_branch {
            collect_branch(state, child)?;
        }
        state.store.replace_with_gc(&child)?;
    }
    trace!(branch = %id, "collected nested branch");
    Ok(())
}
