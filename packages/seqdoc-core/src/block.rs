use std::fmt;
use std::sync::Arc;

use crate::ids::{Clock, Id};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Scalar value stored in a sequence or map.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// The container an item is linked into.
///
/// Roots are addressed by name and exist implicitly on every replica. Nested branches are
/// addressed by the id of the item that carries them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BranchRef {
    Root(Arc<str>),
    Nested(Id),
}

impl BranchRef {
    pub fn root(name: &str) -> Self {
        BranchRef::Root(Arc::from(name))
    }
}

impl fmt::Display for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchRef::Root(name) => write!(f, "root({name})"),
            BranchRef::Nested(id) => write!(f, "nested({id})"),
        }
    }
}

/// Payload of an item.
#[derive(Clone, Debug, PartialEq)]
pub enum Content {
    /// Text; one element per `char`.
    String(String),
    Values(Vec<Value>),
    /// A nested sequence/map container. Always one element long.
    Branch,
    /// Content dropped by GC. Keeps the element count so ids stay addressable.
    Deleted(u32),
}

impl Content {
    pub fn len(&self) -> u32 {
        match self {
            Content::String(s) => s.chars().count() as u32,
            Content::Values(v) => v.len() as u32,
            Content::Branch => 1,
            Content::Deleted(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the content occupies visible positions in its sequence.
    pub fn is_countable(&self) -> bool {
        !matches!(self, Content::Deleted(_))
    }

    /// Keep the first `offset` elements, return the rest.
    fn split_off(&mut self, offset: u32) -> Content {
        match self {
            Content::String(s) => {
                let byte = s
                    .char_indices()
                    .nth(offset as usize)
                    .map(|(i, _)| i)
                    .unwrap_or(s.len());
                Content::String(s.split_off(byte))
            }
            Content::Values(v) => Content::Values(v.split_off(offset as usize)),
            Content::Deleted(n) => {
                let rest = *n - offset;
                *n = offset;
                Content::Deleted(rest)
            }
            Content::Branch => unreachable!("branch content is never split"),
        }
    }

    fn try_append(&mut self, other: &Content) -> bool {
        match (self, other) {
            (Content::String(a), Content::String(b)) => {
                a.push_str(b);
                true
            }
            (Content::Values(a), Content::Values(b)) => {
                a.extend(b.iter().cloned());
                true
            }
            (Content::Deleted(a), Content::Deleted(b)) => {
                *a += *b;
                true
            }
            _ => false,
        }
    }
}

/// Content struct: a run of elements inserted by one replica in one operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub id: Id,
    pub len: u32,
    /// Last element to the left when this item was created. `None` means sequence start.
    pub origin: Option<Id>,
    /// First element to the right when this item was created. `None` means sequence end.
    pub right_origin: Option<Id>,
    /// Current left neighbour, addressed by its last element.
    pub left: Option<Id>,
    /// Current right neighbour, addressed by its first element.
    pub right: Option<Id>,
    /// `None` only for decoded items whose parent is implied by their origins.
    pub parent: Option<BranchRef>,
    /// Map key for standalone value mutations.
    pub parent_sub: Option<Arc<str>>,
    pub content: Content,
    pub deleted: bool,
}

impl Item {
    pub fn new(
        id: Id,
        origin: Option<Id>,
        right_origin: Option<Id>,
        parent: Option<BranchRef>,
        parent_sub: Option<Arc<str>>,
        content: Content,
    ) -> Self {
        Self {
            id,
            len: content.len(),
            origin,
            right_origin,
            left: origin,
            right: right_origin,
            parent,
            parent_sub,
            content,
            deleted: false,
        }
    }

    pub fn last_id(&self) -> Id {
        self.id.advance(self.len - 1)
    }

    pub fn is_countable(&self) -> bool {
        self.content.is_countable()
    }

    /// Number of positions the item occupies in its sequence right now.
    pub fn visible_len(&self) -> u32 {
        if self.deleted || !self.is_countable() || self.parent_sub.is_some() {
            0
        } else {
            self.len
        }
    }

    /// Split at `offset`, keeping `[0, offset)` and returning `[offset, len)`.
    ///
    /// The right half is anchored to the left half's last element and keeps the original
    /// right origin, which is exactly what a replica inserting the two halves separately
    /// would have produced.
    pub fn split(&mut self, offset: u32) -> Item {
        debug_assert!(offset > 0 && offset < self.len);
        let right_id = self.id.advance(offset);
        let right = Item {
            id: right_id,
            len: self.len - offset,
            origin: Some(self.id.advance(offset - 1)),
            right_origin: self.right_origin,
            left: Some(self.id.advance(offset - 1)),
            right: self.right,
            parent: self.parent.clone(),
            parent_sub: self.parent_sub.clone(),
            content: self.content.split_off(offset),
            deleted: self.deleted,
        };
        self.len = offset;
        self.right = Some(right_id);
        right
    }

    /// Drop the first `offset` elements (already known locally) and re-anchor on the last
    /// dropped one.
    pub fn trim_front(&mut self, offset: u32) {
        if offset == 0 {
            return;
        }
        let anchor = self.id.advance(offset - 1);
        self.content = self.content.split_off(offset);
        self.id = self.id.advance(offset);
        self.len -= offset;
        self.origin = Some(anchor);
        self.left = Some(anchor);
    }

    /// Absorb `right` if it is the logical continuation of this item.
    pub fn try_merge(&mut self, right: &Item) -> bool {
        let mergeable = self.id.replica == right.id.replica
            && self.id.clock + self.len == right.id.clock
            && right.origin == Some(self.last_id())
            && self.right == Some(right.id)
            && self.right_origin == right.right_origin
            && self.deleted == right.deleted
            && self.parent_sub.is_none()
            && right.parent_sub.is_none()
            && self.parent == right.parent;
        if !mergeable || !self.content.try_append(&right.content) {
            return false;
        }
        self.len += right.len;
        self.right = right.right;
        true
    }
}

/// Tombstone struct: a deleted clock range whose content and links were discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gc {
    pub id: Id,
    pub len: u32,
}

/// One addressable unit of a replica's log.
#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    Item(Item),
    Gc(Gc),
}

impl Block {
    pub fn id(&self) -> Id {
        match self {
            Block::Item(item) => item.id,
            Block::Gc(gc) => gc.id,
        }
    }

    pub fn len(&self) -> u32 {
        match self {
            Block::Item(item) => item.len,
            Block::Gc(gc) => gc.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_id(&self) -> Id {
        self.id().advance(self.len() - 1)
    }

    /// Clock one past the end of this block.
    pub fn end(&self) -> Clock {
        self.id().clock + self.len()
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            Block::Item(item) => item.deleted,
            Block::Gc(_) => true,
        }
    }

    pub fn contains(&self, id: &Id) -> bool {
        let start = self.id();
        start.replica == id.replica && id.clock >= start.clock && id.clock < self.end()
    }

    /// Offset of `id` within this block.
    pub fn offset_of(&self, id: &Id) -> Option<u32> {
        self.contains(id).then(|| id.clock - self.id().clock)
    }

    pub fn as_item(&self) -> Option<&Item> {
        match self {
            Block::Item(item) => Some(item),
            Block::Gc(_) => None,
        }
    }

    pub fn as_item_mut(&mut self) -> Option<&mut Item> {
        match self {
            Block::Item(item) => Some(item),
            Block::Gc(_) => None,
        }
    }

    /// Split at `offset` (relative to the block start), returning the right half.
    pub fn split(&mut self, offset: u32) -> Block {
        match self {
            Block::Item(item) => Block::Item(item.split(offset)),
            Block::Gc(gc) => {
                let right = Gc {
                    id: gc.id.advance(offset),
                    len: gc.len - offset,
                };
                gc.len = offset;
                Block::Gc(right)
            }
        }
    }

    /// Rejoin the right half returned by [`Block::split`], restoring the block as it was
    /// before the split.
    pub(crate) fn unsplit(&mut self, right: Block) {
        match (self, right) {
            (Block::Item(left), Block::Item(right)) => {
                left.len += right.len;
                left.right = right.right;
                left.content.try_append(&right.content);
            }
            (Block::Gc(left), Block::Gc(right)) => left.len += right.len,
            _ => {}
        }
    }

    /// Copy of `[offset, len)` without touching `self`.
    pub fn tail(&self, offset: u32) -> Block {
        if offset == 0 {
            return self.clone();
        }
        let mut copy = self.clone();
        copy.split(offset)
    }

    pub fn try_merge(&mut self, right: &Block) -> bool {
        match (self, right) {
            (Block::Item(left), Block::Item(right)) => left.try_merge(right),
            (Block::Gc(left), Block::Gc(right)) => {
                if left.id.replica == right.id.replica && left.id.clock + left.len == right.id.clock
                {
                    left.len += right.len;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ReplicaId;

    fn text_item(clock: Clock, text: &str) -> Item {
        Item::new(
            Id::new(ReplicaId(1), clock),
            None,
            None,
            Some(BranchRef::root("t")),
            None,
            Content::String(text.into()),
        )
    }

    #[test]
    fn split_partitions_ids_and_content() {
        let mut left = text_item(0, "héllo");
        let right = left.split(2);
        assert_eq!(left.content, Content::String("hé".into()));
        assert_eq!(right.content, Content::String("llo".into()));
        assert_eq!(left.len, 2);
        assert_eq!(right.len, 3);
        assert_eq!(right.id, Id::new(ReplicaId(1), 2));
        assert_eq!(right.origin, Some(Id::new(ReplicaId(1), 1)));
        assert_eq!(left.right, Some(right.id));
        assert_eq!(right.left, Some(left.last_id()));
    }

    #[test]
    fn split_then_merge_restores_original() {
        let original = text_item(4, "abcdef");
        let mut left = original.clone();
        let right = left.split(3);
        assert!(left.try_merge(&right));
        assert_eq!(left, original);
    }

    #[test]
    fn merge_refuses_different_deletion_state() {
        let mut left = text_item(0, "ab");
        let mut right = left.split(1);
        right.deleted = true;
        assert!(!left.try_merge(&right));
    }

    #[test]
    fn gc_blocks_merge_when_contiguous() {
        let mut a = Block::Gc(Gc {
            id: Id::new(ReplicaId(2), 0),
            len: 3,
        });
        let b = Block::Gc(Gc {
            id: Id::new(ReplicaId(2), 3),
            len: 2,
        });
        let c = Block::Gc(Gc {
            id: Id::new(ReplicaId(2), 9),
            len: 1,
        });
        assert!(a.try_merge(&b));
        assert_eq!(a.len(), 5);
        assert!(!a.try_merge(&c));
        assert!(a.contains(&Id::new(ReplicaId(2), 4)));
        assert!(!a.contains(&Id::new(ReplicaId(2), 5)));
        assert_eq!(a.offset_of(&Id::new(ReplicaId(2), 4)), Some(4));
    }

    #[test]
    fn tail_copies_without_mutating() {
        let block = Block::Item(text_item(0, "xyz"));
        let tail = block.tail(1);
        assert_eq!(block.len(), 3);
        assert_eq!(tail.id(), Id::new(ReplicaId(1), 1));
        assert_eq!(tail.as_item().map(|i| i.content.clone()), Some(Content::String("yz".into())));
    }
}
