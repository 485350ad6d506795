use crate::ids::ReplicaId;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default cap on decoded blocks waiting for missing causal dependencies.
pub const DEFAULT_MAX_PENDING_BLOCKS: usize = 10_000;

/// Per-document configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DocOptions {
    /// Identity used for every local mutation.
    pub replica: ReplicaId,
    /// Collect deleted content at the end of each commit.
    #[cfg_attr(feature = "serde", serde(default = "default_gc"))]
    pub gc: bool,
    /// Upper bound on buffered blocks plus buffered delete ranges; exceeding it rejects the
    /// update that overflowed.
    #[cfg_attr(
        feature = "serde",
        serde(default = "default_max_pending_blocks")
    )]
    pub max_pending_blocks: usize,
}

#[cfg(feature = "serde")]
fn default_gc() -> bool {
    true
}

#[cfg(feature = "serde")]
fn default_max_pending_blocks() -> usize {
    DEFAULT_MAX_PENDING_BLOCKS
}

impl DocOptions {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            gc: true,
            max_pending_blocks: DEFAULT_MAX_PENDING_BLOCKS,
        }
    }

    pub fn with_gc(mut self, gc: bool) -> Self {
        self.gc = gc;
        self
    }

    pub fn with_max_pending_blocks(mut self, max: usize) -> Self {
        self.max_pending_blocks = max;
        self
    }
}
