use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Per-replica operation counter. Not wall time.
pub type Clock = u32;

/// Identifier of one replica (one independent writer of a document).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique identifier of a single element in the document log.
///
/// Ordering is `(replica, clock)`. The order across replicas carries no causal
/// meaning; it only exists so ids can be sorted deterministically.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Id {
    pub replica: ReplicaId,
    pub clock: Clock,
}

impl Id {
    pub const fn new(replica: ReplicaId, clock: Clock) -> Self {
        Self { replica, clock }
    }

    /// Id `n` elements further along the same replica log.
    pub fn advance(self, n: u32) -> Self {
        Self {
            replica: self.replica,
            clock: self.clock + n,
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.replica, self.clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_order_by_replica_then_clock() {
        let a = Id::new(ReplicaId(1), 5);
        let b = Id::new(ReplicaId(1), 6);
        let c = Id::new(ReplicaId(2), 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.advance(1), b);
        assert_eq!(c.to_string(), "2:0");
    }
}
