use thiserror::Error;

use crate::ids::Id;
use crate::state_vector::StateVector;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("no block covers {0}")]
    NotFound(Id),
    #[error("unknown branch: {0}")]
    UnknownBranch(String),
    #[error("out of order append: expected clock {expected}, found {found}")]
    OutOfOrder { expected: u32, found: u32 },
    #[error("unresolved dependency, still missing {missing:?}")]
    UnresolvedDependency { missing: StateVector },
    #[error("malformed update: {0}")]
    MalformedUpdate(String),
    #[error("unknown struct type tag {0}")]
    UnknownStructType(u8),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}
