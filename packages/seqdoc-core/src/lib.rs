#![forbid(unsafe_code)]
//! Core of a replicated document engine: text, value sequences, maps and nested branches
//! that converge across replicas exchanging binary updates in any order.
//! Concurrent inserts are ordered with YATA; deletions travel as compact id ranges and
//! deleted content is garbage collected without breaking references to it.

pub mod block;
pub mod branch;
mod codec;
pub mod doc;
pub mod error;
pub mod events;
mod gc;
pub mod id_set;
pub mod ids;
mod integrate;
pub mod options;
pub mod state_vector;
pub mod store;
pub mod transaction;
pub mod update;

pub use block::{Block, BranchRef, Content, Gc, Item, Value};
pub use branch::{BranchSnapshot, DocSnapshot, Element};
pub use doc::Document;
pub use error::{Error, Result};
pub use events::{Subscription, TransactionEvent, UpdateEvent};
pub use id_set::{ClockRange, DeleteSet, IdSet};
pub use ids::{Clock, Id, ReplicaId};
pub use options::DocOptions;
pub use state_vector::StateVector;
pub use store::BlockStore;
pub use transaction::Transaction;
pub use update::{
    convert_v1_to_v2, convert_v2_to_v1, decode_state_vector, encode_state_vector,
    merge_updates, Update,
};
