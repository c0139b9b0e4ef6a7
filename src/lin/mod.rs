//! An offline linearizability checker: given a sequential model and an
//! observed history of concurrent operations, decides whether the history
//! is explainable by some linearization. This is the correctness oracle for
//! the replicated store; the search itself follows Wing & Gong, with a
//! memoization cache and per-partition parallelism.

mod bitset;
mod check;
mod model;
mod models;

pub use bitset::Bitset;
pub use check::{check_events, check_operations};
pub use model::{Event, Model, Operation};
pub use models::{KvInput, KvModel, KvOp, KvOutput};
