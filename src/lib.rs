//! A concurrent, in-memory, ordered key-value store.
//!
//! The [`tree`] module is the core: a binary search tree in which every
//! node carries its own reader/writer lock (built on the fair queued lock in
//! [`node_lock`]) and is navigated with hand-over-hand (lock-coupling)
//! traversal, so operations on disjoint subtrees make progress
//! concurrently. [`command`] is the textual `q`/`a`/`d`/`f` command grammar
//! used by the `dbsrv` binary; it is an external collaborator of the core,
//! not part of it.

#[macro_use]
extern crate static_assertions;

pub mod command;
pub mod node_lock;
pub mod tree;

pub use tree::{AddOutcome, QueryOutcome, RemoveOutcome, Tree, TreeError};
