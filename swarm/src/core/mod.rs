//! Deterministic, pure logic shared by the swarm.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod graph;
pub mod idle;
pub mod orphans;
pub mod selector;
pub mod tree;
pub mod types;
