//! Containers layer: thin, allocator-adjacent data structures shared across
//! the crate. Each one is grounded on a concrete piece of the allocator or
//! EBR subsystem rather than invented fresh — see DESIGN.md.

pub mod btree;
pub mod hash_table;
pub mod mpmc_queue;
pub mod object_pool;
pub mod ring_buffer;
