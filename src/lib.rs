//! `libttak`: a tiered, lifecycle-tracked memory allocator, an epoch-based
//! reclamation subsystem with detachable arenas, and the concurrency
//! scaffolding (thread pool, futures, scheduler) built on top of both.
//!
//! Teardown order, should a process want to tear every singleton down
//! explicitly rather than leaking to process exit: arenas, then EBR
//! domains, then tracking trees, then the pointer registry.

pub mod alloc;
pub mod arena;
pub mod atomics;
pub mod containers;
pub mod ebr;
pub mod epoch_gc;
pub mod error;
pub mod future;
pub mod header;
pub mod heap;
pub mod owner;
pub mod pool;
pub mod registry;
pub mod scheduler;
pub mod sync;
pub mod time;
pub mod tree;
