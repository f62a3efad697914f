//! Shared memory: mapped pool segments and the allocator inside them.
//!
//! A pool is a memory-mapped file on tmpfs carrying its own metadata,
//! lock and heap. Offsets into the pool are the currency of the whole
//! crate: every shared structure references others by offset, resolved
//! against whatever address the local process mapped the pool at.

pub mod heap;
pub mod pool;
pub mod segment;

pub use heap::HeapStats;
pub use pool::ShmPool;
