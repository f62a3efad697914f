//! # Fusion
//!
//! Kernel-independent inter-process coordination over shared memory.
//!
//! Processes create or join a *world*, a coordination session backed by
//! mmap'd files on a tmpfs. A world provides:
//!
//! - **Shared memory pools**: a BSD-style allocator operating on offsets
//!   inside a mapped file, usable from every attached process
//! - **Skirmishes**: recursive cross-process locks that recover from
//!   crashed owners via a liveness probe
//! - **References**: cross-process atomic counters with watch-for-zero
//!   callbacks
//! - **Object pools**: reference-counted objects reclaimed automatically
//!   when the last holder anywhere lets go, even if their creator died
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use fusion::{World, WorldConfig};
//!
//! // First process becomes master of world 0.
//! let world = World::create(0, WorldConfig::default())?;
//! let pool = world.create_pool("surfaces", 1 << 20)?;
//! let off = pool.allocate(256, true, true)?;
//!
//! // Other processes join and see the same memory.
//! let world = World::join(0, WorldConfig::default())?;
//! let pool = world.attach_pool(1)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
mod hash;
pub mod object;
pub mod refs;
pub mod shm;
pub mod skirmish;
pub mod world;

pub use config::WorldConfig;
pub use error::{Error, Result};
pub use object::{ObjectDestructor, ObjectHandle, ObjectPool, ObjectState};
pub use refs::Ref;
pub use shm::{HeapStats, ShmPool};
pub use skirmish::{dismiss_multi, prevail_multi, Skirmish};
pub use world::World;
