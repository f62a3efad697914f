//! Shared reference counters.
//!
//! A [`Ref`] counts users of a shared resource across all processes of a
//! world. Counts are split into local (plain usage) and global (survives
//! the user handing it on) references; the total drives the lifecycle.
//! When a watched counter drops to zero, the registered call fires in
//! the process performing the final `down`, or is parked in the world's
//! pending ring when that process has no handler.
//!
//! `zero_trylock` lets a reaper freeze the counter at zero while it
//! decides whether to destroy the resource; concurrent `up` calls stall
//! for the short lock window instead of resurrecting a half-dead object
//! unnoticed.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::shm::pool::ShmPool;
use crate::world::World;

/// Shared counter state, allocated from a pool heap or embedded in a
/// larger shared structure.
#[repr(C)]
pub(crate) struct RefShared {
    local: AtomicI32,
    global: AtomicI32,
    thrown: AtomicI32,
    zero_locked: AtomicU32,
    destroyed: AtomicU32,
    /// Deaths signalled but not yet handled, coalesced by the watcher.
    dead: AtomicU32,
    watch_call: AtomicU32,
    watch_arg: AtomicU32,
}

/// Handle to a shared reference counter.
#[derive(Clone)]
pub struct Ref {
    world: World,
    pool: ShmPool,
    off: u32,
}

impl Ref {
    /// Creates a counter in shared memory, starting at zero.
    pub fn init(world: &World, pool: &ShmPool) -> Result<Ref> {
        let off = pool.allocate(std::mem::size_of::<RefShared>(), true, true)?;
        Ok(Ref {
            world: world.clone(),
            pool: pool.clone(),
            off,
        })
    }

    /// Handle onto counter state embedded at `off`, as exchanged between
    /// processes through shared structures. The offset must come from
    /// [`Ref::offset`] on a live counter in the same pool.
    pub fn from_offset(world: &World, pool: &ShmPool, off: u32) -> Ref {
        Ref {
            world: world.clone(),
            pool: pool.clone(),
            off,
        }
    }

    /// Offset of the shared state within its pool.
    pub fn offset(&self) -> u32 {
        self.off
    }

    #[inline]
    fn shared(&self) -> &RefShared {
        // SAFETY: off points at initialized RefShared state; the pool
        // mapping outlives the handle.
        unsafe { &*self.pool.segment().at::<RefShared>(self.off) }
    }

    fn check_alive(&self) -> Result<&RefShared> {
        let s = self.shared();
        if s.destroyed.load(Ordering::Acquire) != 0 {
            return Err(Error::Destroyed("reference"));
        }
        Ok(s)
    }

    /// Increments the counter. Stalls while a reaper holds the zero lock.
    pub fn up(&self, global: bool) -> Result<()> {
        loop {
            let s = self.check_alive()?;
            if s.zero_locked.load(Ordering::Acquire) != 0 {
                std::thread::yield_now();
                continue;
            }
            let counter = if global { &s.global } else { &s.local };
            counter.fetch_add(1, Ordering::AcqRel);
            // A reaper may have taken the zero lock between our check and
            // the increment; back out and let it finish.
            if s.zero_locked.load(Ordering::Acquire) != 0 {
                counter.fetch_sub(1, Ordering::AcqRel);
                std::thread::yield_now();
                continue;
            }
            return Ok(());
        }
    }

    /// Decrements the counter. The final `down` fires the watch call.
    pub fn down(&self, global: bool) -> Result<()> {
        let s = self.check_alive()?;
        let counter = if global { &s.global } else { &s.local };
        // The decrement and the cross-counter loads must be in one total
        // order: two threads dropping the last local and the last global
        // reference each have to see the other side at zero, or the
        // death notice is lost entirely.
        let prev = counter.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            counter.fetch_add(1, Ordering::AcqRel);
            error!(off = self.off, global, "reference counter underflow");
            return Err(Error::invalid("reference counter underflow"));
        }
        if prev == 1
            && s.local.load(Ordering::SeqCst) == 0
            && s.global.load(Ordering::SeqCst) == 0
        {
            let call = s.watch_call.load(Ordering::Acquire);
            if call != 0 {
                s.dead.fetch_add(1, Ordering::AcqRel);
                let arg = s.watch_arg.load(Ordering::Relaxed);
                self.world.call(call, arg);
            }
        }
        Ok(())
    }

    /// Current total count. Unreliable by contract: no lock is taken, the
    /// value may be stale immediately.
    pub fn stat(&self) -> Result<i32> {
        let s = self.check_alive()?;
        Ok(s.local.load(Ordering::Acquire) + s.global.load(Ordering::Acquire))
    }

    /// Locks the counter at zero. Fails with [`Error::Busy`] when the
    /// count is non-zero or another reaper holds the lock.
    pub fn zero_trylock(&self) -> Result<()> {
        let s = self.check_alive()?;
        if s.zero_locked.swap(1, Ordering::AcqRel) != 0 {
            return Err(Error::Busy("reference already zero-locked"));
        }
        if s.local.load(Ordering::Acquire) != 0 || s.global.load(Ordering::Acquire) != 0 {
            s.zero_locked.store(0, Ordering::Release);
            return Err(Error::Busy("reference count not zero"));
        }
        Ok(())
    }

    /// Releases the zero lock.
    pub fn unlock(&self) -> Result<()> {
        let s = self.check_alive()?;
        s.zero_locked.store(0, Ordering::Release);
        Ok(())
    }

    /// Arranges for `call_id` to be executed with `arg` whenever the
    /// count drops to zero. A counter carries at most one watch.
    pub fn watch(&self, call_id: u32, arg: u32) -> Result<()> {
        if call_id == 0 {
            return Err(Error::invalid("watch call id must be non-zero"));
        }
        let s = self.check_alive()?;
        if s
            .watch_call
            .compare_exchange(0, call_id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy("reference already watched"));
        }
        s.watch_arg.store(arg, Ordering::Relaxed);
        Ok(())
    }

    /// Adds another counter's current local count to this one.
    pub fn inherit(&self, from: &Ref) -> Result<()> {
        let s = self.check_alive()?;
        let amount = from.check_alive()?.local.load(Ordering::Acquire);
        if amount > 0 {
            s.local.fetch_add(amount, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Adds a global reference destined for `catcher`, keeping the
    /// resource alive while ownership is in flight.
    pub fn throw(&self, catcher: u64) -> Result<()> {
        self.up(true)?;
        let s = self.shared();
        s.thrown.fetch_add(1, Ordering::AcqRel);
        debug!(off = self.off, catcher, "reference thrown");
        Ok(())
    }

    /// Claims a thrown reference: takes a local reference and releases
    /// the in-flight global one.
    pub fn catch(&self) -> Result<()> {
        self.up(false)?;
        let s = self.shared();
        let prev = s.thrown.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            s.thrown.fetch_add(1, Ordering::AcqRel);
            self.down(false)?;
            return Err(Error::invalid("no thrown reference to catch"));
        }
        self.down(true)
    }

    /// Marks the counter destroyed. All further operations fail.
    pub fn destroy(&self) -> Result<()> {
        let s = self.shared();
        if s.destroyed.swap(1, Ordering::AcqRel) != 0 {
            return Err(Error::Destroyed("reference"));
        }
        Ok(())
    }

    /// Returns the counter's shared memory to the pool heap. Must be the
    /// last use; only valid for counters created with [`Ref::init`].
    pub fn dispose(self) -> Result<()> {
        self.pool.deallocate(self.off, true)
    }

    /// Consumes one death notice, returning the count before. Watchers
    /// use this to skip redundant notifications.
    pub(crate) fn dead_dec(&self) -> u32 {
        self.shared().dead.fetch_sub(1, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ref")
            .field("pool", &self.pool.pool_id())
            .field("off", &self.off)
            .finish()
    }
}
