//! Skirmishes: recursive locks shared between processes.
//!
//! A skirmish arbitrates between threads of all processes attached to a
//! world. The shared flavor keeps its state in a pool segment: a futex
//! word (0 free, 1 locked, 2 locked with waiters), the owner's pid/tid,
//! a recursion count and a notify sequence word for condition-style
//! wait/notify. Waiters block on the futex in bounded slices; every
//! timeout they probe the recorded owner with a null signal and break
//! the lock if the owning process is gone, so a crashed holder never
//! wedges the world.
//!
//! The local flavor serves single-process worlds with plain process
//! memory, `std::sync::Mutex` and condvars, same semantics.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use rustix::io::Errno;
use rustix::thread::futex;
use rustix::time::Timespec;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::shm::pool::ShmPool;
use crate::shm::segment::Segment;
use crate::world::World;

/// Interval between liveness probes while blocked on a held lock.
const PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Permission bits grantable to another fusionee. The builtin backend
/// records no per-fusionee grants; the constants exist for API parity
/// with secure setups.
pub mod permissions {
    /// Allow blocking acquisition.
    pub const PREVAIL: u32 = 0x01;
    /// Allow non-blocking acquisition.
    pub const SWOOP: u32 = 0x02;
    /// Allow releasing.
    pub const DISMISS: u32 = 0x04;
    /// Allow wait/notify.
    pub const WAIT_NOTIFY: u32 = 0x08;
    /// Allow destruction.
    pub const DESTROY: u32 = 0x10;
    /// All of the above.
    pub const ALL: u32 = 0x1f;
}

pub(crate) fn current_pid() -> u32 {
    rustix::process::getpid().as_raw_nonzero().get() as u32
}

pub(crate) fn current_tid() -> u32 {
    rustix::thread::gettid().as_raw_nonzero().get() as u32
}

/// Whether the process with the given pid is gone.
pub(crate) fn process_dead(pid: u32) -> bool {
    match rustix::process::Pid::from_raw(pid as i32) {
        Some(pid) => matches!(
            rustix::process::test_kill_process(pid),
            Err(Errno::SRCH)
        ),
        None => true,
    }
}

fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|d| Timespec {
        tv_sec: d.as_secs() as i64,
        tv_nsec: d.subsec_nanos() as i64,
    });
    // Shared futex (no PRIVATE flag): waiters may sit in other processes.
    let _ = futex::wait(word, futex::Flags::empty(), expected, ts.as_ref());
}

fn futex_wake(word: &AtomicU32, count: u32) {
    let _ = futex::wake(word, futex::Flags::empty(), count);
}

/// Shared lock state, embedded in pool metadata or allocated from a pool
/// heap. All fields are atomics so any process may inspect them; `word`
/// carries the futex protocol.
#[repr(C)]
pub(crate) struct SkirmishShared {
    word: AtomicU32,
    owner_pid: AtomicU32,
    owner_tid: AtomicU32,
    count: AtomicU32,
    notify_seq: AtomicU32,
    destroyed: AtomicU32,
    id: u32,
    _reserved: u32,
}

impl SkirmishShared {
    /// Initializes lock state in place. The memory may be recycled heap
    /// memory, so every field is written.
    ///
    /// # Safety
    ///
    /// `off` must point at `size_of::<SkirmishShared>()` bytes inside
    /// `seg`, 8-aligned, not concurrently in use as a live lock.
    pub unsafe fn init_at(seg: &Segment, off: u32, id: u32) {
        // SAFETY: caller guarantees bounds, alignment and exclusivity.
        let s = unsafe { &mut *seg.at::<SkirmishShared>(off) };
        *s = SkirmishShared {
            word: AtomicU32::new(0),
            owner_pid: AtomicU32::new(0),
            owner_tid: AtomicU32::new(0),
            count: AtomicU32::new(0),
            notify_seq: AtomicU32::new(0),
            destroyed: AtomicU32::new(0),
            id,
            _reserved: 0,
        };
    }
}

/// Backend interface shared by the builtin (cross-process) and local
/// implementations.
pub(crate) trait LockOps: Send + Sync {
    fn prevail(&self) -> Result<()>;
    fn swoop(&self) -> Result<()>;
    fn dismiss(&self) -> Result<()>;
    fn wait(&self, timeout_ms: u32) -> Result<()>;
    fn notify(&self) -> Result<()>;
    fn destroy(&self) -> Result<()>;
    fn lock_count(&self) -> Result<u32>;
    fn id(&self) -> u32;
}

/// Futex-based lock over shared memory.
struct BuiltinLock {
    seg: Arc<Segment>,
    off: u32,
}

impl BuiltinLock {
    #[inline]
    fn shared(&self) -> &SkirmishShared {
        // SAFETY: off points at an initialized SkirmishShared; the Arc
        // keeps the mapping alive.
        unsafe { &*self.seg.at::<SkirmishShared>(self.off) }
    }

    /// Breaks the lock if the recorded owner process no longer exists.
    fn reap_dead_owner(&self) {
        let s = self.shared();
        let pid = s.owner_pid.load(Ordering::Relaxed);
        if pid == 0 || pid == current_pid() || !process_dead(pid) {
            return;
        }
        // Claim the break by swinging owner_pid away from the dead pid
        // first. Exactly one racing breaker wins, and until the winner
        // clears `word` below no new owner can slip in and have its
        // state clobbered by the remaining stores.
        if s
            .owner_pid
            .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        warn!(
            skirmish = s.id,
            owner_pid = pid,
            "lock owner vanished, breaking lock"
        );
        s.count.store(0, Ordering::Relaxed);
        s.owner_tid.store(0, Ordering::Relaxed);
        s.word.store(0, Ordering::Release);
        futex_wake(&s.word, u32::MAX);
    }

    fn holds(&self) -> bool {
        let s = self.shared();
        s.owner_pid.load(Ordering::Relaxed) == current_pid()
            && s.owner_tid.load(Ordering::Relaxed) == current_tid()
    }

    fn take(&self) {
        let s = self.shared();
        s.owner_pid.store(current_pid(), Ordering::Relaxed);
        s.owner_tid.store(current_tid(), Ordering::Relaxed);
        s.count.store(1, Ordering::Relaxed);
    }

    /// Releases the lock completely, returning the recursion depth held.
    fn release_all(&self) -> u32 {
        let s = self.shared();
        let depth = s.count.load(Ordering::Relaxed);
        s.count.store(0, Ordering::Relaxed);
        s.owner_tid.store(0, Ordering::Relaxed);
        s.owner_pid.store(0, Ordering::Relaxed);
        if s.word.swap(0, Ordering::Release) == 2 {
            futex_wake(&s.word, 1);
        }
        depth
    }
}

impl LockOps for BuiltinLock {
    fn prevail(&self) -> Result<()> {
        let s = self.shared();
        loop {
            if s.destroyed.load(Ordering::Acquire) != 0 {
                return Err(Error::Destroyed("skirmish"));
            }
            if s
                .word
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.take();
                return Ok(());
            }
            if self.holds() {
                s.count.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            // Announce contention, then block a bounded slice so the
            // owner liveness probe runs even if the wakeup is lost.
            let _ = s
                .word
                .compare_exchange(1, 2, Ordering::Relaxed, Ordering::Relaxed);
            if s.word.load(Ordering::Relaxed) != 0 {
                futex_wait(&s.word, 2, Some(PROBE_INTERVAL));
                self.reap_dead_owner();
            }
        }
    }

    fn swoop(&self) -> Result<()> {
        let s = self.shared();
        loop {
            if s.destroyed.load(Ordering::Acquire) != 0 {
                return Err(Error::Destroyed("skirmish"));
            }
            if s
                .word
                .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.take();
                return Ok(());
            }
            if self.holds() {
                s.count.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            self.reap_dead_owner();
            if s.word.load(Ordering::Relaxed) != 0 {
                return Err(Error::Busy("skirmish held elsewhere"));
            }
        }
    }

    fn dismiss(&self) -> Result<()> {
        let s = self.shared();
        if s.destroyed.load(Ordering::Acquire) != 0 {
            return Err(Error::Destroyed("skirmish"));
        }
        if !self.holds() {
            return Err(Error::AccessDenied("dismissing a lock not held"));
        }
        let count = s.count.load(Ordering::Relaxed);
        if count > 1 {
            s.count.store(count - 1, Ordering::Relaxed);
            return Ok(());
        }
        self.release_all();
        Ok(())
    }

    fn wait(&self, timeout_ms: u32) -> Result<()> {
        let s = self.shared();
        if s.destroyed.load(Ordering::Acquire) != 0 {
            return Err(Error::Destroyed("skirmish"));
        }
        if !self.holds() {
            return Err(Error::AccessDenied("waiting on a lock not held"));
        }

        let seq = s.notify_seq.load(Ordering::Acquire);
        let deadline =
            (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        let depth = self.release_all();

        let mut timed_out = false;
        loop {
            if s.destroyed.load(Ordering::Acquire) != 0 {
                break;
            }
            if s.notify_seq.load(Ordering::Acquire) != seq {
                break;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        timed_out = true;
                        break;
                    }
                    Some((deadline - now).min(PROBE_INTERVAL * 10))
                }
                None => Some(PROBE_INTERVAL * 10),
            };
            futex_wait(&s.notify_seq, seq, slice);
        }

        // Reacquire at the depth held before, even on timeout. Only
        // destruction returns without the lock.
        self.prevail()?;
        s.count.store(depth, Ordering::Relaxed);
        if timed_out {
            return Err(Error::Timeout("skirmish notification"));
        }
        Ok(())
    }

    fn notify(&self) -> Result<()> {
        let s = self.shared();
        if s.destroyed.load(Ordering::Acquire) != 0 {
            return Err(Error::Destroyed("skirmish"));
        }
        s.notify_seq.fetch_add(1, Ordering::Release);
        futex_wake(&s.notify_seq, u32::MAX);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        let s = self.shared();
        if s.destroyed.swap(1, Ordering::AcqRel) != 0 {
            return Err(Error::Destroyed("skirmish"));
        }
        debug!(skirmish = s.id, "destroying skirmish");
        s.notify_seq.fetch_add(1, Ordering::Release);
        futex_wake(&s.notify_seq, u32::MAX);
        futex_wake(&s.word, u32::MAX);
        Ok(())
    }

    fn lock_count(&self) -> Result<u32> {
        let s = self.shared();
        if s.destroyed.load(Ordering::Acquire) != 0 {
            return Err(Error::Destroyed("skirmish"));
        }
        Ok(s.count.load(Ordering::Relaxed))
    }

    fn id(&self) -> u32 {
        self.shared().id
    }
}

/// Single-process lock state.
struct LocalState {
    owner: Option<ThreadId>,
    depth: u32,
    seq: u64,
    destroyed: bool,
}

/// Recursive lock over process memory, for worlds without other
/// processes attached.
struct LocalLock {
    id: u32,
    state: Mutex<LocalState>,
    lock_cv: Condvar,
    notify_cv: Condvar,
}

impl LocalLock {
    fn new(id: u32) -> Self {
        LocalLock {
            id,
            state: Mutex::new(LocalState {
                owner: None,
                depth: 0,
                seq: 0,
                destroyed: false,
            }),
            lock_cv: Condvar::new(),
            notify_cv: Condvar::new(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LockOps for LocalLock {
    fn prevail(&self) -> Result<()> {
        let me = std::thread::current().id();
        let mut st = self.lock_state();
        loop {
            if st.destroyed {
                return Err(Error::Destroyed("skirmish"));
            }
            match st.owner {
                None => {
                    st.owner = Some(me);
                    st.depth = 1;
                    return Ok(());
                }
                Some(owner) if owner == me => {
                    st.depth += 1;
                    return Ok(());
                }
                _ => {
                    st = self
                        .lock_cv
                        .wait(st)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }
    }

    fn swoop(&self) -> Result<()> {
        let me = std::thread::current().id();
        let mut st = self.lock_state();
        if st.destroyed {
            return Err(Error::Destroyed("skirmish"));
        }
        match st.owner {
            None => {
                st.owner = Some(me);
                st.depth = 1;
                Ok(())
            }
            Some(owner) if owner == me => {
                st.depth += 1;
                Ok(())
            }
            _ => Err(Error::Busy("skirmish held elsewhere")),
        }
    }

    fn dismiss(&self) -> Result<()> {
        let me = std::thread::current().id();
        let mut st = self.lock_state();
        if st.destroyed {
            return Err(Error::Destroyed("skirmish"));
        }
        if st.owner != Some(me) {
            return Err(Error::AccessDenied("dismissing a lock not held"));
        }
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = None;
            self.lock_cv.notify_one();
        }
        Ok(())
    }

    fn wait(&self, timeout_ms: u32) -> Result<()> {
        let me = std::thread::current().id();
        let mut st = self.lock_state();
        if st.destroyed {
            return Err(Error::Destroyed("skirmish"));
        }
        if st.owner != Some(me) {
            return Err(Error::AccessDenied("waiting on a lock not held"));
        }

        let depth = st.depth;
        st.owner = None;
        st.depth = 0;
        self.lock_cv.notify_one();

        let seq = st.seq;
        let deadline =
            (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        let mut timed_out = false;
        while !st.destroyed && st.seq == seq {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        timed_out = true;
                        break;
                    }
                    let (g, _) = self
                        .notify_cv
                        .wait_timeout(st, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    st = g;
                }
                None => {
                    st = self
                        .notify_cv
                        .wait(st)
                        .unwrap_or_else(|e| e.into_inner());
                }
            }
        }

        // Reacquire, preserving the recursion depth held before.
        loop {
            if st.destroyed {
                return Err(Error::Destroyed("skirmish"));
            }
            if st.owner.is_none() {
                st.owner = Some(me);
                st.depth = depth;
                break;
            }
            st = self
                .lock_cv
                .wait(st)
                .unwrap_or_else(|e| e.into_inner());
        }

        if timed_out {
            return Err(Error::Timeout("skirmish notification"));
        }
        Ok(())
    }

    fn notify(&self) -> Result<()> {
        let mut st = self.lock_state();
        if st.destroyed {
            return Err(Error::Destroyed("skirmish"));
        }
        st.seq += 1;
        self.notify_cv.notify_all();
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        let mut st = self.lock_state();
        if st.destroyed {
            return Err(Error::Destroyed("skirmish"));
        }
        st.destroyed = true;
        self.lock_cv.notify_all();
        self.notify_cv.notify_all();
        Ok(())
    }

    fn lock_count(&self) -> Result<u32> {
        let st = self.lock_state();
        if st.destroyed {
            return Err(Error::Destroyed("skirmish"));
        }
        Ok(st.depth)
    }

    fn id(&self) -> u32 {
        self.id
    }
}

/// Ids for local skirmishes come from a process-local well, high range
/// so they never collide with world-allocated ids.
static LOCAL_IDS: AtomicU32 = AtomicU32::new(0x8000_0000);

/// A recursive lock arbitrating between all processes of a world.
#[derive(Clone)]
pub struct Skirmish {
    ops: Arc<dyn LockOps>,
    name: Arc<str>,
}

impl Skirmish {
    /// Creates a skirmish in shared memory, allocated from `pool`'s heap.
    pub fn new(world: &World, pool: &ShmPool, name: &str) -> Result<Skirmish> {
        let id = world.alloc_skirmish_id();
        let size = std::mem::size_of::<SkirmishShared>();
        let off = pool.allocate(size, true, true)?;
        // SAFETY: the allocation is in bounds, 8-aligned (allocator
        // granularity) and exclusively ours until published.
        unsafe { SkirmishShared::init_at(pool.segment(), off, id) };
        debug!(name, id, off, "created shared skirmish");
        Ok(Skirmish {
            ops: Arc::new(BuiltinLock {
                seg: pool.segment_arc(),
                off,
            }),
            name: name.into(),
        })
    }

    /// Creates a process-local skirmish. Same semantics, no shared state.
    pub fn new_local(name: &str) -> Skirmish {
        let id = LOCAL_IDS.fetch_add(1, Ordering::Relaxed);
        Skirmish {
            ops: Arc::new(LocalLock::new(id)),
            name: name.into(),
        }
    }

    /// View of lock state already initialized at `off` inside `seg`
    /// (embedded in pool or object-pool metadata).
    pub(crate) fn from_shared(seg: Arc<Segment>, off: u32, name: &str) -> Skirmish {
        Skirmish {
            ops: Arc::new(BuiltinLock { seg, off }),
            name: name.into(),
        }
    }

    /// Acquires the lock, blocking until available. Recursive for the
    /// owning thread.
    pub fn prevail(&self) -> Result<()> {
        self.ops.prevail()
    }

    /// Acquires the lock without blocking, failing with [`Error::Busy`]
    /// when another thread holds it.
    pub fn swoop(&self) -> Result<()> {
        self.ops.swoop()
    }

    /// Releases one level of ownership.
    pub fn dismiss(&self) -> Result<()> {
        self.ops.dismiss()
    }

    /// Releases the lock and blocks until [`notify`](Self::notify) or the
    /// timeout (`0` = wait forever). Returns holding the lock again, also
    /// on [`Error::Timeout`]; only [`Error::Destroyed`] returns without it.
    pub fn wait(&self, timeout_ms: u32) -> Result<()> {
        self.ops.wait(timeout_ms)
    }

    /// Wakes all current waiters.
    pub fn notify(&self) -> Result<()> {
        self.ops.notify()
    }

    /// Destroys the lock. Blocked threads and waiters fail with
    /// [`Error::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        self.ops.destroy()
    }

    /// Current recursion depth (0 when free). Unreliable by nature: the
    /// value may be stale as soon as it is read.
    pub fn lock_count(&self) -> Result<u32> {
        self.ops.lock_count()
    }

    /// Grants usage permissions to another fusionee. The builtin backend
    /// enforces none; this records the intent for secure setups.
    pub fn add_permissions(&self, fusion_id: u64, mask: u32) -> Result<()> {
        debug!(name = %self.name, fusion_id, mask, "permissions granted");
        Ok(())
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn order_key(&self) -> u32 {
        self.ops.id()
    }
}

impl std::fmt::Debug for Skirmish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Skirmish")
            .field("name", &self.name)
            .field("id", &self.ops.id())
            .finish()
    }
}

/// Acquires several skirmishes at once without deadlocking against other
/// multi-acquirers: locks are taken in a stable global order. On failure
/// the acquired prefix is released in reverse order and the error
/// returned.
pub fn prevail_multi(locks: &[&Skirmish]) -> Result<()> {
    let mut order: SmallVec<[&Skirmish; 8]> = locks.iter().copied().collect();
    order.sort_by_key(|s| s.order_key());
    for (i, lock) in order.iter().enumerate() {
        if let Err(err) = lock.prevail() {
            for held in order[..i].iter().rev() {
                let _ = held.dismiss();
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Releases several skirmishes, in reverse acquisition order. The first
/// failure is reported after all dismissals were attempted.
pub fn dismiss_multi(locks: &[&Skirmish]) -> Result<()> {
    let mut order: SmallVec<[&Skirmish; 8]> = locks.iter().copied().collect();
    order.sort_by_key(|s| s.order_key());
    let mut result = Ok(());
    for lock in order.iter().rev() {
        if let Err(err) = lock.dismiss() {
            if result.is_ok() {
                result = Err(err);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_segment(tag: &str) -> Arc<Segment> {
        let pid = current_pid();
        let path = PathBuf::from(std::env::temp_dir())
            .join(format!("fusion-skirmish-{tag}-{pid}"));
        Arc::new(Segment::create(&path, 4096, None, None).unwrap())
    }

    fn shared_lock(tag: &str) -> (Skirmish, Arc<Segment>) {
        let seg = temp_segment(tag);
        unsafe { SkirmishShared::init_at(&seg, 64, 1) };
        (Skirmish::from_shared(seg.clone(), 64, tag), seg)
    }

    #[test]
    fn local_lock_is_recursive() {
        let s = Skirmish::new_local("recursive");
        s.prevail().unwrap();
        s.prevail().unwrap();
        assert_eq!(s.lock_count().unwrap(), 2);
        s.dismiss().unwrap();
        assert_eq!(s.lock_count().unwrap(), 1);
        s.dismiss().unwrap();
        assert_eq!(s.lock_count().unwrap(), 0);
    }

    #[test]
    fn dismiss_without_hold_is_denied() {
        let s = Skirmish::new_local("stranger");
        s.prevail().unwrap();
        let s2 = s.clone();
        let h = std::thread::spawn(move || s2.dismiss());
        assert!(matches!(h.join().unwrap(), Err(Error::AccessDenied(_))));
        s.dismiss().unwrap();
    }

    #[test]
    fn swoop_fails_busy_across_threads() {
        let (s, seg) = shared_lock("swoop");
        s.prevail().unwrap();
        let s2 = s.clone();
        let h = std::thread::spawn(move || s2.swoop());
        assert!(matches!(h.join().unwrap(), Err(Error::Busy(_))));
        s.dismiss().unwrap();
        seg.unlink();
    }

    #[test]
    fn builtin_mutual_exclusion() {
        let (s, seg) = shared_lock("mutex");
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = s.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    s.prevail().unwrap();
                    // Non-atomic read-modify-write guarded by the lock.
                    let v = counter.load(Ordering::Relaxed);
                    std::hint::spin_loop();
                    counter.store(v + 1, Ordering::Relaxed);
                    s.dismiss().unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 2000);
        seg.unlink();
    }

    #[test]
    fn dead_owner_lock_is_broken() {
        let (s, seg) = shared_lock("dead-owner");

        // Forge a holder whose pid cannot exist (beyond PID_MAX_LIMIT).
        {
            let raw = unsafe { &*seg.at::<SkirmishShared>(64) };
            raw.word.store(1, Ordering::Relaxed);
            raw.owner_pid.store(0x7fff_fff0, Ordering::Relaxed);
            raw.owner_tid.store(0x7fff_fff0, Ordering::Relaxed);
            raw.count.store(1, Ordering::Relaxed);
        }

        // Both the non-blocking and blocking paths must recover.
        s.swoop().unwrap();
        s.dismiss().unwrap();
        s.prevail().unwrap();
        s.dismiss().unwrap();
        seg.unlink();
    }

    #[test]
    fn dead_owner_break_admits_single_recoverer() {
        let (s, seg) = shared_lock("race-reap");

        {
            let raw = unsafe { &*seg.at::<SkirmishShared>(64) };
            raw.word.store(1, Ordering::Relaxed);
            raw.owner_pid.store(0x7fff_fff0, Ordering::Relaxed);
            raw.owner_tid.store(0x7fff_fff0, Ordering::Relaxed);
            raw.count.store(1, Ordering::Relaxed);
        }

        // All four race to break the dead owner's lock; exactly one may
        // end up owning it, the rest must see it busy.
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = s.clone();
                std::thread::spawn(move || s.swoop().is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(successes, 1);
        seg.unlink();
    }

    #[test]
    fn wait_returns_holding_lock_on_notify() {
        let (s, seg) = shared_lock("notify");
        let s2 = s.clone();

        let waiter = std::thread::spawn(move || {
            s2.prevail().unwrap();
            s2.wait(0).unwrap();
            // Still holding after wakeup.
            assert_eq!(s2.lock_count().unwrap(), 1);
            s2.dismiss().unwrap();
        });

        // Give the waiter time to block, then notify.
        std::thread::sleep(Duration::from_millis(50));
        s.notify().unwrap();
        waiter.join().unwrap();
        seg.unlink();
    }

    #[test]
    fn wait_timeout_still_reacquires() {
        let (s, seg) = shared_lock("timeout");
        s.prevail().unwrap();
        let err = s.wait(30).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        // Timeout contract: lock is held again.
        assert_eq!(s.lock_count().unwrap(), 1);
        s.dismiss().unwrap();
        seg.unlink();
    }

    #[test]
    fn destroy_fails_waiters() {
        let (s, seg) = shared_lock("destroy");
        let s2 = s.clone();
        let waiter = std::thread::spawn(move || {
            s2.prevail().unwrap();
            s2.wait(0)
        });
        std::thread::sleep(Duration::from_millis(50));
        s.destroy().unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Destroyed(_))));
        assert!(matches!(s.prevail(), Err(Error::Destroyed(_))));
        seg.unlink();
    }

    #[test]
    fn multi_lock_rolls_back_on_failure() {
        let a = Skirmish::new_local("multi-a");
        let b = Skirmish::new_local("multi-b");
        let c = Skirmish::new_local("multi-c");
        c.destroy().unwrap();

        let err = prevail_multi(&[&a, &b, &c]).unwrap_err();
        assert!(matches!(err, Error::Destroyed(_)));
        // The survivors must be free again.
        assert_eq!(a.lock_count().unwrap(), 0);
        assert_eq!(b.lock_count().unwrap(), 0);
    }

    #[test]
    fn multi_lock_failure_on_first_lock_releases_nothing() {
        // Ids are monotonic, so `a` sorts first and fails first.
        let a = Skirmish::new_local("first-a");
        let b = Skirmish::new_local("first-b");
        a.destroy().unwrap();

        let err = prevail_multi(&[&a, &b]).unwrap_err();
        assert!(matches!(err, Error::Destroyed(_)));
        assert_eq!(b.lock_count().unwrap(), 0);
        b.prevail().unwrap();
        b.dismiss().unwrap();
    }

    #[test]
    fn multi_lock_avoids_deadlock_between_orders() {
        let a = Arc::new(Skirmish::new_local("order-a"));
        let b = Arc::new(Skirmish::new_local("order-b"));

        let mut handles = Vec::new();
        for flip in [false, true] {
            let a = a.clone();
            let b = b.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let locks: [&Skirmish; 2] =
                        if flip { [&b, &a] } else { [&a, &b] };
                    prevail_multi(&locks).unwrap();
                    dismiss_multi(&locks).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
