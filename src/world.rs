//! Worlds: coordination sessions shared by a set of processes.
//!
//! The process creating a world becomes its master (fusion id 1) and owns
//! the main pool (pool id 0), whose segment carries the [`WorldHeader`]
//! right behind the pool metadata: magic/version, the global pool table,
//! monotonic id wells and a small ring of pending call notices. Further
//! processes join by mapping the main pool's backing file, named
//! `<tmpfs>/fusion.<world_index>.0`.

use std::collections::HashMap;
use std::mem::offset_of;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::WorldConfig;
use crate::error::{Error, Result};
use crate::shm::pool::{self, ShmPool};
use crate::skirmish::{Skirmish, SkirmishShared};

const WORLD_MAGIC: u32 = 0x4653_5744; // "FSWD"
const WORLD_VERSION: u32 = 0x0009_0000;

/// Fixed capacity of the global pool table.
pub const MAX_POOLS: usize = 16;

/// Capacity of the pending call ring.
const PENDING_RING: usize = 256;

/// One entry of the global pool table. `active` is the publication flag;
/// the other fields are written under the table skirmish before it is set.
#[repr(C)]
struct PoolSlot {
    active: AtomicU32,
    pool_id: u32,
    max_size: u32,
    _reserved: u32,
}

/// Shared world state, living in the main pool's `extra` region.
#[repr(C)]
struct WorldHeader {
    magic: u32,
    version: u32,
    world_index: u32,
    _pad: u32,
    table_lock: SkirmishShared,
    next_pool_id: AtomicU32,
    next_skirmish_id: AtomicU32,
    next_call_id: AtomicU32,
    _pad2: u32,
    next_fusion_id: AtomicU64,
    pools: [PoolSlot; MAX_POOLS],
    /// Call notices that could not be dispatched locally: producers
    /// reserve a slot by advancing `pending_tail`, consumers claim one by
    /// advancing `pending_head` and spin briefly until the producer's
    /// value (never 0) lands.
    pending_head: AtomicU32,
    pending_tail: AtomicU32,
    pending: [AtomicU64; PENDING_RING],
}

const TABLE_LOCK_OFF: u32 = offset_of!(WorldHeader, table_lock) as u32;

/// Handler invoked when a watched reference hits zero.
pub type CallHandler = Arc<dyn Fn(u32) + Send + Sync>;

pub(crate) struct WorldInner {
    cfg: WorldConfig,
    index: u32,
    fusion_id: u64,
    main: ShmPool,
    world_off: u32,
    table_lock: Skirmish,
    calls: Mutex<HashMap<u32, CallHandler>>,
    pools: Mutex<HashMap<u32, ShmPool>>,
}

/// Handle to a world. Clones share the underlying state.
#[derive(Clone)]
pub struct World {
    inner: Arc<WorldInner>,
}

fn pool_path(cfg: &WorldConfig, index: u32, pool_id: u32) -> PathBuf {
    cfg.tmpfs_dir.join(format!("fusion.{index}.{pool_id}"))
}

impl World {
    /// Creates a world, becoming its master (fusion id 1). Fails when a
    /// world with this index already exists on the tmpfs.
    pub fn create(index: u32, cfg: WorldConfig) -> Result<World> {
        let path = pool_path(&cfg, index, 0);
        if path.exists() {
            return Err(Error::Busy("world already exists at this index"));
        }

        let extra = std::mem::size_of::<WorldHeader>() as u32;
        // Skirmish ids 1 and 2 are fixed: main pool lock and table lock.
        let (main, world_off) = ShmPool::create(
            &path,
            0,
            cfg.main_pool_size,
            "main pool",
            1,
            1,
            extra,
            &cfg,
        )?;

        // SAFETY: the extra region is fresh, in bounds and 8-aligned.
        unsafe {
            SkirmishShared::init_at(main.segment(), world_off + TABLE_LOCK_OFF, 2);
            let wh = &mut *main.segment().at::<WorldHeader>(world_off);
            wh.magic = WORLD_MAGIC;
            wh.version = WORLD_VERSION;
            wh.world_index = index;
            wh.next_pool_id = AtomicU32::new(1);
            wh.next_skirmish_id = AtomicU32::new(3);
            wh.next_call_id = AtomicU32::new(1);
            wh.next_fusion_id = AtomicU64::new(2);
            let slot = &mut wh.pools[0];
            slot.pool_id = 0;
            slot.max_size = cfg.main_pool_size;
            slot.active = AtomicU32::new(1);
        }

        info!(index, main_pool_size = cfg.main_pool_size, "created world");
        Ok(World {
            inner: Arc::new(WorldInner {
                table_lock: Skirmish::from_shared(
                    main.segment_arc(),
                    world_off + TABLE_LOCK_OFF,
                    "pool table",
                ),
                cfg,
                index,
                fusion_id: 1,
                main,
                world_off,
                calls: Mutex::new(HashMap::new()),
                pools: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Joins an existing world, drawing a fresh fusion id from the shared
    /// well.
    pub fn join(index: u32, cfg: WorldConfig) -> Result<World> {
        let path = pool_path(&cfg, index, 0);
        let main = ShmPool::attach(&path, &cfg)?;
        let world_off = pool::extra_off();

        // SAFETY: the world header sits in the validated main pool.
        let fusion_id = unsafe {
            let wh = &*main.segment().at::<WorldHeader>(world_off);
            if wh.magic != WORLD_MAGIC {
                return Err(Error::InvalidSegment(format!(
                    "world {index} has bad magic {:#x}",
                    wh.magic
                )));
            }
            if wh.version != WORLD_VERSION {
                return Err(Error::InvalidSegment(format!(
                    "world {index} has version {:#x}, expected {WORLD_VERSION:#x}",
                    wh.version
                )));
            }
            if wh.world_index != index {
                return Err(Error::InvalidSegment(format!(
                    "world file for index {index} claims index {}",
                    wh.world_index
                )));
            }
            wh.next_fusion_id.fetch_add(1, Ordering::AcqRel)
        };

        info!(index, fusion_id, "joined world");
        Ok(World {
            inner: Arc::new(WorldInner {
                table_lock: Skirmish::from_shared(
                    main.segment_arc(),
                    world_off + TABLE_LOCK_OFF,
                    "pool table",
                ),
                cfg,
                index,
                fusion_id,
                main,
                world_off,
                calls: Mutex::new(HashMap::new()),
                pools: Mutex::new(HashMap::new()),
            }),
        })
    }

    fn header_ptr(&self) -> *mut WorldHeader {
        // SAFETY: validated at create/join; in bounds of the main pool.
        unsafe {
            self.inner
                .main
                .segment()
                .at::<WorldHeader>(self.inner.world_off)
        }
    }

    fn header(&self) -> &WorldHeader {
        // SAFETY: validated at create/join; the main pool mapping lives
        // as long as the world handle.
        unsafe {
            &*self
                .inner
                .main
                .segment()
                .at::<WorldHeader>(self.inner.world_off)
        }
    }

    /// Index of this world.
    pub fn world_index(&self) -> u32 {
        self.inner.index
    }

    /// This process's fusionee id within the world.
    pub fn fusion_id(&self) -> u64 {
        self.inner.fusion_id
    }

    /// Whether this process created the world.
    pub fn is_master(&self) -> bool {
        self.inner.fusion_id == 1
    }

    /// The world's main pool (pool id 0).
    pub fn main_pool(&self) -> &ShmPool {
        &self.inner.main
    }

    /// The configuration the world was created or joined with.
    pub fn config(&self) -> &WorldConfig {
        &self.inner.cfg
    }

    pub(crate) fn alloc_skirmish_id(&self) -> u32 {
        self.header().next_skirmish_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates a pool, reserving a slot in the global table.
    pub fn create_pool(&self, name: &str, max_size: u32) -> Result<ShmPool> {
        self.inner.table_lock.prevail()?;
        let result = self.create_pool_locked(name, max_size);
        self.inner.table_lock.dismiss()?;
        result
    }

    fn create_pool_locked(&self, name: &str, max_size: u32) -> Result<ShmPool> {
        let wh = self.header();
        let slot_index = (0..MAX_POOLS)
            .find(|&i| wh.pools[i].active.load(Ordering::Acquire) == 0)
            .ok_or(Error::LimitExceeded("pool table full"))?;

        let pool_id = wh.next_pool_id.fetch_add(1, Ordering::Relaxed);
        let lock_id = self.alloc_skirmish_id();
        let path = pool_path(&self.inner.cfg, self.inner.index, pool_id);

        let (pool, _) = ShmPool::create(
            &path,
            pool_id,
            max_size,
            name,
            self.inner.fusion_id,
            lock_id,
            0,
            &self.inner.cfg,
        )?;

        // Publish the slot last.
        // SAFETY: slot fields are ours to write under the table lock.
        unsafe {
            let slot = std::ptr::addr_of_mut!((*self.header_ptr()).pools[slot_index]);
            (*slot).pool_id = pool_id;
            (*slot).max_size = max_size;
        }
        wh.pools[slot_index].active.store(1, Ordering::Release);

        self.inner
            .pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pool_id, pool.clone());
        debug!(pool_id, name, max_size, "pool registered");
        Ok(pool)
    }

    /// Attaches to a pool created by another fusionee.
    pub fn attach_pool(&self, pool_id: u32) -> Result<ShmPool> {
        if pool_id == 0 {
            return Ok(self.inner.main.clone());
        }
        if let Some(pool) = self
            .inner
            .pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pool_id)
        {
            return Ok(pool.clone());
        }

        self.inner.table_lock.prevail()?;
        let wh = self.header();
        let found = (0..MAX_POOLS).any(|i| {
            wh.pools[i].active.load(Ordering::Acquire) != 0 && wh.pools[i].pool_id == pool_id
        });
        let result = if found {
            ShmPool::attach(
                &pool_path(&self.inner.cfg, self.inner.index, pool_id),
                &self.inner.cfg,
            )
        } else {
            Err(Error::NotFound("no pool with this id"))
        };
        self.inner.table_lock.dismiss()?;

        let pool = result?;
        self.inner
            .pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pool_id, pool.clone());
        Ok(pool)
    }

    /// Drops this process's handle on a pool. The shared pool lives on.
    pub fn detach_pool(&self, pool: ShmPool) {
        self.inner
            .pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pool.pool_id());
        drop(pool);
    }

    /// Destroys a pool. Only its creator may do this; the table slot is
    /// released and the backing file unlinked.
    pub fn destroy_pool(&self, pool: ShmPool) -> Result<()> {
        if pool.pool_id() == 0 {
            return Err(Error::invalid("the main pool lives as long as the world"));
        }
        if pool.creator_fusion_id() != self.inner.fusion_id {
            return Err(Error::AccessDenied("only the creator may destroy a pool"));
        }

        self.inner.table_lock.prevail()?;
        let wh = self.header();
        for i in 0..MAX_POOLS {
            if wh.pools[i].active.load(Ordering::Acquire) != 0
                && wh.pools[i].pool_id == pool.pool_id()
            {
                wh.pools[i].active.store(0, Ordering::Release);
            }
        }
        self.inner.table_lock.dismiss()?;

        self.inner
            .pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pool.pool_id());
        pool.dismantle()
    }

    /// Registers a call handler, returning its world-unique call id.
    pub fn register_call(&self, handler: CallHandler) -> u32 {
        let id = self.header().next_call_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handler);
        id
    }

    /// Registers a handler under an id already allocated elsewhere, as
    /// done by every process attaching to an object pool.
    pub(crate) fn register_call_as(&self, id: u32, handler: CallHandler) {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handler);
    }

    /// Removes a call handler registration.
    pub fn unregister_call(&self, id: u32) {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Executes the call locally if this process has the handler, else
    /// parks the notice in the shared pending ring for whoever has it.
    pub(crate) fn call(&self, call_id: u32, arg: u32) {
        let handler = self
            .inner
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&call_id)
            .cloned();
        match handler {
            Some(handler) => handler(arg),
            None => {
                debug!(call_id, arg, "no local handler, parking call notice");
                self.push_pending(call_id, arg);
            }
        }
    }

    fn push_pending(&self, call_id: u32, arg: u32) {
        let wh = self.header();
        let value = ((call_id as u64) << 32) | arg as u64;
        loop {
            let tail = wh.pending_tail.load(Ordering::Acquire);
            let head = wh.pending_head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) >= PENDING_RING as u32 {
                warn!(call_id, arg, "pending call ring full, notice dropped");
                return;
            }
            if wh
                .pending_tail
                .compare_exchange_weak(tail, tail.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                wh.pending[tail as usize % PENDING_RING].store(value, Ordering::Release);
                return;
            }
        }
    }

    fn pop_pending(&self) -> Option<(u32, u32)> {
        let wh = self.header();
        loop {
            let head = wh.pending_head.load(Ordering::Acquire);
            let tail = wh.pending_tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            if wh
                .pending_head
                .compare_exchange_weak(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let slot = &wh.pending[head as usize % PENDING_RING];
                // The producer that reserved this slot may not have
                // stored yet; values are never 0.
                loop {
                    let value = slot.swap(0, Ordering::AcqRel);
                    if value != 0 {
                        return Some(((value >> 32) as u32, value as u32));
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Dispatches parked call notices this process has handlers for.
    /// Notices for handlers living elsewhere are re-parked. Returns the
    /// number of notices dispatched.
    pub fn process_pending_calls(&self) -> usize {
        let mut dispatched = 0;
        let mut foreign = Vec::new();
        while let Some((call_id, arg)) = self.pop_pending() {
            let handler = self
                .inner
                .calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(&call_id)
                .cloned();
            match handler {
                Some(handler) => {
                    handler(arg);
                    dispatched += 1;
                }
                None => foreign.push((call_id, arg)),
            }
        }
        for (call_id, arg) in foreign {
            self.push_pending(call_id, arg);
        }
        dispatched
    }
}

impl Drop for WorldInner {
    fn drop(&mut self) {
        if self.fusion_id == 1 {
            // The world ends with its master: unlink the main pool so a
            // fresh master can take the index. Attached processes keep
            // their mappings until they drop them.
            info!(index = self.index, "master leaving, world ends");
            self.main.segment().unlink();
        }
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("index", &self.inner.index)
            .field("fusion_id", &self.inner.fusion_id)
            .finish()
    }
}
