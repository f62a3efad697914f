//! Reference-counted objects living in shared memory pools.
//!
//! An object pool hands out fixed-size allocations from a shared memory
//! pool, each carrying an [`ObjectHeader`] with a world-watched reference
//! counter. When the last reference anywhere in the world drops, the
//! pool's reference watcher reclaims the object: it transitions the state
//! to DEINIT, unlinks it from the id index and runs the type-specific
//! destructor outside the pool lock. The watcher runs in whichever
//! process performed the final `down`; processes without the destructor
//! receive the notice through the world's pending ring.
//!
//! Objects additionally carry an owner list (fusionee ids allowed to
//! mutate), an access list (executable path patterns) and a lazily
//! created string-keyed property table.

use std::mem::{offset_of, size_of};
use std::sync::{Arc, Weak};

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hash::{Key, KeyKind, ShmHash};
use crate::refs::{Ref, RefShared};
use crate::shm::pool::ShmPool;
use crate::skirmish::{Skirmish, SkirmishShared};
use crate::world::{CallHandler, World};

const OBJECT_MAGIC: u32 = 0x4653_4f42; // "FSOB"
const POOL_MAGIC: u32 = 0x4653_4f50; // "FSOP"

const STATE_INIT: u32 = 0;
const STATE_ACTIVE: u32 = 1;
const STATE_DEINIT: u32 = 2;

/// Lifecycle state of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Allocated and indexed, construction not finished.
    Init,
    /// Fully constructed.
    Active,
    /// Being torn down, no longer indexed.
    Deinit,
}

/// Metadata at the start of every object allocation. The payload follows
/// directly behind; `object_size` covers both.
#[repr(C)]
struct ObjectHeader {
    magic: u32,
    id: u32,
    state: u32,
    /// Offset of the owning pool's shared state, 0 once unlinked.
    pool_off: u32,
    /// Creator-chosen identity, usually a fusionee id.
    identity: u64,
    refs: RefShared,
    /// Fusionee ids allowed to mutate: offset of a u64 array, length and
    /// capacity in entries.
    owners_off: u32,
    owners_len: u32,
    owners_cap: u32,
    /// Access patterns: offset of a u32 array of string offsets.
    access_off: u32,
    access_len: u32,
    access_cap: u32,
    /// String-keyed property table, 0 until first use.
    props_off: u32,
    _pad: u32,
}

const REF_OFF: u32 = offset_of!(ObjectHeader, refs) as u32;

/// Destructor run when an object is reclaimed. The second argument is
/// true for zombies force-destroyed by [`ObjectPool::destroy`]. Memory
/// teardown happens in the pool after the destructor returns; the
/// destructor must not free the object.
pub type ObjectDestructor = Arc<dyn Fn(&ObjectHandle, bool) + Send + Sync>;

/// Shared pool state, allocated from the owning shared memory pool.
#[repr(C)]
struct PoolShared {
    magic: u32,
    name_off: u32,
    object_size: u32,
    /// Reserved for an event channel per object; carried for layout
    /// compatibility with consumers that size their channels from it.
    message_size: u32,
    next_object_id: u32,
    call_id: u32,
    /// Offset of the id index hash.
    objects_off: u32,
    _pad: u32,
    lock: SkirmishShared,
}

const POOL_LOCK_OFF: u32 = offset_of!(PoolShared, lock) as u32;

struct PoolInner {
    world: World,
    shm: ShmPool,
    off: u32,
    lock: Skirmish,
    name: String,
    destructor: ObjectDestructor,
}

/// Handle to an object pool. Clones share the local state; other
/// processes attach via [`ObjectPool::attach`] with the pool's offset.
#[derive(Clone)]
pub struct ObjectPool {
    inner: Arc<PoolInner>,
}

/// Handle to one object. Does not itself hold a reference; use
/// [`ObjectPool::get`] or [`ObjectHandle::ref_up`] for that.
#[derive(Clone)]
pub struct ObjectHandle {
    pool: ObjectPool,
    off: u32,
    id: u32,
}

impl ObjectPool {
    /// Creates a pool inside `shm`, registering the reference watcher
    /// with the world.
    pub fn create(
        world: &World,
        shm: &ShmPool,
        name: &str,
        object_size: u32,
        message_size: u32,
        destructor: ObjectDestructor,
    ) -> Result<ObjectPool> {
        if (object_size as usize) < size_of::<ObjectHeader>() {
            return Err(Error::invalid(format!(
                "object size {object_size} below header size {}",
                size_of::<ObjectHeader>()
            )));
        }

        let off = shm.allocate(size_of::<PoolShared>(), true, true)?;
        let objects = match ShmHash::create(shm, KeyKind::Int, 0) {
            Ok(objects) => objects,
            Err(err) => {
                shm.deallocate(off, true)?;
                return Err(err);
            }
        };
        let name_off = shm.strdup(name, true)?;

        let lock_id = world.alloc_skirmish_id();
        // SAFETY: fresh zeroed allocation sized for PoolShared.
        unsafe {
            SkirmishShared::init_at(shm.segment(), off + POOL_LOCK_OFF, lock_id);
            let ps = &mut *shm.segment().at::<PoolShared>(off);
            ps.magic = POOL_MAGIC;
            ps.name_off = name_off;
            ps.object_size = object_size;
            ps.message_size = message_size;
            ps.next_object_id = 0;
            ps.objects_off = objects.offset();
        }

        let pool = ObjectPool {
            inner: Arc::new(PoolInner {
                world: world.clone(),
                shm: shm.clone(),
                off,
                lock: Skirmish::from_shared(shm.segment_arc(), off + POOL_LOCK_OFF, name),
                name: name.to_string(),
                destructor,
            }),
        };

        let call_id = world.register_call(pool.watcher());
        // SAFETY: header written above.
        unsafe { (*shm.segment().at::<PoolShared>(off)).call_id = call_id };

        debug!(name, object_size, call_id, "object pool created");
        Ok(pool)
    }

    /// Attaches to a pool created elsewhere, registering this process's
    /// copy of the destructor under the pool's shared call id.
    pub fn attach(
        world: &World,
        shm: &ShmPool,
        off: u32,
        destructor: ObjectDestructor,
    ) -> Result<ObjectPool> {
        // SAFETY: offset supplied by the pool's creator; validated below.
        let (magic, name_off, call_id) = unsafe {
            let ps = &*shm.segment().at::<PoolShared>(off);
            (ps.magic, ps.name_off, ps.call_id)
        };
        if magic != POOL_MAGIC {
            return Err(Error::InvalidSegment(format!(
                "object pool at {off:#x} has bad magic {magic:#x}"
            )));
        }

        let name = shm.read_str(name_off);
        let pool = ObjectPool {
            inner: Arc::new(PoolInner {
                world: world.clone(),
                shm: shm.clone(),
                off,
                lock: Skirmish::from_shared(shm.segment_arc(), off + POOL_LOCK_OFF, &name),
                name,
                destructor,
            }),
        };
        world.register_call_as(call_id, pool.watcher());
        Ok(pool)
    }

    fn watcher(&self) -> CallHandler {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |id| {
            if let Some(inner) = Weak::upgrade(&weak) {
                ObjectPool { inner }.reap(id);
            }
        })
    }

    fn shared(&self) -> *mut PoolShared {
        // SAFETY: validated at create/attach time.
        unsafe { self.inner.shm.segment().at::<PoolShared>(self.inner.off) }
    }

    fn objects(&self) -> ShmHash {
        let objects_off = unsafe { (*self.shared()).objects_off };
        ShmHash::from_raw(&self.inner.shm, objects_off)
    }

    fn header(&self, off: u32) -> *mut ObjectHeader {
        // SAFETY: object offsets come from our own allocations.
        unsafe { self.inner.shm.segment().at::<ObjectHeader>(off) }
    }

    fn object_ref(&self, off: u32) -> Ref {
        Ref::from_offset(&self.inner.world, &self.inner.shm, off + REF_OFF)
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Offset of the shared pool state, for [`ObjectPool::attach`] in
    /// other processes.
    pub fn offset(&self) -> u32 {
        self.inner.off
    }

    /// Size of each object including its header.
    pub fn object_size(&self) -> u32 {
        unsafe { (*self.shared()).object_size }
    }

    /// Message size the pool was created with.
    pub fn message_size(&self) -> u32 {
        unsafe { (*self.shared()).message_size }
    }

    /// Creates an object: state INIT, reference count 1, indexed by a
    /// fresh id, its counter watched by the pool.
    pub fn create_object(&self, identity: u64) -> Result<ObjectHandle> {
        self.inner.lock.prevail()?;
        let result = self.create_object_locked(identity);
        self.inner.lock.dismiss()?;
        result
    }

    fn create_object_locked(&self, identity: u64) -> Result<ObjectHandle> {
        let (object_size, call_id) = unsafe {
            let ps = &*self.shared();
            (ps.object_size, ps.call_id)
        };
        let off = self.inner.shm.allocate(object_size as usize, true, true)?;

        // SAFETY: fresh zeroed allocation; id well advanced under the
        // pool lock.
        let id = unsafe {
            let ps = &mut *self.shared();
            ps.next_object_id += 1;
            let id = ps.next_object_id;
            let hdr = &mut *self.header(off);
            hdr.magic = OBJECT_MAGIC;
            hdr.id = id;
            hdr.state = STATE_INIT;
            hdr.pool_off = self.inner.off;
            hdr.identity = identity;
            id
        };

        let r = self.object_ref(off);
        let unwind = |err: Error| -> Result<ObjectHandle> {
            let _ = r.destroy();
            self.inner.shm.deallocate(off, true)?;
            Err(err)
        };
        if let Err(err) = r.up(false) {
            return unwind(err);
        }
        if let Err(err) = r.watch(call_id, id) {
            return unwind(err);
        }
        if let Err(err) = self.objects().insert(Key::Int(id), off) {
            return unwind(err);
        }

        debug!(pool = %self.inner.name, id, identity, "object created");
        Ok(ObjectHandle {
            pool: self.clone(),
            off,
            id,
        })
    }

    /// Looks up an object and takes a local reference on it.
    pub fn get(&self, id: u32) -> Result<ObjectHandle> {
        self.inner.lock.prevail()?;
        let result = match self.objects().lookup(Key::Int(id)) {
            Some(off) => self.object_ref(off).up(false).map(|()| ObjectHandle {
                pool: self.clone(),
                off,
                id,
            }),
            None => Err(Error::NotFound("no object with this id")),
        };
        self.inner.lock.dismiss()?;
        result
    }

    /// Looks up an object without referencing it. The handle is only
    /// safe to use while the caller otherwise keeps the object alive.
    pub fn lookup(&self, id: u32) -> Result<Option<ObjectHandle>> {
        self.inner.lock.prevail()?;
        let found = self.objects().lookup(Key::Int(id));
        self.inner.lock.dismiss()?;
        Ok(found.map(|off| ObjectHandle {
            pool: self.clone(),
            off,
            id,
        }))
    }

    /// Visits every live object under the pool lock until `f` returns
    /// `false`.
    pub fn enumerate(&self, mut f: impl FnMut(&ObjectHandle) -> bool) -> Result<()> {
        self.inner.lock.prevail()?;
        self.objects().iterate(|id, off| {
            let handle = ObjectHandle {
                pool: self.clone(),
                off,
                id,
            };
            !f(&handle)
        });
        self.inner.lock.dismiss()
    }

    /// Number of live objects.
    pub fn size(&self) -> Result<u32> {
        self.inner.lock.prevail()?;
        let n = self.objects().len();
        self.inner.lock.dismiss()?;
        Ok(n)
    }

    /// Reference watcher: runs in the process that performed the final
    /// `down` on an object's counter.
    fn reap(&self, id: u32) {
        if self.inner.lock.prevail().is_err() {
            return;
        }
        let Some(off) = self.objects().lookup(Key::Int(id)) else {
            warn!(pool = %self.inner.name, id, "death notice for unindexed object");
            let _ = self.inner.lock.dismiss();
            return;
        };
        let r = self.object_ref(off);

        // Several death notices may have been coalesced; only the last
        // one proceeds.
        if r.dead_dec() > 1 {
            debug!(pool = %self.inner.name, id, "coalesced death notice skipped");
            let _ = self.inner.lock.dismiss();
            return;
        }

        match r.zero_trylock() {
            Ok(()) => {}
            Err(Error::Busy(_)) => {
                // Someone re-referenced the object; the next zero
                // transition retries.
                let _ = self.inner.lock.dismiss();
                return;
            }
            Err(_) => {
                warn!(pool = %self.inner.name, id, "object counter destroyed, unindexing");
                self.unlink(off, id);
                let _ = self.inner.lock.dismiss();
                return;
            }
        }

        // SAFETY: off indexed under the pool lock.
        let state = unsafe { (*self.header(off)).state };
        if state == STATE_INIT {
            // Half-constructed; leaking beats running the destructor on
            // it. Stays zero locked so nothing resurrects it.
            warn!(pool = %self.inner.name, id, "incomplete object dropped, leaking");
            self.unlink(off, id);
            let _ = self.inner.lock.dismiss();
            return;
        }

        // SAFETY: as above; the state transition is one way.
        unsafe { (*self.header(off)).state = STATE_DEINIT };
        self.unlink(off, id);
        let _ = self.inner.lock.dismiss();

        let handle = ObjectHandle {
            pool: self.clone(),
            off,
            id,
        };
        (self.inner.destructor)(&handle, false);
        if let Err(err) = self.teardown(off) {
            warn!(pool = %self.inner.name, id, %err, "object teardown failed");
        }
    }

    /// Removes the object from the id index and clears its pool back
    /// reference. Caller holds the pool lock.
    fn unlink(&self, off: u32, id: u32) {
        // SAFETY: off indexed under the pool lock.
        unsafe { (*self.header(off)).pool_off = 0 };
        if let Err(err) = self.objects().remove(Key::Int(id)) {
            warn!(pool = %self.inner.name, id, %err, "failed to unindex object");
        }
    }

    /// Frees everything an object allocated: owner and access vectors,
    /// property table, counter, the object itself.
    fn teardown(&self, off: u32) -> Result<()> {
        let shm = &self.inner.shm;
        // SAFETY: the object is unlinked; this process is the only user.
        let (owners_off, access_off, access_len, props_off) = unsafe {
            let hdr = &*self.header(off);
            (hdr.owners_off, hdr.access_off, hdr.access_len, hdr.props_off)
        };
        if owners_off != 0 {
            shm.deallocate(owners_off, true)?;
        }
        if access_off != 0 {
            for i in 0..access_len {
                // SAFETY: the access array holds string offsets.
                let s = unsafe { *shm.segment().at::<u32>(access_off + i * 4) };
                shm.deallocate(s, true)?;
            }
            shm.deallocate(access_off, true)?;
        }
        if props_off != 0 {
            ShmHash::from_raw(shm, props_off).destroy()?;
        }
        let _ = self.object_ref(off).destroy();
        shm.deallocate(off, true)
    }

    /// Destroys the pool, force-destroying every remaining object as a
    /// zombie. With `shutdown_info`, each leaked object is logged with
    /// its remaining reference count.
    pub fn destroy(self, shutdown_info: bool) -> Result<()> {
        self.inner.lock.prevail()?;

        let mut zombies: SmallVec<[(u32, u32); 16]> = SmallVec::new();
        self.objects().iterate(|id, off| {
            zombies.push((id, off));
            false
        });
        for &(id, off) in &zombies {
            if shutdown_info {
                let stat = self.object_ref(off).stat().unwrap_or(-1);
                let identity = unsafe { (*self.header(off)).identity };
                warn!(
                    pool = %self.inner.name,
                    id, identity, refs = stat,
                    "zombie object at pool shutdown"
                );
            }
            // SAFETY: indexed offsets, under the pool lock.
            unsafe { (*self.header(off)).state = STATE_DEINIT };
            self.unlink(off, id);
        }
        let call_id = unsafe { (*self.shared()).call_id };
        self.inner.lock.dismiss()?;

        for &(id, off) in &zombies {
            let handle = ObjectHandle {
                pool: self.clone(),
                off,
                id,
            };
            (self.inner.destructor)(&handle, true);
            self.teardown(off)?;
        }

        self.inner.world.unregister_call(call_id);
        self.objects().destroy()?;
        let name_off = unsafe { (*self.shared()).name_off };
        self.inner.shm.deallocate(name_off, true)?;
        self.inner.lock.destroy()?;
        self.inner.shm.deallocate(self.inner.off, true)?;
        debug!(pool = %self.inner.name, zombies = zombies.len(), "object pool destroyed");
        Ok(())
    }
}

impl std::fmt::Debug for ObjectPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.inner.name)
            .field("off", &self.inner.off)
            .finish()
    }
}

impl ObjectHandle {
    /// Pool-unique object id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Offset of the object within its shared memory pool.
    pub fn offset(&self) -> u32 {
        self.off
    }

    /// Identity recorded at creation.
    pub fn identity(&self) -> u64 {
        // SAFETY: header written at creation, never moved.
        unsafe { (*self.pool.header(self.off)).identity }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ObjectState {
        match unsafe { (*self.pool.header(self.off)).state } {
            STATE_INIT => ObjectState::Init,
            STATE_ACTIVE => ObjectState::Active,
            _ => ObjectState::Deinit,
        }
    }

    /// Offset of the payload behind the header.
    pub fn payload_offset(&self) -> u32 {
        self.off + size_of::<ObjectHeader>() as u32
    }

    /// Pointer to the payload in this process's mapping.
    pub fn payload_ptr(&self) -> *mut u8 {
        self.pool.inner.shm.ptr(self.payload_offset())
    }

    /// Marks construction complete. Only INIT objects change state.
    pub fn activate(&self) -> Result<()> {
        // SAFETY: header written at creation.
        let hdr = unsafe { &mut *self.pool.header(self.off) };
        if hdr.state == STATE_INIT {
            hdr.state = STATE_ACTIVE;
        }
        Ok(())
    }

    /// Explicit synchronous destruction, regardless of the reference
    /// count. The pool destructor does not run; the caller tears the
    /// payload down itself first.
    pub fn destroy(self) -> Result<()> {
        let pool = self.pool.clone();
        pool.inner.lock.prevail()?;
        // SAFETY: under the pool lock.
        unsafe { (*pool.header(self.off)).state = STATE_DEINIT };
        pool.unlink(self.off, self.id);
        pool.inner.lock.dismiss()?;
        pool.teardown(self.off)
    }

    /// Takes a reference.
    pub fn ref_up(&self, global: bool) -> Result<()> {
        self.pool.object_ref(self.off).up(global)
    }

    /// Drops a reference. The final drop triggers reclamation through
    /// the pool's watcher.
    pub fn ref_down(&self, global: bool) -> Result<()> {
        self.pool.object_ref(self.off).down(global)
    }

    /// Snapshot of the reference count.
    pub fn ref_stat(&self) -> Result<i32> {
        self.pool.object_ref(self.off).stat()
    }

    /// Adds a global reference destined for `catcher`.
    pub fn throw(&self, catcher: u64) -> Result<()> {
        self.pool.object_ref(self.off).throw(catcher)
    }

    /// Claims a thrown reference as a local one.
    pub fn catch(&self) -> Result<()> {
        self.pool.object_ref(self.off).catch()
    }

    /// Records `fusion_id` as an owner allowed to mutate the object.
    pub fn add_owner(&self, fusion_id: u64) -> Result<()> {
        let pool = &self.pool;
        pool.inner.lock.prevail()?;
        let result = self.add_owner_locked(fusion_id);
        pool.inner.lock.dismiss()?;
        result
    }

    fn add_owner_locked(&self, fusion_id: u64) -> Result<()> {
        let shm = &self.pool.inner.shm;
        // SAFETY: under the pool lock; vectors only mutate here.
        let hdr = unsafe { &mut *self.pool.header(self.off) };
        if hdr.owners_len == hdr.owners_cap {
            let cap = if hdr.owners_cap == 0 { 4 } else { hdr.owners_cap * 2 };
            hdr.owners_off = shm.reallocate(hdr.owners_off, cap as usize * 8, true)?;
            hdr.owners_cap = cap;
        }
        // SAFETY: capacity ensured above; u64 slots are 8-aligned by
        // allocator granularity.
        unsafe {
            *shm.segment().at::<u64>(hdr.owners_off + hdr.owners_len * 8) = fusion_id;
        }
        hdr.owners_len += 1;
        Ok(())
    }

    /// Checks whether `fusion_id` may mutate the object. With no owners
    /// recorded, `succeed_if_not_owned` decides.
    pub fn check_owner(&self, fusion_id: u64, succeed_if_not_owned: bool) -> Result<()> {
        let pool = &self.pool;
        pool.inner.lock.prevail()?;
        let shm = &pool.inner.shm;
        // SAFETY: under the pool lock.
        let (owners_off, owners_len) = unsafe {
            let hdr = &*pool.header(self.off);
            (hdr.owners_off, hdr.owners_len)
        };
        let allowed = if owners_len == 0 {
            succeed_if_not_owned
        } else {
            // SAFETY: array of owners_len u64s at owners_off.
            (0..owners_len)
                .any(|i| unsafe { *shm.segment().at::<u64>(owners_off + i * 8) } == fusion_id)
        };
        pool.inner.lock.dismiss()?;
        if allowed {
            Ok(())
        } else {
            Err(Error::AccessDenied("fusionee does not own this object"))
        }
    }

    /// Adds an executable path pattern to the access list. A trailing
    /// `*` matches any suffix.
    pub fn add_access(&self, pattern: &str) -> Result<()> {
        let pool = &self.pool;
        pool.inner.lock.prevail()?;
        let result = self.add_access_locked(pattern);
        pool.inner.lock.dismiss()?;
        result
    }

    fn add_access_locked(&self, pattern: &str) -> Result<()> {
        let shm = &self.pool.inner.shm;
        let pattern_off = shm.strdup(pattern, true)?;
        // SAFETY: under the pool lock.
        let hdr = unsafe { &mut *self.pool.header(self.off) };
        if hdr.access_len == hdr.access_cap {
            let cap = if hdr.access_cap == 0 { 4 } else { hdr.access_cap * 2 };
            hdr.access_off = shm.reallocate(hdr.access_off, cap as usize * 4, true)?;
            hdr.access_cap = cap;
        }
        // SAFETY: capacity ensured above.
        unsafe {
            *shm.segment().at::<u32>(hdr.access_off + hdr.access_len * 4) = pattern_off;
        }
        hdr.access_len += 1;
        Ok(())
    }

    /// Matches `path` against the access list.
    pub fn has_access(&self, path: &str) -> Result<bool> {
        let pool = &self.pool;
        pool.inner.lock.prevail()?;
        let shm = &pool.inner.shm;
        // SAFETY: under the pool lock.
        let (access_off, access_len) = unsafe {
            let hdr = &*pool.header(self.off);
            (hdr.access_off, hdr.access_len)
        };
        let mut found = false;
        for i in 0..access_len {
            // SAFETY: array of access_len string offsets at access_off.
            let s = unsafe { *shm.segment().at::<u32>(access_off + i * 4) };
            let pattern = shm.read_str(s);
            let matched = match pattern.strip_suffix('*') {
                Some(prefix) => path.starts_with(prefix),
                None => path == pattern,
            };
            if matched {
                found = true;
                break;
            }
        }
        pool.inner.lock.dismiss()?;
        Ok(found)
    }

    fn props(&self) -> Result<ShmHash> {
        let shm = &self.pool.inner.shm;
        // SAFETY: under the pool lock (all property entry points hold it).
        let hdr = unsafe { &mut *self.pool.header(self.off) };
        if hdr.props_off == 0 {
            let table = ShmHash::create(shm, KeyKind::Str, 0)?;
            hdr.props_off = table.offset();
            Ok(table)
        } else {
            Ok(ShmHash::from_raw(shm, hdr.props_off))
        }
    }

    /// Sets a property, replacing any previous value.
    pub fn set_property(&self, key: &str, value: u32) -> Result<()> {
        let pool = &self.pool;
        pool.inner.lock.prevail()?;
        let result = self.props().and_then(|t| t.replace(Key::Str(key), value));
        pool.inner.lock.dismiss()?;
        result.map(|_| ())
    }

    /// Reads a property.
    pub fn get_property(&self, key: &str) -> Result<Option<u32>> {
        let pool = &self.pool;
        pool.inner.lock.prevail()?;
        // SAFETY: under the pool lock.
        let props_off = unsafe { (*pool.header(self.off)).props_off };
        let value = if props_off == 0 {
            None
        } else {
            ShmHash::from_raw(&pool.inner.shm, props_off).lookup(Key::Str(key))
        };
        pool.inner.lock.dismiss()?;
        Ok(value)
    }

    /// Removes a property, returning its value if it was set.
    pub fn remove_property(&self, key: &str) -> Result<Option<u32>> {
        let pool = &self.pool;
        pool.inner.lock.prevail()?;
        // SAFETY: under the pool lock.
        let props_off = unsafe { (*pool.header(self.off)).props_off };
        let result = if props_off == 0 {
            Ok(None)
        } else {
            ShmHash::from_raw(&pool.inner.shm, props_off).remove(Key::Str(key))
        };
        pool.inner.lock.dismiss()?;
        result
    }
}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("id", &self.id)
            .field("off", &self.off)
            .finish()
    }
}
