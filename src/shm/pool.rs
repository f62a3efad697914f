//! Shared memory pools.
//!
//! A pool owns one backing file, one skirmish serializing its heap, and
//! the heap itself. The first bytes of the segment hold the [`PoolHeader`];
//! the world's main pool additionally carries the world header right after
//! it (the `extra` region negotiated at creation).

use std::mem::offset_of;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::WorldConfig;
use crate::error::{Error, Result};
use crate::shm::heap::{Heap, HeapStats};
use crate::shm::segment::Segment;
use crate::skirmish::{Skirmish, SkirmishShared};

/// Smallest accepted pool size.
pub const MIN_POOL_SIZE: u32 = 8192;

const POOL_MAGIC: u32 = 0x4653_504c; // "FSPL"
const POOL_VERSION: u32 = 0x0009_0000;

/// Pool metadata at segment offset 0.
#[repr(C)]
struct PoolHeader {
    magic: u32,
    version: u32,
    pool_id: u32,
    max_size: u32,
    creator_fusion_id: u64,
    active: u32,
    /// Heap offset of the pool name, 0 until set.
    name_off: u32,
    lock: SkirmishShared,
    heap: crate::shm::heap::HeapHeader,
}

const LOCK_OFF: u32 = offset_of!(PoolHeader, lock) as u32;
const HEAP_OFF: u32 = offset_of!(PoolHeader, heap) as u32;

/// Offset of the `extra` metadata region inside any pool segment.
pub(crate) fn extra_off() -> u32 {
    (std::mem::size_of::<PoolHeader>() as u32 + 7) & !7
}

pub(crate) struct PoolInner {
    seg: Arc<Segment>,
    lock: Skirmish,
    pool_id: u32,
    max_size: u32,
    madv_remove: bool,
    name: String,
}

/// Handle to a shared memory pool. Clones share the mapping.
#[derive(Clone)]
pub struct ShmPool {
    inner: Arc<PoolInner>,
}

impl ShmPool {
    /// Creates the backing file and initializes pool metadata, returning
    /// the pool and the segment offset of the `extra` metadata region
    /// reserved between the pool header and the heap.
    pub(crate) fn create(
        path: &Path,
        pool_id: u32,
        max_size: u32,
        name: &str,
        creator_fusion_id: u64,
        lock_id: u32,
        extra: u32,
        cfg: &WorldConfig,
    ) -> Result<(ShmPool, u32)> {
        if max_size < MIN_POOL_SIZE {
            return Err(Error::invalid(format!(
                "pool size {max_size} below minimum {MIN_POOL_SIZE}"
            )));
        }

        let mode = if cfg.secure { 0o640 } else { cfg.shmfile_mode };
        let gid = if cfg.secure { None } else { cfg.shmfile_gid };
        let seg = Arc::new(Segment::create(path, max_size as usize, Some(mode), gid)?);

        let extra_off = extra_off();
        let meta_end = extra_off + extra;
        let (info_off, heap_base) = Heap::layout(meta_end, max_size).ok_or_else(|| {
            Error::invalid(format!("pool size {max_size} too small for metadata"))
        })?;

        // SAFETY: fresh zeroed segment, offsets from Heap::layout are in
        // bounds and aligned, nothing else references the segment yet.
        unsafe {
            Heap::init(&seg, HEAP_OFF, info_off, heap_base, max_size);
            SkirmishShared::init_at(&seg, LOCK_OFF, lock_id);
            let hdr = &mut *seg.at::<PoolHeader>(0);
            hdr.magic = POOL_MAGIC;
            hdr.version = POOL_VERSION;
            hdr.pool_id = pool_id;
            hdr.max_size = max_size;
            hdr.creator_fusion_id = creator_fusion_id;
            hdr.active = 1;
            hdr.name_off = 0;
        }

        let pool = ShmPool {
            inner: Arc::new(PoolInner {
                lock: Skirmish::from_shared(seg.clone(), LOCK_OFF, name),
                seg,
                pool_id,
                max_size,
                madv_remove: cfg.madv_remove,
                name: name.to_string(),
            }),
        };

        let name_off = pool.strdup(name, true)?;
        // SAFETY: header initialized above.
        unsafe { (*pool.inner.seg.at::<PoolHeader>(0)).name_off = name_off };

        debug!(pool_id, max_size, name, path = %path.display(), "created pool");
        Ok((pool, extra_off))
    }

    /// Maps an existing pool and validates its metadata.
    pub(crate) fn attach(path: &Path, cfg: &WorldConfig) -> Result<ShmPool> {
        let seg = Arc::new(Segment::open(path)?);

        // SAFETY: segment is at least MIN_POOL_SIZE or validation fails.
        if seg.len() < std::mem::size_of::<PoolHeader>() {
            return Err(Error::InvalidSegment(format!(
                "{} too small for a pool header",
                path.display()
            )));
        }
        let (magic, version, pool_id, max_size, active, name_off) = unsafe {
            let hdr = &*seg.at::<PoolHeader>(0);
            (
                hdr.magic,
                hdr.version,
                hdr.pool_id,
                hdr.max_size,
                hdr.active,
                hdr.name_off,
            )
        };
        if magic != POOL_MAGIC {
            return Err(Error::InvalidSegment(format!(
                "{} has bad magic {magic:#x}",
                path.display()
            )));
        }
        if version != POOL_VERSION {
            return Err(Error::InvalidSegment(format!(
                "{} has version {version:#x}, expected {POOL_VERSION:#x}",
                path.display()
            )));
        }
        if active == 0 {
            return Err(Error::Destroyed("pool"));
        }
        if max_size as usize != seg.len() {
            warn!(
                pool_id,
                max_size,
                mapped = seg.len(),
                "pool size mismatch with backing file"
            );
        }

        // SAFETY: header validated above.
        if unsafe { Heap::attach(&seg, HEAP_OFF, cfg.madv_remove) }.is_none() {
            return Err(Error::InvalidSegment(format!(
                "{} heap header corrupt",
                path.display()
            )));
        }

        let name = read_str(&seg, name_off);
        debug!(pool_id, name = %name, path = %path.display(), "attached pool");

        Ok(ShmPool {
            inner: Arc::new(PoolInner {
                lock: Skirmish::from_shared(seg.clone(), LOCK_OFF, &name),
                seg,
                pool_id,
                max_size,
                madv_remove: cfg.madv_remove,
                name,
            }),
        })
    }

    fn with_heap<R>(&self, lock: bool, f: impl FnOnce(&mut Heap<'_>) -> R) -> Result<R> {
        if lock {
            self.inner.lock.prevail()?;
        }
        // SAFETY: the heap was validated at create/attach time.
        let heap = unsafe { Heap::attach(&self.inner.seg, HEAP_OFF, self.inner.madv_remove) };
        let result = match heap {
            Some(mut heap) => Ok(f(&mut heap)),
            None => Err(Error::InvalidSegment("pool heap header corrupt".into())),
        };
        if lock {
            self.inner.lock.dismiss()?;
        }
        result
    }

    /// Allocates `size` bytes from the pool heap, optionally zeroed.
    /// A zero `size` yields the null offset 0, which [`deallocate`]
    /// accepts as a no-op.
    ///
    /// Pass `lock = false` only while already holding the pool skirmish.
    ///
    /// [`deallocate`]: Self::deallocate
    pub fn allocate(&self, size: usize, clear: bool, lock: bool) -> Result<u32> {
        if size == 0 {
            return Ok(0);
        }
        let off = self
            .with_heap(lock, |heap| heap.allocate(size))?
            .ok_or(Error::OutOfSharedMemory { needed: size })?;
        if clear {
            // SAFETY: the allocator returned an in-bounds range of `size`.
            unsafe {
                std::ptr::write_bytes(self.inner.seg.base().add(off as usize), 0, size);
            }
        }
        Ok(off)
    }

    /// Resizes an allocation. `off == 0` allocates; `size == 0` frees and
    /// returns 0. Content up to the lesser size is preserved; the
    /// allocation may move.
    pub fn reallocate(&self, off: u32, size: usize, lock: bool) -> Result<u32> {
        if off == 0 {
            return self.allocate(size, false, lock);
        }
        if size == 0 {
            self.deallocate(off, lock)?;
            return Ok(0);
        }
        self.with_heap(lock, |heap| heap.reallocate(off, size))?
            .ok_or(Error::OutOfSharedMemory { needed: size })
    }

    /// Returns an allocation to the pool heap. Offset 0 is a no-op.
    pub fn deallocate(&self, off: u32, lock: bool) -> Result<()> {
        self.with_heap(lock, |heap| heap.deallocate(off))
    }

    /// Copies `s` into the pool as a NUL-terminated string, returning its
    /// offset.
    pub fn strdup(&self, s: &str, lock: bool) -> Result<u32> {
        let bytes = s.as_bytes();
        let off = self.allocate(bytes.len() + 1, false, lock)?;
        // SAFETY: allocation of len + 1 bytes starting at off.
        unsafe {
            let dst = self.inner.seg.base().add(off as usize);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            *dst.add(bytes.len()) = 0;
        }
        Ok(off)
    }

    /// Reads a NUL-terminated shared string written by [`strdup`](Self::strdup).
    pub fn read_str(&self, off: u32) -> String {
        read_str(&self.inner.seg, off)
    }

    /// Compares the shared string at `off` with `s`.
    pub(crate) fn str_eq(&self, off: u32, s: &str) -> bool {
        if off == 0 {
            return false;
        }
        let seg = &self.inner.seg;
        let bytes = s.as_bytes();
        let base = off as usize;
        if base + bytes.len() >= seg.len() {
            return false;
        }
        // SAFETY: bounds checked above; strings in the pool are NUL
        // terminated by strdup.
        unsafe {
            for (i, &b) in bytes.iter().enumerate() {
                if *seg.base().add(base + i) != b {
                    return false;
                }
            }
            *seg.base().add(base + bytes.len()) == 0
        }
    }

    /// Resolves an offset into the local mapping.
    #[inline]
    pub fn ptr(&self, off: u32) -> *mut u8 {
        debug_assert!((off as usize) < self.inner.seg.len());
        // In-bounds by the debug assert; callers get a raw pointer and
        // take it from there.
        unsafe { self.inner.seg.base().add(off as usize) }
    }

    /// Allocation statistics, taken under the pool lock.
    pub fn stats(&self) -> Result<HeapStats> {
        self.with_heap(true, |heap| heap.stats())
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Pool id within its world (0 = main pool).
    pub fn pool_id(&self) -> u32 {
        self.inner.pool_id
    }

    /// Total pool capacity in bytes.
    pub fn max_size(&self) -> u32 {
        self.inner.max_size
    }

    /// The skirmish serializing this pool's heap.
    pub fn lock(&self) -> &Skirmish {
        &self.inner.lock
    }

    pub(crate) fn segment(&self) -> &Segment {
        &self.inner.seg
    }

    pub(crate) fn segment_arc(&self) -> Arc<Segment> {
        self.inner.seg.clone()
    }

    pub(crate) fn creator_fusion_id(&self) -> u64 {
        // SAFETY: header validated at create/attach time.
        unsafe { (*self.inner.seg.at::<PoolHeader>(0)).creator_fusion_id }
    }

    /// Marks the pool destroyed, frees its name and unlinks the backing
    /// file. Existing mappings stay valid until their handles drop.
    pub(crate) fn dismantle(&self) -> Result<()> {
        self.inner.lock.prevail()?;
        // SAFETY: header validated at create time.
        let name_off = unsafe {
            let hdr = &mut *self.inner.seg.at::<PoolHeader>(0);
            hdr.active = 0;
            std::mem::replace(&mut hdr.name_off, 0)
        };
        if name_off != 0 {
            self.deallocate(name_off, false)?;
        }
        self.inner.lock.dismiss()?;
        self.inner.lock.destroy()?;
        self.inner.seg.unlink();
        debug!(pool_id = self.inner.pool_id, name = %self.inner.name, "pool dismantled");
        Ok(())
    }
}

impl std::fmt::Debug for ShmPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmPool")
            .field("pool_id", &self.inner.pool_id)
            .field("name", &self.inner.name)
            .field("max_size", &self.inner.max_size)
            .finish()
    }
}

fn read_str(seg: &Segment, off: u32) -> String {
    if off == 0 {
        return String::new();
    }
    let mut bytes = Vec::new();
    let mut i = off as usize;
    // SAFETY: bounded by the segment length; strdup NUL-terminates.
    unsafe {
        while i < seg.len() {
            let b = *seg.base().add(i);
            if b == 0 {
                break;
            }
            bytes.push(b);
            i += 1;
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn temp_path() -> PathBuf {
        let pid = rustix::process::getpid().as_raw_nonzero().get();
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("fusion-pool-{pid}-{n}"))
    }

    fn test_config() -> WorldConfig {
        WorldConfig {
            tmpfs_dir: std::env::temp_dir(),
            madv_remove: false,
            ..WorldConfig::default()
        }
    }

    fn make_pool(max_size: u32) -> (ShmPool, PathBuf) {
        let path = temp_path();
        let cfg = test_config();
        let (pool, _) = ShmPool::create(&path, 7, max_size, "test pool", 1, 100, 0, &cfg).unwrap();
        (pool, path)
    }

    #[test]
    fn rejects_undersized_pool() {
        let path = temp_path();
        let cfg = test_config();
        let err =
            ShmPool::create(&path, 1, MIN_POOL_SIZE - 1, "tiny", 1, 100, 0, &cfg).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn allocate_clear_zeroes_recycled_memory() {
        let (pool, path) = make_pool(256 * 1024);

        let a = pool.allocate(64, false, true).unwrap();
        unsafe { std::ptr::write_bytes(pool.ptr(a), 0xaa, 64) };
        pool.deallocate(a, true).unwrap();

        let b = pool.allocate(64, true, true).unwrap();
        let all_zero = unsafe { (0..64).all(|i| *pool.ptr(b).add(i) == 0) };
        assert!(all_zero);
        pool.segment().unlink();
        let _ = path;
    }

    #[test]
    fn zero_size_allocation_is_null() {
        let (pool, _path) = make_pool(64 * 1024);
        let before = pool.stats().unwrap();
        assert_eq!(pool.allocate(0, false, true).unwrap(), 0);
        // Freeing the null offset is a no-op, and nothing was reserved.
        pool.deallocate(0, true).unwrap();
        let after = pool.stats().unwrap();
        assert_eq!(before.bytes_used, after.bytes_used);
        assert_eq!(before.chunks_used, after.chunks_used);
        pool.segment().unlink();
    }

    #[test]
    fn strings_roundtrip_and_compare() {
        let (pool, _path) = make_pool(64 * 1024);
        let off = pool.strdup("surface/27", true).unwrap();
        assert_eq!(pool.read_str(off), "surface/27");
        assert!(pool.str_eq(off, "surface/27"));
        assert!(!pool.str_eq(off, "surface/2"));
        assert!(!pool.str_eq(off, "surface/271"));
        pool.deallocate(off, true).unwrap();
        pool.segment().unlink();
    }

    #[test]
    fn attach_sees_existing_allocations() {
        let (pool, path) = make_pool(256 * 1024);
        let off = pool.allocate(128, true, true).unwrap();
        unsafe { *pool.ptr(off).cast::<u64>() = 0x1122_3344_5566_7788 };

        // Second mapping of the same file, as another process would do.
        let other = ShmPool::attach(&path, &test_config()).unwrap();
        assert_eq!(other.name(), "test pool");
        assert_eq!(other.pool_id(), 7);
        let got = unsafe { *other.ptr(off).cast::<u64>() };
        assert_eq!(got, 0x1122_3344_5566_7788);

        // Allocations through either mapping come from the same heap.
        let from_other = other.allocate(64, false, true).unwrap();
        let from_orig = pool.allocate(64, false, true).unwrap();
        assert_ne!(from_other, from_orig);

        pool.segment().unlink();
    }

    #[test]
    fn exhaustion_reports_out_of_shared_memory() {
        let (pool, _path) = make_pool(MIN_POOL_SIZE);
        // One block of heap exists; a second large allocation must fail.
        let _a = pool.allocate(3000, false, true).unwrap();
        let err = pool.allocate(3000, false, true).unwrap_err();
        assert!(matches!(err, Error::OutOfSharedMemory { .. }));
        pool.segment().unlink();
    }

    #[test]
    fn realloc_zero_frees() {
        let (pool, _path) = make_pool(64 * 1024);
        let off = pool.allocate(512, false, true).unwrap();
        let res = pool.reallocate(off, 0, true).unwrap();
        assert_eq!(res, 0);
        // Only the pool name allocation remains.
        assert_eq!(pool.stats().unwrap().chunks_used, 1);
        pool.segment().unlink();
    }

    #[test]
    fn dismantled_pool_rejects_attach() {
        let (pool, path) = make_pool(64 * 1024);
        // Copy the file path; dismantle unlinks, so attach via a hard copy
        // of the bytes is not possible - instead check active flag first.
        pool.dismantle().unwrap();
        assert!(ShmPool::attach(&path, &test_config()).is_err());
    }
}
