//! Chained hash tables living in shared memory.
//!
//! Buckets, nodes and string keys are all pool allocations referenced by
//! offset, so every process attached to the pool sees the same table.
//! The table itself is not synchronized; callers serialize access with
//! the skirmish guarding the structure that owns the table (object pools
//! use their pool lock).

use std::mem::size_of;

use crate::error::{Error, Result};
use crate::shm::pool::ShmPool;

const HASH_MAGIC: u32 = 0x4653_4853; // "FSHS"
const HASH_MIN_SIZE: u32 = 11;
const HASH_MAX_SIZE: u32 = 13_845_163;

/// Bucket counts, spaced roughly by powers of 1.5.
const PRIMES: [u32; 34] = [
    11, 19, 37, 73, 109, 163, 251, 367, 557, 823, 1237, 1861, 2777, 4177, 6247, 9371, 14057,
    21089, 31627, 47431, 71143, 106721, 160073, 240101, 360163, 540217, 810343, 1215497, 1823231,
    2734867, 4102283, 6153409, 9230113, 13845163,
];

fn spaced_primes_closest(num: u32) -> u32 {
    for &p in &PRIMES {
        if p > num {
            return p;
        }
    }
    PRIMES[PRIMES.len() - 1]
}

/// How keys are stored and compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyKind {
    /// The key is the 32-bit value itself.
    Int,
    /// The key is the offset of a NUL-terminated pool string owned by
    /// the table.
    Str,
}

/// A key for lookup or insertion.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Key<'a> {
    Int(u32),
    Str(&'a str),
}

#[repr(C)]
struct HashHeader {
    magic: u32,
    key_kind: u32,
    /// Bucket count.
    size: u32,
    /// Entry count.
    nnodes: u32,
    /// Offset of the bucket array (`size` u32 offsets).
    buckets_off: u32,
}

#[repr(C)]
struct HashNode {
    /// Int key value, or offset of the key string.
    key: u32,
    value: u32,
    /// Offset of the next node in the chain, 0 = end.
    next: u32,
}

fn str_hash(s: &str) -> u32 {
    let bytes = s.as_bytes();
    match bytes.first() {
        None => 0,
        Some(&first) => {
            let mut h = first as u32;
            for &b in &bytes[1..] {
                h = (h << 5).wrapping_sub(h).wrapping_add(b as u32);
            }
            h
        }
    }
}

/// Handle to a shared hash table. Cheap to clone; access must be
/// serialized by the owner.
#[derive(Clone)]
pub(crate) struct ShmHash {
    pool: ShmPool,
    off: u32,
}

impl ShmHash {
    /// Creates a table with at least `capacity` buckets.
    pub fn create(pool: &ShmPool, kind: KeyKind, capacity: u32) -> Result<ShmHash> {
        let size = capacity.max(HASH_MIN_SIZE);
        let off = pool.allocate(size_of::<HashHeader>(), true, true)?;
        let buckets_off = match pool.allocate(size as usize * 4, true, true) {
            Ok(buckets_off) => buckets_off,
            Err(err) => {
                pool.deallocate(off, true)?;
                return Err(err);
            }
        };
        // SAFETY: fresh allocation, aligned to 4 by allocator granularity.
        unsafe {
            let hdr = &mut *pool.segment().at::<HashHeader>(off);
            hdr.magic = HASH_MAGIC;
            hdr.key_kind = match kind {
                KeyKind::Int => 0,
                KeyKind::Str => 1,
            };
            hdr.size = size;
            hdr.nnodes = 0;
            hdr.buckets_off = buckets_off;
        }
        Ok(ShmHash {
            pool: pool.clone(),
            off,
        })
    }

    /// Handle onto an existing table.
    pub fn from_raw(pool: &ShmPool, off: u32) -> ShmHash {
        ShmHash {
            pool: pool.clone(),
            off,
        }
    }

    /// Offset of the table header within its pool.
    pub fn offset(&self) -> u32 {
        self.off
    }

    fn hdr(&self) -> *mut HashHeader {
        // SAFETY: off points at a header written by create/from_raw.
        unsafe { self.pool.segment().at::<HashHeader>(self.off) }
    }

    fn kind(&self) -> KeyKind {
        match unsafe { (*self.hdr()).key_kind } {
            0 => KeyKind::Int,
            _ => KeyKind::Str,
        }
    }

    fn bucket_ptr(&self, index: u32) -> *mut u32 {
        let buckets_off = unsafe { (*self.hdr()).buckets_off };
        // SAFETY: index < size, array of size u32s starting at buckets_off.
        unsafe { self.pool.segment().at::<u32>(buckets_off + index * 4) }
    }

    fn node(&self, off: u32) -> *mut HashNode {
        // SAFETY: node offsets come from our own allocations.
        unsafe { self.pool.segment().at::<HashNode>(off) }
    }

    fn bucket_of(&self, key: &Key<'_>, size: u32) -> u32 {
        match *key {
            Key::Int(k) => k % size,
            Key::Str(s) => str_hash(s) % size,
        }
    }

    fn key_matches(&self, node_key: u32, key: &Key<'_>) -> bool {
        match *key {
            Key::Int(k) => node_key == k,
            Key::Str(s) => self.pool.str_eq(node_key, s),
        }
    }

    /// Finds the node for `key`, returning `(prev_node_off, node_off)`
    /// with 0 for "none".
    fn find(&self, key: &Key<'_>) -> (u32, u32) {
        let size = unsafe { (*self.hdr()).size };
        let bucket = self.bucket_of(key, size);
        let mut prev = 0u32;
        let mut cur = unsafe { *self.bucket_ptr(bucket) };
        while cur != 0 {
            let node = self.node(cur);
            if self.key_matches(unsafe { (*node).key }, key) {
                return (prev, cur);
            }
            prev = cur;
            cur = unsafe { (*node).next };
        }
        (prev, 0)
    }

    /// Looks up the value stored for `key`.
    pub fn lookup(&self, key: Key<'_>) -> Option<u32> {
        let (_, node) = self.find(&key);
        if node == 0 {
            None
        } else {
            Some(unsafe { (*self.node(node)).value })
        }
    }

    fn make_key(&self, key: &Key<'_>) -> Result<u32> {
        match *key {
            Key::Int(k) => Ok(k),
            Key::Str(s) => self.pool.strdup(s, true),
        }
    }

    fn free_key(&self, node_key: u32) -> Result<()> {
        if self.kind() == KeyKind::Str && node_key != 0 {
            self.pool.deallocate(node_key, true)?;
        }
        Ok(())
    }

    fn link_new(&self, key: &Key<'_>, value: u32) -> Result<()> {
        let node_off = self.pool.allocate(size_of::<HashNode>(), true, true)?;
        let stored_key = match self.make_key(key) {
            Ok(stored_key) => stored_key,
            Err(err) => {
                self.pool.deallocate(node_off, true)?;
                return Err(err);
            }
        };
        let size = unsafe { (*self.hdr()).size };
        let bucket = self.bucket_of(key, size);
        // SAFETY: fresh node; bucket pointer in bounds.
        unsafe {
            let node = self.node(node_off);
            (*node).key = stored_key;
            (*node).value = value;
            (*node).next = *self.bucket_ptr(bucket);
            *self.bucket_ptr(bucket) = node_off;
            (*self.hdr()).nnodes += 1;
        }
        if self.should_resize() {
            self.resize()?;
        }
        Ok(())
    }

    /// Inserts a new entry. The key must not be present.
    pub fn insert(&self, key: Key<'_>, value: u32) -> Result<()> {
        let (_, node) = self.find(&key);
        if node != 0 {
            return Err(Error::invalid("key already exists"));
        }
        self.link_new(&key, value)
    }

    /// Inserts or overwrites, returning the previous value if any.
    pub fn replace(&self, key: Key<'_>, value: u32) -> Result<Option<u32>> {
        let (_, node) = self.find(&key);
        if node != 0 {
            // SAFETY: node found above.
            let old = unsafe {
                let node = self.node(node);
                std::mem::replace(&mut (*node).value, value)
            };
            return Ok(Some(old));
        }
        self.link_new(&key, value)?;
        Ok(None)
    }

    /// Removes an entry, returning its value if it was present.
    pub fn remove(&self, key: Key<'_>) -> Result<Option<u32>> {
        let (prev, node) = self.find(&key);
        if node == 0 {
            return Ok(None);
        }
        let (node_key, value, next) = unsafe {
            let n = self.node(node);
            ((*n).key, (*n).value, (*n).next)
        };
        // SAFETY: prev/bucket pointers come from find on the same table.
        unsafe {
            if prev != 0 {
                (*self.node(prev)).next = next;
            } else {
                let size = (*self.hdr()).size;
                let bucket = self.bucket_of(&key, size);
                *self.bucket_ptr(bucket) = next;
            }
            (*self.hdr()).nnodes -= 1;
        }
        self.free_key(node_key)?;
        self.pool.deallocate(node, true)?;
        Ok(Some(value))
    }

    /// Visits every entry until `f` returns `true`. String keys are
    /// passed as their pool offset.
    pub fn iterate(&self, mut f: impl FnMut(u32, u32) -> bool) {
        let size = unsafe { (*self.hdr()).size };
        for i in 0..size {
            let mut cur = unsafe { *self.bucket_ptr(i) };
            while cur != 0 {
                let (key, value, next) = unsafe {
                    let n = self.node(cur);
                    ((*n).key, (*n).value, (*n).next)
                };
                if f(key, value) {
                    return;
                }
                cur = next;
            }
        }
    }

    /// Number of entries.
    pub fn len(&self) -> u32 {
        unsafe { (*self.hdr()).nnodes }
    }

    fn should_resize(&self) -> bool {
        let (size, nnodes) = unsafe { ((*self.hdr()).size, (*self.hdr()).nnodes) };
        (size >= 3 * nnodes && size > HASH_MIN_SIZE)
            || (3 * size <= nnodes && size < HASH_MAX_SIZE)
    }

    fn resize(&self) -> Result<()> {
        let (old_size, nnodes, old_buckets) = unsafe {
            let h = self.hdr();
            ((*h).size, (*h).nnodes, (*h).buckets_off)
        };
        let new_size = spaced_primes_closest(nnodes).clamp(HASH_MIN_SIZE, HASH_MAX_SIZE);
        if new_size == old_size {
            return Ok(());
        }
        let new_buckets = self.pool.allocate(new_size as usize * 4, true, true)?;

        let kind = self.kind();
        let seg = self.pool.segment();
        for i in 0..old_size {
            // SAFETY: traversing chains we built ourselves, relinking
            // into the fresh bucket array.
            unsafe {
                let mut cur = *seg.at::<u32>(old_buckets + i * 4);
                while cur != 0 {
                    let node = self.node(cur);
                    let next = (*node).next;
                    let bucket = match kind {
                        KeyKind::Int => (*node).key % new_size,
                        KeyKind::Str => {
                            str_hash(&self.pool.read_str((*node).key)) % new_size
                        }
                    };
                    let slot = seg.at::<u32>(new_buckets + bucket * 4);
                    (*node).next = *slot;
                    *slot = cur;
                    cur = next;
                }
            }
        }

        // SAFETY: header owned by this table.
        unsafe {
            (*self.hdr()).buckets_off = new_buckets;
            (*self.hdr()).size = new_size;
        }
        self.pool.deallocate(old_buckets, true)?;
        Ok(())
    }

    /// Frees every node (and owned key string), the bucket array and the
    /// header.
    pub fn destroy(self) -> Result<()> {
        let (size, buckets_off) = unsafe { ((*self.hdr()).size, (*self.hdr()).buckets_off) };
        for i in 0..size {
            let mut cur = unsafe { *self.bucket_ptr(i) };
            while cur != 0 {
                let (key, next) = unsafe {
                    let n = self.node(cur);
                    ((*n).key, (*n).next)
                };
                self.free_key(key)?;
                self.pool.deallocate(cur, true)?;
                cur = next;
            }
        }
        self.pool.deallocate(buckets_off, true)?;
        self.pool.deallocate(self.off, true)
    }
}
