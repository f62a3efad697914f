//! Stress tests for the shared memory allocator.
//!
//! These tests exercise the pool heap through its public wrapper under
//! churn and concurrency to verify the free list stays consistent and
//! accounting returns to zero.

use fusion::{Error, ShmPool, World, WorldConfig};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

fn test_config() -> WorldConfig {
    WorldConfig {
        tmpfs_dir: std::env::temp_dir(),
        madv_remove: false,
        main_pool_size: 256 * 1024,
        ..WorldConfig::default()
    }
}

fn fresh_world() -> World {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let pid = rustix::process::getpid().as_raw_nonzero().get() as u32;
    let index = (pid % 50_000) * 200 + 100_000_000 + COUNTER.fetch_add(1, Ordering::Relaxed);
    let cfg = test_config();
    for pool_id in 0..4 {
        let _ = std::fs::remove_file(cfg.tmpfs_dir.join(format!("fusion.{index}.{pool_id}")));
    }
    World::create(index, cfg).unwrap()
}

/// Tiny deterministic PRNG so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

// ============================================================================
// End-to-end allocation scenario
// ============================================================================

/// A 64 KiB pool serves 100 objects of 256 bytes, refuses allocations only
/// once genuinely full, and accounts every byte back after freeing.
#[test]
fn test_small_pool_end_to_end() {
    let world = fresh_world();
    let pool = world.create_pool("end to end", 65536).unwrap();
    // The pool name itself lives in the heap.
    let baseline = pool.stats().unwrap();

    let mut offsets = Vec::new();
    for i in 0..100 {
        match pool.allocate(256, true, true) {
            Ok(off) => {
                unsafe { *pool.ptr(off).cast::<u32>() = i };
                offsets.push(off);
            }
            Err(err) => panic!("allocation {i} failed early: {err}"),
        }
    }

    // Contents are intact and distinct.
    for (i, &off) in offsets.iter().enumerate() {
        assert_eq!(unsafe { *pool.ptr(off).cast::<u32>() }, i as u32);
    }

    // Keep allocating until the heap is genuinely exhausted.
    let mut extra = Vec::new();
    loop {
        match pool.allocate(256, false, true) {
            Ok(off) => extra.push(off),
            Err(Error::OutOfSharedMemory { .. }) => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert!(!extra.is_empty(), "some headroom beyond 100 objects expected");

    for off in offsets.into_iter().chain(extra) {
        pool.deallocate(off, true).unwrap();
    }
    let stats = pool.stats().unwrap();
    assert_eq!(stats.bytes_used, baseline.bytes_used);
    assert_eq!(stats.chunks_used, 1, "only the pool name remains");

    world.destroy_pool(pool).unwrap();
}

// ============================================================================
// Randomized churn
// ============================================================================

/// Random mixed-size allocate/free/realloc churn with a shadow map; every
/// live allocation keeps its fill pattern and accounting balances at the end.
#[test]
fn test_randomized_churn_keeps_heap_consistent() {
    let world = fresh_world();
    let pool = world.create_pool("churn", 128 * 1024).unwrap();
    let baseline = pool.stats().unwrap();
    let mut rng = Lcg(0x5eed);
    let mut live: Vec<(u32, usize, u8)> = Vec::new();

    let check = |pool: &ShmPool, off: u32, len: usize, fill: u8| {
        let ok = unsafe { (0..len).all(|i| *pool.ptr(off).add(i) == fill) };
        assert!(ok, "allocation at {off:#x} lost its fill");
    };

    for round in 0..20_000u32 {
        match rng.next() % 10 {
            // Allocate, small sizes dominating like real workloads.
            0..=5 => {
                let size = match rng.next() % 4 {
                    0 => 1 + (rng.next() as usize % 8),
                    1 => 8 + (rng.next() as usize % 120),
                    2 => 128 + (rng.next() as usize % 1920),
                    _ => 2048 + (rng.next() as usize % 6144),
                };
                if let Ok(off) = pool.allocate(size, false, true) {
                    let fill = (round % 251 + 1) as u8;
                    unsafe { std::ptr::write_bytes(pool.ptr(off), fill, size) };
                    live.push((off, size, fill));
                }
            }
            // Free a random live allocation.
            6..=7 if !live.is_empty() => {
                let idx = rng.next() as usize % live.len();
                let (off, len, fill) = live.swap_remove(idx);
                check(&pool, off, len, fill);
                pool.deallocate(off, true).unwrap();
            }
            // Reallocate a random live allocation.
            8 if !live.is_empty() => {
                let idx = rng.next() as usize % live.len();
                let (off, len, fill) = live[idx];
                let new_len = 1 + (rng.next() as usize % 4096);
                if let Ok(new_off) = pool.reallocate(off, new_len, true) {
                    let kept = len.min(new_len);
                    check(&pool, new_off, kept, fill);
                    unsafe { std::ptr::write_bytes(pool.ptr(new_off), fill, new_len) };
                    live[idx] = (new_off, new_len, fill);
                }
            }
            _ => {}
        }
    }

    for (off, len, fill) in live.drain(..) {
        check(&pool, off, len, fill);
        pool.deallocate(off, true).unwrap();
    }
    let stats = pool.stats().unwrap();
    assert_eq!(stats.bytes_used, baseline.bytes_used);
    assert_eq!(stats.chunks_used, 1);

    world.destroy_pool(pool).unwrap();
}

// ============================================================================
// Concurrency
// ============================================================================

/// Threads hammering one pool through separate attachments never corrupt
/// each other's allocations.
#[test]
fn test_concurrent_allocations_do_not_collide() {
    let world = fresh_world();
    let pool = world.create_pool("threads", 192 * 1024).unwrap();
    let baseline = pool.stats().unwrap();
    let num_threads = 4;
    let iterations = 500;

    let handles: Vec<_> = (0..num_threads)
        .map(|thread_id: u8| {
            // A separate mapping per thread, as separate processes would have.
            let joined = World::join(world.world_index(), test_config()).unwrap();
            let pool = joined.attach_pool(1).unwrap();
            thread::spawn(move || {
                let mut mine = Vec::new();
                for i in 0..iterations {
                    let size = 16 + (i % 7) * 24;
                    if let Ok(off) = pool.allocate(size, false, true) {
                        unsafe { std::ptr::write_bytes(pool.ptr(off), thread_id + 1, size) };
                        mine.push((off, size));
                    }
                    if mine.len() > 20 {
                        let (off, size) = mine.remove(0);
                        let intact =
                            unsafe { (0..size).all(|k| *pool.ptr(off).add(k) == thread_id + 1) };
                        assert!(intact, "thread {thread_id} allocation was overwritten");
                        pool.deallocate(off, true).unwrap();
                    }
                }
                for (off, _) in mine {
                    pool.deallocate(off, true).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let stats = pool.stats().unwrap();
    assert_eq!(stats.bytes_used, baseline.bytes_used);
    world.destroy_pool(pool).unwrap();
}

/// Fragment-heavy workload: many small allocations sharing blocks, freed
/// in an interleaved order, leave no residue.
#[test]
fn test_fragment_churn_returns_everything() {
    let world = fresh_world();
    let pool = world.create_pool("fragments", 64 * 1024).unwrap();
    let baseline = pool.stats().unwrap();

    let mut small: Vec<u32> = (0..256)
        .map(|_| pool.allocate(24, false, true).unwrap())
        .collect();
    // Free every other one, then the rest.
    let mut i = 0;
    small.retain(|&off| {
        i += 1;
        if i % 2 == 0 {
            pool.deallocate(off, true).unwrap();
            false
        } else {
            true
        }
    });
    // Holes are reused before the heap grows.
    let used_before = pool.stats().unwrap().bytes_used;
    let refill: Vec<u32> = (0..128)
        .map(|_| pool.allocate(24, false, true).unwrap())
        .collect();
    let used_after = pool.stats().unwrap().bytes_used;
    assert_eq!(used_after, used_before + 128 * 32);

    for off in small.into_iter().chain(refill) {
        pool.deallocate(off, true).unwrap();
    }
    assert_eq!(pool.stats().unwrap().bytes_used, baseline.bytes_used);
    world.destroy_pool(pool).unwrap();
}
