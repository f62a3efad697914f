//! Integration tests spanning several world attachments.
//!
//! Each `World::join` maps the backing files a second time, exactly as a
//! separate process would, so these tests cover the cross-process paths:
//! shared locks, shared pools, object pools and parked call notices.

use fusion::{prevail_multi, Error, ObjectPool, World, WorldConfig};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

fn test_config() -> WorldConfig {
    WorldConfig {
        tmpfs_dir: std::env::temp_dir(),
        madv_remove: false,
        main_pool_size: 512 * 1024,
        ..WorldConfig::default()
    }
}

fn fresh_world() -> World {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let pid = rustix::process::getpid().as_raw_nonzero().get() as u32;
    let index = (pid % 50_000) * 200 + 200_000_000 + COUNTER.fetch_add(1, Ordering::Relaxed);
    let cfg = test_config();
    for pool_id in 0..4 {
        let _ = std::fs::remove_file(cfg.tmpfs_dir.join(format!("fusion.{index}.{pool_id}")));
    }
    World::create(index, cfg).unwrap()
}

// ============================================================================
// Locks across attachments
// ============================================================================

/// The pool skirmish excludes holders across separate mappings of the
/// same backing file.
#[test]
fn test_lock_excludes_across_attachments() {
    let master = fresh_world();
    let pool = master.create_pool("counter", 64 * 1024).unwrap();
    let slot = pool.allocate(8, true, true).unwrap();

    let iterations = 400;
    let num_threads = 4;
    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let joined = World::join(master.world_index(), test_config()).unwrap();
            let pool = joined.attach_pool(1).unwrap();
            thread::spawn(move || {
                for _ in 0..iterations {
                    pool.lock().prevail().unwrap();
                    // Unsynchronized read-modify-write, protected only by
                    // the skirmish.
                    unsafe {
                        let p = pool.ptr(slot).cast::<u64>();
                        let v = p.read_volatile();
                        std::hint::spin_loop();
                        p.write_volatile(v + 1);
                    }
                    pool.lock().dismiss().unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let total = unsafe { pool.ptr(slot).cast::<u64>().read_volatile() };
    assert_eq!(total, (num_threads * iterations) as u64);
    pool.deallocate(slot, true).unwrap();
    master.destroy_pool(pool).unwrap();
}

/// Ordered multi-lock takes pool locks from different attachments without
/// deadlocking, whatever order the caller lists them in.
#[test]
fn test_multi_lock_across_pools() {
    let master = fresh_world();
    let a = master.create_pool("pool a", 32 * 1024).unwrap();
    let b = master.create_pool("pool b", 32 * 1024).unwrap();

    let joined = World::join(master.world_index(), test_config()).unwrap();
    let a2 = joined.attach_pool(a.pool_id()).unwrap();
    let b2 = joined.attach_pool(b.pool_id()).unwrap();

    let rounds = 200;
    let t1 = thread::spawn(move || {
        for _ in 0..rounds {
            let locks = [a2.lock(), b2.lock()];
            prevail_multi(&[locks[0], locks[1]]).unwrap();
            fusion::dismiss_multi(&[locks[0], locks[1]]).unwrap();
        }
    });
    for _ in 0..rounds {
        // Opposite listing order from the other thread.
        prevail_multi(&[b.lock(), a.lock()]).unwrap();
        fusion::dismiss_multi(&[b.lock(), a.lock()]).unwrap();
    }
    t1.join().unwrap();

    master.destroy_pool(a).unwrap();
    master.destroy_pool(b).unwrap();
}

// ============================================================================
// Object pools across attachments
// ============================================================================

/// An object created by the master is destroyed in whichever attachment
/// drops the final reference, exactly once.
#[test]
fn test_object_destructor_runs_in_final_downer() {
    let master = fresh_world();
    let master_fired = Arc::new(AtomicUsize::new(0));
    let mf = master_fired.clone();
    let pool = ObjectPool::create(
        &master,
        master.main_pool(),
        "shared objects",
        256,
        0,
        Arc::new(move |_, _| {
            mf.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    let obj = pool.create_object(master.fusion_id()).unwrap();
    obj.activate().unwrap();
    let id = obj.id();

    // Another attachment takes a reference, then the master lets go.
    let joined = World::join(master.world_index(), test_config()).unwrap();
    let joined_fired = Arc::new(AtomicUsize::new(0));
    let jf = joined_fired.clone();
    let attached = ObjectPool::attach(
        &joined,
        joined.main_pool(),
        pool.offset(),
        Arc::new(move |_, _| {
            jf.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    let theirs = attached.get(id).unwrap();
    obj.ref_down(false).unwrap();
    assert_eq!(master_fired.load(Ordering::SeqCst), 0);
    assert_eq!(joined_fired.load(Ordering::SeqCst), 0);

    // Final down happens in the second attachment; its watcher runs.
    theirs.ref_down(false).unwrap();
    assert_eq!(joined_fired.load(Ordering::SeqCst), 1);
    assert_eq!(master_fired.load(Ordering::SeqCst), 0);

    // Both attachments agree the object is gone.
    assert!(matches!(pool.get(id), Err(Error::NotFound(_))));
    assert_eq!(attached.size().unwrap(), 0);
}

/// Object payloads written through one attachment are visible through the
/// other, and properties travel with the object.
#[test]
fn test_object_state_is_shared() {
    let master = fresh_world();
    let noop = |_: &fusion::ObjectHandle, _: bool| {};
    let pool = ObjectPool::create(
        &master,
        master.main_pool(),
        "surfaces",
        512,
        0,
        Arc::new(noop),
    )
    .unwrap();

    let obj = pool.create_object(1).unwrap();
    obj.activate().unwrap();
    unsafe { *obj.payload_ptr().cast::<u64>() = 0xdead_beef_cafe_f00d };
    obj.set_property("format", 32).unwrap();

    let joined = World::join(master.world_index(), test_config()).unwrap();
    let attached = ObjectPool::attach(
        &joined,
        joined.main_pool(),
        pool.offset(),
        Arc::new(noop),
    )
    .unwrap();
    let theirs = attached.get(obj.id()).unwrap();
    assert_eq!(
        unsafe { *theirs.payload_ptr().cast::<u64>() },
        0xdead_beef_cafe_f00d
    );
    assert_eq!(theirs.get_property("format").unwrap(), Some(32));
    assert_eq!(theirs.identity(), 1);

    theirs.ref_down(false).unwrap();
    obj.ref_down(false).unwrap();
}

/// Throw/catch hands an object between attachments without its count
/// ever touching zero.
#[test]
fn test_throw_catch_between_attachments() {
    let master = fresh_world();
    let fired = Arc::new(AtomicUsize::new(0));
    let f2 = fired.clone();
    let pool = ObjectPool::create(
        &master,
        master.main_pool(),
        "handoff",
        128,
        0,
        Arc::new(move |_, _| {
            f2.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    let joined = World::join(master.world_index(), test_config()).unwrap();
    let fired_j = Arc::new(AtomicUsize::new(0));
    let fj = fired_j.clone();
    let attached = ObjectPool::attach(
        &joined,
        joined.main_pool(),
        pool.offset(),
        Arc::new(move |_, _| {
            fj.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .unwrap();

    let obj = pool.create_object(master.fusion_id()).unwrap();
    obj.activate().unwrap();
    obj.throw(joined.fusion_id()).unwrap();
    obj.ref_down(false).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0, "thrown reference keeps it alive");

    let theirs = attached.lookup(obj.id()).unwrap().unwrap();
    theirs.catch().unwrap();
    theirs.ref_down(false).unwrap();
    assert_eq!(fired_j.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Parked call notices
// ============================================================================

/// A final `down` in a process without the watch handler parks a notice
/// that the handler's process later drains.
#[test]
fn test_death_notice_parks_until_processed() {
    let master = fresh_world();
    let fired = Arc::new(AtomicUsize::new(0));
    let f2 = fired.clone();
    let call_id = master.register_call(Arc::new(move |arg| {
        assert_eq!(arg, 42);
        f2.fetch_add(1, Ordering::SeqCst);
    }));

    let r = fusion::Ref::init(&master, master.main_pool()).unwrap();
    r.watch(call_id, 42).unwrap();
    r.up(false).unwrap();

    // The joiner has no handler for this call id; hand the counter over
    // by offset, as shared structures do.
    let joined = World::join(master.world_index(), test_config()).unwrap();
    let shared = fusion::Ref::from_offset(&joined, joined.main_pool(), r.offset());
    shared.down(false).unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0, "notice parked, not dispatched");

    assert_eq!(master.process_pending_calls(), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
