use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use crate::state::{
    FLAG_BITS, MAX_READERS, ONE_READER, READ_WAITERS, State, UNLOCKED, UPGRADING, WRITE_WAITERS,
};
use crate::{Config, Error, Lock, RwLock, RwLockWriteGuard, ThreadId};

/// Spins until `condition` holds.
fn wait_for<F: FnMut() -> bool>(mut condition: F) {
    while !condition() {
        thread::yield_now();
    }
}

#[test]
fn lock_sync() {
    let num_threads = if cfg!(miri) { 4 } else { 16 };
    let num_iters = if cfg!(miri) { 16 } else { 256 };

    let lock = Arc::new(Lock::default());
    let check = Arc::new(AtomicUsize::new(0));

    lock.write_lock();
    check.fetch_add(usize::MAX, Relaxed);

    let mut threads = Vec::new();
    for _ in 0..num_threads {
        let lock = lock.clone();
        let check = check.clone();
        threads.push(thread::spawn(move || {
            for j in 0..num_iters {
                if j % 11 == 0 {
                    lock.write_lock();
                    assert_eq!(check.fetch_add(usize::MAX, Relaxed), 0);
                    thread::sleep(Duration::from_micros(1));
                    check.fetch_sub(usize::MAX, Relaxed);
                    assert!(lock.write_unlock().is_ok());
                } else {
                    lock.read_lock();
                    assert_ne!(check.fetch_add(1, Relaxed), usize::MAX);
                    thread::sleep(Duration::from_micros(1));
                    check.fetch_sub(1, Relaxed);
                    assert!(lock.read_unlock().is_ok());
                }
            }
        }));
    }

    thread::sleep(Duration::from_millis(if cfg!(miri) { 1 } else { 10 }));
    check.fetch_sub(usize::MAX, Relaxed);
    assert!(lock.write_unlock().is_ok());

    for thread in threads {
        assert!(thread.join().is_ok());
    }
    assert_eq!(check.load(Relaxed), 0);
    assert!(lock.is_free(Relaxed));
    assert_eq!(lock.parked_readers(), 0);
    assert_eq!(lock.parked_writers(), 0);
}

#[test]
fn counter() {
    let num_threads = 4;
    let num_iters = if cfg!(miri) { 64 } else { 1_000_000 };

    let lock = Arc::new(Lock::default());
    let counter = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for _ in 0..num_threads {
        let lock = lock.clone();
        let counter = counter.clone();
        threads.push(thread::spawn(move || {
            for _ in 0..num_iters {
                lock.write_lock();
                let value = counter.load(Relaxed);
                counter.store(value + 1, Relaxed);
                assert!(lock.write_unlock().is_ok());
            }
        }));
    }
    for thread in threads {
        assert!(thread.join().is_ok());
    }

    lock.read_lock();
    assert_eq!(counter.load(Relaxed), num_threads * num_iters);
    assert!(lock.read_unlock().is_ok());
}

#[test]
fn readers_share() {
    let num_threads = if cfg!(miri) { 4 } else { 8 };

    let lock = Arc::new(Lock::default());
    let barrier = Arc::new(Barrier::new(num_threads));

    let mut threads = Vec::new();
    for _ in 0..num_threads {
        let lock = lock.clone();
        let barrier = barrier.clone();
        threads.push(thread::spawn(move || {
            lock.read_lock();
            barrier.wait();
            assert_eq!(lock.readers(Relaxed), num_threads);
            assert!(!lock.try_write_lock());
            barrier.wait();
            assert!(lock.read_unlock().is_ok());
        }));
    }
    for thread in threads {
        assert!(thread.join().is_ok());
    }
    assert!(lock.is_free(Relaxed));
}

#[test]
fn recursive_write() {
    let lock = Arc::new(Lock::default());
    let try_from_other_thread = |lock: &Arc<Lock>| {
        let lock = lock.clone();
        thread::spawn(move || {
            let acquired = lock.try_write_lock();
            if acquired {
                assert!(lock.write_unlock().is_ok());
            } else {
                assert!(!lock.try_read_lock());
            }
            acquired
        })
        .join()
        .unwrap()
    };

    lock.write_lock();
    lock.write_lock();
    assert!(lock.try_write_lock());
    assert_eq!(lock.recursion_depth(), 3);
    assert_eq!(lock.owner(Relaxed), Some(ThreadId::current()));
    assert!(!try_from_other_thread(&lock));

    assert!(lock.write_unlock().is_ok());
    assert!(lock.write_unlock().is_ok());
    assert_eq!(lock.recursion_depth(), 1);
    assert!(lock.is_locked(Relaxed));
    assert!(!try_from_other_thread(&lock));

    assert!(lock.write_unlock().is_ok());
    assert_eq!(lock.recursion_depth(), 0);
    assert_eq!(lock.owner(Relaxed), None);
    assert!(try_from_other_thread(&lock));
    assert!(lock.is_free(Relaxed));
}

#[test]
fn write_blocks_readers() {
    let lock = Arc::new(Lock::default());
    let check = Arc::new(AtomicUsize::new(0));

    lock.write_lock();

    let lock_clone = lock.clone();
    let check_clone = check.clone();
    let reader = thread::spawn(move || {
        lock_clone.read_lock();
        assert_eq!(check_clone.load(Relaxed), 1);
        assert!(lock_clone.read_unlock().is_ok());
    });

    wait_for(|| lock.parked_readers() == 1);
    check.store(1, Relaxed);
    assert!(lock.write_unlock().is_ok());
    assert!(reader.join().is_ok());
    assert!(lock.is_free(Relaxed));
}

#[test]
fn writer_priority() {
    let lock = Arc::new(Lock::default());
    let sequence = Arc::new(AtomicUsize::new(0));

    lock.read_lock();

    let lock_clone = lock.clone();
    let sequence_clone = sequence.clone();
    let writer = thread::spawn(move || {
        lock_clone.write_lock();
        let order = sequence_clone.fetch_add(1, SeqCst);
        assert!(lock_clone.write_unlock().is_ok());
        order
    });
    wait_for(|| lock.parked_writers() == 1);

    // A pending writer turns new readers away even though the lock is shared.
    assert!(!lock.try_read_lock());

    let lock_clone = lock.clone();
    let sequence_clone = sequence.clone();
    let reader = thread::spawn(move || {
        lock_clone.read_lock();
        let order = sequence_clone.fetch_add(1, SeqCst);
        assert!(lock_clone.read_unlock().is_ok());
        order
    });
    wait_for(|| lock.parked_readers() == 1);

    assert!(lock.read_unlock().is_ok());

    let writer_order = writer.join().unwrap();
    let reader_order = reader.join().unwrap();
    assert!(writer_order < reader_order);
    assert!(lock.is_free(Relaxed));
    assert!(lock.try_read_lock());
    assert!(lock.read_unlock().is_ok());
}

#[test]
fn readers_drain_before_writer() {
    let lock = Arc::new(Lock::default());
    let check = Arc::new(AtomicUsize::new(0));

    lock.read_lock();
    lock.read_lock();

    let lock_clone = lock.clone();
    let check_clone = check.clone();
    let writer = thread::spawn(move || {
        lock_clone.write_lock();
        assert_eq!(check_clone.load(Relaxed), 2);
        assert!(lock_clone.write_unlock().is_ok());
    });
    wait_for(|| lock.parked_writers() == 1);

    check.fetch_add(1, Relaxed);
    assert!(lock.read_unlock().is_ok());
    assert!(lock.is_shared(Relaxed));

    check.fetch_add(1, Relaxed);
    assert!(lock.read_unlock().is_ok());

    assert!(writer.join().is_ok());
    assert!(lock.is_free(Relaxed));
}

#[test]
fn upgrade_sole_reader() {
    let lock = Lock::default();

    lock.read_lock();
    assert!(lock.upgrade().is_ok());
    assert!(lock.is_owned_by_current());
    assert_eq!(lock.readers(Relaxed), 0);
    assert_eq!(lock.recursion_depth(), 1);

    lock.write_lock();
    assert!(lock.write_unlock().is_ok());
    assert!(lock.write_unlock().is_ok());
    assert!(lock.is_free(Relaxed));

    lock.read_lock();
    assert_eq!(lock.try_upgrade(), Ok(true));
    assert!(lock.is_locked(Relaxed));
    assert!(lock.write_unlock().is_ok());
}

#[test]
fn upgrade_waits_for_readers() {
    let lock = Arc::new(Lock::default());
    let check = Arc::new(AtomicUsize::new(0));

    lock.read_lock();

    let lock_clone = lock.clone();
    let check_clone = check.clone();
    let upgrader = thread::spawn(move || {
        lock_clone.read_lock();
        assert!(lock_clone.upgrade().is_ok());
        assert_eq!(check_clone.fetch_add(usize::MAX, Relaxed), 1);
        assert!(lock_clone.is_owned_by_current());
        check_clone.fetch_sub(usize::MAX, Relaxed);
        assert!(lock_clone.write_unlock().is_ok());
    });
    wait_for(|| lock.parked_writers() == 1);

    assert_eq!(lock.readers(Relaxed), 2);
    assert!(!lock.try_read_lock());
    assert!(!lock.try_write_lock());
    assert_eq!(lock.try_upgrade(), Ok(false));

    check.fetch_add(1, Relaxed);
    assert!(lock.read_unlock().is_ok());

    assert!(upgrader.join().is_ok());
    assert_eq!(check.load(Relaxed), 1);
    assert!(lock.is_free(Relaxed));
}

#[test]
fn upgrade_conflict() {
    let lock = Arc::new(Lock::default());

    lock.read_lock();

    let lock_clone = lock.clone();
    let upgrader = thread::spawn(move || {
        lock_clone.read_lock();
        assert!(lock_clone.upgrade().is_ok());
        assert!(lock_clone.write_unlock().is_ok());
    });
    wait_for(|| lock.parked_writers() == 1);

    assert_eq!(lock.upgrade(), Err(Error::UpgradeConflict));
    assert_eq!(lock.readers(Relaxed), 2);

    assert!(lock.read_unlock().is_ok());
    assert!(upgrader.join().is_ok());
    assert!(lock.is_free(Relaxed));
}

#[test]
fn downgrade_wakes_readers() {
    let lock = Arc::new(Lock::default());

    lock.write_lock();
    lock.write_lock();

    let lock_clone = lock.clone();
    let reader = thread::spawn(move || {
        lock_clone.read_lock();
        assert!(lock_clone.readers(Relaxed) >= 1);
        assert!(lock_clone.read_unlock().is_ok());
    });
    wait_for(|| lock.parked_readers() == 1);

    assert!(lock.downgrade().is_ok());
    assert!(lock.is_shared(Relaxed));
    assert_eq!(lock.recursion_depth(), 0);
    assert_eq!(lock.write_unlock(), Err(Error::NotHeldByCaller));

    assert!(reader.join().is_ok());
    assert_eq!(lock.readers(Relaxed), 1);
    assert!(lock.read_unlock().is_ok());
    assert!(lock.is_free(Relaxed));
}

#[test]
fn downgrade_keeps_writer_priority() {
    let lock = Arc::new(Lock::default());

    lock.write_lock();

    let lock_clone = lock.clone();
    let writer = thread::spawn(move || {
        lock_clone.write_lock();
        assert!(lock_clone.write_unlock().is_ok());
    });
    wait_for(|| lock.parked_writers() == 1);

    assert!(lock.downgrade().is_ok());
    assert!(!lock.try_read_lock());
    assert!(lock.read_unlock().is_ok());

    assert!(writer.join().is_ok());
    assert!(lock.is_free(Relaxed));
}

/// Checks that a thread other than the caller can join the shared holders.
fn reader_joins(lock: &Arc<Lock>) -> bool {
    let lock = lock.clone();
    thread::spawn(move || {
        let joined = lock.try_read_lock();
        if joined {
            assert!(lock.read_unlock().is_ok());
        }
        joined
    })
    .join()
    .unwrap()
}

#[test]
fn downgrade_after_contended_write() {
    let lock = Arc::new(Lock::default());

    lock.write_lock();

    let lock_clone = lock.clone();
    let writer = thread::spawn(move || {
        lock_clone.write_lock();
        assert!(lock_clone.downgrade().is_ok());
        assert_eq!(lock_clone.parked_writers(), 0);
        assert!(reader_joins(&lock_clone));

        lock_clone.read_lock();
        assert_eq!(lock_clone.readers(Relaxed), 2);
        assert!(lock_clone.read_unlock().is_ok());
        assert!(lock_clone.read_unlock().is_ok());
    });
    wait_for(|| lock.parked_writers() == 1);

    assert!(lock.write_unlock().is_ok());
    assert!(writer.join().is_ok());
    assert!(lock.is_free(Relaxed));
    assert!(reader_joins(&lock));
}

#[test]
fn downgrade_after_contended_upgrade() {
    let lock = Arc::new(Lock::default());

    lock.read_lock();

    let lock_clone = lock.clone();
    let upgrader = thread::spawn(move || {
        lock_clone.read_lock();
        assert!(lock_clone.upgrade().is_ok());
        assert!(lock_clone.downgrade().is_ok());
        assert_eq!(lock_clone.parked_writers(), 0);
        assert!(reader_joins(&lock_clone));
        assert!(lock_clone.read_unlock().is_ok());
    });
    wait_for(|| lock.parked_writers() == 1);

    assert!(lock.read_unlock().is_ok());
    assert!(upgrader.join().is_ok());
    assert!(lock.is_free(Relaxed));
    assert!(reader_joins(&lock));
}

#[test]
fn rwlock_read_after_contended_downgrade() {
    let rwlock: Arc<RwLock<usize>> = Arc::new(RwLock::new(0));

    let guard = rwlock.write();

    let rwlock_clone = rwlock.clone();
    let writer = thread::spawn(move || {
        let mut guard = rwlock_clone.write();
        *guard += 1;
        let guard = RwLockWriteGuard::downgrade(guard);
        let again = rwlock_clone.read();
        assert_eq!(*guard + *again, 2);
    });
    // SAFETY: the raw lock is only inspected.
    wait_for(|| unsafe { rwlock.raw() }.parked_writers() == 1);

    drop(guard);
    assert!(writer.join().is_ok());
    assert_eq!(*rwlock.read(), 1);
}

#[test]
fn misuse() {
    let lock = Arc::new(Lock::default());

    assert_eq!(lock.read_unlock(), Err(Error::NoSharedHolders));
    assert_eq!(lock.write_unlock(), Err(Error::NotHeldByCaller));
    assert_eq!(lock.downgrade(), Err(Error::NotHeldByCaller));
    assert_eq!(lock.upgrade(), Err(Error::InvalidUpgradeState));
    assert_eq!(lock.try_upgrade(), Err(Error::InvalidUpgradeState));
    assert!(lock.is_free(Relaxed));

    lock.write_lock();
    assert_eq!(lock.read_unlock(), Err(Error::NoSharedHolders));
    assert_eq!(lock.upgrade(), Err(Error::InvalidUpgradeState));

    let lock_clone = lock.clone();
    thread::spawn(move || {
        assert_eq!(lock_clone.write_unlock(), Err(Error::NotHeldByCaller));
        assert_eq!(lock_clone.downgrade(), Err(Error::NotHeldByCaller));
    })
    .join()
    .unwrap();

    assert!(lock.is_owned_by_current());
    assert_eq!(lock.recursion_depth(), 1);
    assert!(lock.write_unlock().is_ok());

    lock.read_lock();
    assert_eq!(lock.write_unlock(), Err(Error::NotHeldByCaller));
    assert_eq!(lock.downgrade(), Err(Error::NotHeldByCaller));
    assert_eq!(lock.readers(Relaxed), 1);
    assert!(lock.read_unlock().is_ok());
}

#[test]
fn error_display() {
    assert_eq!(
        Error::NotHeldByCaller.to_string(),
        "lock is not held exclusively by the caller"
    );
    assert_eq!(
        Error::UpgradeConflict.to_string(),
        "another shared holder is already upgrading"
    );
    let error: Box<dyn std::error::Error> = Box::new(Error::NoSharedHolders);
    assert_eq!(error.to_string(), "lock is not held in shared mode");
}

#[derive(Debug, Default)]
struct FixedContext;

impl Config for FixedContext {
    fn thread_id() -> ThreadId {
        ThreadId::new(42).unwrap()
    }
}

#[test]
fn custom_config() {
    let lock: Arc<Lock<FixedContext>> = Arc::new(Lock::with_config());

    lock.write_lock();
    assert_eq!(lock.owner(Relaxed), ThreadId::new(42));

    // Every thread reports the same identity, so another thread re-enters the lock.
    let lock_clone = lock.clone();
    thread::spawn(move || {
        assert!(lock_clone.is_owned_by_current());
        assert!(lock_clone.try_write_lock());
        assert!(lock_clone.write_unlock().is_ok());
    })
    .join()
    .unwrap();

    assert_eq!(lock.recursion_depth(), 1);
    assert!(lock.write_unlock().is_ok());
    assert!(lock.is_free(Relaxed));
}

#[test]
fn thread_id() {
    assert!(ThreadId::new(0).is_none());
    assert!(ThreadId::new(ThreadId::MAX + 1).is_none());
    assert_eq!(ThreadId::new(ThreadId::MAX).map(ThreadId::get), Some(ThreadId::MAX));

    let id = ThreadId::current();
    assert_eq!(id, ThreadId::current());

    let others = (0..4)
        .map(|_| thread::spawn(ThreadId::current))
        .collect::<Vec<_>>()
        .into_iter()
        .map(|thread| thread.join().unwrap())
        .collect::<Vec<_>>();
    for (i, other) in others.iter().enumerate() {
        assert_ne!(*other, id);
        assert!(others[i + 1..].iter().all(|o| o != other));
    }

    let max = ThreadId::new(ThreadId::MAX).unwrap();
    assert_eq!(ThreadId::from_owner_bits(max.to_owner_bits()), Some(max));
}

#[test]
fn state_encoding() {
    let id = ThreadId::new(3).unwrap();

    let unlocked = State(UNLOCKED);
    assert!(unlocked.is_free());
    assert!(unlocked.can_read());
    assert!(unlocked.can_write());
    assert!(!unlocked.is_shared());
    assert!(!unlocked.is_exclusive());
    assert_eq!(unlocked.owner(), None);

    let shared = unlocked.with_reader_added().with_reader_added();
    assert_eq!(shared.0, UNLOCKED + 2 * ONE_READER);
    assert_eq!(shared.readers(), 2);
    assert!(!shared.can_write());
    assert!(!shared.can_upgrade());
    assert!(shared.with_reader_removed().can_upgrade());

    // Hints never make the word look held.
    let hinted = State(UNLOCKED | READ_WAITERS | WRITE_WAITERS | UPGRADING);
    assert!(hinted.is_free());
    assert!(hinted.can_write());
    assert!(!hinted.can_read());
    assert!(!State(shared.0 | UPGRADING).can_read());

    let exclusive = State::exclusive(id, State(shared.0 | READ_WAITERS | UPGRADING));
    assert_eq!(exclusive.0, (3 << FLAG_BITS) | READ_WAITERS);
    assert!(exclusive.is_exclusive());
    assert!(exclusive.is_owned_by(id));
    assert!(!exclusive.is_owned_by(ThreadId::new(4).unwrap()));
    assert_eq!(exclusive.owner(), Some(id));
    assert_eq!(exclusive.readers(), 0);
    assert!(!exclusive.can_read());
    assert!(!exclusive.can_write());

    assert_eq!(State::unlocked(exclusive).0, UNLOCKED | READ_WAITERS);
    let downgraded = State::downgraded(State(exclusive.0 | WRITE_WAITERS));
    assert_eq!(downgraded.0, UNLOCKED + ONE_READER + WRITE_WAITERS);
    assert!(downgraded.can_upgrade());
    assert!(!downgraded.has_read_waiters());
}

#[test]
#[should_panic(expected = "too many shared holders")]
fn reader_overflow() {
    let saturated = State(UNLOCKED | (MAX_READERS << FLAG_BITS));
    assert_eq!(saturated.readers(), MAX_READERS);
    let _ = saturated.with_reader_added();
}

#[test]
fn debug_output() {
    let lock = Lock::default();
    lock.read_lock();

    let output = format!("{lock:?}");
    assert!(output.starts_with("Lock"));
    assert!(output.contains("readers: 1"));
    assert!(output.contains("owner: None"));
    assert!(lock.read_unlock().is_ok());
}

#[test]
fn rwlock() {
    let num_threads = if cfg!(miri) { 4 } else { 16 };
    let num_iters = if cfg!(miri) { 16 } else { 256 };

    let rwlock: Arc<RwLock<usize>> = Arc::new(RwLock::new(0));

    let mut threads = Vec::new();
    for i in 0..num_threads {
        let rwlock = rwlock.clone();
        threads.push(thread::spawn(move || {
            for j in 0..num_iters {
                if (i + j) % 3 == 0 {
                    *rwlock.write() += 1;
                } else {
                    let guard = rwlock.read();
                    assert!(*guard <= num_threads * num_iters);
                }
            }
        }));
    }
    for thread in threads {
        assert!(thread.join().is_ok());
    }

    let expected = (0..num_threads)
        .map(|i| (0..num_iters).filter(|j| (i + j) % 3 == 0).count())
        .sum::<usize>();
    assert_eq!(*rwlock.read(), expected);
    assert!(!rwlock.is_locked());
}

#[test]
fn rwlock_downgrade() {
    let rwlock: RwLock<usize> = RwLock::new(1);

    let mut guard = rwlock.write();
    assert!(rwlock.is_locked_exclusive());
    assert!(rwlock.try_write().is_none());
    *guard += 1;

    let guard = RwLockWriteGuard::downgrade(guard);
    assert!(rwlock.is_locked());
    assert!(!rwlock.is_locked_exclusive());
    assert!(rwlock.try_write().is_none());
    assert_eq!(*rwlock.try_read().unwrap(), 2);
    assert_eq!(*guard, 2);
    drop(guard);

    assert!(!rwlock.is_locked());
    assert!(rwlock.try_write().is_some());
}

#[test]
#[should_panic(expected = "write guard requested by the thread that already holds one")]
fn rwlock_reentrant_write() {
    let rwlock: RwLock<usize> = RwLock::new(0);
    let _guard = rwlock.write();
    let _second = rwlock.write();
}
