//! Object tables shared between independent mappings of one file
//!
//! Each `SharedMemoryRegion` below is a separate mmap of the same file, the
//! same situation as two processes attaching one table. The peer-process
//! tests run `shmsync-cli` as a real second process on the table file.

use std::{
    path::Path,
    process::{Command, Output},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use shmsync::{
    sync::WAITERS, Acquisition, GuardPolicy, ObjectState, ObjectTable, ObjectType, Ptid,
    RegionConfig, SemaphoreState, SharedMemoryRegion, ShmSyncError, SlotId, TableConfig,
};
use tempfile::TempDir;

fn create_table(path: &Path, config: TableConfig) -> ObjectTable {
    let region = SharedMemoryRegion::new(
        RegionConfig::new("objects", config.region_size()).with_file_path(path),
    )
    .unwrap();
    ObjectTable::create(Arc::new(region), config).unwrap()
}

fn attach_table(path: &Path, config: TableConfig) -> shmsync::Result<ObjectTable> {
    let region = SharedMemoryRegion::new(RegionConfig::open("objects", path))?;
    ObjectTable::attach(Arc::new(region), config)
}

/// Pid of a process that has already exited
fn exited_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

/// Run the command-line tool as a separate process against `path`
fn cli(path: &Path, args: &[&str]) -> Output {
    let output = Command::new(env!("CARGO_BIN_EXE_shmsync-cli"))
        .arg(args[0])
        .arg("--file")
        .arg(path)
        .args(&args[1..])
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "shmsync-cli {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

#[cfg(test)]
mod object_table_tests {
    use super::*;

    /// Test: state written through one mapping is visible through another
    #[test]
    fn test_two_mappings_share_objects() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("objects.shm");
        let first = create_table(&path, TableConfig::new(16));
        let second = attach_table(&path, TableConfig::default()).unwrap();

        assert_eq!(second.capacity(), 16);

        let mutex = first.create_mutex(None).unwrap();
        let event = first.create_event(false, false).unwrap();
        let semaphore = first.create_semaphore(1, 4).unwrap();
        assert_eq!(second.stats().allocated, 3);
        assert_eq!(second.get(semaphore).unwrap().object_type(), ObjectType::Semaphore);

        let a = Ptid::new(0xa);
        let b = Ptid::new(0xb);
        assert_eq!(second.try_wait(mutex, a).unwrap(), Acquisition::Acquired);
        assert_eq!(first.try_wait(mutex, b).unwrap(), Acquisition::NotAvailable);
        assert_eq!(first.mutex(mutex).unwrap().state().unwrap().owner, a);

        first.event(event).unwrap().signal().unwrap();
        assert!(second.event(event).unwrap().poll().unwrap());
        assert!(!first.event(event).unwrap().poll().unwrap());

        assert_eq!(second.semaphore(semaphore).unwrap().release(3).unwrap(), 1);
        assert_eq!(first.semaphore(semaphore).unwrap().state().unwrap().count, 4);

        // slots allocated through either mapping never collide
        let next = second.alloc().unwrap();
        assert_eq!(next, SlotId(3));
        assert!(first.is_allocated(next));
    }

    /// Test: mutual exclusion holds across mappings and threads
    #[test]
    fn test_cross_mapping_contention() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("objects.shm");
        let first = Arc::new(create_table(&path, TableConfig::new(4)));
        let slot = first.create_semaphore(0, 1000).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let table = attach_table(&path, TableConfig::default()).unwrap();
                    let semaphore = table.semaphore(slot).unwrap();
                    for _ in 0..250 {
                        semaphore.release(1).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let state = first.semaphore(slot).unwrap().state().unwrap();
        assert_eq!(state.count, 1000);
        assert!(first.semaphore(slot).unwrap().release(1).is_err());
    }

    /// Test: abandonment flagged through one mapping reaches the other
    #[test]
    fn test_abandon_across_mappings() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("objects.shm");
        let first = create_table(&path, TableConfig::new(8));
        let second = attach_table(&path, TableConfig::default()).unwrap();
        let dying = Ptid::new(0x77);

        let held = first.create_mutex(Some(dying)).unwrap();
        let free = first.create_mutex(None).unwrap();

        assert_eq!(second.abandon_mutexes(dying).unwrap(), 1);
        assert_eq!(second.abandon_mutexes(dying).unwrap(), 0);
        assert_eq!(
            first.try_wait(held, Ptid::new(0x78)).unwrap(),
            Acquisition::Abandoned
        );
        assert_eq!(
            first.try_wait(free, Ptid::new(0x78)).unwrap(),
            Acquisition::Acquired
        );
    }

    /// Test: attaching to a region without a published table fails
    #[test]
    fn test_attach_rejects_uninitialized_region() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("blank.shm");
        let _blank = SharedMemoryRegion::new(
            RegionConfig::new("blank", 4096).with_file_path(&path),
        )
        .unwrap();

        assert!(matches!(
            attach_table(&path, TableConfig::default()),
            Err(ShmSyncError::InvalidLayout { .. })
        ));
        assert!(attach_table(&temp_dir.path().join("missing.shm"), TableConfig::default()).is_err());
    }

    /// Test: a guard left held by an exited process is taken over
    #[test]
    fn test_recover_guard_from_dead_process() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("objects.shm");
        let table = create_table(&path, TableConfig::new(4));
        let slot = table.create_mutex(None).unwrap();

        let dead = GuardPolicy::new().with_holder_id(exited_pid());
        let hold = table.get(slot).unwrap().guard().try_acquire(&dead).unwrap().unwrap();
        std::mem::forget(hold);
        assert!(table.get(slot).unwrap().guard().is_held());

        let me = Ptid::new(0x99);
        assert_eq!(table.try_wait(slot, me).unwrap(), Acquisition::Acquired);
        assert!(!table.get(slot).unwrap().guard().is_held());
        assert_eq!(table.mutex(slot).unwrap().release(me).unwrap(), 1);
    }

    /// Test: a guard held by a live process times out instead of being stolen
    #[test]
    fn test_guard_timeout_on_live_holder() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("objects.shm");
        let config = TableConfig::new(4).with_guard_policy(
            GuardPolicy::new().with_timeout(Some(Duration::from_millis(20))),
        );
        let table = create_table(&path, config);
        let slot = table.create_event(true, true).unwrap();

        // our own pid is alive, so the stuck guard must not be recovered
        let hold = table.get(slot).unwrap().guard().try_acquire(table.policy()).unwrap().unwrap();
        std::mem::forget(hold);

        assert!(matches!(
            table.event(slot).unwrap().poll(),
            Err(ShmSyncError::GuardTimeout { .. })
        ));
        assert_eq!(
            table.get(slot).unwrap().guard().holder(),
            Some(std::process::id())
        );
    }

    /// Test: freeing and retyping a slot never lets a concurrent sweep act on the old type
    #[test]
    fn test_slot_reuse_during_sweep() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("objects.shm");
        let allocator = create_table(&path, TableConfig::new(1));
        let sweeper = attach_table(&path, TableConfig::default()).unwrap();
        let dying = Ptid::new(0x5a);
        let done = Arc::new(AtomicBool::new(false));

        let sweep_done = done.clone();
        let sweep = thread::spawn(move || {
            let mut sweeps = 0u64;
            while !sweep_done.load(Ordering::SeqCst) {
                sweeper.abandon_mutexes(dying).unwrap();
                sweeps += 1;
            }
            sweeps
        });

        for _ in 0..20_000 {
            let slot = allocator.create_mutex(Some(dying)).unwrap();
            allocator.free(slot).unwrap();

            let slot = allocator.create_semaphore(1, 1).unwrap();
            assert_eq!(
                allocator.snapshot(slot).unwrap(),
                ObjectState::Semaphore(SemaphoreState { count: 1, maximum: 1 })
            );
            allocator.free(slot).unwrap();
        }

        done.store(true, Ordering::SeqCst);
        assert!(sweep.join().unwrap() > 0);
        assert_eq!(allocator.stats().allocated, 0);
    }

    /// Test: a separate process drives objects in the same table file
    #[test]
    fn test_peer_process_operates_on_table() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("objects.shm");
        let table = create_table(&path, TableConfig::new(8));
        let semaphore = table.create_semaphore(0, 4).unwrap();
        let mutex = table.create_mutex(None).unwrap();

        cli(&path, &["release", "--slot", &semaphore.0.to_string(), "--count", "3"]);
        assert_eq!(table.semaphore(semaphore).unwrap().state().unwrap().count, 3);

        cli(&path, &["acquire", "--slot", &mutex.0.to_string(), "--ptid", "0x55"]);
        let state = table.mutex(mutex).unwrap().state().unwrap();
        assert_eq!(state.owner, Ptid::new(0x55));
        assert_eq!(state.count, 1);
        assert_eq!(
            table.try_wait(mutex, Ptid::new(0x56)).unwrap(),
            Acquisition::NotAvailable
        );

        let output = cli(&path, &["abandon", "--ptid", "0x55"]);
        assert!(String::from_utf8_lossy(&output.stdout).contains("Marked 1 mutexes"));
        assert_eq!(
            table.try_wait(mutex, Ptid::new(0x56)).unwrap(),
            Acquisition::Abandoned
        );
    }

    /// Test: a peer process parked on a live holder's guard completes after release
    #[test]
    fn test_parked_peer_process_woken() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("objects.shm");
        let table = create_table(&path, TableConfig::new(4));
        let slot = table.create_event(true, false).unwrap();
        let guard = table.get(slot).unwrap().guard();

        let hold = guard.try_acquire(table.policy()).unwrap().unwrap();
        let mut child = Command::new(env!("CARGO_BIN_EXE_shmsync-cli"))
            .arg("signal")
            .arg("--file")
            .arg(&path)
            .arg("--slot")
            .arg(slot.0.to_string())
            .spawn()
            .unwrap();

        // this process is alive, so the peer parks instead of taking over
        let deadline = Instant::now() + Duration::from_secs(4);
        while guard.raw() & WAITERS == 0 {
            assert!(Instant::now() < deadline, "peer never parked on the guard");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(guard.holder(), Some(std::process::id()));
        drop(hold);

        assert!(child.wait().unwrap().success());
        assert!(table.event(slot).unwrap().poll().unwrap());
        assert!(!guard.is_held());
    }
}
