//! Fork isolation tests
//!
//! A child inherits a copy-on-write view of the arena and its region. Writes
//! and allocator activity in the child must never be visible to the parent.
//!
//! Children report through their exit status only. They never panic or
//! print, since another test thread may have held the stdio locks at the
//! moment of the fork.

use memmap2::MmapMut;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vmem_rs::{Arena, Handle, Region};

const REGION_SIZE: usize = 1 << 20;
const BUFFERS: usize = 16;
const BUFFER_SIZE: usize = 4096;

fn fill(h: Handle, byte: u8) {
    unsafe { std::ptr::write_bytes(h.as_ptr(), byte, BUFFER_SIZE) };
}

fn holds(h: Handle, byte: u8) -> bool {
    let bytes = unsafe { std::slice::from_raw_parts(h.as_ptr(), BUFFER_SIZE) };
    bytes.iter().all(|&b| b == byte)
}

fn parent_byte(i: usize) -> u8 {
    0xA0 + i as u8
}

/// Run `child` in a forked process and return its exit code
fn fork_and_wait<F: FnOnce() -> i32>(child: F) -> i32 {
    // SAFETY: the child runs `child` and leaves through `_exit`.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        unsafe { libc::alarm(10) };
        let code = child();
        unsafe { libc::_exit(code) };
    }

    let mut status = 0;
    let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(rc, pid);
    assert!(libc::WIFEXITED(status), "child killed: status {:#x}", status);
    libc::WEXITSTATUS(status)
}

fn child_work(arena: &Arena, buffers: &[Handle]) -> i32 {
    for (i, &h) in buffers.iter().enumerate() {
        if !holds(h, parent_byte(i)) {
            return 2;
        }
    }

    if arena.owner_pid() != std::process::id() || arena.fork_generation() != 1 {
        return 3;
    }

    for &h in buffers {
        fill(h, 0xCC);
    }

    // Free half and allocate fresh buffers over the same space
    for &h in buffers.iter().step_by(2) {
        if arena.free(h).is_err() {
            return 4;
        }
    }
    for _ in 0..BUFFERS {
        match arena.allocate(BUFFER_SIZE) {
            Ok(h) => fill(h, 0xCD),
            Err(_) => return 5,
        }
    }

    if arena.check().is_err() {
        return 6;
    }
    0
}

#[test]
fn test_child_writes_do_not_reach_parent() {
    let mut map = MmapMut::map_anon(REGION_SIZE).unwrap();
    let region = unsafe { Region::from_mmap(&mut map) }.unwrap();
    let arena = Arena::create(region).unwrap();

    let buffers: Vec<_> = (0..BUFFERS)
        .map(|i| {
            let h = arena.allocate(BUFFER_SIZE).unwrap();
            fill(h, parent_byte(i));
            h
        })
        .collect();
    let before = arena.stats();

    let code = fork_and_wait(|| child_work(&arena, &buffers));
    assert_eq!(code, 0, "child reported failure {}", code);

    for (i, &h) in buffers.iter().enumerate() {
        assert!(holds(h, parent_byte(i)), "buffer {} changed in parent", i);
        assert_eq!(arena.usable_size(h).unwrap(), BUFFER_SIZE);
    }

    assert_eq!(arena.stats(), before);
    assert_eq!(arena.owner_pid(), std::process::id());
    assert_eq!(arena.fork_generation(), 0);
    arena.check().unwrap();

    // Parent keeps allocating normally after the fork
    let h = arena.allocate(BUFFER_SIZE).unwrap();
    arena.free(h).unwrap();
}

#[test]
fn test_nested_fork_generations() {
    let mut map = MmapMut::map_anon(REGION_SIZE).unwrap();
    let region = unsafe { Region::from_mmap(&mut map) }.unwrap();
    let arena = Arena::create(region).unwrap();
    let h = arena.allocate(BUFFER_SIZE).unwrap();
    fill(h, 0x11);

    let code = fork_and_wait(|| {
        fill(h, 0x22);
        let grandchild = fork_and_wait(|| {
            if arena.fork_generation() != 2 || !holds(h, 0x22) {
                return 1;
            }
            fill(h, 0x33);
            match arena.allocate(64) {
                Ok(_) => 0,
                Err(_) => 2,
            }
        });
        if grandchild != 0 {
            return 10 + grandchild;
        }
        if arena.fork_generation() != 1 || !holds(h, 0x22) {
            return 3;
        }
        0
    });

    assert_eq!(code, 0, "child reported failure {}", code);
    assert!(holds(h, 0x11));
}

#[test]
fn test_unguarded_arena_still_copies() {
    let mut map = MmapMut::map_anon(REGION_SIZE).unwrap();
    let region = unsafe { Region::from_mmap(&mut map) }.unwrap();
    let arena = vmem_rs::ArenaBuilder::new()
        .fork_safe(false)
        .build(region)
        .unwrap();

    let h = arena.allocate(BUFFER_SIZE).unwrap();
    fill(h, 0x44);

    // No thread touches this arena during the fork, so its lock is free
    let code = fork_and_wait(|| {
        fill(h, 0x55);
        if arena.fork_generation() != 0 {
            return 1;
        }
        match arena.free(h) {
            Ok(()) => 0,
            Err(_) => 2,
        }
    });

    assert_eq!(code, 0);
    assert!(holds(h, 0x44));
    assert_eq!(arena.usable_size(h).unwrap(), BUFFER_SIZE);
}

#[test]
fn test_child_can_exec_while_arena_is_busy() {
    let mut map = MmapMut::map_anon(REGION_SIZE).unwrap();
    let region = unsafe { Region::from_mmap(&mut map) }.unwrap();
    let arena = Arc::new(Arena::create(region).unwrap());
    let stop = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..2)
        .map(|_| {
            let arena = arena.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let h = arena.allocate(BUFFER_SIZE).unwrap();
                    fill(h, 0x77);
                    arena.free(h).unwrap();
                }
            })
        })
        .collect();

    // Built before forking so the child does not allocate before exec
    let path = CString::new("/bin/true").unwrap();
    let argv = [path.as_ptr(), std::ptr::null()];

    for _ in 0..10 {
        let code = fork_and_wait(|| {
            unsafe { libc::execv(path.as_ptr(), argv.as_ptr()) };
            127
        });
        assert_eq!(code, 0, "exec in child failed with {}", code);
    }

    stop.store(true, Ordering::Relaxed);
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(arena.stats().live_allocations, 0);
    assert_eq!(arena.fork_generation(), 0);
    arena.check().unwrap();
}
