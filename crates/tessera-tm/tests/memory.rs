//! End-to-end behavior of the transactional memory substrate: isolation,
//! write-back commit, snapshot rollback, and privatization.

#![allow(unsafe_code)]

use std::thread;

use tessera_core::Transaction;
use tessera_types::{BLOCK_SIZE, PrivatizeFlags};

/// Block-aligned test arena. Leaked so its address stays valid for any
/// worker threads spawned by a test.
#[repr(align(64))]
struct Arena([u8; 4 * BLOCK_SIZE]);

fn leak_arena(fill: u8) -> usize {
    let arena = Box::leak(Box::new(Arena([fill; 4 * BLOCK_SIZE])));
    arena.0.as_mut_ptr() as usize
}

fn raw_read(addr: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0_u8; len];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = unsafe { *((addr + i) as *const u8) };
    }
    out
}

#[test]
fn test_store_then_load_returns_stored_value() {
    let addr = leak_arena(0);
    let mut tx = Transaction::new();

    tx.run(|tx| {
        unsafe {
            tessera_tm::store(tx, addr, &[0xAB, 0xCD, 0xEF])?;
            let mut out = [0_u8; 3];
            tessera_tm::load(tx, addr, &mut out)?;
            assert_eq!(out, [0xAB, 0xCD, 0xEF]);
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_commit_publishes_to_memory() {
    let addr = leak_arena(0);
    let mut tx = Transaction::new();

    tx.run(|tx| unsafe { tessera_tm::store(tx, addr + 10, &[7, 8, 9]) })
        .unwrap();

    assert_eq!(raw_read(addr + 10, 3), [7, 8, 9]);
}

#[test]
fn test_restart_leaves_no_net_change() {
    let addr = leak_arena(0x11);
    let mut tx = Transaction::new();

    let mut first = true;
    tx.run(|tx| {
        if first {
            first = false;
            unsafe { tessera_tm::store(tx, addr, &[0xFF; BLOCK_SIZE * 2])? };
            return tx.restart();
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(raw_read(addr, BLOCK_SIZE * 2), vec![0x11; BLOCK_SIZE * 2]);
}

#[test]
fn test_store_spanning_blocks() {
    let addr = leak_arena(0);
    let mut tx = Transaction::new();

    // Write across a block boundary.
    let start = addr + BLOCK_SIZE - 4;
    tx.run(|tx| unsafe { tessera_tm::store(tx, start, &[1, 2, 3, 4, 5, 6, 7, 8]) })
        .unwrap();

    assert_eq!(raw_read(start, 8), [1, 2, 3, 4, 5, 6, 7, 8]);
    // Neighbors untouched.
    assert_eq!(raw_read(start - 1, 1), [0]);
    assert_eq!(raw_read(start + 8, 1), [0]);
}

#[test]
fn test_load_store_copies_between_regions() {
    let addr = leak_arena(0);
    let mut tx = Transaction::new();

    tx.run(|tx| unsafe {
        tessera_tm::store(tx, addr, b"transactional")?;
        tessera_tm::load_store(tx, addr, addr + 2 * BLOCK_SIZE, b"transactional".len())
    })
    .unwrap();

    assert_eq!(raw_read(addr + 2 * BLOCK_SIZE, 13), b"transactional");
}

#[test]
fn test_typed_value_round_trip() {
    let addr = leak_arena(0);
    let mut tx = Transaction::new();

    let out = tx
        .run(|tx| unsafe {
            tessera_tm::store_value::<u64>(tx, addr, 0xDEAD_BEEF_CAFE_F00D)?;
            tessera_tm::load_value::<u64>(tx, addr)
        })
        .unwrap();
    assert_eq!(out, 0xDEAD_BEEF_CAFE_F00D);
}

#[test]
fn test_privatized_store_reverted_on_rollback() {
    let addr = leak_arena(0x44);
    let mut tx = Transaction::new();

    let mut first = true;
    tx.run(|tx| {
        if first {
            first = false;
            unsafe {
                tessera_tm::privatize(tx, addr, BLOCK_SIZE, PrivatizeFlags::STORE)?;
                // Raw write, as privatization allows.
                std::ptr::write_bytes(addr as *mut u8, 0x99, BLOCK_SIZE);
            }
            return tx.restart();
        }
        Ok(())
    })
    .unwrap();

    // The write-through page was reverted, not applied.
    assert_eq!(raw_read(addr, BLOCK_SIZE), vec![0x44; BLOCK_SIZE]);
}

#[test]
fn test_privatized_store_survives_commit() {
    let addr = leak_arena(0x44);
    let mut tx = Transaction::new();

    tx.run(|tx| {
        unsafe {
            tessera_tm::privatize(tx, addr, 8, PrivatizeFlags::STORE)?;
            std::ptr::write_bytes(addr as *mut u8, 0x77, 8);
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(raw_read(addr, 8), vec![0x77; 8]);
}

#[test]
fn test_privatize_after_buffered_write_publishes_and_reverts() {
    let addr = leak_arena(0x10);
    let mut tx = Transaction::new();

    let mut first = true;
    tx.run(|tx| {
        if first {
            first = false;
            unsafe {
                // Buffered write, then privatization of the same block.
                tessera_tm::store(tx, addr, &[0x66; 8])?;
                tessera_tm::privatize(tx, addr, 8, PrivatizeFlags::LOADSTORE)?;
                // The buffered write became visible through raw pointers.
                assert_eq!(raw_read(addr, 8), vec![0x66; 8]);
            }
            return tx.restart();
        }
        Ok(())
    })
    .unwrap();

    // Rollback restored the pre-transaction bytes.
    assert_eq!(raw_read(addr, 8), vec![0x10; 8]);

    tx.run(|tx| {
        unsafe {
            tessera_tm::store(tx, addr, &[0x67; 8])?;
            tessera_tm::privatize(tx, addr, 8, PrivatizeFlags::LOADSTORE)?;
        }
        Ok(())
    })
    .unwrap();
    assert_eq!(raw_read(addr, 8), vec![0x67; 8]);
}

#[test]
fn test_privatize_release_discards_undo() {
    let addr = leak_arena(0x20);
    let mut tx = Transaction::new();

    let mut first = true;
    tx.run(|tx| {
        if first {
            first = false;
            unsafe {
                tessera_tm::privatize(tx, addr, 4, PrivatizeFlags::STORE)?;
                std::ptr::write_bytes(addr as *mut u8, 0x30, 4);
                // Declare the region dead: rollback must not restore it.
                tessera_tm::privatize(tx, addr, 4, PrivatizeFlags::empty())?;
            }
            return tx.restart();
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(raw_read(addr, 4), vec![0x30; 4]);
}

#[test]
fn test_privatize_c_stops_at_sentinel() {
    let addr = leak_arena(0);
    // A string spanning a block boundary, terminated mid-second-block.
    let text = vec![b'x'; BLOCK_SIZE + 10];
    let mut tx = Transaction::new();

    tx.run(|tx| {
        unsafe {
            tessera_tm::store(tx, addr, &text)?;
            tessera_tm::store(tx, addr + text.len(), &[0])?;
        }
        Ok(())
    })
    .unwrap();

    tx.run(|tx| {
        unsafe { tessera_tm::privatize_c(tx, addr, 0, PrivatizeFlags::LOAD)? };
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_concurrent_disjoint_writers_both_commit() {
    let addr = leak_arena(0);

    let handles: Vec<_> = (0..2)
        .map(|worker: usize| {
            thread::spawn(move || {
                let mut tx = Transaction::new();
                let my_addr = addr + worker * 2 * BLOCK_SIZE;
                let mut body_runs = 0_u32;
                for round in 0..500_u64 {
                    tx.run(|tx| unsafe {
                        body_runs += 1;
                        let current = tessera_tm::load_value::<u64>(tx, my_addr)?;
                        tessera_tm::store_value::<u64>(tx, my_addr, current + round)
                    })
                    .unwrap();
                }
                // Disjoint block sets never force a restart.
                assert_eq!(body_runs, 500);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    let expected: u64 = (0..500).sum();
    for worker in 0..2 {
        let mut tx = Transaction::new();
        let my_addr = addr + worker * 2 * BLOCK_SIZE;
        let value = tx
            .run(|tx| unsafe { tessera_tm::load_value::<u64>(tx, my_addr) })
            .unwrap();
        assert_eq!(value, expected);
    }
}

#[test]
fn test_no_torn_reads_across_blocks() {
    const PATTERN_A: [u8; 16] = [0x00; 16];
    const PATTERN_B: [u8; 16] = [0xFF; 16];

    let addr = leak_arena(0);
    // Straddle a block boundary so the value spans two frames.
    let target = addr + BLOCK_SIZE - 8;

    let writer = thread::spawn(move || {
        let mut tx = Transaction::new();
        for round in 0..400 {
            let pattern = if round % 2 == 0 { PATTERN_B } else { PATTERN_A };
            tx.run(|tx| unsafe { tessera_tm::store(tx, target, &pattern) })
                .unwrap();
        }
    });

    let reader = thread::spawn(move || {
        let mut tx = Transaction::new();
        for _ in 0..400 {
            let mut out = [0_u8; 16];
            tx.run(|tx| unsafe { tessera_tm::load(tx, target, &mut out) })
                .unwrap();
            assert!(
                out == PATTERN_A || out == PATTERN_B,
                "torn read observed: {out:?}"
            );
        }
    });

    writer.join().unwrap();
    reader.join().unwrap();
}
