//! Boot-time self tests
//!
//! Sanity checks run on the boot processor before any task exists
//! (allocator and collections), plus the multitasking smoke test both
//! the BP and every AP run once tasking is up.

use alloc::vec::Vec;

use crate::collections::{BTree, RingBuffer};
use crate::kern::task::Task;
use crate::kern::{cpu, sched};
use crate::types::{Error, Result, NANOSECS_IN_MS, PAGE_SIZE};

fn test_allocator() -> Result<()> {
    let mut size = 1;
    while size <= 8 * PAGE_SIZE {
        let mut block: Vec<u8> = Vec::new();
        if block.try_reserve_exact(size).is_err() {
            return Err(Error::NoMemory);
        }
        block.resize(size, 0);

        block[0] = 1;
        block[size / 2] = 1;
        block[size - 1] = 1;

        size += 1;
    }
    Ok(())
}

fn test_btree() -> Result<()> {
    log::debug!("btree test started");

    let key_count: u32 = 431;
    let mut tree: BTree<u32, u32, 4> = BTree::new();

    if !tree.check() {
        return Err(Error::Unsuccessful);
    }

    for key in 0..key_count {
        if !tree.insert(key, key) {
            log::debug!("btree test: can't insert key {}", key);
            return Err(Error::Unsuccessful);
        }
    }
    if !tree.check() {
        return Err(Error::Unsuccessful);
    }

    for key in 0..key_count {
        if tree.lookup(&key) != Some(&key) {
            log::debug!("btree test: can't find key {}", key);
            return Err(Error::Unsuccessful);
        }
    }

    for key in 0..key_count / 2 {
        if !tree.delete(&key) {
            log::debug!("btree test: can't delete key {}", key);
            return Err(Error::Unsuccessful);
        }
    }
    if !tree.check() {
        return Err(Error::Unsuccessful);
    }

    for key in key_count / 2..key_count {
        if tree.lookup(&key) != Some(&key) {
            return Err(Error::Unsuccessful);
        }
    }

    for key in key_count / 2..key_count {
        if !tree.delete(&key) {
            return Err(Error::Unsuccessful);
        }
    }
    if !tree.check() {
        return Err(Error::Unsuccessful);
    }

    for key in 0..key_count {
        if tree.contains(&key) {
            log::debug!("btree test: key {} still present", key);
            return Err(Error::Unsuccessful);
        }
    }

    for key in 0..key_count {
        if !tree.insert(key, key) {
            return Err(Error::Unsuccessful);
        }
    }
    if !tree.check() {
        return Err(Error::Unsuccessful);
    }

    log::debug!(
        "btree test: min depth {} max depth {}",
        tree.min_depth(),
        tree.max_depth()
    );

    tree.clear();
    if !tree.check() {
        return Err(Error::Unsuccessful);
    }

    log::debug!("btree test complete");
    Ok(())
}

fn test_ring_buffer() -> Result<()> {
    let mut rb: RingBuffer<u8, 3> = RingBuffer::new();

    if rb.put(0x1).is_err() || rb.put(0x2).is_err() || rb.put(0x3).is_err() {
        return Err(Error::Unsuccessful);
    }
    if rb.put(0x4).is_ok() {
        return Err(Error::Unsuccessful);
    }
    if !rb.is_full() || rb.is_empty() {
        return Err(Error::Unsuccessful);
    }
    if rb.get() != Some(0x1) || rb.get() != Some(0x2) || rb.get() != Some(0x3) {
        return Err(Error::Unsuccessful);
    }
    if !rb.is_empty() {
        return Err(Error::Unsuccessful);
    }
    Ok(())
}

/// Allocator and collection checks, run before tasking is up
pub fn run() -> Result<()> {
    test_allocator()?;
    test_btree()?;
    test_ring_buffer()?;
    Ok(())
}

fn multitasking_worker(_ctx: usize) {
    for _ in 0..2 {
        let cpu = cpu::cpu_table().current();
        let task = Task::current();
        log::info!(
            "hello from task {} pid {} on cpu {}",
            task.name(),
            task.pid(),
            cpu.index()
        );
        sched::sleep(100 * NANOSECS_IN_MS);
    }
}

/// Start two short-lived tasks and join them
pub fn test_multitasking() -> bool {
    let tasks = [Task::new("mtest0"), Task::new("mtest1")];

    for (index, task) in tasks.iter().enumerate() {
        if Task::start(task, multitasking_worker, 0).is_err() {
            for started in tasks.iter().take(index) {
                started.wait();
            }
            return false;
        }
    }

    for task in tasks.iter() {
        task.wait();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_selftests_pass() {
        assert!(run().is_ok());
    }
}
