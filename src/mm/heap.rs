//! Kernel heap
//!
//! A linked-list heap carved out of the physical page allocator. Backs
//! `alloc` for everything else in the kernel, including task stacks,
//! which ask for size-aligned blocks.

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;

#[cfg(not(test))]
use crate::mm::page_allocator;
#[cfg(not(test))]
use crate::types::{Error, PAGE_SIZE};
use crate::types::Result;

/// Kernel heap size: 16 MiB
#[cfg(not(test))]
const HEAP_PAGES: usize = 4096;

#[cfg(not(test))]
#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

/// Hand a page-allocator region to the global heap. Must run before
/// the first allocation.
#[cfg(not(test))]
pub fn init() -> Result<()> {
    let base = page_allocator::alloc_pages(HEAP_PAGES).ok_or(Error::NoMemory)?;
    unsafe {
        HEAP.lock().init(base as *mut u8, HEAP_PAGES * PAGE_SIZE);
    }
    Ok(())
}

// Hosted tests use the host allocator.
#[cfg(test)]
pub fn init() -> Result<()> {
    Ok(())
}
