//! Kernel page table
//!
//! Identity-maps the first 4 GiB with 2 MiB pages and aliases the same
//! physical range into the high half, so `phys_to_virt` is a constant
//! offset. The first 2 MiB are later split into 4 KiB pages so the
//! null page can be unmapped.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::mm::page_allocator;
use crate::types::{Error, Result, PAGE_SIZE};

/// Base of the high-half alias of physical memory
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Amount of physical memory covered by the kernel mapping
pub const MAPPED_LIMIT: u64 = 4 << 30;

const ENTRIES: usize = 512;

const FLAG_PRESENT: u64 = 1 << 0;
const FLAG_WRITE: u64 = 1 << 1;
const FLAG_HUGE: u64 = 1 << 7;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

static ROOT: AtomicU64 = AtomicU64::new(0);
static PDPT: AtomicU64 = AtomicU64::new(0);

fn alloc_table() -> Result<u64> {
    let addr = page_allocator::alloc_pages(1).ok_or(Error::NoMemory)? as u64;
    unsafe {
        core::ptr::write_bytes(addr as *mut u8, 0, PAGE_SIZE);
    }
    Ok(addr)
}

unsafe fn entry(table: u64, index: usize) -> *mut u64 {
    (table as *mut u64).add(index)
}

/// Build the identity mapping for the first 4 GiB. The resulting root
/// can be loaded into CR3 as soon as this returns.
pub fn setup() -> Result<()> {
    let pml4 = alloc_table()?;
    let pdpt = alloc_table()?;

    unsafe {
        *entry(pml4, 0) = pdpt | FLAG_PRESENT | FLAG_WRITE;

        for gib in 0..(MAPPED_LIMIT >> 30) {
            let pd = alloc_table()?;
            *entry(pdpt, gib as usize) = pd | FLAG_PRESENT | FLAG_WRITE;

            for index in 0..ENTRIES {
                let phys = (gib << 30) + (index as u64) * (2 << 20);
                *entry(pd, index) = phys | FLAG_PRESENT | FLAG_WRITE | FLAG_HUGE;
            }
        }
    }

    ROOT.store(pml4, Ordering::Release);
    PDPT.store(pdpt, Ordering::Release);
    Ok(())
}

/// Second phase: alias the same physical range into the high half so
/// `phys_to_virt` addresses resolve.
pub fn setup2() -> Result<()> {
    let pml4 = ROOT.load(Ordering::Acquire);
    let pdpt = PDPT.load(Ordering::Acquire);
    if pml4 == 0 {
        return Err(Error::Unsuccessful);
    }

    let high_index = ((KERNEL_BASE >> 39) & 0x1FF) as usize;
    unsafe {
        *entry(pml4, high_index) = pdpt | FLAG_PRESENT | FLAG_WRITE;
    }
    Ok(())
}

/// Split the first 2 MiB into 4 KiB pages with page zero absent, so
/// null dereferences fault instead of reading low memory.
pub fn unmap_null() -> Result<()> {
    let pdpt = PDPT.load(Ordering::Acquire);
    if pdpt == 0 {
        return Err(Error::Unsuccessful);
    }

    let pt = alloc_table()?;
    unsafe {
        for index in 1..ENTRIES {
            let phys = (index as u64) * PAGE_SIZE as u64;
            *entry(pt, index) = phys | FLAG_PRESENT | FLAG_WRITE;
        }

        let pd = *entry(pdpt, 0) & ADDR_MASK;
        *entry(pd, 0) = pt | FLAG_PRESENT | FLAG_WRITE;
    }

    #[cfg(not(test))]
    unsafe {
        crate::arch::x86_64::set_cr3(ROOT.load(Ordering::Acquire));
    }
    Ok(())
}

/// Physical address of the PML4
pub fn root() -> u64 {
    ROOT.load(Ordering::Acquire)
}

/// High-half view of a physical address
pub fn phys_to_virt(phys: u64) -> u64 {
    phys + KERNEL_BASE
}

/// Physical address behind either mapping
pub fn virt_to_phys(virt: u64) -> u64 {
    if virt >= KERNEL_BASE {
        virt - KERNEL_BASE
    } else {
        virt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PAGE_SHIFT;
    use alloc::vec;

    #[test]
    fn test_virt_phys_offsets() {
        assert_eq!(phys_to_virt(0x1000), KERNEL_BASE + 0x1000);
        assert_eq!(virt_to_phys(KERNEL_BASE + 0x1000), 0x1000);
        assert_eq!(virt_to_phys(0x2000), 0x2000);
    }

    #[test]
    fn test_build_tables() {
        // Give the page allocator a private region, then build and walk
        // the tables in hosted memory.
        let backing = vec![0u8; 64 * PAGE_SIZE].leak();
        let start = backing.as_ptr() as usize;
        // The singleton may already be set up by another test.
        let _ = page_allocator::setup(start, start + backing.len());

        setup().unwrap();
        setup2().unwrap();
        unmap_null().unwrap();

        let pml4 = root();
        assert_ne!(pml4, 0);
        assert_eq!(pml4 & ((1 << PAGE_SHIFT) - 1), 0);

        unsafe {
            // Low identity entry present
            let pdpt = *entry(pml4, 0) & ADDR_MASK;
            assert_ne!(pdpt, 0);
            // High-half alias points at the same directory pointer table
            let high_index = ((KERNEL_BASE >> 39) & 0x1FF) as usize;
            assert_eq!(*entry(pml4, high_index) & ADDR_MASK, pdpt);

            // First directory entry was split: no longer a huge page
            let pd = *entry(pdpt, 0) & ADDR_MASK;
            let first = *entry(pd, 0);
            assert_eq!(first & FLAG_HUGE, 0);

            // Page zero absent, page one present
            let pt = first & ADDR_MASK;
            assert_eq!(*entry(pt, 0), 0);
            assert_ne!(*entry(pt, 1) & FLAG_PRESENT, 0);
        }
    }
}
