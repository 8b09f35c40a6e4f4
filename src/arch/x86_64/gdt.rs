//! Global descriptor table
//!
//! Flat 64-bit segmentation: null, kernel code, kernel data. Every CPU
//! loads the same table during bring-up; there is no per-CPU TSS because
//! the kernel never leaves ring 0.

use core::arch::asm;

/// Kernel code segment selector
pub const KERNEL_CS: u16 = 0x08;

/// Kernel data segment selector
pub const KERNEL_DS: u16 = 0x10;

/// 64-bit code descriptor: present, ring 0, executable, long mode
const KERNEL_CODE_DESC: u64 = 0x00AF_9A00_0000_FFFF;

/// Data descriptor: present, ring 0, writable
const KERNEL_DATA_DESC: u64 = 0x00CF_9200_0000_FFFF;

static GDT: [u64; 3] = [0, KERNEL_CODE_DESC, KERNEL_DATA_DESC];

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u64,
}

/// Load the kernel GDT on the calling CPU and reload all segment
/// registers. Called once per CPU during bring-up, before interrupts
/// are enabled.
pub fn load() {
    let pointer = DescriptorPointer {
        limit: (core::mem::size_of_val(&GDT) - 1) as u16,
        base: GDT.as_ptr() as u64,
    };

    unsafe {
        asm!(
            "lgdt [{ptr}]",
            // Reload CS with a far return
            "lea {tmp}, [rip + 2f]",
            "push {cs}",
            "push {tmp}",
            "retfq",
            "2:",
            "mov ds, {ds:x}",
            "mov es, {ds:x}",
            "mov ss, {ds:x}",
            "xor {tmp:e}, {tmp:e}",
            "mov fs, {tmp:x}",
            "mov gs, {tmp:x}",
            ptr = in(reg) &pointer,
            cs = in(reg) KERNEL_CS as u64,
            ds = in(reg) KERNEL_DS as u64,
            tmp = out(reg) _,
        );
    }
}
