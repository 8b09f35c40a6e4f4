//! IO APIC
//!
//! Routes global system interrupts to CPU vectors through the
//! redirection table. The MMIO base comes from the ACPI MADT.

use core::sync::atomic::{AtomicU64, Ordering};

const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;

const REG_VERSION: u32 = 0x01;
const REG_REDIR_BASE: u32 = 0x10;

const REDIR_MASKED: u64 = 1 << 16;

static BASE: AtomicU64 = AtomicU64::new(0xFEC0_0000);

/// Record the MMIO base reported by ACPI
pub fn set_base(base: u64) {
    BASE.store(base, Ordering::Release);
}

unsafe fn read(reg: u32) -> u32 {
    let base = BASE.load(Ordering::Acquire);
    ((base + IOREGSEL) as *mut u32).write_volatile(reg);
    ((base + IOWIN) as *const u32).read_volatile()
}

unsafe fn write(reg: u32, value: u32) {
    let base = BASE.load(Ordering::Acquire);
    ((base + IOREGSEL) as *mut u32).write_volatile(reg);
    ((base + IOWIN) as *mut u32).write_volatile(value);
}

fn redirection_entries() -> u32 {
    (unsafe { read(REG_VERSION) } >> 16 & 0xFF) + 1
}

/// Mask every redirection entry; lines are opened individually by
/// [`route`]
pub fn enable() {
    for gsi in 0..redirection_entries() {
        unsafe {
            write(REG_REDIR_BASE + 2 * gsi, REDIR_MASKED as u32);
            write(REG_REDIR_BASE + 2 * gsi + 1, 0);
        }
    }
}

/// Deliver `gsi` as `vector` to the CPU with the given local APIC id:
/// fixed delivery, physical destination, edge triggered, active high.
pub fn route(gsi: u32, vector: u8, dest_apic_id: u32) {
    unsafe {
        write(REG_REDIR_BASE + 2 * gsi + 1, dest_apic_id << 24);
        write(REG_REDIR_BASE + 2 * gsi, vector as u32);
    }
}

/// Mask a single line
pub fn mask(gsi: u32) {
    unsafe {
        let low = read(REG_REDIR_BASE + 2 * gsi);
        write(REG_REDIR_BASE + 2 * gsi, low | REDIR_MASKED as u32);
    }
}
