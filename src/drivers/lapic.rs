//! Local APIC
//!
//! Per-CPU interrupt controller: identification, end-of-interrupt,
//! inter-processor interrupts and the per-CPU preemption timer. The
//! register window lives in the identity-mapped physical window, so
//! nothing here is usable before paging is up.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::arch::x86_64::{idt, io_delay, rdmsr};
use crate::kern::timer;

const IA32_APIC_BASE_MSR: u32 = 0x1B;
const APIC_BASE_MASK: u64 = 0xFFFF_F000;

// Register offsets
const REG_ID: u64 = 0x20;
const REG_TPR: u64 = 0x80;
const REG_EOI: u64 = 0xB0;
const REG_SVR: u64 = 0xF0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INIT: u64 = 0x380;
const REG_TIMER_CURRENT: u64 = 0x390;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

const SVR_ENABLE: u32 = 1 << 8;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const ICR_ASSERT: u32 = 1 << 14;
const ICR_MODE_INIT: u32 = 0x500;
const ICR_MODE_STARTUP: u32 = 0x600;
const LVT_TIMER_PERIODIC: u32 = 1 << 17;

/// Divide configuration value for divide-by-16
const TIMER_DIVIDE_BY_16: u32 = 0x3;

static ENABLED: AtomicBool = AtomicBool::new(false);
static BASE: AtomicU64 = AtomicU64::new(0xFEE0_0000);

/// Periodic initial count for a 1 ms tick, measured once on the boot
/// processor and reused by every AP.
static TIMER_COUNTS_PER_TICK: AtomicU32 = AtomicU32::new(0);

unsafe fn read(reg: u64) -> u32 {
    let addr = (BASE.load(Ordering::Relaxed) + reg) as *const u32;
    addr.read_volatile()
}

unsafe fn write(reg: u64, value: u32) {
    let addr = (BASE.load(Ordering::Relaxed) + reg) as *mut u32;
    addr.write_volatile(value);
}

/// Enable the local APIC on the calling CPU: accept all priorities and
/// turn on the software-enable bit with the spurious vector installed.
pub fn enable() {
    let base = rdmsr(IA32_APIC_BASE_MSR) & APIC_BASE_MASK;
    BASE.store(base, Ordering::Relaxed);

    unsafe {
        write(REG_TPR, 0);
        write(REG_SVR, SVR_ENABLE | idt::SPURIOUS_VECTOR as u32);
    }
    ENABLED.store(true, Ordering::Release);
}

/// Local APIC id of the calling CPU; 0 before [`enable`] has run
pub fn id() -> u32 {
    if !ENABLED.load(Ordering::Acquire) {
        return 0;
    }
    unsafe { read(REG_ID) >> 24 }
}

/// Signal end-of-interrupt for the in-service vector
pub fn eoi() {
    unsafe {
        write(REG_EOI, 0);
    }
}

unsafe fn icr_send(apic_id: u32, low: u32) {
    write(REG_ICR_HIGH, apic_id << 24);
    write(REG_ICR_LOW, low);
    while read(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
        crate::arch::pause();
    }
}

/// Raise a fixed-delivery interrupt `vector` on the target CPU
pub fn send_ipi(apic_id: u32, vector: u8) {
    unsafe {
        icr_send(apic_id, ICR_ASSERT | vector as u32);
    }
}

/// Send the INIT IPI that resets an application processor
pub fn send_init(apic_id: u32) {
    unsafe {
        icr_send(apic_id, ICR_ASSERT | ICR_MODE_INIT);
    }
}

/// Send a startup IPI; the vector is the page number the AP starts at
pub fn send_sipi(apic_id: u32, vector: u8) {
    unsafe {
        icr_send(apic_id, ICR_ASSERT | ICR_MODE_STARTUP | vector as u32);
    }
}

/// Program the local timer for periodic 1 ms interrupts. The first call
/// (on the boot processor, with the PIT already ticking) calibrates the
/// count; later calls reuse it.
pub fn setup_timer() {
    let mut counts = TIMER_COUNTS_PER_TICK.load(Ordering::Acquire);
    if counts == 0 {
        counts = calibrate_timer();
        TIMER_COUNTS_PER_TICK.store(counts, Ordering::Release);
    }

    unsafe {
        write(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
        write(
            REG_LVT_TIMER,
            LVT_TIMER_PERIODIC | idt::LAPIC_TIMER_VECTOR as u32,
        );
        write(REG_TIMER_INIT, counts);
    }
}

/// Count LAPIC timer decrements over ten PIT ticks
fn calibrate_timer() -> u32 {
    unsafe {
        write(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
        write(REG_LVT_TIMER, 1 << 16); // masked while measuring
        write(REG_TIMER_INIT, u32::MAX);
    }

    delay_ms(10);

    let elapsed = u32::MAX - unsafe { read(REG_TIMER_CURRENT) };
    unsafe {
        write(REG_TIMER_INIT, 0);
    }
    (elapsed / 10).max(1)
}

/// Busy-wait on the boot-time clock; requires a running system timer
pub fn delay_ms(ms: u64) {
    let deadline = timer::boot_time() + ms * crate::types::NANOSECS_IN_MS;
    while timer::boot_time() < deadline {
        crate::arch::pause();
    }
}

/// Short sub-tick delay driven by port 0x80 writes (~1us each)
pub fn delay_us(us: u64) {
    for _ in 0..us {
        io_delay();
    }
}
