//! Kernel panic path
//!
//! Prints what is known to the console and the trace channel, quiesces
//! scheduling, stops the other CPUs and halts. Re-entrant panics skip
//! straight to the halt.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch;
use crate::kern::{cpu, sched};

static PANICKING: AtomicBool = AtomicBool::new(false);

pub fn kernel_panic(info: &PanicInfo) -> ! {
    arch::disable_interrupts();

    if PANICKING.swap(true, Ordering::AcqRel) {
        arch::halt();
    }

    sched::preempt_off();

    crate::println!("\n!!! KERNEL PANIC !!!");
    if let Some(location) = info.location() {
        crate::println!("at {}:{}", location.file(), location.line());
    }
    crate::println!("{}", info.message());

    log::error!("panic: {}", info.message());

    cpu::cpu_table().exit_all_except_self();

    arch::halt()
}
