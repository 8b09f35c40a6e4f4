//! Interrupt registration and dispatch
//!
//! External interrupt stubs funnel into [`interrupt_dispatch`] with the
//! vector number. Fixed kernel vectors (IPIs, the local timer) are
//! handled inline; device vectors go through a registration table that
//! pairs a handler function with an IO APIC route.
//!
//! EOI is sent before the handler body so a handler that ends up in the
//! scheduler never leaves the interrupt in service.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::x86_64::idt;
use crate::drivers::lapic;
use crate::kern::{cpu, sched};

type HandlerFn = fn();

static HANDLERS: [AtomicUsize; idt::IDT_ENTRIES] =
    [const { AtomicUsize::new(0) }; idt::IDT_ENTRIES];

/// Bind `handler` to `vector` and route the given global system
/// interrupt to it, delivered to the boot processor.
pub fn register(handler: HandlerFn, gsi: u32, vector: u8) {
    HANDLERS[vector as usize].store(handler as usize, Ordering::Release);

    let cpus = cpu::cpu_table();
    let bsp = cpus.cpu(cpus.bsp_index());
    crate::drivers::ioapic::route(gsi, vector, bsp.lapic_id());

    log::info!("interrupt: gsi {} -> vector 0x{:x}", gsi, vector);
}

/// Common entry for all external interrupt stubs
#[no_mangle]
extern "C" fn interrupt_dispatch(vector: u64) {
    let vector = vector as u8;

    match vector {
        // Wakeup IPI: acknowledge and count; the interrupt itself is
        // the payload.
        idt::IPI_VECTOR => {
            lapic::eoi();
            cpu::on_wakeup_ipi();
        }
        // Shutdown IPI: never returns.
        idt::IPI_EXIT_VECTOR => {
            lapic::eoi();
            cpu::on_exit_ipi();
        }
        idt::LAPIC_TIMER_VECTOR => {
            lapic::eoi();
            sched::timer_interrupt(false);
        }
        idt::SPURIOUS_VECTOR => {}
        vector => {
            lapic::eoi();
            match HANDLERS[vector as usize].load(Ordering::Acquire) {
                0 => log::warn!("unexpected interrupt vector 0x{:x}", vector),
                raw => {
                    let handler: HandlerFn = unsafe { core::mem::transmute(raw) };
                    handler();
                }
            }
        }
    }
}
