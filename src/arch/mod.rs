//! Architecture support
//!
//! The kernel targets x86-64 only; this module re-exports the
//! privileged-instruction wrappers the rest of the kernel uses.

pub mod x86_64;

pub use x86_64::{
    disable_interrupts, enable_interrupts, halt, interrupts_enabled, irq_restore, irq_save, pause,
    rflags, rsp, wait_for_interrupt,
};
