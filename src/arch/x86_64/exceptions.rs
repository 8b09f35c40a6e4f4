//! CPU exception handling
//!
//! Installs interrupt gates for vectors 0-31. Exceptions indicate a
//! kernel bug; the handler logs what it can and panics.

use core::arch::global_asm;

use super::cr2;
use super::idt;

const EXCEPTION_NAMES: [&str; 21] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid tss",
    "segment not present",
    "stack segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating point",
    "alignment check",
    "machine check",
    "simd floating point",
    "virtualization",
];

/// Vectors that push a hardware error code
const ERROR_CODE_VECTORS: u32 = (1 << 8) | (1 << 10) | (1 << 11) | (1 << 12) | (1 << 13) | (1 << 14) | (1 << 17);

// Exception stubs normalize the stack so every vector reaches the common
// handler with (vector, error code) arguments. Vectors without a hardware
// error code push a zero placeholder first.
macro_rules! exception_stub {
    ($name:ident, $vector:expr) => {
        global_asm!(concat!(
            ".global ",
            stringify!($name),
            "\n",
            stringify!($name),
            ":\n",
            "push 0\n",
            "push rdi\n",
            "push rsi\n",
            "mov rdi, ",
            stringify!($vector),
            "\n",
            "mov rsi, [rsp + 16]\n",
            "call exception_dispatch\n",
            "pop rsi\n",
            "pop rdi\n",
            "add rsp, 8\n",
            "iretq\n"
        ));

        extern "C" {
            pub fn $name();
        }
    };
}

macro_rules! exception_stub_with_error {
    ($name:ident, $vector:expr) => {
        global_asm!(concat!(
            ".global ",
            stringify!($name),
            "\n",
            stringify!($name),
            ":\n",
            "push rdi\n",
            "push rsi\n",
            "mov rdi, ",
            stringify!($vector),
            "\n",
            "mov rsi, [rsp + 16]\n",
            "call exception_dispatch\n",
            "pop rsi\n",
            "pop rdi\n",
            "add rsp, 8\n",
            "iretq\n"
        ));

        extern "C" {
            pub fn $name();
        }
    };
}

exception_stub!(exc_stub_0, 0);
exception_stub!(exc_stub_1, 1);
exception_stub!(exc_stub_2, 2);
exception_stub!(exc_stub_3, 3);
exception_stub!(exc_stub_4, 4);
exception_stub!(exc_stub_5, 5);
exception_stub!(exc_stub_6, 6);
exception_stub!(exc_stub_7, 7);
exception_stub_with_error!(exc_stub_8, 8);
exception_stub!(exc_stub_9, 9);
exception_stub_with_error!(exc_stub_10, 10);
exception_stub_with_error!(exc_stub_11, 11);
exception_stub_with_error!(exc_stub_12, 12);
exception_stub_with_error!(exc_stub_13, 13);
exception_stub_with_error!(exc_stub_14, 14);
exception_stub!(exc_stub_16, 16);
exception_stub_with_error!(exc_stub_17, 17);
exception_stub!(exc_stub_18, 18);
exception_stub!(exc_stub_19, 19);
exception_stub!(exc_stub_20, 20);

/// Common exception entry. Never returns; any CPU exception in ring 0 is
/// an unrecoverable kernel bug.
#[no_mangle]
extern "C" fn exception_dispatch(vector: u64, error_code: u64) -> ! {
    let name = EXCEPTION_NAMES
        .get(vector as usize)
        .copied()
        .unwrap_or("unknown");

    if vector == 14 {
        panic!(
            "page fault: error 0x{:x} address 0x{:x}",
            error_code,
            cr2()
        );
    }

    if ERROR_CODE_VECTORS & (1 << vector) != 0 {
        panic!("cpu exception {} ({}): error 0x{:x}", vector, name, error_code);
    }
    panic!("cpu exception {} ({})", vector, name);
}

/// Install gates for all handled exception vectors
pub fn install() {
    idt::set_descriptor(0, exc_stub_0 as u64);
    idt::set_descriptor(1, exc_stub_1 as u64);
    idt::set_descriptor(2, exc_stub_2 as u64);
    idt::set_descriptor(3, exc_stub_3 as u64);
    idt::set_descriptor(4, exc_stub_4 as u64);
    idt::set_descriptor(5, exc_stub_5 as u64);
    idt::set_descriptor(6, exc_stub_6 as u64);
    idt::set_descriptor(7, exc_stub_7 as u64);
    idt::set_descriptor(8, exc_stub_8 as u64);
    idt::set_descriptor(9, exc_stub_9 as u64);
    idt::set_descriptor(10, exc_stub_10 as u64);
    idt::set_descriptor(11, exc_stub_11 as u64);
    idt::set_descriptor(12, exc_stub_12 as u64);
    idt::set_descriptor(13, exc_stub_13 as u64);
    idt::set_descriptor(14, exc_stub_14 as u64);
    idt::set_descriptor(16, exc_stub_16 as u64);
    idt::set_descriptor(17, exc_stub_17 as u64);
    idt::set_descriptor(18, exc_stub_18 as u64);
    idt::set_descriptor(19, exc_stub_19 as u64);
    idt::set_descriptor(20, exc_stub_20 as u64);
}
