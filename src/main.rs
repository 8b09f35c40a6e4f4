//! Axon kernel binary: multiboot entry, CPU startup and shutdown
//!
//! The loader enters `_start` in 32-bit protected mode. The entry code
//! switches to long mode on statically built identity tables, claims a
//! boot stack and calls [`kernel_main`] on the boot processor.
//! Application processors arrive from the startup trampoline at
//! `ap_entry` and funnel into [`ap_main`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]

extern crate alloc;

use core::arch::global_asm;
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axon::arch;
use axon::arch::x86_64::idt;
use axon::boot::{multiboot::BootInfo, params};
use axon::bug_on;
use axon::drivers::{acpi, ioapic, kbd, lapic, pic, pit, serial};
use axon::kern::task::{task_table, Task};
use axon::kern::{cpu, sched};
use axon::mm::{heap, page_allocator, page_table};
use axon::println;
use axon::types::MAX_CPUS;
use axon::{interrupt, selftest, shell, trace};

// ============================================================================
// Multiboot2 Header
// ============================================================================

const MULTIBOOT2_MAGIC: u32 = 0xE852_50D6;
const MULTIBOOT2_HEADER_LEN: u32 = 24;

#[repr(C, align(8))]
struct Multiboot2Header([u32; 6]);

#[used]
#[link_section = ".multiboot2_header"]
static MULTIBOOT2_HEADER: Multiboot2Header = Multiboot2Header([
    MULTIBOOT2_MAGIC,
    0, // architecture: i386 protected mode
    MULTIBOOT2_HEADER_LEN,
    0u32.wrapping_sub(MULTIBOOT2_MAGIC).wrapping_sub(MULTIBOOT2_HEADER_LEN),
    0, // end tag
    8,
]);

// ============================================================================
// Boot Stacks and Early Page Tables
// ============================================================================

const CPU_STACK_SIZE: usize = axon::types::CPU_STACK_PAGES * axon::types::PAGE_SIZE;

// The entry code hardcodes the slot shift and the slot count.
const _: () = assert!(CPU_STACK_SIZE == 1 << 15);
const _: () = assert!(MAX_CPUS == 8);

#[repr(C, align(4096))]
struct BootStackPool([[u8; CPU_STACK_SIZE]; MAX_CPUS]);

/// One boot stack per CPU; slots are claimed by `STACK_INDEX` in the
/// entry code, overflow parks the CPU.
#[used]
#[no_mangle]
static mut BOOT_STACKS: BootStackPool = BootStackPool([[0; CPU_STACK_SIZE]; MAX_CPUS]);

#[used]
#[no_mangle]
static STACK_INDEX: AtomicU64 = AtomicU64::new(0);

const fn build_early_pd() -> [u64; 2048] {
    // 2 MiB pages covering the first 4 GiB: present, writable, huge
    let mut pd = [0u64; 2048];
    let mut index = 0;
    while index < 2048 {
        pd[index] = (index as u64 * 0x20_0000) | 0x83;
        index += 1;
    }
    pd
}

#[repr(C, align(4096))]
struct EarlyPageTables {
    pml4: [u64; 512],
    pdpt: [u64; 512],
    pd: [u64; 2048],
}

/// Identity map used between the loader handoff and the real kernel
/// page table. The directory entries are compile-time constants; the
/// entry code links pml4 and pdpt at runtime.
#[used]
#[no_mangle]
static mut EARLY_TABLES: EarlyPageTables = EarlyPageTables {
    pml4: [0; 512],
    pdpt: [0; 512],
    pd: build_early_pd(),
};

// ============================================================================
// Entry Code
// ============================================================================

#[cfg(not(test))]
global_asm!(
    ".code32",
    ".global _start",
    "_start:",
    "cli",
    "cld",
    "movl %eax, %ebp", // multiboot magic
    "movl %ebx, %edi", // boot info pointer
    // Wire up the early identity tables: pml4[0] -> pdpt, pdpt[0..4] -> pds
    "movl $EARLY_TABLES, %ecx",
    "leal 4096(%ecx), %edx",
    "orl $0x3, %edx",
    "movl %edx, 0(%ecx)",
    "leal 8192(%ecx), %edx",
    "orl $0x3, %edx",
    "movl %edx, 4096(%ecx)",
    "leal 12288(%ecx), %edx",
    "orl $0x3, %edx",
    "movl %edx, 4104(%ecx)",
    "leal 16384(%ecx), %edx",
    "orl $0x3, %edx",
    "movl %edx, 4112(%ecx)",
    "leal 20480(%ecx), %edx",
    "orl $0x3, %edx",
    "movl %edx, 4120(%ecx)",
    "movl %ecx, %cr3",
    // PAE
    "movl %cr4, %eax",
    "orl $0x20, %eax",
    "movl %eax, %cr4",
    // EFER.LME
    "movl $0xC0000080, %ecx",
    "rdmsr",
    "orl $0x100, %eax",
    "wrmsr",
    // paging on: protected mode becomes long mode
    "movl %cr0, %eax",
    "orl $0x80000000, %eax",
    "movl %eax, %cr0",
    "lgdt boot_gdt_desc",
    "ljmp $0x08, $start64",
    ".code64",
    "start64:",
    "xorw %ax, %ax",
    "movw %ax, %ds",
    "movw %ax, %es",
    "movw %ax, %ss",
    // claim boot stack slot (slots are 32 KiB each)
    "movq $1, %rax",
    "lock xaddq %rax, STACK_INDEX(%rip)",
    "cmpq $8, %rax",
    "jae 2f",
    "incq %rax",
    "shlq $15, %rax",
    "leaq BOOT_STACKS(%rip), %rdx",
    "addq %rdx, %rax",
    "movq %rax, %rsp",
    "movl %ebp, %esi", // magic
    "xorl %ebp, %ebp",
    "call kernel_main",
    "2:",
    "cli",
    "hlt",
    "jmp 2b",
    ".balign 8",
    "boot_gdt:",
    ".quad 0",
    ".quad 0x00AF9A000000FFFF",
    "boot_gdt_desc:",
    ".word 15",
    ".long boot_gdt",
    // Application processors arrive here from the startup trampoline,
    // already in long mode on the kernel page table.
    ".global ap_entry",
    "ap_entry:",
    "movq $1, %rax",
    "lock xaddq %rax, STACK_INDEX(%rip)",
    "cmpq $8, %rax",
    "jae 3f",
    "incq %rax",
    "shlq $15, %rax",
    "leaq BOOT_STACKS(%rip), %rdx",
    "addq %rdx, %rax",
    "movq %rax, %rsp",
    "xorl %ebp, %ebp",
    "call ap_main",
    "3:",
    "cli",
    "hlt",
    "jmp 3b",
    options(att_syntax)
);

extern "C" {
    static __kernel_end: u8;
}

/// Application processors spin here until the boot processor has
/// finished bring-up and enabled preemption.
static PREEMPT_ON_WAITING: AtomicBool = AtomicBool::new(true);

// ============================================================================
// Boot Processor
// ============================================================================

#[no_mangle]
pub extern "C" fn kernel_main(mb_info: usize, magic: u32) -> ! {
    pic::remap();
    pic::disable();

    arch::x86_64::gdt::load();
    arch::x86_64::exceptions::install();
    idt::install_stubs();
    idt::load();

    serial::init();
    trace::init(log::LevelFilter::Info);

    println!("Hello!");
    log::info!("{} {} booting, bp rsp 0x{:x}", axon::NAME, axon::VERSION, arch::rsp());

    let info = match unsafe { BootInfo::new(mb_info, magic) } {
        Ok(info) => info,
        Err(_) => panic!("bad multiboot magic 0x{:x}", magic),
    };
    if let Some(cmdline) = info.cmdline() {
        log::info!("command line: '{}'", cmdline);
        params::parse(cmdline);
    }

    let kernel_end = unsafe { &__kernel_end as *const u8 as u64 };
    let floor = kernel_end.max(info.end_addr() as u64);
    let (mem_start, mem_end) = match info.find_region(floor, page_table::MAPPED_LIMIT) {
        Some(region) => region,
        None => panic!("no usable memory region above 0x{:x}", floor),
    };
    log::info!("memory region 0x{:x}..0x{:x}", mem_start, mem_end);

    if let Err(err) = page_allocator::setup(mem_start as usize, mem_end as usize) {
        panic!("can't set up page allocator: {}", err);
    }
    if let Err(err) = heap::init() {
        panic!("can't set up kernel heap: {}", err);
    }

    if let Err(err) = page_table::setup() {
        panic!("can't set up paging: {}", err);
    }
    unsafe {
        arch::x86_64::set_cr3(page_table::root());
    }
    if let Err(err) = page_table::setup2() {
        panic!("can't set up high-half paging: {}", err);
    }
    unsafe {
        arch::x86_64::set_cr3(page_table::root());
    }
    log::info!("paging root 0x{:x}", page_table::root());

    println!("Self test begin, please wait...");

    if let Err(err) = acpi::parse() {
        panic!("can't parse acpi: {}", err);
    }

    if let Err(err) = selftest::run() {
        panic!("self test failed: {}", err);
    }
    println!("Self test complete");

    lapic::enable();

    let cpus = cpu::cpu_table();
    let cpu = cpus.current();
    if let Err(err) = cpus.set_bsp_index(cpu.index()) {
        panic!("can't set boot processor index: {}", err);
    }
    log::info!(
        "{} cpus present, bp is cpu {} (lapic {})",
        cpus.present_count(),
        cpu.index(),
        cpu.lapic_id()
    );

    if let Err(err) = cpu.run(bp_startup, 0) {
        panic!("can't run cpu {} task: {}", cpu.index(), err);
    }
    unreachable!()
}

/// First task on the boot processor: bring up interrupts, the other
/// CPUs and the shell, then idle until the user asks to exit.
fn bp_startup(_ctx: usize) {
    let cpus = cpu::cpu_table();
    let cpu = cpus.current();

    log::info!(
        "cpu {} running, rflags 0x{:x}, task {}",
        cpu.index(),
        arch::rflags(),
        Task::current().name()
    );

    ioapic::enable();

    interrupt::register(pit::handle_interrupt, acpi::gsi_by_irq(0), idt::TIMER_VECTOR);
    interrupt::register(kbd::handle_interrupt, acpi::gsi_by_irq(1), idt::KEYBOARD_VECTOR);
    interrupt::register(serial::handle_interrupt, acpi::gsi_by_irq(4), idt::SERIAL_VECTOR);

    if let Err(err) = page_table::unmap_null() {
        panic!("can't unmap null page: {}", err);
    }

    bug_on!(arch::interrupts_enabled());
    arch::enable_interrupts();
    pit::setup();
    log::info!("interrupts enabled");

    cpu.set_running();

    if !params::smp_off() {
        if let Err(err) = cpus.start_all() {
            panic!("can't start all cpus: {}", err);
        }
    }

    sched::preempt_on();
    PREEMPT_ON_WAITING.store(false, Ordering::Release);

    println!("IPI test...");
    let mask = cpus.running_mask();
    for index in 0..MAX_CPUS {
        if mask & (1 << index) != 0 && index != cpu.index() {
            cpus.send_ipi(index);
        }
    }

    println!("Task test...");
    if !selftest::test_multitasking() {
        panic!("multitasking test failed");
    }

    println!("Idle looping...");
    let shell_task = match shell::start() {
        Ok(task) => task,
        Err(err) => panic!("can't start shell: {}", err),
    };

    loop {
        cpu.idle();
        if shell::is_exit_requested() {
            log::info!("exit requested");
            shell_task.set_stopping();
            shell_task.wait();
            break;
        }
    }

    exit();
}

/// Orderly shutdown: stop the other CPUs, unregister the bootstrap
/// tasks and halt.
fn exit() -> ! {
    sched::preempt_disable();

    println!("Going to exit!");
    log::info!("exit begin");

    let cpus = cpu::cpu_table();
    cpus.exit_all_except_self();

    // The per-CPU bootstrap tasks never exit on their own; drop them
    // from the queues and the table so nothing stays registered.
    for index in 0..MAX_CPUS {
        let cpu = cpus.cpu(index);
        if let Some(idle) = cpu.idle_task() {
            cpu.queue().remove(&idle);
            task_table().remove(&idle);
        }
    }
    bug_on!(task_table().len() != 0, "tasks still registered at exit");

    println!("Bye!");
    log::info!("exit end");

    sched::preempt_off();
    arch::halt();
}

// ============================================================================
// Application Processors
// ============================================================================

#[no_mangle]
pub extern "C" fn ap_main() -> ! {
    arch::x86_64::gdt::load();
    idt::load();

    if params::smp_off() {
        panic!("ap started while smp is off");
    }

    lapic::enable();

    let cpus = cpu::cpu_table();
    let cpu = cpus.current();
    log::info!("cpu {} rsp 0x{:x}", cpu.index(), arch::rsp());

    if let Err(err) = cpu.run(ap_startup, 0) {
        log::error!("can't run cpu {} task: {}", cpu.index(), err);
        arch::halt();
    }
    unreachable!()
}

/// First task on an application processor: local timer, publish
/// Running, run the smoke test and serve the local queue forever.
fn ap_startup(_ctx: usize) {
    let cpus = cpu::cpu_table();
    let cpu = cpus.current();

    log::info!(
        "cpu {} running, rflags 0x{:x}, task {}",
        cpu.index(),
        arch::rflags(),
        Task::current().name()
    );

    lapic::setup_timer();

    bug_on!(arch::interrupts_enabled());
    arch::enable_interrupts();

    cpu.set_running();

    while PREEMPT_ON_WAITING.load(Ordering::Acquire) {
        arch::pause();
    }

    if !selftest::test_multitasking() {
        panic!("multitasking test failed");
    }

    loop {
        cpu.idle();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    axon::panic::kernel_panic(info)
}
