//! Per-CPU descriptors and the CPU table
//!
//! One [`Cpu`] per logical processor, created up front in a fixed table.
//! The boot processor registers itself first; ACPI enumeration fills in
//! the rest. Each CPU owns a run queue, an idle-task handle, a preempt
//! nesting counter and an IPI acknowledge counter.
//!
//! The table keeps a running-bitmask whose bit i mirrors
//! `cpu(i).state() == Running`.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::arch;
use crate::drivers::lapic;
use crate::kern::lock::SpinLock;
use crate::kern::runq::TaskQueue;
use crate::kern::sched;
use crate::kern::task::{Task, TaskFn};
use crate::types::{Error, Result, INVALID_OBJECT_ID, MAX_CPUS};

/// Spin iterations granted to an AP before bring-up is declared failed
const STARTUP_SPIN_LIMIT: usize = 50_000_000;

/// Spin iterations granted to a CPU to park itself on shutdown
const SHUTDOWN_SPIN_LIMIT: usize = 50_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CpuState {
    Offline = 0,
    Starting = 1,
    Running = 2,
    Exited = 3,
}

impl CpuState {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => CpuState::Offline,
            1 => CpuState::Starting,
            2 => CpuState::Running,
            3 => CpuState::Exited,
            _ => panic!("invalid cpu state {}", value),
        }
    }
}

pub struct Cpu {
    index: usize,
    lapic_id: AtomicU32,
    present: AtomicBool,
    state: AtomicU32,
    queue: TaskQueue,
    idle_task: SpinLock<Option<Arc<Task>>>,
    ipi_acks: AtomicU64,
    preempt_count: AtomicUsize,
}

impl Cpu {
    const fn new(index: usize) -> Self {
        Self {
            index,
            lapic_id: AtomicU32::new(0),
            present: AtomicBool::new(false),
            state: AtomicU32::new(CpuState::Offline as u32),
            queue: TaskQueue::new(index),
            idle_task: SpinLock::new(None),
            ipi_acks: AtomicU64::new(0),
            preempt_count: AtomicUsize::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn lapic_id(&self) -> u32 {
        self.lapic_id.load(Ordering::Acquire)
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    pub fn state(&self) -> CpuState {
        CpuState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn idle_task(&self) -> Option<Arc<Task>> {
        self.idle_task.lock().clone()
    }

    /// IPIs received and acknowledged by this CPU
    pub fn ipi_acks(&self) -> u64 {
        self.ipi_acks.load(Ordering::Acquire)
    }

    pub(crate) fn count_ipi_ack(&self) {
        self.ipi_acks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn preempt_count(&self) -> usize {
        self.preempt_count.load(Ordering::Acquire)
    }

    pub(crate) fn preempt_disable(&self) {
        self.preempt_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn preempt_enable(&self) {
        let prior = self.preempt_count.fetch_sub(1, Ordering::AcqRel);
        crate::bug_on!(prior == 0, "preempt enable without disable");
    }

    /// Bootstrap the first task on this CPU: allocate it, install it as
    /// the running task and switch execution onto its stack. Called
    /// exactly once per CPU during startup; returns only on failure.
    #[cfg(not(test))]
    pub fn run(&'static self, func: TaskFn, ctx: usize) -> Result<()> {
        let mut name: heapless::String<16> = heapless::String::new();
        let _ = core::fmt::write(&mut name, format_args!("cpu{}", self.index));

        let task = Task::new(&name);
        task.set_idle();
        task.set_cpu_affinity(1 << self.index);
        *self.idle_task.lock() = Some(task.clone());

        let err = Task::run(&task, &self.queue, func, ctx);
        // Reached only when setup failed and the switch never happened.
        *self.idle_task.lock() = None;
        err
    }

    /// Let other tasks run, then halt until the next interrupt.
    /// Interrupts are enabled across the halt so timer ticks and IPIs
    /// can wake the CPU.
    pub fn idle(&self) {
        sched::schedule();
        arch::wait_for_interrupt();
    }

    /// Publish that this CPU finished its startup
    pub fn set_running(&self) {
        self.state.store(CpuState::Running as u32, Ordering::Release);
        CPU_TABLE
            .running_mask
            .fetch_or(1 << self.index, Ordering::AcqRel);
    }

    /// Mark this CPU exited and drop it from the running mask
    pub fn set_exited(&self) {
        self.state.store(CpuState::Exited as u32, Ordering::Release);
        CPU_TABLE
            .running_mask
            .fetch_and(!(1 << self.index), Ordering::AcqRel);
    }

    fn set_starting(&self) {
        self.state
            .store(CpuState::Starting as u32, Ordering::Release);
    }
}

// ============================================================================
// CPU Table
// ============================================================================

pub struct CpuTable {
    cpus: [Cpu; MAX_CPUS],
    bsp_index: AtomicUsize,
    running_mask: AtomicU64,
}

impl CpuTable {
    const fn new() -> Self {
        Self {
            cpus: [
                Cpu::new(0),
                Cpu::new(1),
                Cpu::new(2),
                Cpu::new(3),
                Cpu::new(4),
                Cpu::new(5),
                Cpu::new(6),
                Cpu::new(7),
            ],
            bsp_index: AtomicUsize::new(INVALID_OBJECT_ID),
            running_mask: AtomicU64::new(0),
        }
    }

    pub fn cpu(&self, index: usize) -> &Cpu {
        &self.cpus[index]
    }

    /// Claim a slot for the local APIC id reported by ACPI (or by the
    /// boot processor itself). Returns the slot, or `None` when the
    /// table is full or the id is already registered.
    pub fn register(&self, lapic_id: u32) -> Option<&Cpu> {
        for cpu in self.cpus.iter() {
            if cpu.is_present() && cpu.lapic_id() == lapic_id {
                return None;
            }
        }
        for cpu in self.cpus.iter() {
            if !cpu.present.swap(true, Ordering::AcqRel) {
                cpu.lapic_id.store(lapic_id, Ordering::Release);
                return Some(cpu);
            }
        }
        None
    }

    /// The CPU executing this call, identified by local APIC id
    pub fn current(&self) -> &Cpu {
        &self.cpus[self.current_index()]
    }

    /// Index of the calling CPU. Before the boot processor registers
    /// itself this falls back to slot 0.
    pub fn current_index(&self) -> usize {
        let id = lapic::id();
        for cpu in self.cpus.iter() {
            if cpu.is_present() && cpu.lapic_id() == id {
                return cpu.index;
            }
        }
        0
    }

    /// Record the boot processor slot; valid exactly once
    pub fn set_bsp_index(&self, index: usize) -> Result<()> {
        if index >= MAX_CPUS {
            return Err(Error::InvalidArgument);
        }
        self.bsp_index
            .compare_exchange(
                INVALID_OBJECT_ID,
                index,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    pub fn bsp_index(&self) -> usize {
        self.bsp_index.load(Ordering::Acquire)
    }

    /// Bitmask of CPUs whose state is Running
    pub fn running_mask(&self) -> u64 {
        self.running_mask.load(Ordering::Acquire)
    }

    pub fn running_count(&self) -> usize {
        self.running_mask().count_ones() as usize
    }

    /// Number of registered CPUs
    pub fn present_count(&self) -> usize {
        self.cpus.iter().filter(|c| c.is_present()).count()
    }

    /// Wake every other present CPU with the INIT-SIPI-SIPI sequence
    /// and wait until each publishes Running. Fails if any CPU does not
    /// come up within a bounded spin.
    #[cfg(not(test))]
    pub fn start_all(&'static self) -> Result<()> {
        let self_index = self.current_index();

        crate::boot::trampoline::install();

        for cpu in self.cpus.iter() {
            if !cpu.is_present() || cpu.index == self_index {
                continue;
            }

            log::info!("starting cpu {} (lapic {})", cpu.index, cpu.lapic_id());
            cpu.set_starting();

            let apic_id = cpu.lapic_id();
            lapic::send_init(apic_id);
            lapic::delay_ms(10);
            lapic::send_sipi(apic_id, crate::boot::trampoline::SIPI_VECTOR);
            lapic::delay_us(200);
            lapic::send_sipi(apic_id, crate::boot::trampoline::SIPI_VECTOR);

            let mut spins = STARTUP_SPIN_LIMIT;
            while cpu.state() != CpuState::Running {
                arch::pause();
                spins -= 1;
                if spins == 0 {
                    log::error!("cpu {} did not come up", cpu.index);
                    return Err(Error::Unsuccessful);
                }
            }
            log::info!("cpu {} running", cpu.index);
        }
        Ok(())
    }

    /// Raise the wakeup IPI on a target CPU. Fire-and-forget; the
    /// receiver acknowledges by bumping its ack counter. Targeting a
    /// CPU that is not running is a no-op.
    pub fn send_ipi(&self, target: usize) {
        if target >= MAX_CPUS {
            return;
        }
        let cpu = &self.cpus[target];
        if cpu.state() != CpuState::Running {
            return;
        }
        lapic::send_ipi(cpu.lapic_id(), crate::arch::x86_64::idt::IPI_VECTOR);
    }

    /// Signal every other running CPU to stop and spin until each one
    /// reaches Exited. The caller keeps running; the targets park in a
    /// `cli; hlt` loop.
    pub fn exit_all_except_self(&self) {
        let self_index = self.current_index();

        for cpu in self.cpus.iter() {
            if cpu.index == self_index || cpu.state() != CpuState::Running {
                continue;
            }
            lapic::send_ipi(cpu.lapic_id(), crate::arch::x86_64::idt::IPI_EXIT_VECTOR);
        }

        for cpu in self.cpus.iter() {
            if cpu.index == self_index || !cpu.is_present() {
                continue;
            }
            if cpu.state() == CpuState::Offline {
                continue;
            }

            let mut spins = SHUTDOWN_SPIN_LIMIT;
            while cpu.state() != CpuState::Exited {
                arch::pause();
                spins -= 1;
                if spins == 0 {
                    log::error!("cpu {} did not exit", cpu.index);
                    break;
                }
            }
        }
    }
}

static CPU_TABLE: CpuTable = CpuTable::new();

/// The process-wide CPU table
pub fn cpu_table() -> &'static CpuTable {
    &CPU_TABLE
}

/// Index of the calling CPU; safe to call from any context
pub fn current_index() -> usize {
    CPU_TABLE.current_index()
}

// ============================================================================
// IPI Receive Side
// ============================================================================

/// Wakeup IPI body: acknowledge and count. The point of the vector is
/// only to kick the target out of `hlt`.
pub(crate) fn on_wakeup_ipi() {
    CPU_TABLE.current().count_ipi_ack();
}

/// Shutdown IPI body: mark this CPU exited and park it forever with
/// interrupts disabled.
pub(crate) fn on_exit_ipi() -> ! {
    let cpu = CPU_TABLE.current();
    log::info!("cpu {} exiting", cpu.index());
    cpu.set_exited();
    arch::halt();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_masks() {
        let table = CpuTable::new();

        let cpu = table.register(7).expect("slot");
        assert_eq!(cpu.index(), 0);
        assert_eq!(cpu.lapic_id(), 7);
        assert!(table.register(7).is_none());

        assert_eq!(table.running_mask(), 0);
        // set_running publishes into the global table, so drive the
        // state machine directly here.
        cpu.state.store(CpuState::Running as u32, Ordering::Release);
        table.running_mask.fetch_or(1, Ordering::AcqRel);
        assert_eq!(table.running_mask(), 1);
        assert_eq!(table.running_count(), 1);
    }

    #[test]
    fn test_bsp_index_set_once() {
        let table = CpuTable::new();
        assert!(table.set_bsp_index(2).is_ok());
        assert_eq!(table.bsp_index(), 2);
        assert_eq!(table.set_bsp_index(3), Err(Error::Busy));
        assert_eq!(table.bsp_index(), 2);
    }

    #[test]
    fn test_bsp_index_bounds() {
        let table = CpuTable::new();
        assert_eq!(table.set_bsp_index(MAX_CPUS), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_preempt_nesting() {
        let cpu = Cpu::new(0);
        assert_eq!(cpu.preempt_count(), 0);
        cpu.preempt_disable();
        cpu.preempt_disable();
        assert_eq!(cpu.preempt_count(), 2);
        cpu.preempt_enable();
        cpu.preempt_enable();
        assert_eq!(cpu.preempt_count(), 0);
    }

    #[test]
    #[should_panic]
    fn test_preempt_enable_underflow() {
        let cpu = Cpu::new(0);
        cpu.preempt_enable();
    }
}
