//! Scheduling: context switches, preemption gates, sleep and yield
//!
//! `schedule` is the only place a CPU changes tasks. It disables
//! preemption and interrupts, asks the local queue for a decision,
//! performs the stack-pointer switch and finishes bookkeeping on the
//! far side. Timer interrupts call [`timer_interrupt`], which invokes
//! `schedule` only while the per-CPU preempt counter is zero and the
//! master preempt switch is on.
//!
//! Context switch protocol: callee-saved registers and RFLAGS are saved
//! on the outgoing task's own stack and only the resulting `rsp` is
//! stored in the task. A brand-new task's stack is pre-built so the
//! first switch "returns" into the trampoline with RDI holding the task
//! pointer and interrupts enabled.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(not(test))]
use core::arch::global_asm;

use crate::arch;
use crate::kern::cpu::{self, Cpu};
use crate::kern::runq::NextTask;
use crate::kern::task::{Task, TaskState};
use crate::kern::timer;
use crate::types::NANOSECS_IN_MS;

/// Master preemption switch. Off until the boot processor finishes
/// bring-up; [`preempt_off`] quiesces scheduling everywhere.
static PREEMPT_MASTER: AtomicBool = AtomicBool::new(false);

/// Enable timer-driven preemption globally
pub fn preempt_on() {
    PREEMPT_MASTER.store(true, Ordering::Release);
}

/// Disable timer-driven preemption globally
pub fn preempt_off() {
    PREEMPT_MASTER.store(false, Ordering::Release);
}

pub fn preempt_active() -> bool {
    PREEMPT_MASTER.load(Ordering::Acquire)
}

/// Enter a no-preempt region on the calling CPU. Nests.
pub fn preempt_disable() {
    cpu::cpu_table().current().preempt_disable();
}

/// Leave a no-preempt region; must pair with [`preempt_disable`]
pub fn preempt_enable() {
    cpu::cpu_table().current().preempt_enable();
}

// ============================================================================
// Context Switch
// ============================================================================

// Saves RFLAGS and the callee-saved registers on the outgoing stack,
// parks rsp in *prev_rsp_slot and resumes from next_rsp. RDI travels in
// the frame so a fresh task finds its argument after the first switch.
// Interrupts stay disabled from the cli until popfq restores the
// incoming task's flags.
#[cfg(not(test))]
global_asm!(
    ".global switch_context",
    "switch_context:",
    "pushfq",
    "cli",
    "push rbx",
    "push rbp",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "push rdi",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop rdi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbp",
    "pop rbx",
    "popfq",
    "ret",
);

#[cfg(not(test))]
extern "C" {
    fn switch_context(prev_rsp_slot: *mut u64, next_rsp: u64);
}

/// Number of qwords in a saved switch frame, including the return
/// address: rdi, r15, r14, r13, r12, rbp, rbx, rflags, rip.
const SWITCH_FRAME_QWORDS: usize = 9;

/// Build the initial switch frame for a task that has never run.
///
/// The frame makes the first context switch land in [`task_trampoline`]
/// with RDI = the task pointer and IF set. Returns the initial saved
/// `rsp` value.
pub fn prepare_initial_stack(stack_top: u64, task: *const Task) -> u64 {
    // One padding qword below the aligned top keeps the trampoline
    // entered with rsp ≡ 8 (mod 16), as if it had been called.
    let rsp = stack_top - 8 - (SWITCH_FRAME_QWORDS * 8) as u64;
    let frame = rsp as *mut u64;

    unsafe {
        frame.add(0).write(task as u64); // rdi
        frame.add(1).write(0); // r15
        frame.add(2).write(0); // r14
        frame.add(3).write(0); // r13
        frame.add(4).write(0); // r12
        frame.add(5).write(0); // rbp
        frame.add(6).write(0); // rbx
        frame.add(7).write(arch::x86_64::RFLAGS_TASK_INITIAL);
        frame.add(8).write(task_trampoline as u64); // return address
    }
    rsp
}

/// First-entry point for started tasks. Runs the callback exactly once,
/// then exits the task.
extern "C" fn task_trampoline(raw: *const Task) -> ! {
    let cpu = cpu::cpu_table().current();
    finish_switch(cpu);
    cpu.preempt_enable();

    let task = unsafe {
        Arc::increment_strong_count(raw);
        Arc::from_raw(raw)
    };

    task.invoke_entry();
    Task::exit(task);
}

/// Drop the reference of a task that exited on this CPU. Runs in the
/// context of the task that replaced it, once the dead stack can no
/// longer be in use.
pub(crate) fn finish_switch(cpu: &Cpu) {
    if let Some(victim) = cpu.queue().take_reap() {
        drop(victim);
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// Cooperative scheduling point: give the CPU to the next runnable
/// task, or keep running if there is none. Returns when this task is
/// switched back in.
#[cfg(not(test))]
pub fn schedule() {
    let cpu = cpu::cpu_table().current();

    let flags = arch::irq_save();
    cpu.preempt_disable();

    #[cfg(debug_assertions)]
    debug_assert_eq!(crate::kern::lock::locks_held(), 0);

    let mut switch_args = None;
    loop {
        // Arc handles must not live past this block: locals held across
        // the switch would leak on a stack that never unwinds.
        {
            let prev = cpu.queue().current().expect("schedule without a task");
            let idle = cpu.idle_task();
            let now = timer::boot_time();

            match cpu.queue().schedule_next(&prev, idle.as_ref(), now) {
                NextTask::Keep => break,
                NextTask::Switch(next) => {
                    prev.update_runtime(now);
                    prev.bump_context_switches();
                    next.set_state(TaskState::Running);
                    next.set_run_start(now);
                    switch_args = Some((prev.saved_rsp_ptr(), next.saved_rsp()));
                    break;
                }
                NextTask::Idle => {}
            }
        }

        // Nothing runnable anywhere: wait for a timer tick or IPI to
        // make something ready, then decide again.
        arch::wait_for_interrupt();
        arch::disable_interrupts();
    }

    if let Some((prev_rsp_slot, next_rsp)) = switch_args {
        // The queue keeps references to both sides; only raw values
        // cross the switch.
        unsafe {
            switch_context(prev_rsp_slot, next_rsp);
        }
    }

    finish_switch(cpu);
    cpu.preempt_enable();
    arch::irq_restore(flags);
}

#[cfg(test)]
pub fn schedule() {}

/// Give up the CPU without changing state
pub fn yield_now() {
    schedule();
}

/// Block the current task for at least `ns` nanoseconds. The local
/// timer callback moves it back to the ready list once the deadline
/// passes.
#[cfg(not(test))]
pub fn sleep(ns: u64) {
    let cpu = cpu::cpu_table().current();
    let task = cpu.queue().current().expect("sleep without a task");

    task.set_wake_deadline(timer::boot_time() + ns);
    task.set_state(TaskState::Waiting);
    drop(task);

    schedule();
}

#[cfg(test)]
pub fn sleep(_ns: u64) {}

/// Sleep in milliseconds
pub fn sleep_ms(ms: u64) {
    sleep(ms * NANOSECS_IN_MS);
}

/// Per-CPU timer callback. `global_tick` is true on the boot processor,
/// whose timer also advances the boot-time clock. Requeues expired
/// sleepers, then preempts the current task when allowed.
pub fn timer_interrupt(global_tick: bool) {
    if global_tick {
        timer::tick();
    }

    let cpu = cpu::cpu_table().current();
    cpu.queue().wake_expired(timer::boot_time());

    if preempt_active() && cpu.preempt_count() == 0 && cpu.queue().has_ready() {
        schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::STACK_SIZE;

    #[test]
    fn test_preempt_master_switch() {
        preempt_on();
        assert!(preempt_active());
        preempt_off();
        assert!(!preempt_active());
    }

    #[test]
    fn test_initial_frame_layout() {
        #[repr(align(4096))]
        struct Buffer([u8; 4096]);
        let buffer = alloc::boxed::Box::new(Buffer([0; 4096]));

        let top = buffer.0.as_ptr() as u64 + 4096;
        let task = 0x1234_5678_usize as *const Task;

        let rsp = prepare_initial_stack(top, task);
        assert_eq!(rsp, top - 80);
        assert!(rsp % 8 == 0);
        assert!((top - rsp) as usize <= STACK_SIZE);

        let frame = rsp as *const u64;
        unsafe {
            assert_eq!(frame.add(0).read(), task as u64);
            assert_eq!(frame.add(7).read() & (1 << 9), 1 << 9);
            assert_eq!(frame.add(8).read(), task_trampoline as u64);
        }
    }
}
