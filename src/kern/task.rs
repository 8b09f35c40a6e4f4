//! Tasks and the global task table
//!
//! A task is a unit of kernel execution: a dedicated stack, a saved
//! stack pointer for context switches, a state word and accounting. Each
//! stack is aligned to its own size and starts with a magic-guarded
//! header naming the owning task, so the current task is recovered from
//! `rsp` alone with no per-CPU indirection.
//!
//! Tasks are shared objects: the task table, the owning run queue and
//! any pid lookup each hold a reference. The last dropped reference
//! frees the stack.

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::Write as FmtWrite;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::bug_on;
use crate::kern::cpu;
use crate::kern::lock::SpinLock;
use crate::kern::object::ObjectTable;
use crate::kern::runq::TaskQueue;
use crate::kern::sched;
use crate::kern::timer;
use crate::types::{
    Error, ObjectId, Result, INVALID_OBJECT_ID, MAX_CPUS, MAX_TASKS, PAGE_SIZE, STACK_SIZE,
};

/// Task entry point: called exactly once with its context argument
pub type TaskFn = fn(ctx: usize);

/// Maximum task name length
pub const TASK_NAME_LEN: usize = 32;

/// Number of task table hash buckets (power of two)
const TASK_BUCKETS: usize = 16;

const STACK_MAGIC1: u64 = 0xBEAF_DEAD_BEAF_DEAD;
const STACK_MAGIC2: u64 = 0xCAFE_F00D_CAFE_F00D;
const TASK_MAGIC: u64 = 0x7A5B_1ED0_7A5B_1ED0;

// ============================================================================
// Task State and Flags
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TaskState {
    New = 0,
    Waiting = 1,
    Running = 2,
    Exited = 3,
}

impl TaskState {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => TaskState::New,
            1 => TaskState::Waiting,
            2 => TaskState::Running,
            3 => TaskState::Exited,
            _ => panic!("invalid task state {}", value),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Exited => "exited",
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskFlags: u32 {
        /// Cooperative cancellation request; polled at safe points
        const STOPPING = 1 << 0;
        /// CPU idle task; kept out of the ready rotation while runnable
        const IDLE = 1 << 1;
    }
}

// ============================================================================
// Kernel Stack
// ============================================================================

/// Header at the lowest address of every task stack
#[repr(C)]
struct StackHeader {
    magic1: u64,
    task: *const Task,
    magic2: u64,
}

/// An owned, size-aligned kernel stack.
///
/// Layout from the base: header, one guard page, then the usable stack
/// growing down from `top()`. `rsp & !(STACK_SIZE - 1)` always lands on
/// the header.
struct TaskStack {
    base: *mut u8,
}

unsafe impl Send for TaskStack {}

impl TaskStack {
    fn layout() -> Layout {
        Layout::from_size_align(STACK_SIZE, STACK_SIZE).unwrap()
    }

    fn new(task: *const Task) -> Result<Self> {
        let base = unsafe { alloc(Self::layout()) };
        if base.is_null() {
            return Err(Error::NoMemory);
        }

        let header = base as *mut StackHeader;
        unsafe {
            (*header).magic1 = STACK_MAGIC1;
            (*header).task = task;
            (*header).magic2 = STACK_MAGIC2;
        }

        Ok(Self { base })
    }

    fn top(&self) -> u64 {
        self.base as u64 + STACK_SIZE as u64
    }
}

impl Drop for TaskStack {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.base, Self::layout());
        }
    }
}

/// Recover the task owning the stack that `rsp` points into.
///
/// Panics if the header magics, the valid stack range or the task magic
/// do not check out: a mismatch means the stack is corrupt and nothing
/// can be trusted.
pub(crate) fn task_for_rsp(rsp: u64) -> Arc<Task> {
    let base = rsp & !(STACK_SIZE as u64 - 1);
    let header = base as *const StackHeader;

    let (magic1, magic2, task_ptr) =
        unsafe { ((*header).magic1, (*header).magic2, (*header).task) };

    bug_on!(magic1 != STACK_MAGIC1, "stack header magic1 corrupt");
    bug_on!(magic2 != STACK_MAGIC2, "stack header magic2 corrupt");

    // The guard page and header are never valid stack, and rsp == top
    // would mask into the neighboring block.
    let usable_bottom = base + 2 * PAGE_SIZE as u64;
    let top = base + STACK_SIZE as u64;
    bug_on!(rsp <= usable_bottom || rsp >= top, "rsp outside stack bounds");

    bug_on!(
        unsafe { (*task_ptr).magic } != TASK_MAGIC,
        "task magic corrupt"
    );

    unsafe {
        Arc::increment_strong_count(task_ptr);
        Arc::from_raw(task_ptr)
    }
}

// ============================================================================
// Task
// ============================================================================

pub struct Task {
    magic: u64,
    name: SpinLock<heapless::String<TASK_NAME_LEN>>,
    pid: AtomicUsize,
    state: AtomicU32,
    flags: AtomicU32,
    affinity: SpinLock<u64>,
    /// Saved stack pointer while not running
    rsp: AtomicU64,
    /// Index of the CPU whose queue owns this task
    owner_cpu: AtomicUsize,
    stack: SpinLock<Option<TaskStack>>,
    entry: SpinLock<Option<(TaskFn, usize)>>,
    wake_deadline: AtomicU64,

    // Accounting, all in boot-time nanoseconds
    start_time: AtomicU64,
    run_start_time: AtomicU64,
    exit_time: AtomicU64,
    runtime: AtomicU64,
    context_switches: AtomicU64,
}

impl Task {
    pub fn new(name: &str) -> Arc<Self> {
        let mut bounded: heapless::String<TASK_NAME_LEN> = heapless::String::new();
        let _ = bounded.push_str(&name[..name.len().min(TASK_NAME_LEN)]);

        Arc::new(Self {
            magic: TASK_MAGIC,
            name: SpinLock::new(bounded),
            pid: AtomicUsize::new(INVALID_OBJECT_ID),
            state: AtomicU32::new(TaskState::New as u32),
            flags: AtomicU32::new(TaskFlags::empty().bits()),
            affinity: SpinLock::new(u64::MAX),
            rsp: AtomicU64::new(0),
            owner_cpu: AtomicUsize::new(INVALID_OBJECT_ID),
            stack: SpinLock::new(None),
            entry: SpinLock::new(None),
            wake_deadline: AtomicU64::new(0),
            start_time: AtomicU64::new(0),
            run_start_time: AtomicU64::new(0),
            exit_time: AtomicU64::new(0),
            runtime: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
        })
    }

    /// The task currently executing on this CPU, recovered from `rsp`
    pub fn current() -> Arc<Task> {
        task_for_rsp(crate::arch::rsp())
    }

    pub fn pid(&self) -> ObjectId {
        self.pid.load(Ordering::Acquire)
    }

    pub fn name(&self) -> heapless::String<TASK_NAME_LEN> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        let mut guard = self.name.lock();
        guard.clear();
        let _ = guard.push_str(&name[..name.len().min(TASK_NAME_LEN)]);
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Request cooperative cancellation
    pub fn set_stopping(&self) {
        self.flags
            .fetch_or(TaskFlags::STOPPING.bits(), Ordering::AcqRel);
    }

    pub fn is_stopping(&self) -> bool {
        self.flags().contains(TaskFlags::STOPPING)
    }

    pub(crate) fn set_idle(&self) {
        self.flags
            .fetch_or(TaskFlags::IDLE.bits(), Ordering::AcqRel);
    }

    pub fn is_idle(&self) -> bool {
        self.flags().contains(TaskFlags::IDLE)
    }

    /// Takes effect at the next placement; a running task does not move
    pub fn set_cpu_affinity(&self, mask: u64) {
        *self.affinity.lock() = mask;
    }

    pub fn cpu_affinity(&self) -> u64 {
        *self.affinity.lock()
    }

    pub fn owner(&self) -> Option<usize> {
        match self.owner_cpu.load(Ordering::Acquire) {
            INVALID_OBJECT_ID => None,
            index => Some(index),
        }
    }

    pub(crate) fn set_owner(&self, owner: Option<usize>) {
        self.owner_cpu
            .store(owner.unwrap_or(INVALID_OBJECT_ID), Ordering::Release);
    }

    pub(crate) fn saved_rsp(&self) -> u64 {
        self.rsp.load(Ordering::Acquire)
    }

    pub(crate) fn saved_rsp_ptr(&self) -> *mut u64 {
        self.rsp.as_ptr()
    }

    pub fn wake_deadline(&self) -> u64 {
        self.wake_deadline.load(Ordering::Acquire)
    }

    pub(crate) fn set_wake_deadline(&self, deadline: u64) {
        self.wake_deadline.store(deadline, Ordering::Release);
    }

    pub(crate) fn clear_wake_deadline(&self) {
        self.wake_deadline.store(0, Ordering::Release);
    }

    pub fn runtime(&self) -> u64 {
        self.runtime.load(Ordering::Relaxed)
    }

    pub fn context_switches(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    pub(crate) fn set_run_start(&self, now: u64) {
        self.run_start_time.store(now, Ordering::Relaxed);
    }

    /// Charge the time since the last run start to this task
    pub(crate) fn update_runtime(&self, now: u64) {
        let started = self.run_start_time.swap(now, Ordering::Relaxed);
        self.runtime
            .fetch_add(now.saturating_sub(started), Ordering::Relaxed);
    }

    pub(crate) fn bump_context_switches(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Run the entry callback. Panics if it was already consumed: the
    /// trampoline must fire exactly once per started task.
    pub(crate) fn invoke_entry(&self) {
        let entry = self.entry.lock().take();
        match entry {
            Some((func, ctx)) => func(ctx),
            None => panic!("task entry invoked twice"),
        }
    }

    /// Allocate the stack and register the task in the task table.
    /// On any failure no partial state is left behind.
    fn prepare(this: &Arc<Task>, func: TaskFn, ctx: usize) -> Result<()> {
        {
            let mut stack = this.stack.lock();
            bug_on!(stack.is_some(), "task already has a stack");
            *stack = Some(TaskStack::new(Arc::as_ptr(this))?);
        }

        if let Err(err) = task_table().insert(this) {
            *this.stack.lock() = None;
            return Err(err);
        }

        *this.entry.lock() = Some((func, ctx));
        Ok(())
    }

    /// Start the task on the least-loaded running CPU permitted by its
    /// affinity mask. The first switch into the task lands in the
    /// trampoline, which calls `func(ctx)` once and then exits.
    pub fn start(this: &Arc<Task>, func: TaskFn, ctx: usize) -> Result<()> {
        Task::prepare(this, func, ctx)?;

        let top = this.stack.lock().as_ref().unwrap().top();
        let rsp = sched::prepare_initial_stack(top, Arc::as_ptr(this));
        this.rsp.store(rsp, Ordering::Release);

        this.start_time.store(timer::boot_time(), Ordering::Relaxed);
        this.set_state(TaskState::Waiting);

        let queue = match select_next_queue(this) {
            Some(queue) => queue,
            None => {
                task_table().remove(this);
                *this.stack.lock() = None;
                *this.entry.lock() = None;
                this.set_state(TaskState::New);
                return Err(Error::Unsuccessful);
            }
        };
        queue.insert(this.clone());
        Ok(())
    }

    /// CPU bring-up variant: switch onto the task's stack in the calling
    /// context and run `func(ctx)` synchronously as this CPU's first
    /// task. Returns only on setup failure.
    #[cfg(not(test))]
    pub fn run(
        this: &Arc<Task>,
        queue: &'static TaskQueue,
        func: TaskFn,
        ctx: usize,
    ) -> Result<()> {
        Task::prepare(this, func, ctx)?;

        let now = timer::boot_time();
        this.start_time.store(now, Ordering::Relaxed);
        this.set_run_start(now);
        this.set_state(TaskState::Running);
        queue.adopt_current(this.clone());

        let top = this.stack.lock().as_ref().unwrap().top();
        let raw = Arc::into_raw(this.clone()) as usize;
        unsafe {
            crate::arch::x86_64::switch_stack(top, bootstrap_task_entry, raw);
        }
    }

    /// Mark the current task exited and never run it again. Callable
    /// only by the task itself; consumes the caller's handle because
    /// nothing on this stack runs again to drop it.
    pub fn exit(this: Arc<Task>) -> ! {
        bug_on!(
            !Arc::ptr_eq(&this, &Task::current()),
            "exit of a non-current task"
        );

        this.exit_time.store(timer::boot_time(), Ordering::Relaxed);
        this.set_state(TaskState::Exited);
        task_table().remove(&this);
        drop(this);

        sched::schedule();

        panic!("exited task resumed");
    }

    /// Busy-join: sleep in 1 ms slices until the task exits
    pub fn wait(&self) {
        while self.state() != TaskState::Exited {
            sched::sleep(crate::types::NANOSECS_IN_MS);
        }
    }
}

/// First code executed by a CPU's bootstrap task, on the task's own
/// stack. The callback never returns in practice; if it does, the task
/// is torn down and the CPU has nowhere left to go.
#[cfg(not(test))]
extern "C" fn bootstrap_task_entry(raw: usize) -> ! {
    let task = unsafe { Arc::from_raw(raw as *const Task) };

    task.invoke_entry();

    if let Some(index) = task.owner() {
        cpu::cpu_table().cpu(index).queue().remove(&task);
    }
    task_table().remove(&task);
    panic!("cpu bootstrap task returned");
}

// ============================================================================
// Placement
// ============================================================================

/// Pick the destination queue for a task: among running CPUs allowed by
/// the affinity mask, excluding the task's current queue, the one with
/// the fewest context switches so far. Ties go to the lowest CPU index.
pub fn select_next_queue(task: &Arc<Task>) -> Option<&'static TaskQueue> {
    let cpus = cpu::cpu_table();
    let mask = cpus.running_mask() & task.cpu_affinity();

    let mut best: Option<&'static TaskQueue> = None;
    for index in 0..MAX_CPUS {
        if mask & (1 << index) == 0 {
            continue;
        }
        if task.owner() == Some(index) {
            continue;
        }

        let queue = cpus.cpu(index).queue();
        match best {
            None => best = Some(queue),
            Some(current_best) => {
                if queue.switch_count() < current_best.switch_count() {
                    best = Some(queue);
                }
            }
        }
    }
    best
}

// ============================================================================
// Task Table
// ============================================================================

/// All live tasks: a pid table plus address-hashed buckets for iteration
pub struct TaskTable {
    ids: ObjectTable<Task, MAX_TASKS>,
    buckets: [SpinLock<Vec<Arc<Task>>>; TASK_BUCKETS],
}

fn bucket_index(task: &Arc<Task>) -> usize {
    let addr = Arc::as_ptr(task) as usize;
    (addr >> 4) % TASK_BUCKETS
}

impl TaskTable {
    pub const fn new() -> Self {
        Self {
            ids: ObjectTable::new(),
            buckets: [const { SpinLock::new(Vec::new()) }; TASK_BUCKETS],
        }
    }

    /// Assign a pid and link the task into its bucket
    pub fn insert(&self, task: &Arc<Task>) -> Result<()> {
        let pid = self.ids.insert(task).ok_or(Error::NoMemory)?;
        task.pid.store(pid, Ordering::Release);

        let mut bucket = self.buckets[bucket_index(task)].lock();
        bug_on!(
            bucket.iter().any(|t| Arc::ptr_eq(t, task)),
            "task already in table"
        );
        bucket.push(task.clone());
        Ok(())
    }

    /// Release the pid and unlink the task. Reference drops happen
    /// outside the bucket lock.
    pub fn remove(&self, task: &Arc<Task>) {
        let pid = task.pid.swap(INVALID_OBJECT_ID, Ordering::AcqRel);
        if pid != INVALID_OBJECT_ID {
            self.ids.remove(pid);
        }

        let unlinked = {
            let mut bucket = self.buckets[bucket_index(task)].lock();
            match bucket.iter().position(|t| Arc::ptr_eq(t, task)) {
                Some(pos) => Some(bucket.swap_remove(pos)),
                None => None,
            }
        };
        drop(unlinked);
    }

    /// Return a referenced handle for `pid`, if it names a live task
    pub fn lookup(&self, pid: ObjectId) -> Option<Arc<Task>> {
        self.ids.lookup(pid)
    }

    /// Number of registered tasks
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Print one line per task: pid, state, flags, runtime, context
    /// switches, name. Each bucket is locked only while it is printed.
    pub fn ps(&self, out: &mut dyn FmtWrite) {
        let _ = writeln!(out, "pid state flags runtime ctxswitches name");
        for bucket in self.buckets.iter() {
            let bucket = bucket.lock();
            for task in bucket.iter() {
                let runtime = task.runtime();
                let _ = writeln!(
                    out,
                    "{} {} 0x{:x} {}.{:06} {} {}",
                    task.pid(),
                    task.state().as_str(),
                    task.flags().bits(),
                    runtime / crate::types::NANOSECS_IN_SEC,
                    (runtime % crate::types::NANOSECS_IN_SEC) / 1000,
                    task.context_switches(),
                    task.name()
                );
            }
        }
    }
}

static TASK_TABLE: TaskTable = TaskTable::new();

/// The process-wide task table
pub fn task_table() -> &'static TaskTable {
    &TASK_TABLE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        let task = Task::new("t");
        assert_eq!(task.state(), TaskState::New);
        task.set_state(TaskState::Waiting);
        assert_eq!(task.state(), TaskState::Waiting);
    }

    #[test]
    fn test_stopping_flag() {
        let task = Task::new("t");
        assert!(!task.is_stopping());
        task.set_stopping();
        assert!(task.is_stopping());
    }

    #[test]
    fn test_affinity_default_allows_all() {
        let task = Task::new("t");
        assert_eq!(task.cpu_affinity(), u64::MAX);
        task.set_cpu_affinity(0b100);
        assert_eq!(task.cpu_affinity(), 0b100);
    }

    #[test]
    fn test_name_is_bounded() {
        let long = "x".repeat(4 * TASK_NAME_LEN);
        let task = Task::new(&long);
        assert_eq!(task.name().len(), TASK_NAME_LEN);
    }

    #[test]
    fn test_table_insert_lookup_remove() {
        let table = TaskTable::new();
        let task = Task::new("tracked");

        let baseline = Arc::strong_count(&task);
        table.insert(&task).unwrap();
        let pid = task.pid();
        assert_ne!(pid, INVALID_OBJECT_ID);

        let found = table.lookup(pid).unwrap();
        assert!(Arc::ptr_eq(&found, &task));
        drop(found);

        table.remove(&task);
        assert_eq!(task.pid(), INVALID_OBJECT_ID);
        assert!(table.lookup(pid).is_none());
        assert_eq!(Arc::strong_count(&task), baseline);
    }

    #[test]
    fn test_table_remove_twice_is_noop() {
        let table = TaskTable::new();
        let task = Task::new("t");

        table.insert(&task).unwrap();
        table.remove(&task);
        table.remove(&task);
        assert!(table.is_empty());
    }

    #[test]
    fn test_runtime_accounting() {
        let task = Task::new("t");
        task.set_run_start(100);
        task.update_runtime(350);
        assert_eq!(task.runtime(), 250);
        task.update_runtime(400);
        assert_eq!(task.runtime(), 300);
    }

    #[test]
    fn test_stack_rooted_lookup() {
        let task = Task::new("stacked");
        let stack = TaskStack::new(Arc::as_ptr(&task)).unwrap();

        let base = stack.base as u64;
        let baseline = Arc::strong_count(&task);

        // Any rsp within the usable range resolves to the owning task.
        for rsp in [
            base + STACK_SIZE as u64 - 8,
            base + STACK_SIZE as u64 - 72,
            base + 3 * PAGE_SIZE as u64,
        ] {
            let found = task_for_rsp(rsp);
            assert!(Arc::ptr_eq(&found, &task));
            drop(found);
        }
        assert_eq!(Arc::strong_count(&task), baseline);
    }

    #[test]
    #[should_panic]
    fn test_stack_lookup_rejects_guard_page() {
        let task = Task::new("guarded");
        let stack = TaskStack::new(Arc::as_ptr(&task)).unwrap();
        // An rsp inside the guard page means the stack overflowed.
        let _ = task_for_rsp(stack.base as u64 + PAGE_SIZE as u64 + 16);
    }

    #[test]
    fn test_entry_fires_exactly_once() {
        use core::sync::atomic::AtomicUsize;

        static CALLS: AtomicUsize = AtomicUsize::new(0);

        fn entry(ctx: usize) {
            CALLS.fetch_add(ctx, Ordering::SeqCst);
        }

        let task = Task::new("once");
        *task.entry.lock() = Some((entry, 1));

        task.invoke_entry();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
