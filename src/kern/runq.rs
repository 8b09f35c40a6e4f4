//! Per-CPU task queues
//!
//! Each CPU owns one [`TaskQueue`] holding the tasks eligible to run
//! there: a round-robin ready list, a sleep list ordered only by scan,
//! and the task currently executing. The queue also counts context
//! switches; task placement uses that counter as a coarse load metric.
//!
//! A task is on at most one queue, and its owner back-pointer always
//! names that queue. Tasks never migrate once placed.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::bug_on;
use crate::kern::lock::SpinLock;
use crate::kern::task::{Task, TaskState};

/// Outcome of a scheduling decision
pub enum NextTask {
    /// The current task keeps the CPU
    Keep,
    /// Switch to this task; the queue state is already updated
    Switch(Arc<Task>),
    /// Nothing is runnable on this CPU right now
    Idle,
}

struct QueueInner {
    ready: VecDeque<Arc<Task>>,
    sleeping: Vec<Arc<Task>>,
    current: Option<Arc<Task>>,
    /// Exited task awaiting its final reference drop. The drop must not
    /// happen while the task's stack may still be the active stack, so
    /// the next task reaps it after the switch completes.
    reap: Option<Arc<Task>>,
}

impl QueueInner {
    const fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            sleeping: Vec::new(),
            current: None,
            reap: None,
        }
    }

    fn wake_expired(&mut self, now: u64) {
        let mut i = 0;
        while i < self.sleeping.len() {
            if self.sleeping[i].wake_deadline() <= now {
                let task = self.sleeping.swap_remove(i);
                task.clear_wake_deadline();
                self.ready.push_back(task);
            } else {
                i += 1;
            }
        }
    }

    /// Put the outgoing task wherever its state says it belongs
    fn dispose(&mut self, prev: &Arc<Task>, cpu_index: usize) {
        match prev.state() {
            TaskState::Running => {
                // Still runnable; idle tasks stay out of the rotation and
                // are reached through the CPU's idle handle instead.
                if !prev.is_idle() {
                    self.ready.push_back(prev.clone());
                }
            }
            TaskState::Waiting => self.sleeping.push(prev.clone()),
            TaskState::Exited => {
                bug_on!(self.reap.is_some());
                prev.set_owner(None);
                self.reap = Some(prev.clone());
            }
            TaskState::New => panic!("new task was running on cpu {}", cpu_index),
        }
    }
}

pub struct TaskQueue {
    cpu_index: usize,
    switches: AtomicU64,
    inner: SpinLock<QueueInner>,
}

impl TaskQueue {
    pub const fn new(cpu_index: usize) -> Self {
        Self {
            cpu_index,
            switches: AtomicU64::new(0),
            inner: SpinLock::new(QueueInner::new()),
        }
    }

    pub fn cpu_index(&self) -> usize {
        self.cpu_index
    }

    /// Context switches performed on this CPU so far
    pub fn switch_count(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Append a task to the ready list and take ownership of it
    pub fn insert(&self, task: Arc<Task>) {
        bug_on!(task.owner().is_some());
        task.set_owner(Some(self.cpu_index));

        let mut inner = self.inner.lock();
        inner.ready.push_back(task);
    }

    /// Unlink a task from this queue and clear its owner pointer. The
    /// queue's reference is dropped after the lock is released.
    pub fn remove(&self, task: &Arc<Task>) {
        let unlinked = {
            let mut inner = self.inner.lock();

            if let Some(pos) = inner.ready.iter().position(|t| Arc::ptr_eq(t, task)) {
                inner.ready.remove(pos)
            } else if let Some(pos) = inner.sleeping.iter().position(|t| Arc::ptr_eq(t, task)) {
                Some(inner.sleeping.swap_remove(pos))
            } else if inner
                .current
                .as_ref()
                .is_some_and(|t| Arc::ptr_eq(t, task))
            {
                inner.current.take()
            } else {
                None
            }
        };

        task.set_owner(None);
        drop(unlinked);
    }

    /// Install the first task of a CPU as its running task
    pub fn adopt_current(&self, task: Arc<Task>) {
        bug_on!(task.owner().is_some());
        task.set_owner(Some(self.cpu_index));

        let mut inner = self.inner.lock();
        bug_on!(inner.current.is_some());
        inner.current = Some(task);
    }

    /// The task currently executing on this queue's CPU
    pub fn current(&self) -> Option<Arc<Task>> {
        self.inner.lock().current.clone()
    }

    /// Move sleepers whose deadline has passed back to the ready list
    pub fn wake_expired(&self, now: u64) {
        self.inner.lock().wake_expired(now);
    }

    /// Whether any task is waiting for the CPU
    pub fn has_ready(&self) -> bool {
        !self.inner.lock().ready.is_empty()
    }

    /// Ready + sleeping task count (diagnostics)
    pub fn queued_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.ready.len() + inner.sleeping.len()
    }

    /// Take the task parked for reaping after the last switch
    pub fn take_reap(&self) -> Option<Arc<Task>> {
        self.inner.lock().reap.take()
    }

    /// Pick what runs next on this CPU.
    ///
    /// `prev` must be the queue's current task. On `Switch` the queue has
    /// already re-filed `prev`, installed the returned task as current and
    /// bumped the switch counter; the caller only performs the actual
    /// context switch. `idle` is the CPU's idle task, used when nothing
    /// else is runnable and `prev` cannot continue.
    pub fn schedule_next(&self, prev: &Arc<Task>, idle: Option<&Arc<Task>>, now: u64) -> NextTask {
        let mut inner = self.inner.lock();

        bug_on!(!inner
            .current
            .as_ref()
            .is_some_and(|t| Arc::ptr_eq(t, prev)));

        inner.wake_expired(now);

        // A sleeper whose deadline passed while it still held the CPU
        // simply keeps running.
        if prev.state() == TaskState::Waiting && prev.wake_deadline() <= now {
            prev.clear_wake_deadline();
            prev.set_state(TaskState::Running);
        }

        if let Some(next) = inner.ready.pop_front() {
            inner.dispose(prev, self.cpu_index);
            inner.current = Some(next.clone());
            self.switches.fetch_add(1, Ordering::Relaxed);
            return NextTask::Switch(next);
        }

        if prev.state() == TaskState::Running {
            return NextTask::Keep;
        }

        // Nothing ready and prev is blocked: fall back to the idle task
        // if it is parked outside the rotation.
        if let Some(idle) = idle {
            if !Arc::ptr_eq(idle, prev) && idle.state() == TaskState::Running {
                inner.dispose(prev, self.cpu_index);
                inner.current = Some(idle.clone());
                self.switches.fetch_add(1, Ordering::Relaxed);
                return NextTask::Switch(idle.clone());
            }
        }

        NextTask::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::task::Task;

    fn task(name: &str) -> Arc<Task> {
        Task::new(name)
    }

    #[test]
    fn test_insert_sets_owner() {
        let queue = TaskQueue::new(3);
        let t = task("a");

        assert!(t.owner().is_none());
        queue.insert(t.clone());
        assert_eq!(t.owner(), Some(3));
        assert!(queue.has_ready());

        queue.remove(&t);
        assert!(t.owner().is_none());
        assert!(!queue.has_ready());
    }

    #[test]
    fn test_round_robin_rotation() {
        let queue = TaskQueue::new(0);

        let running = task("running");
        running.set_state(TaskState::Running);
        queue.adopt_current(running.clone());

        let a = task("a");
        let b = task("b");
        a.set_state(TaskState::Waiting);
        b.set_state(TaskState::Waiting);
        queue.insert(a.clone());
        queue.insert(b.clone());

        // running -> a, running requeued behind b
        match queue.schedule_next(&running, None, 0) {
            NextTask::Switch(next) => assert!(Arc::ptr_eq(&next, &a)),
            _ => panic!("expected switch"),
        }
        assert_eq!(queue.switch_count(), 1);

        a.set_state(TaskState::Running);
        match queue.schedule_next(&a, None, 0) {
            NextTask::Switch(next) => assert!(Arc::ptr_eq(&next, &b)),
            _ => panic!("expected switch"),
        }
    }

    #[test]
    fn test_keep_when_alone() {
        let queue = TaskQueue::new(0);
        let t = task("only");
        t.set_state(TaskState::Running);
        queue.adopt_current(t.clone());

        assert!(matches!(queue.schedule_next(&t, None, 0), NextTask::Keep));
        assert_eq!(queue.switch_count(), 0);
    }

    #[test]
    fn test_sleeper_wakes_after_deadline() {
        let queue = TaskQueue::new(0);

        let idle = task("idle");
        idle.set_idle();
        idle.set_state(TaskState::Running);
        queue.adopt_current(idle.clone());

        let sleeper = task("sleeper");
        sleeper.set_state(TaskState::Waiting);
        sleeper.set_wake_deadline(100);
        queue.insert(sleeper.clone());
        {
            // File it on the sleep list by switching to it and sleeping.
            match queue.schedule_next(&idle, None, 0) {
                NextTask::Switch(next) => assert!(Arc::ptr_eq(&next, &sleeper)),
                _ => panic!("expected switch"),
            }
        }

        // Sleeper blocks again at t=10; idle task takes over.
        sleeper.set_state(TaskState::Waiting);
        sleeper.set_wake_deadline(100);
        match queue.schedule_next(&sleeper, Some(&idle), 10) {
            NextTask::Switch(next) => assert!(Arc::ptr_eq(&next, &idle)),
            _ => panic!("expected switch to idle"),
        }

        // Deadline passes; the sleeper comes back off the sleep list.
        match queue.schedule_next(&idle, None, 200) {
            NextTask::Switch(next) => {
                assert!(Arc::ptr_eq(&next, &sleeper));
                assert_eq!(next.wake_deadline(), 0);
            }
            _ => panic!("expected switch"),
        }
    }

    #[test]
    fn test_exited_task_parked_for_reaping() {
        let queue = TaskQueue::new(0);

        let dying = task("dying");
        dying.set_state(TaskState::Running);
        queue.adopt_current(dying.clone());

        let next = task("next");
        next.set_state(TaskState::Waiting);
        queue.insert(next.clone());

        dying.set_state(TaskState::Exited);
        match queue.schedule_next(&dying, None, 0) {
            NextTask::Switch(n) => assert!(Arc::ptr_eq(&n, &next)),
            _ => panic!("expected switch"),
        }

        assert!(dying.owner().is_none());
        let reaped = queue.take_reap().expect("reap slot filled");
        assert!(Arc::ptr_eq(&reaped, &dying));
        assert!(queue.take_reap().is_none());
    }
}
