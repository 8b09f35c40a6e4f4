//! Command shell
//!
//! A kernel task that reads characters pushed by the keyboard and
//! serial drivers, echoes them and executes one-line commands. `exit`
//! requests the orderly shutdown the boot processor's idle loop polls
//! for.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::collections::RingBuffer;
use crate::kern::lock::SpinLock;
use crate::kern::task::{task_table, Task};
use crate::kern::{cpu, sched, timer};
use crate::types::Result;
use crate::{print, println};

const LINE_LEN: usize = 80;

static INPUT: SpinLock<RingBuffer<char, 128>> = SpinLock::new(RingBuffer::new());
static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Queue a character typed by the user; drops input when the buffer is
/// full
pub fn push_input(c: char) {
    let _ = INPUT.lock().put(c);
}

/// Whether the user asked the kernel to shut down
pub fn is_exit_requested() -> bool {
    EXIT_REQUESTED.load(Ordering::Acquire)
}

/// Start the shell task
pub fn start() -> Result<Arc<Task>> {
    let task = Task::new("shell");
    Task::start(&task, shell_task, 0)?;
    Ok(task)
}

fn shell_task(_ctx: usize) {
    let this = Task::current();
    let mut line: heapless::String<LINE_LEN> = heapless::String::new();

    print!("axon> ");
    loop {
        if this.is_stopping() {
            break;
        }

        let input = INPUT.lock().get();
        match input {
            None => sched::sleep_ms(10),
            Some('\n') => {
                println!();
                execute(&line);
                line.clear();
                print!("axon> ");
            }
            Some('\x08') => {
                if line.pop().is_some() {
                    print!("\x08");
                }
            }
            Some(c) => {
                if line.push(c).is_ok() {
                    print!("{}", c);
                }
            }
        }
    }
}

/// Adapter so table printers can write to the console
struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        print!("{}", s);
        Ok(())
    }
}

fn execute(line: &str) {
    match line.trim() {
        "" => {}
        "help" => {
            println!("commands: help ps dmesg uptime cpus exit");
        }
        "ps" => {
            task_table().ps(&mut ConsoleWriter);
        }
        "dmesg" => {
            crate::dmesg::for_each(|entry| println!("{}", entry));
        }
        "uptime" => {
            println!("{}.{:03}s", timer::uptime_secs(), timer::uptime_millis());
        }
        "cpus" => {
            let cpus = cpu::cpu_table();
            for index in 0..crate::types::MAX_CPUS {
                let cpu = cpus.cpu(index);
                if !cpu.is_present() {
                    continue;
                }
                println!(
                    "cpu {}: state {:?} switches {} queued {} ipi-acks {}",
                    index,
                    cpu.state(),
                    cpu.queue().switch_count(),
                    cpu.queue().queued_len(),
                    cpu.ipi_acks()
                );
            }
        }
        "exit" => {
            EXIT_REQUESTED.store(true, Ordering::Release);
        }
        other => {
            println!("unknown command '{}'", other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_queue() {
        push_input('p');
        push_input('s');
        assert_eq!(INPUT.lock().get(), Some('p'));
        assert_eq!(INPUT.lock().get(), Some('s'));
        assert_eq!(INPUT.lock().get(), None);
    }

    #[test]
    fn test_exit_command_sets_flag() {
        assert!(!is_exit_requested());
        execute("  exit  ");
        assert!(is_exit_requested());
        EXIT_REQUESTED.store(false, Ordering::Release);
    }

    #[test]
    fn test_ps_and_help_do_not_panic() {
        execute("help");
        execute("ps");
        execute("uptime");
        execute("bogus");
    }
}
