//! Periodic scheduler threads.
//!
//! One named thread per sub-task drives [`Task::tick`] on its period.
//! Deadlines are absolute: after each tick the next deadline advances by
//! exactly one period, so a single late tick does not shift the grid.
//!
//! Overrun discipline: when a tick finishes past its successor's deadline
//! the overrun streak grows and the grid resynchronizes from now; a tick
//! that meets its deadline shrinks the streak again. Only a streak reaching
//! `max_overrun` aborts the task, so isolated hiccups are survivable while
//! sustained overload is not.

use crate::task::Task;
use crate::trace::{debug, info, warn};
use minstant::Instant;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Handle on a task's scheduler threads.
pub struct Scheduler {
    task: Arc<Task>,
    threads: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns one thread per sub-task. `pin_fastest` pins the fastest
    /// sub-task's thread to the last available core.
    pub fn spawn(task: Arc<Task>, pin_fastest: bool) -> io::Result<Self> {
        let mut threads = Vec::with_capacity(task.sub_task_count());
        for sub_task in 0..task.sub_task_count() {
            let mut builder = thread::Builder::new()
                .name(format!("cadence-{}-st{}", task.name(), sub_task));
            if let Some(stack) = task.tuning().stack_size {
                builder = builder.stack_size(stack);
            }
            let task = Arc::clone(&task);
            let pin = pin_fastest && sub_task == 0;
            threads.push(builder.spawn(move || run_sub_task(&task, sub_task, pin))?);
        }
        Ok(Scheduler { task, threads })
    }

    /// Stops all sub-task threads and waits for them to exit.
    pub fn stop(self) {
        self.task.request_stop();
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

fn run_sub_task(task: &Arc<Task>, sub_task: usize, pin: bool) {
    if pin {
        if let Some(core) = core_affinity::get_core_ids().and_then(|ids| ids.into_iter().last()) {
            if core_affinity::set_for_current(core) {
                debug!(task = %task.name(), core = core.id, "pinned fastest sub-task");
            }
        }
    }

    let period = task.periods()[sub_task];
    let max_overrun = task.tuning().max_overrun;
    let mut streak = 0u32;
    let mut deadline = Instant::now() + period;
    info!(task = %task.name(), sub_task, ?period, "sub-task thread running");

    while !task.should_stop() {
        sleep_until(deadline);
        if task.tick(sub_task).is_err() {
            // Abort reason already latched by the task.
            break;
        }
        deadline += period;
        let now = Instant::now();
        if now > deadline {
            streak += 1;
            let _total = task.note_overrun(sub_task);
            warn!(task = %task.name(), sub_task, streak, total = _total, "tick overran its deadline");
            if streak >= max_overrun {
                task.abort("sustained deadline overruns");
                break;
            }
            // Resynchronize the grid rather than racing to catch up.
            deadline = now + period;
        } else if streak > 0 {
            streak -= 1;
        }
    }
    debug!(task = %task.name(), sub_task, "sub-task thread exiting");
}

fn sleep_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(deadline.duration_since(now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelDescriptor, ElemType};
    use crate::config::HostConfig;
    use crate::error::HostError;
    use crate::task::{StepFault, TaskDescriptor, TaskRegistry, TaskStep};
    use std::time::Duration;

    struct CountStep {
        n: u32,
    }

    impl TaskStep for CountStep {
        fn step(&mut self, _sub: usize, image: &mut [u8], _params: &[u8]) -> Result<(), StepFault> {
            image[0..4].copy_from_slice(&self.n.to_le_bytes());
            self.n += 1;
            Ok(())
        }
    }

    struct SlowStep;

    impl TaskStep for SlowStep {
        fn step(&mut self, _sub: usize, _image: &mut [u8], _params: &[u8]) -> Result<(), StepFault> {
            thread::sleep(Duration::from_millis(8));
            Ok(())
        }
    }

    #[test]
    fn scheduler_produces_snapshots() {
        let reg = TaskRegistry::new(HostConfig::default());
        let mut desc = TaskDescriptor::new(
            "clocked",
            "clocked-1.0",
            vec![Duration::from_millis(1)],
            4,
            Box::new(CountStep { n: 0 }),
        );
        desc.signals = vec![ChannelDescriptor::vector(0, "/clocked/n", 0, 1, ElemType::U32)];
        let task = reg.register(desc).unwrap();

        let sched = Scheduler::spawn(Arc::clone(&task), false).unwrap();
        thread::sleep(Duration::from_millis(50));
        sched.stop();

        let pending = task.ring().current_write_offset().unwrap();
        assert!(pending > 5, "expected several snapshots, got {pending}");

        // Slices carry consecutive counter values from slice 0 on.
        let mut slice = vec![0u8; task.slice_len()];
        task.ring().read_slice(0, &mut slice).unwrap();
        assert_eq!(u32::from_le_bytes(slice[0..4].try_into().unwrap()), 0);
        task.ring().read_slice(1, &mut slice).unwrap();
        assert_eq!(u32::from_le_bytes(slice[0..4].try_into().unwrap()), 1);
    }

    #[test]
    fn sustained_overruns_abort_the_task() {
        let reg = TaskRegistry::new(HostConfig::default());
        let mut desc = TaskDescriptor::new(
            "sluggish",
            "sluggish-1.0",
            vec![Duration::from_millis(1)],
            4,
            Box::new(SlowStep),
        );
        desc.tuning.max_overrun = Some(3);
        let task = reg.register(desc).unwrap();

        let sched = Scheduler::spawn(Arc::clone(&task), false).unwrap();
        // 8ms steps on a 1ms period overrun every tick; three strikes.
        thread::sleep(Duration::from_millis(100));
        sched.stop();

        assert!(task.abort_reason().is_some());
        assert!(task.ring().is_closed());
        assert!(matches!(
            task.get_parameters(),
            Err(HostError::Aborted(_))
        ));
    }
}
