//! Run-queue scheduler: priority selection, status transitions, and
//! periodic-class runtime accounting.
//!
//! Built on the index-based [`crate::list`] primitives over a fixed
//! [`ThreadTable`] rather than pointer-threaded nodes.

use crate::bitmap::RunQueueBitmap;
use crate::config::{Config, DefaultConfig};
use crate::list;
use crate::list::LinkStore;
use crate::thread::{
    PeriodicInfo, Pid, Status, Tcb, ThreadTable, IDLE_PRIORITY, PERIODIC_PRIO_LEVEL, PRIO_LEVELS,
};

/// The scheduler's view of the clock and the soft-timer engine, used to
/// arm the periodic-class preemption/wake-up timer. Kept as a trait so
/// `sched.rs` has no dependency on the timer engine's internals, the
/// same mechanism/policy split that separates run-queue selection from
/// the engine driving it.
pub trait SchedTimerPort {
    fn now(&self) -> u32;
    /// Unconditionally (re-)arms `pid`'s slot, evicting whatever was
    /// there. For scheduler-owned transitions (periodic quantum
    /// accounting, period rollover, mutex wait hand-off) that already own
    /// the lifecycle of that slot.
    fn arm_absolute(&mut self, pid: Pid, target_low: u32);
    /// As `arm_absolute`, but fails instead of evicting when `pid`'s slot
    /// is already armed. For request paths where a second concurrent
    /// request should be rejected rather than silently cancel the first.
    fn try_arm_absolute(&mut self, pid: Pid, target_low: u32) -> Result<(), crate::error::SchedError>;
    fn remove(&mut self, pid: Pid);
}

/// The run-queue scheduler's owned state.
pub struct Scheduler {
    pub table: ThreadTable,
    run_queues: [Option<Pid>; PRIO_LEVELS],
    bitmap: RunQueueBitmap,
    pub active_pid: Pid,
    pub context_switch_request: bool,
    pub in_isr: bool,
}

impl Scheduler {
    pub fn new(idle_pid: Pid) -> Self {
        let mut sched = Scheduler {
            table: ThreadTable::new(),
            run_queues: [None; PRIO_LEVELS],
            bitmap: RunQueueBitmap::new(),
            active_pid: idle_pid,
            context_switch_request: false,
            in_isr: false,
        };
        if let Some(idle) = sched.table.get_mut(idle_pid) {
            idle.priority = IDLE_PRIORITY;
            idle.in_use = true;
        }
        sched.set_status(idle_pid, Status::Running);
        sched
    }

    /// Enforces the invariant: on-runqueue states live in `run_queues` with
    /// the matching bitmap bit set; all other states don't. The new
    /// status is written last, after the queue/bitmap bookkeeping.
    pub fn set_status(&mut self, pid: Pid, status: Status) {
        let (was_on_runqueue, priority) = match self.table.get(pid) {
            Some(t) => (t.status.on_runqueue(), t.priority),
            None => return,
        };
        let now_on_runqueue = status.on_runqueue();

        if was_on_runqueue && !now_on_runqueue {
            let head = &mut self.run_queues[priority as usize];
            list::remove(&mut self.table, head, pid);
            if self.run_queues[priority as usize].is_none() {
                self.bitmap.clear(priority);
            }
        } else if !was_on_runqueue && now_on_runqueue {
            let head = &mut self.run_queues[priority as usize];
            list::rpush(&mut self.table, head, pid);
            self.bitmap.set(priority);
        }

        if let Some(t) = self.table.get_mut(pid) {
            t.status = status;
        }
    }

    /// `sched_run`: picks the next thread to run. Returns `true` if the
    /// active thread changed.
    pub fn run(&mut self, timers: &mut impl SchedTimerPort) -> bool {
        if self.charge_periodic_quantum(timers) {
            // active thread went to sleep; fall through to selection.
        } else if self.periodic_quantum_remains() {
            // still within budget: keep running the same thread.
            return false;
        }

        self.context_switch_request = false;

        let priority = match self.bitmap.lowest_set() {
            Some(p) => p,
            None => return false, // nothing runnable; should not happen (idle always ready)
        };
        let head = self.run_queues[priority as usize];
        let current = match list::peek_head(&self.table, head) {
            Some(c) => c,
            None => return false,
        };
        let chosen = self.table.next(current).unwrap_or(current);

        if chosen == self.active_pid {
            return false;
        }

        if let Some(active) = self.table.get_mut(self.active_pid) {
            if active.status == Status::Running {
                active.status = Status::Pending;
            }
        }
        if let Some(t) = self.table.get_mut(chosen) {
            t.status = Status::Running;
        }
        self.active_pid = chosen;

        if self.table.get(chosen).map(Tcb::is_periodic).unwrap_or(false) {
            let head = &mut self.run_queues[priority as usize];
            list::lpoprpush(&mut self.table, head);
            self.arm_periodic_preemption(chosen, timers);
        }

        true
    }

    /// Charges elapsed time against the active periodic thread's budget.
    /// Returns `true` if the thread was put to sleep (budget exhausted).
    fn charge_periodic_quantum(&mut self, timers: &mut impl SchedTimerPort) -> bool {
        let pid = self.active_pid;
        let now = timers.now();
        let exhausted = {
            let t = match self.table.get_mut(pid) {
                Some(t) => t,
                None => return false,
            };
            if t.status != Status::Running || !t.is_periodic() {
                return false;
            }
            let info = t.periodic.as_mut().unwrap();
            info.last_runtime = now
                .wrapping_sub(info.last_reference)
                .saturating_sub(DefaultConfig::OVERHEAD);
            info.last_runtime >= info.runtime
        };
        if !exhausted {
            return false;
        }

        let next_wake = {
            let t = self.table.get_mut(pid).unwrap();
            let info = t.periodic.as_mut().unwrap();
            while !later_than(info.last_reference, now) {
                info.last_reference = info.last_reference.wrapping_add(info.period);
            }
            info.last_runtime = 0;
            info.last_reference
        };
        timers.arm_absolute(pid, next_wake);
        self.set_status(pid, Status::Sleeping);
        true
    }

    fn periodic_quantum_remains(&self) -> bool {
        let pid = self.active_pid;
        match self.table.get(pid) {
            Some(t) if t.status == Status::Running && t.is_periodic() => true,
            _ => false,
        }
    }

    fn arm_periodic_preemption(&mut self, pid: Pid, timers: &mut impl SchedTimerPort) {
        let now = timers.now();
        if let Some(t) = self.table.get(pid) {
            if let Some(info) = t.periodic {
                let remaining = info.runtime.saturating_sub(info.last_runtime);
                timers.arm_absolute(pid, now.wrapping_add(remaining));
            }
        }
    }

    /// `sched_switch`: request a reschedule if the caller is no longer the
    /// best candidate; the caller decides whether to yield immediately
    /// (never from ISR context).
    pub fn switch(&mut self, other_priority: u8) {
        let on_runqueue = self
            .table
            .get(self.active_pid)
            .map(|t| t.status.on_runqueue())
            .unwrap_or(false);
        let current_priority = self
            .table
            .get(self.active_pid)
            .map(|t| t.priority)
            .unwrap_or(IDLE_PRIORITY);
        if !on_runqueue || current_priority > other_priority {
            self.context_switch_request = true;
        }
    }

    /// `sched_yield`: round-robins within the active thread's priority, or
    /// for a periodic thread, cancels its preemption timer and schedules
    /// the next period's wake-up.
    pub fn yield_now(&mut self, timers: &mut impl SchedTimerPort) {
        let pid = self.active_pid;
        let (priority, is_periodic) = match self.table.get(pid) {
            Some(t) => (t.priority, t.is_periodic()),
            None => return,
        };

        if !is_periodic {
            let head = &mut self.run_queues[priority as usize];
            list::lpoprpush(&mut self.table, head);
            return;
        }

        timers.remove(pid);
        let next_wake = {
            let t = self.table.get_mut(pid).unwrap();
            let info = t.periodic.as_mut().unwrap();
            info.last_reference = info.last_reference.wrapping_add(info.period);
            info.last_runtime = 0;
            info.last_reference
        };
        timers.arm_absolute(pid, next_wake);
        self.context_switch_request = true;
    }

    /// `sched_task_exit_internal`: frees the active thread's slot.
    pub fn task_exit(&mut self, timers: &mut impl SchedTimerPort) {
        let pid = self.active_pid;
        timers.remove(pid);
        self.set_status(pid, Status::Stopped);
        self.table.free(pid);
        log::info!("thread {pid} exited");
    }

    /// Starts a thread entering the periodic class (`change_to_periodical`).
    pub fn promote_to_periodic(
        &mut self,
        pid: Pid,
        runtime: u32,
        period: u32,
        timers: &mut impl SchedTimerPort,
    ) {
        let now = timers.now();
        if let Some(t) = self.table.get_mut(pid) {
            t.priority = PERIODIC_PRIO_LEVEL;
            t.periodic = Some(PeriodicInfo {
                runtime,
                period,
                last_reference: now,
                last_runtime: 0,
                original_entry_index: t.entry_index,
            });
        }
        timers.arm_absolute(pid, now.wrapping_add(period));
        self.set_status(pid, Status::Sleeping);
    }
}

/// `true` if `candidate` is strictly after `now` in wrapping 32-bit time.
fn later_than(candidate: u32, now: u32) -> bool {
    candidate.wrapping_sub(now) > 0 && candidate.wrapping_sub(now) < 0x8000_0000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeTimers {
        now: u32,
        armed: HashMap<Pid, u32>,
    }
    impl FakeTimers {
        fn new() -> Self {
            FakeTimers {
                now: 0,
                armed: HashMap::new(),
            }
        }
    }
    impl SchedTimerPort for FakeTimers {
        fn now(&self) -> u32 {
            self.now
        }
        fn arm_absolute(&mut self, pid: Pid, target_low: u32) {
            self.armed.insert(pid, target_low);
        }
        fn try_arm_absolute(
            &mut self,
            pid: Pid,
            target_low: u32,
        ) -> Result<(), crate::error::SchedError> {
            if self.armed.contains_key(&pid) {
                return Err(crate::error::SchedError::TimerBusy);
            }
            self.armed.insert(pid, target_low);
            Ok(())
        }
        fn remove(&mut self, pid: Pid) {
            self.armed.remove(&pid);
        }
    }

    fn spawn(sched: &mut Scheduler, priority: u8) -> Pid {
        let pid = sched.table.allocate().unwrap();
        sched.table.get_mut(pid).unwrap().priority = priority;
        sched.set_status(pid, Status::Pending);
        pid
    }

    #[test]
    fn bitmap_tracks_non_empty_queues() {
        let mut sched = Scheduler::new(0);
        let pid = spawn(&mut sched, 5);
        assert!(sched.bitmap.is_set(5));
        sched.set_status(pid, Status::Sleeping);
        assert!(!sched.bitmap.is_set(5));
    }

    #[test]
    fn round_robin_at_equal_priority() {
        let mut sched = Scheduler::new(0);
        let mut timers = FakeTimers::new();
        let t1 = spawn(&mut sched, 5);
        let t2 = spawn(&mut sched, 5);
        sched.active_pid = t1;
        sched.table.get_mut(t1).unwrap().status = Status::Running;

        assert!(sched.run(&mut timers));
        assert_eq!(sched.active_pid, t2);

        sched.yield_now(&mut timers);
        assert!(sched.run(&mut timers));
        assert_eq!(sched.active_pid, t1);
    }

    #[test]
    fn exactly_one_thread_running_after_selection() {
        let mut sched = Scheduler::new(0);
        let mut timers = FakeTimers::new();
        let t1 = spawn(&mut sched, 3);
        sched.active_pid = 0;
        sched.run(&mut timers);
        assert_eq!(sched.active_pid, t1);
        let running = sched
            .table
            .iter()
            .filter(|t| t.status == Status::Running)
            .count();
        assert_eq!(running, 1);
    }

    #[test]
    fn periodic_quantum_exhausted_puts_thread_to_sleep() {
        let mut sched = Scheduler::new(0);
        let mut timers = FakeTimers::new();
        let pid = spawn(&mut sched, 1);
        sched.table.get_mut(pid).unwrap().periodic = Some(PeriodicInfo {
            runtime: 500,
            period: 2000,
            last_reference: 0,
            last_runtime: 0,
            original_entry_index: 0,
        });
        sched.table.get_mut(pid).unwrap().priority = PERIODIC_PRIO_LEVEL;
        sched.active_pid = pid;
        sched.table.get_mut(pid).unwrap().status = Status::Running;
        // run_queues bookkeeping: pretend thread already on runqueue at
        // PERIODIC_PRIO_LEVEL (set_status would normally have put it there).
        sched.run_queues[PERIODIC_PRIO_LEVEL as usize] = Some(pid);
        sched.bitmap.set(PERIODIC_PRIO_LEVEL);
        sched.table.get_mut(pid).unwrap().next = Some(pid);

        timers.now = 900; // elapsed 900 - OVERHEAD(300) = 600 >= runtime(500)
        sched.run(&mut timers);
        assert_eq!(sched.table.get(pid).unwrap().status, Status::Sleeping);
        assert!(timers.armed.contains_key(&pid));
    }

    #[test]
    fn task_exit_frees_slot() {
        let mut sched = Scheduler::new(0);
        let mut timers = FakeTimers::new();
        let pid = spawn(&mut sched, 4);
        sched.active_pid = pid;
        sched.table.get_mut(pid).unwrap().status = Status::Running;
        sched.task_exit(&mut timers);
        assert!(!sched.table.get(pid).unwrap().in_use);
    }
}
