//! The protected entry stub: the single boundary every scheduling
//! operation funnels through.
//!
//! Register save/restore is architecture-specific and out of this
//! crate's scope, so it is expressed as the
//! [`ArchContext`] trait rather than inline assembly. Likewise the
//! hardware-isolation primitive's "get caller id" / violation-detection
//! capability is the [`IsolationBoundary`] trait, keeping interrupt
//! handling separate from the scheduling mechanism it drives.

use crate::sched::{Scheduler, SchedTimerPort};
use crate::thread::{Pid, Status, Tcb, RESUME_INTO_MODULE};
#[cfg(test)]
use crate::thread::MAX_THREADS;

/// One of the five operations dispatched at the protected boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// First call after kernel init; behaves like `Yield` once the
    /// soft-timer engine (constructed by the kernel layer before the
    /// first dispatch) is up.
    Boot,
    Yield,
    Exit,
    Switch { other_priority: u8 },
    Sleep { offset: u32 },
}

/// The save/resume contract a target architecture must implement.
/// `resume` never returns: control transfers to `tcb`'s stack (ordinary
/// threads) or entry point (protected threads).
pub trait ArchContext {
    fn save(&mut self, tcb: &mut Tcb);
    /// Same as `save`, but for `Exit`'s "skip overwriting SP" case: the
    /// exiting thread's stack pointer is never read again, so an
    /// implementation may elide that one register write. Defaults to a
    /// full `save` since skipping it is purely an optimization.
    fn save_skip_sp(&mut self, tcb: &mut Tcb) {
        self.save(tcb);
    }
    fn resume(&mut self, tcb: &Tcb) -> !;
}

/// The hardware-isolation primitive's view from the entry stub: who
/// called, and did anything go wrong getting here.
pub trait IsolationBoundary {
    /// `true` if the calling code executes inside a protected region.
    fn caller_is_protected(&self) -> bool;
    /// `true` if the isolation primitive flagged a violation on this
    /// entry.
    fn violation_detected(&self) -> bool;
}

/// Runs the dispatch protocol and returns the PID now selected to run.
/// Does not itself resume — that is [`ArchContext::resume`]'s job, left
/// to the caller (real boot code loops `dispatch` then `resume`
/// unconditionally; tests only need the selection outcome).
pub fn dispatch(
    sched: &mut Scheduler,
    timers: &mut impl SchedTimerPort,
    arch: &mut impl ArchContext,
    isolation: &impl IsolationBoundary,
    opcode: Opcode,
) -> Pid {
    let caller = sched.active_pid;

    if let Some(t) = sched.table.get_mut(caller) {
        if isolation.caller_is_protected() {
            t.is_protected = true;
            t.entry_index = RESUME_INTO_MODULE;
        } else {
            t.is_protected = false;
        }
    }

    if isolation.violation_detected() {
        log::warn!("isolation violation on thread {caller}, forcing exit");
        if let Some(t) = sched.table.get_mut(caller) {
            arch.save_skip_sp(t);
        }
        sched.task_exit(timers);
        sched.run(timers);
        return sched.active_pid;
    }

    match opcode {
        Opcode::Boot | Opcode::Yield => {
            if let Some(t) = sched.table.get_mut(caller) {
                arch.save(t);
            }
            sched.run(timers);
        }
        Opcode::Exit => {
            if let Some(t) = sched.table.get_mut(caller) {
                arch.save_skip_sp(t);
            }
            sched.task_exit(timers);
            sched.run(timers);
        }
        Opcode::Switch { other_priority } => {
            sched.switch(other_priority);
            if sched.context_switch_request {
                if let Some(t) = sched.table.get_mut(caller) {
                    arch.save(t);
                }
                sched.run(timers);
            }
        }
        Opcode::Sleep { offset } => {
            if let Some(t) = sched.table.get_mut(caller) {
                arch.save(t);
            }
            let target = timers.now().wrapping_add(offset);
            // Caller's slot may already be armed (a periodic thread's own
            // preemption timer). Arming for sleep is a request against a
            // shared per-caller resource, not a scheduler-owned rearm, so a
            // busy slot is a no-op rather than an eviction: the caller keeps
            // running and is expected to re-check time and retry.
            if timers.try_arm_absolute(caller, target).is_ok() {
                sched.set_status(caller, Status::Sleeping);
            }
            sched.run(timers);
        }
    }

    sched.active_pid
}

/// The real top-level stub: dispatch, then transfer control. Diverges,
/// so it is never exercised by `#[cfg(test)]` — only [`dispatch`] is.
pub fn dispatch_and_resume(
    sched: &mut Scheduler,
    timers: &mut impl SchedTimerPort,
    arch: &mut impl ArchContext,
    isolation: &impl IsolationBoundary,
    opcode: Opcode,
) -> ! {
    let next = dispatch(sched, timers, arch, isolation, opcode);
    let tcb = sched.table.get(next).expect("active pid must be valid");
    arch.resume(tcb)
}

#[cfg(test)]
pub struct TestArchContext {
    pub saved: heapless::Vec<Pid, MAX_THREADS>,
    pub skip_sp_saved: heapless::Vec<Pid, MAX_THREADS>,
}

#[cfg(test)]
impl TestArchContext {
    pub fn new() -> Self {
        TestArchContext {
            saved: heapless::Vec::new(),
            skip_sp_saved: heapless::Vec::new(),
        }
    }
}

#[cfg(test)]
impl ArchContext for TestArchContext {
    fn save(&mut self, tcb: &mut Tcb) {
        let _ = self.saved.push(tcb.pid);
    }
    fn save_skip_sp(&mut self, tcb: &mut Tcb) {
        let _ = self.skip_sp_saved.push(tcb.pid);
    }
    fn resume(&mut self, _tcb: &Tcb) -> ! {
        panic!("TestArchContext::resume is not meant to be called in unit tests");
    }
}

#[cfg(test)]
pub struct TestIsolationBoundary {
    pub protected: bool,
    pub violation: bool,
}

#[cfg(test)]
impl IsolationBoundary for TestIsolationBoundary {
    fn caller_is_protected(&self) -> bool {
        self.protected
    }
    fn violation_detected(&self) -> bool {
        self.violation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::Scheduler;
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

    fn ordinary(sched: &mut Scheduler, priority: u8) -> Pid {
        let pid = sched.table.allocate().unwrap();
        sched.table.get_mut(pid).unwrap().priority = priority;
        sched.set_status(pid, Status::Pending);
        pid
    }

    #[test]
    fn yield_saves_caller_and_may_switch() {
        let mut sched = Scheduler::new(0);
        let mut timers = FakeTimers::new();
        let mut arch = TestArchContext::new();
        let iso = TestIsolationBoundary {
            protected: false,
            violation: false,
        };
        let t1 = ordinary(&mut sched, 5);
        sched.active_pid = t1;
        sched.table.get_mut(t1).unwrap().status = Status::Running;
        let t2 = ordinary(&mut sched, 5);

        let next = dispatch(&mut sched, &mut timers, &mut arch, &iso, Opcode::Yield);
        assert_eq!(next, t2);
        assert_eq!(arch.saved.as_slice(), &[t1]);
    }

    #[test]
    fn exit_uses_skip_sp_save_and_frees_the_caller() {
        let mut sched = Scheduler::new(0);
        let mut timers = FakeTimers::new();
        let mut arch = TestArchContext::new();
        let iso = TestIsolationBoundary {
            protected: false,
            violation: false,
        };
        let t1 = ordinary(&mut sched, 5);
        sched.active_pid = t1;
        sched.table.get_mut(t1).unwrap().status = Status::Running;

        dispatch(&mut sched, &mut timers, &mut arch, &iso, Opcode::Exit);
        assert_eq!(arch.skip_sp_saved.as_slice(), &[t1]);
        assert!(arch.saved.is_empty());
        assert!(!sched.table.get(t1).unwrap().in_use);
    }

    #[test]
    fn switch_does_not_reschedule_when_not_higher_priority() {
        let mut sched = Scheduler::new(0);
        let mut timers = FakeTimers::new();
        let mut arch = TestArchContext::new();
        let iso = TestIsolationBoundary {
            protected: false,
            violation: false,
        };
        let t1 = ordinary(&mut sched, 5);
        sched.active_pid = t1;
        sched.table.get_mut(t1).unwrap().status = Status::Running;

        let next = dispatch(
            &mut sched,
            &mut timers,
            &mut arch,
            &iso,
            Opcode::Switch { other_priority: 9 },
        );
        assert_eq!(next, t1);
        assert!(arch.saved.is_empty());
    }

    #[test]
    fn switch_reschedules_when_strictly_higher_priority_is_ready() {
        let mut sched = Scheduler::new(0);
        let mut timers = FakeTimers::new();
        let mut arch = TestArchContext::new();
        let iso = TestIsolationBoundary {
            protected: false,
            violation: false,
        };
        let t1 = ordinary(&mut sched, 5);
        sched.active_pid = t1;
        sched.table.get_mut(t1).unwrap().status = Status::Running;
        let t2 = ordinary(&mut sched, 2);

        let next = dispatch(
            &mut sched,
            &mut timers,
            &mut arch,
            &iso,
            Opcode::Switch { other_priority: 2 },
        );
        assert_eq!(next, t2);
    }

    #[test]
    fn sleep_arms_a_timer_and_reschedules() {
        let mut sched = Scheduler::new(0);
        let mut timers = FakeTimers::new();
        let mut arch = TestArchContext::new();
        let iso = TestIsolationBoundary {
            protected: false,
            violation: false,
        };
        let t1 = ordinary(&mut sched, 5);
        sched.active_pid = t1;
        sched.table.get_mut(t1).unwrap().status = Status::Running;
        timers.now = 100;

        dispatch(
            &mut sched,
            &mut timers,
            &mut arch,
            &iso,
            Opcode::Sleep { offset: 1000 },
        );
        assert_eq!(sched.table.get(t1).unwrap().status, Status::Sleeping);
        assert_eq!(timers.armed.get(&t1), Some(&1100));
    }

    #[test]
    fn sleep_is_a_no_op_when_the_callers_slot_is_already_armed() {
        let mut sched = Scheduler::new(0);
        let mut timers = FakeTimers::new();
        let mut arch = TestArchContext::new();
        let iso = TestIsolationBoundary {
            protected: false,
            violation: false,
        };
        let t1 = ordinary(&mut sched, 5);
        sched.active_pid = t1;
        sched.table.get_mut(t1).unwrap().status = Status::Running;
        timers.now = 100;
        timers.armed.insert(t1, 500);

        dispatch(
            &mut sched,
            &mut timers,
            &mut arch,
            &iso,
            Opcode::Sleep { offset: 1000 },
        );
        assert_eq!(sched.table.get(t1).unwrap().status, Status::Running);
        assert_eq!(timers.armed.get(&t1), Some(&500));
    }

    #[test]
    fn protected_caller_is_marked_for_resume_into_module() {
        let mut sched = Scheduler::new(0);
        let mut timers = FakeTimers::new();
        let mut arch = TestArchContext::new();
        let iso = TestIsolationBoundary {
            protected: true,
            violation: false,
        };
        let t1 = ordinary(&mut sched, 5);
        sched.active_pid = t1;
        sched.table.get_mut(t1).unwrap().status = Status::Running;

        dispatch(&mut sched, &mut timers, &mut arch, &iso, Opcode::Yield);
        let t1_tcb = sched.table.get(t1).unwrap();
        assert!(t1_tcb.is_protected);
        assert_eq!(t1_tcb.entry_index, RESUME_INTO_MODULE);
    }

    #[test]
    fn isolation_violation_force_exits_regardless_of_opcode() {
        let mut sched = Scheduler::new(0);
        let mut timers = FakeTimers::new();
        let mut arch = TestArchContext::new();
        let iso = TestIsolationBoundary {
            protected: false,
            violation: true,
        };
        let t1 = ordinary(&mut sched, 5);
        sched.active_pid = t1;
        sched.table.get_mut(t1).unwrap().status = Status::Running;

        dispatch(&mut sched, &mut timers, &mut arch, &iso, Opcode::Yield);
        assert!(!sched.table.get(t1).unwrap().in_use);
        assert_eq!(arch.skip_sp_saved.as_slice(), &[t1]);
    }
}
