//! The protected singleton and the ephemeral-handle wrapper used to
//! touch it.
//!
//! All scheduler state lives behind a module-private singleton with an
//! ephemeral handle passed into every internal routine, rather than
//! file-scope statics read directly: a module-private
//! `Mutex<Option<KernelState>>` plus a short-lived handle type borrowed
//! from it for the duration of one scheduling operation.

use spin::{Mutex, MutexGuard};

use crate::config::Config;
use crate::sched::Scheduler;
use crate::thread::{Pid, MAX_THREADS};
use crate::timer::{HardwareTimer, SoftTimerEngine};

/// The PSM's owned state: the run-queue scheduler and the soft-timer
/// engine driving it, constructed together since the scheduler cannot
/// make progress without a clock.
pub struct KernelState<H: HardwareTimer, C: Config> {
    pub scheduler: Scheduler,
    pub timers: SoftTimerEngine<H, C>,
}

impl<H: HardwareTimer, C: Config> KernelState<H, C> {
    pub fn new(hw: H, idle_pid: Pid) -> Result<Self, crate::error::TimerError> {
        Ok(KernelState {
            scheduler: Scheduler::new(idle_pid),
            timers: SoftTimerEngine::new(hw)?,
        })
    }
}

/// A protected-region singleton cell. A board crate declares one
/// `static` of this type per hardware timer instance and calls
/// [`SchedCell::init`] once during boot, then reaches every scheduler
/// operation through a [`SchedHandle`] borrowed from it — never through
/// the static directly.
pub struct SchedCell<H: HardwareTimer, C: Config> {
    inner: Mutex<Option<KernelState<H, C>>>,
}

impl<H: HardwareTimer, C: Config> SchedCell<H, C> {
    pub const fn uninit() -> Self {
        SchedCell {
            inner: Mutex::new(None),
        }
    }

    /// Brings the singleton up. Idempotent in the sense that calling it
    /// again simply replaces the prior state; callers are expected to
    /// call this exactly once, from the BOOT opcode's handler.
    pub fn init(&self, hw: H, idle_pid: Pid) -> Result<(), crate::error::TimerError> {
        let mut guard = self.inner.lock();
        *guard = Some(KernelState::new(hw, idle_pid)?);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Locks the singleton for the duration of one scheduling operation.
    pub fn handle(&self) -> SchedHandle<'_, H, C> {
        SchedHandle {
            guard: self.inner.lock(),
        }
    }
}

/// An ephemeral, lock-held view of the kernel's scheduler and timer
/// state. Every operation that needs both takes one of these rather
/// than reaching for file-scope statics.
pub struct SchedHandle<'a, H: HardwareTimer, C: Config> {
    guard: MutexGuard<'a, Option<KernelState<H, C>>>,
}

impl<'a, H: HardwareTimer, C: Config> SchedHandle<'a, H, C> {
    fn state_mut(&mut self) -> &mut KernelState<H, C> {
        self.guard
            .as_mut()
            .expect("SchedHandle used before SchedCell::init")
    }

    /// Borrows both halves at once — the common shape every
    /// scheduler/timer-coupled operation (dispatch, mutex timeout,
    /// mintimer calls) needs.
    pub fn scheduler_and_timers(&mut self) -> (&mut Scheduler, &mut SoftTimerEngine<H, C>) {
        let state = self.state_mut();
        (&mut state.scheduler, &mut state.timers)
    }

    pub fn scheduler(&mut self) -> &mut Scheduler {
        &mut self.state_mut().scheduler
    }

    pub fn timers(&mut self) -> &mut SoftTimerEngine<H, C> {
        &mut self.state_mut().timers
    }

    /// Runs the entry-stub dispatch protocol against this singleton.
    pub fn dispatch(
        &mut self,
        arch: &mut impl crate::entry::ArchContext,
        isolation: &impl crate::entry::IsolationBoundary,
        opcode: crate::entry::Opcode,
    ) -> Pid {
        let (sched, timers) = self.scheduler_and_timers();
        crate::entry::dispatch(sched, timers, arch, isolation, opcode)
    }

    /// Drains due soft timers and applies their wake-ups to the
    /// scheduler. A fired PID that is not the currently running thread
    /// goes straight back to `Pending`. A fired PID that *is* the
    /// running thread — its own periodic preemption timer, sharing the
    /// sleep/wake slot per PID — is left alone: flipping it to `Pending`
    /// while it is still `active_pid` would desync the "exactly one
    /// `Running` thread, and it is `active_thread`" invariant and wedge
    /// `charge_periodic_quantum`'s `status == Running` guard forever.
    /// Either way a reschedule is requested so the next `run()` call
    /// re-evaluates; for the still-running case that call's own
    /// `charge_periodic_quantum` decides the exhaustion transition.
    pub fn timer_callback(&mut self) -> heapless::Vec<Pid, MAX_THREADS> {
        let (sched, timers) = self.scheduler_and_timers();
        let fired = timers.timer_callback();
        for &pid in fired.iter() {
            let is_active_running = pid == sched.active_pid
                && sched
                    .table
                    .get(pid)
                    .map(|t| t.status == crate::thread::Status::Running)
                    .unwrap_or(false);
            if !is_active_running {
                sched.set_status(pid, crate::thread::Status::Pending);
            }
        }
        if !fired.is_empty() {
            sched.context_switch_request = true;
        }
        fired
    }
}
