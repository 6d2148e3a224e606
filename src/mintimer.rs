//! The public soft-timer API façade.
//!
//! A zero-sized type exposing the soft-timer/sleep/wake surface as
//! associated functions over a [`SchedHandle`].

use crate::config::{self, Config};
use crate::entry::{ArchContext, IsolationBoundary, Opcode};
use crate::error::TimerError;
use crate::kernel::SchedHandle;
use crate::mutex::Mutex;
use crate::thread::Pid;
#[cfg(test)]
use crate::thread::Status;
use crate::timer::HardwareTimer;

/// Stateless façade over the soft-timer and sleep/wake surface.
pub struct Mintimer;

impl Mintimer {
    pub fn now<H: HardwareTimer, C: Config>(handle: &mut SchedHandle<H, C>) -> u32 {
        handle.timers().now32()
    }

    pub fn now64<H: HardwareTimer, C: Config>(handle: &mut SchedHandle<H, C>) -> u64 {
        handle.timers().now64()
    }

    pub fn now_usec<H: HardwareTimer, C: Config>(handle: &mut SchedHandle<H, C>) -> u32 {
        config::usec_from_ticks::<C>(Self::now(handle))
    }

    pub fn now_usec64<H: HardwareTimer, C: Config>(handle: &mut SchedHandle<H, C>) -> u64 {
        config::usec_from_ticks64::<C>(Self::now64(handle))
    }

    /// Suspends the active thread for `ticks`, via the entry stub's
    /// SLEEP opcode. Returns the PID now selected to run.
    pub fn tsleep32<H: HardwareTimer, C: Config>(
        handle: &mut SchedHandle<H, C>,
        arch: &mut impl ArchContext,
        isolation: &impl IsolationBoundary,
        ticks: u32,
    ) -> Pid {
        handle.dispatch(arch, isolation, Opcode::Sleep { offset: ticks })
    }

    /// As [`Self::tsleep32`], for an offset given in 64-bit ticks. An
    /// offset that does not fit the 32-bit SLEEP opcode is rejected
    /// explicitly (DESIGN.md Open Question 3) rather than silently
    /// truncated.
    pub fn tsleep64<H: HardwareTimer, C: Config>(
        handle: &mut SchedHandle<H, C>,
        arch: &mut impl ArchContext,
        isolation: &impl IsolationBoundary,
        ticks: u64,
    ) -> Result<Pid, TimerError> {
        let ticks32 = u32::try_from(ticks).map_err(|_| TimerError::OffsetTooLarge)?;
        Ok(Self::tsleep32(handle, arch, isolation, ticks32))
    }

    pub fn usleep<H: HardwareTimer, C: Config>(
        handle: &mut SchedHandle<H, C>,
        arch: &mut impl ArchContext,
        isolation: &impl IsolationBoundary,
        usec: u32,
    ) -> Pid {
        Self::tsleep32(handle, arch, isolation, config::ticks_from_usec::<C>(usec))
    }

    pub fn sleep<H: HardwareTimer, C: Config>(
        handle: &mut SchedHandle<H, C>,
        arch: &mut impl ArchContext,
        isolation: &impl IsolationBoundary,
        seconds: u32,
    ) -> Pid {
        Self::usleep(handle, arch, isolation, seconds.saturating_mul(1_000_000))
    }

    pub fn nanosleep<H: HardwareTimer, C: Config>(
        handle: &mut SchedHandle<H, C>,
        arch: &mut impl ArchContext,
        isolation: &impl IsolationBoundary,
        nanos: u32,
    ) -> Pid {
        Self::usleep(handle, arch, isolation, nanos / 1000)
    }

    /// `set_absolute(timer, target_low)`: arms (or fires) the soft timer
    /// owned by `pid` for absolute extended-32 tick `target`.
    pub fn set_absolute<H: HardwareTimer, C: Config>(
        handle: &mut SchedHandle<H, C>,
        pid: Pid,
        target: u32,
    ) {
        handle.timers().set_absolute(pid, target);
    }

    pub fn remove<H: HardwareTimer, C: Config>(handle: &mut SchedHandle<H, C>, pid: Pid) {
        handle.timers().remove(pid);
    }

    /// Attempts to lock `mutex`, arming a timeout of `usec` microseconds
    /// if it must block. Returns `true` if the lock was acquired
    /// immediately (no blocking occurred); `false` means `caller` is now
    /// `MUTEX_BLOCKED` with a timeout armed, and will resume either via
    /// a mutex hand-off or, once the timeout elapses, via
    /// [`Self::mutex_lock_timeout_expire`] being invoked against the
    /// fired PID.
    pub fn mutex_lock_timeout<H: HardwareTimer, C: Config>(
        handle: &mut SchedHandle<H, C>,
        mutex: &mut Mutex,
        caller: Pid,
        usec: u32,
    ) -> bool {
        if mutex.try_lock() {
            return true;
        }
        let (sched, timers) = handle.scheduler_and_timers();
        mutex.block_and_enqueue(sched, caller);
        let ticks = config::ticks_from_usec::<C>(usec);
        let target = timers.now32().wrapping_add(ticks);
        timers.set_absolute(caller, target);
        sched.yield_now(timers);
        false
    }

    /// The timeout half of `mutex_lock_timeout`: called for a PID the
    /// timer engine reports as fired while it was still waiting on
    /// `mutex`. Cancels the stale wait-list entry so the thread is
    /// returned to `Pending` without having been handed the lock.
    /// Returns `false` (no-op) if the mutex had already handed it
    /// ownership before the timer fired — "on success, the timer is
    /// removed", so no separate bookkeeping is needed for the
    /// success path beyond the hand-off `unlock` already performed.
    pub fn mutex_lock_timeout_expire<H: HardwareTimer, C: Config>(
        handle: &mut SchedHandle<H, C>,
        mutex: &mut Mutex,
        caller: Pid,
    ) -> bool {
        mutex.cancel_wait(handle.scheduler(), caller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConfig;
    use crate::entry::{TestArchContext, TestIsolationBoundary};
    use crate::kernel::SchedCell;
    use crate::timer::hw::SimHardwareTimer;

    type TestCell = SchedCell<SimHardwareTimer, DefaultConfig>;

    fn iso() -> TestIsolationBoundary {
        TestIsolationBoundary {
            protected: false,
            violation: false,
        }
    }

    #[test]
    fn now_starts_at_zero() {
        let cell = TestCell::uninit();
        cell.init(SimHardwareTimer::new(), 0).unwrap();
        let mut handle = cell.handle();
        assert_eq!(Mintimer::now(&mut handle), 0);
        assert_eq!(Mintimer::now_usec(&mut handle), 0);
    }

    #[test]
    fn tsleep32_marks_active_thread_sleeping_and_reschedules() {
        let cell = TestCell::uninit();
        cell.init(SimHardwareTimer::new(), 0).unwrap();
        let mut handle = cell.handle();
        let pid = {
            let sched = handle.scheduler();
            let pid = sched.table.allocate().unwrap();
            sched.table.get_mut(pid).unwrap().priority = 5;
            sched.set_status(pid, Status::Pending);
            sched.active_pid = pid;
            sched.table.get_mut(pid).unwrap().status = Status::Running;
            pid
        };
        let mut arch = TestArchContext::new();
        let boundary = iso();
        let next = Mintimer::tsleep32(&mut handle, &mut arch, &boundary, 10_000);
        assert_eq!(next, 0); // idle, since the sleeper was the only other thread
        assert_eq!(handle.scheduler().table.get(pid).unwrap().status, Status::Sleeping);
    }

    #[test]
    fn mutex_lock_timeout_acquires_immediately_when_unlocked() {
        let cell = TestCell::uninit();
        cell.init(SimHardwareTimer::new(), 0).unwrap();
        let mut handle = cell.handle();
        let caller = {
            let sched = handle.scheduler();
            let pid = sched.table.allocate().unwrap();
            sched.set_status(pid, Status::Pending);
            pid
        };
        let mut mutex = Mutex::new();
        assert!(Mintimer::mutex_lock_timeout(&mut handle, &mut mutex, caller, 1_000));
        assert!(mutex.is_locked());
    }

    #[test]
    fn mutex_lock_timeout_blocks_then_expires_on_timeout() {
        let cell = TestCell::uninit();
        cell.init(SimHardwareTimer::new(), 0).unwrap();
        let mut handle = cell.handle();
        let (holder, waiter) = {
            let sched = handle.scheduler();
            let holder = sched.table.allocate().unwrap();
            sched.table.get_mut(holder).unwrap().priority = 5;
            sched.set_status(holder, Status::Pending);
            let waiter = sched.table.allocate().unwrap();
            sched.table.get_mut(waiter).unwrap().priority = 5;
            sched.set_status(waiter, Status::Pending);
            (holder, waiter)
        };
        let mut mutex = Mutex::new();
        assert!(mutex.try_lock());
        assert!(!Mintimer::mutex_lock_timeout(
            &mut handle,
            &mut mutex,
            waiter,
            1_000
        ));
        assert_eq!(
            handle.scheduler().table.get(waiter).unwrap().status,
            Status::MutexBlocked
        );

        assert!(Mintimer::mutex_lock_timeout_expire(
            &mut handle,
            &mut mutex,
            waiter
        ));
        assert_eq!(
            handle.scheduler().table.get(waiter).unwrap().status,
            Status::Pending
        );
        let _ = holder;
    }

    #[test]
    fn mutex_lock_timeout_expire_is_a_no_op_after_hand_off() {
        let cell = TestCell::uninit();
        cell.init(SimHardwareTimer::new(), 0).unwrap();
        let mut handle = cell.handle();
        let waiter = {
            let sched = handle.scheduler();
            let pid = sched.table.allocate().unwrap();
            sched.table.get_mut(pid).unwrap().priority = 5;
            sched.set_status(pid, Status::Pending);
            pid
        };
        let mut mutex = Mutex::new();
        assert!(mutex.try_lock());
        Mintimer::mutex_lock_timeout(&mut handle, &mut mutex, waiter, 1_000);
        mutex.unlock(handle.scheduler(), 5);

        assert!(!Mintimer::mutex_lock_timeout_expire(
            &mut handle,
            &mut mutex,
            waiter
        ));
    }
}
