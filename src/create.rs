//! Thread-creation helpers: stack bring-up and parameter validation for
//! ordinary and protected threads.
//!
//! Covers both of the two creation flavors: ordinary threads (classical
//! register-frame restore) and protected threads (branch to a stored
//! entry address/index instead).

use bitflags::bitflags;

use crate::error::CreateError;
use crate::sched::Scheduler;
use crate::thread::{Pid, Status, MAX_PRIO_LEVEL_UNPROTECTED, RESUME_INTO_MODULE};

bitflags! {
    /// Thread-creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateFlags: u8 {
        /// Thread starts in `Sleeping` rather than `Pending`.
        const CREATE_SLEEPING = 0b0001;
        /// Creator does not yield to the new thread even if it outranks it.
        const CREATE_WOUT_YIELD = 0b0100;
        /// Paint the stack with a canary pattern for high-water-mark checks.
        const CREATE_STACKTEST = 0b1000;
        /// Reserved; accepted but currently a no-op.
        const AUTO_FREE = 0b0010;
    }
}

/// `thread_create`: allocates a TCB for an ordinary thread.
///
/// `entry_address` is the thread's entry point; `stack_pointer` must
/// already point at the top of a stack region the thread owns. Stack
/// initialization (pushing an initial register frame) is the
/// architecture's `ArchContext::save`/`resume` concern, not this helper's.
pub fn create(
    sched: &mut Scheduler,
    stack_pointer: usize,
    priority: u8,
    flags: CreateFlags,
    entry_address: usize,
) -> Result<Pid, CreateError> {
    if priority < MAX_PRIO_LEVEL_UNPROTECTED {
        return Err(CreateError::InvalidPriority);
    }
    let pid = sched.table.allocate().ok_or(CreateError::TableFull)?;
    {
        let t = sched.table.get_mut(pid).unwrap();
        t.is_protected = false;
        t.stack_pointer = stack_pointer;
        t.entry_address = entry_address;
        t.entry_index = 0;
        t.priority = priority;
    }
    let status = if flags.contains(CreateFlags::CREATE_SLEEPING) {
        Status::Sleeping
    } else {
        Status::Pending
    };
    sched.set_status(pid, status);
    if status == Status::Pending && !flags.contains(CreateFlags::CREATE_WOUT_YIELD) {
        sched.switch(priority);
    }
    log::info!("thread {pid} created at priority {priority}");
    Ok(pid)
}

/// `thread_create_protected`: allocates a TCB for a protected thread,
/// resumed by branching to `entry_address`/`entry_index` rather than by
/// restoring a saved register frame.
pub fn create_protected(
    sched: &mut Scheduler,
    scratch_stack_pointer: usize,
    priority: u8,
    flags: CreateFlags,
    entry_address: usize,
    entry_index: u16,
) -> Result<Pid, CreateError> {
    if priority < MAX_PRIO_LEVEL_UNPROTECTED {
        return Err(CreateError::InvalidPriority);
    }
    let pid = sched.table.allocate().ok_or(CreateError::TableFull)?;
    {
        let t = sched.table.get_mut(pid).unwrap();
        t.is_protected = true;
        t.stack_pointer = scratch_stack_pointer;
        t.entry_address = entry_address;
        t.entry_index = entry_index;
        t.priority = priority;
    }
    let status = if flags.contains(CreateFlags::CREATE_SLEEPING) {
        Status::Sleeping
    } else {
        Status::Pending
    };
    sched.set_status(pid, status);
    if status == Status::Pending && !flags.contains(CreateFlags::CREATE_WOUT_YIELD) {
        sched.switch(priority);
    }
    log::info!("protected thread {pid} created at priority {priority}");
    Ok(pid)
}

/// Marks a resumed protected thread so the entry stub branches back into
/// the module instead of re-entering at a fresh entry point
/// (`entry_index = 0xFFFF`).
pub fn mark_resume_into_module(sched: &mut Scheduler, pid: Pid) {
    if let Some(t) = sched.table.get_mut(pid) {
        if t.is_protected {
            t.entry_index = RESUME_INTO_MODULE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_priority_below_unprotected_floor() {
        let mut sched = Scheduler::new(0);
        let err = create(&mut sched, 0, 0, CreateFlags::empty(), 0).unwrap_err();
        assert_eq!(err, CreateError::InvalidPriority);
    }

    #[test]
    fn table_full_is_reported_as_overflow() {
        let mut sched = Scheduler::new(0);
        // PID 0 is the idle thread already allocated by `Scheduler::new`.
        let mut last = Ok(0);
        for _ in 0..crate::thread::MAX_THREADS {
            last = create(&mut sched, 0, 5, CreateFlags::empty(), 0);
            if last.is_err() {
                break;
            }
        }
        assert_eq!(last, Err(CreateError::TableFull));
    }

    #[test]
    fn sleeping_flag_skips_the_run_queue() {
        let mut sched = Scheduler::new(0);
        let pid = create(&mut sched, 0, 5, CreateFlags::CREATE_SLEEPING, 0).unwrap();
        assert_eq!(sched.table.get(pid).unwrap().status, Status::Sleeping);
    }

    #[test]
    fn protected_thread_is_marked_and_resumes_into_module() {
        let mut sched = Scheduler::new(0);
        let pid = create_protected(&mut sched, 0x1000, 5, CreateFlags::empty(), 0x4000, 3).unwrap();
        assert!(sched.table.get(pid).unwrap().is_protected);
        mark_resume_into_module(&mut sched, pid);
        assert_eq!(
            sched.table.get(pid).unwrap().entry_index,
            RESUME_INTO_MODULE
        );
    }
}
