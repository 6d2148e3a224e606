//! Priority-ordered mutex.
//!
//! State is a plain three-variant enum (unlocked, locked with an empty
//! wait list, locked with a wait list head) rather than encoding it
//! through pointer sentinels on a single link field.

use crate::list;
use crate::sched::{Scheduler, SchedTimerPort};
use crate::thread::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unlocked,
    LockedEmpty,
    LockedWithWaiters(Pid),
}

/// A priority-ordered mutex. Owns no thread state itself; all blocking
/// and wake-up transitions are applied to the [`Scheduler`]'s thread
/// table through the handle passed to each operation.
pub struct Mutex {
    state: State,
}

impl Mutex {
    pub const fn new() -> Self {
        Mutex {
            state: State::Unlocked,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.state != State::Unlocked
    }

    /// `_mutex_lock(blocking=true)`. Blocks the caller until the mutex is
    /// granted; caller must subsequently run the scheduler (yield) to
    /// actually suspend.
    pub fn lock(&mut self, sched: &mut Scheduler, caller: Pid, timers: &mut impl SchedTimerPort) {
        match self.state {
            State::Unlocked => {
                self.state = State::LockedEmpty;
            }
            _ => {
                self.block_and_enqueue(sched, caller);
                sched.yield_now(timers);
            }
        }
    }

    /// `_mutex_lock(blocking=false)`. Never blocks.
    pub fn try_lock(&mut self) -> bool {
        if self.state == State::Unlocked {
            self.state = State::LockedEmpty;
            true
        } else {
            false
        }
    }

    pub(crate) fn block_and_enqueue(&mut self, sched: &mut Scheduler, caller: Pid) {
        sched.set_status(caller, crate::thread::Status::MutexBlocked);
        let mut h = match self.state {
            State::LockedEmpty => None,
            State::LockedWithWaiters(head) => Some(head),
            State::Unlocked => unreachable!(),
        };
        let table = &mut sched.table;
        list::linear_insert_sorted(table, &mut h, caller, |table, pid| {
            table.get(pid).map(|t| t.priority).unwrap_or(u8::MAX)
        });
        self.state = State::LockedWithWaiters(h.unwrap());
    }

    /// `mutex_unlock`: pops the highest-priority waiter (if any), hands
    /// off ownership to it, and requests (but does not force) a switch
    /// if the woken thread outranks the caller.
    pub fn unlock(&mut self, sched: &mut Scheduler, caller_priority: u8) {
        match self.state {
            State::Unlocked => {}
            State::LockedEmpty => self.state = State::Unlocked,
            State::LockedWithWaiters(head) => {
                let woken_priority = self.pop_and_wake(sched, head);
                if woken_priority < caller_priority {
                    sched.switch(woken_priority);
                }
            }
        }
    }

    /// `mutex_unlock_and_sleep`: unlock exactly as above, then put the
    /// caller to sleep and yield.
    pub fn unlock_and_sleep(
        &mut self,
        sched: &mut Scheduler,
        caller: Pid,
        timers: &mut impl SchedTimerPort,
    ) {
        match self.state {
            State::Unlocked => {}
            State::LockedEmpty => self.state = State::Unlocked,
            State::LockedWithWaiters(head) => {
                self.pop_and_wake(sched, head);
            }
        }
        sched.set_status(caller, crate::thread::Status::Sleeping);
        sched.yield_now(timers);
    }

    /// Cancels a still-waiting thread's place in the wait list without
    /// handing it the lock — used by a timed-out `mutex_lock_timeout`
    /// ("arms a soft timer whose callback unlocks the mutex from
    /// under the sleeper"). No-op (returns `false`) if `pid` is not
    /// currently `MUTEX_BLOCKED` on this mutex, e.g. because it had
    /// already been handed the lock before the timeout fired.
    pub fn cancel_wait(&mut self, sched: &mut Scheduler, pid: Pid) -> bool {
        let was_blocked = sched
            .table
            .get(pid)
            .map(|t| t.status == crate::thread::Status::MutexBlocked)
            .unwrap_or(false);
        if !was_blocked {
            return false;
        }
        if let State::LockedWithWaiters(head) = self.state {
            let mut h = Some(head);
            let table = &mut sched.table;
            list::linear_remove(table, &mut h, pid);
            self.state = match h {
                Some(new_head) => State::LockedWithWaiters(new_head),
                None => State::LockedEmpty,
            };
        }
        sched.set_status(pid, crate::thread::Status::Pending);
        true
    }

    /// Pops the wait-list head, transitions it to `Pending`, and updates
    /// `self.state` to reflect the new holder / emptiness. Returns the
    /// woken thread's priority.
    fn pop_and_wake(&mut self, sched: &mut Scheduler, head: Pid) -> u8 {
        let mut h = Some(head);
        let table = &mut sched.table;
        let next_up = list::linear_pop_front(table, &mut h).unwrap_or(head);
        let priority = table.get(next_up).map(|t| t.priority).unwrap_or(u8::MAX);
        sched.set_status(next_up, crate::thread::Status::Pending);
        self.state = match h {
            Some(new_head) => State::LockedWithWaiters(new_head),
            None => State::LockedEmpty,
        };
        priority
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}
