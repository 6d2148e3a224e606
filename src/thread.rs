//! Thread control blocks and the fixed thread table.

use heapless::Vec;

/// Number of priority levels; priority `0` is highest.
pub const PRIO_LEVELS: usize = 16;
/// Ordinary (untrusted) threads may not request a priority below this.
pub const MAX_PRIO_LEVEL_UNPROTECTED: u8 = 1;
/// The reserved priority level used by the periodic class.
pub const PERIODIC_PRIO_LEVEL: u8 = 0;
/// The idle thread's priority: the lowest in the system.
pub const IDLE_PRIORITY: u8 = (PRIO_LEVELS - 1) as u8;
/// Size of the fixed thread table; PID `0` is reserved for the idle thread.
pub const MAX_THREADS: usize = 32;

/// A thread index into the fixed table; also its public identity.
pub type Pid = u8;

/// Sentinel resume index meaning "return into the protected module"
/// rather than branching to a fresh entry point.
pub const RESUME_INTO_MODULE: u16 = 0xFFFF;

/// Thread status. Variant order is kept stable so `status as u8` stays
/// meaningful across the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Stopped,
    Sleeping,
    MutexBlocked,
    ReceiveBlocked,
    SendBlocked,
    ReplyBlocked,
    FlagBlockedAny,
    FlagBlockedAll,
    MboxBlocked,
    CondBlocked,
    Running,
    Pending,
}

impl Status {
    /// `true` for the two "on-runqueue" states; all others are blocked.
    pub fn on_runqueue(self) -> bool {
        matches!(self, Status::Running | Status::Pending)
    }
}

/// Per-thread record of its periodic-class bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct PeriodicInfo {
    /// Runtime budget per period, in ticks.
    pub runtime: u32,
    /// Length of one period, in ticks.
    pub period: u32,
    /// Absolute tick at which the current period started.
    pub last_reference: u32,
    /// Ticks consumed so far in the current period.
    pub last_runtime: u32,
    /// Entry index to restore on each re-activation (protected threads).
    pub original_entry_index: u16,
}

/// Thread Control Block.
#[derive(Debug, Clone, Copy)]
pub struct Tcb {
    pub in_use: bool,
    pub is_protected: bool,
    pub stack_pointer: usize,
    pub entry_address: usize,
    pub entry_index: u16,
    pub status: Status,
    pub priority: u8,
    pub pid: Pid,
    /// Intrusive circular-list link: the run queue, a mutex wait list, or
    /// nowhere. Soft-timer links live in the timer pool, not here.
    pub next: Option<Pid>,
    pub periodic: Option<PeriodicInfo>,
}

impl Tcb {
    const fn empty(pid: Pid) -> Self {
        Tcb {
            in_use: false,
            is_protected: false,
            stack_pointer: 0,
            entry_address: 0,
            entry_index: 0,
            status: Status::Stopped,
            priority: IDLE_PRIORITY,
            pid,
            next: None,
            periodic: None,
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.priority == PERIODIC_PRIO_LEVEL && self.periodic.is_some()
    }
}

/// The fixed-size thread table. PID `0` is reserved for the idle thread.
pub struct ThreadTable {
    slots: Vec<Tcb, MAX_THREADS>,
}

impl ThreadTable {
    pub fn new() -> Self {
        let mut slots = Vec::new();
        for pid in 0..MAX_THREADS as Pid {
            // capacity is MAX_THREADS, push cannot fail here.
            let _ = slots.push(Tcb::empty(pid));
        }
        ThreadTable { slots }
    }

    pub fn get(&self, pid: Pid) -> Option<&Tcb> {
        self.slots.get(pid as usize)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Tcb> {
        self.slots.get_mut(pid as usize)
    }

    /// Finds a free slot and marks it in use, returning its PID.
    pub fn allocate(&mut self) -> Option<Pid> {
        let slot = self.slots.iter_mut().find(|t| !t.in_use)?;
        slot.in_use = true;
        Some(slot.pid)
    }

    pub fn free(&mut self, pid: Pid) {
        if let Some(t) = self.get_mut(pid) {
            *t = Tcb::empty(pid);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tcb> {
        self.slots.iter()
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::list::LinkStore<Pid> for ThreadTable {
    fn next(&self, k: Pid) -> Option<Pid> {
        self.get(k).and_then(|t| t.next)
    }
    fn set_next(&mut self, k: Pid, v: Option<Pid>) {
        if let Some(t) = self.get_mut(k) {
            t.next = v;
        }
    }
}
