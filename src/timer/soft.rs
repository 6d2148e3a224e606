//! The three-list soft-timer engine.
//!
//! Each thread owns exactly one slot in a fixed [`TimerPool`] indexed by
//! PID, rather than timers being bound by pointer into a caller-supplied
//! struct.

use crate::config::Config;
use crate::list;
use crate::sched::SchedTimerPort;
use crate::thread::{Pid, MAX_THREADS};
use crate::timer::hw::HardwareTimer;
use core::marker::PhantomData;
use heapless::Vec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ListKind {
    None,
    Short,
    Overflow,
    Long,
}

#[derive(Clone, Copy, Debug)]
struct TimerSlot {
    in_use: bool,
    target_low: u32,
    target_high: u32,
    list: ListKind,
    next: Option<Pid>,
}

impl TimerSlot {
    const fn empty() -> Self {
        TimerSlot {
            in_use: false,
            target_low: 0,
            target_high: 0,
            list: ListKind::None,
            next: None,
        }
    }
}

struct TimerPool {
    slots: Vec<TimerSlot, MAX_THREADS>,
}

impl TimerPool {
    fn new() -> Self {
        let mut slots = Vec::new();
        for _ in 0..MAX_THREADS {
            let _ = slots.push(TimerSlot::empty());
        }
        TimerPool { slots }
    }

    fn get(&self, pid: Pid) -> &TimerSlot {
        &self.slots[pid as usize]
    }
    fn get_mut(&mut self, pid: Pid) -> &mut TimerSlot {
        &mut self.slots[pid as usize]
    }
}

impl list::LinkStore<Pid> for TimerPool {
    fn next(&self, k: Pid) -> Option<Pid> {
        self.get(k).next
    }
    fn set_next(&mut self, k: Pid, v: Option<Pid>) {
        self.get_mut(k).next = v;
    }
}

/// The three-list soft-timer engine driving one hardware timer.
pub struct SoftTimerEngine<H: HardwareTimer, C: Config> {
    hw: H,
    pool: TimerPool,
    short: Option<Pid>,
    overflow: Option<Pid>,
    long: Option<Pid>,
    high_count: u32,
    long_count: u32,
    in_isr: bool,
    fired: Vec<Pid, MAX_THREADS>,
    _config: PhantomData<C>,
}

impl<H: HardwareTimer, C: Config> SoftTimerEngine<H, C> {
    pub fn new(mut hw: H) -> Result<Self, crate::error::TimerError> {
        hw.init(C::HZ)?;
        hw.start();
        Ok(SoftTimerEngine {
            hw,
            pool: TimerPool::new(),
            short: None,
            overflow: None,
            long: None,
            high_count: 0,
            long_count: 0,
            in_isr: false,
            fired: Vec::new(),
            _config: PhantomData,
        })
    }

    fn epoch_size(&self) -> u32 {
        C::lo_mask().wrapping_add(1)
    }

    /// Current extended-32 time, latching `high_count` twice and
    /// re-reading on mismatch to tolerate ISR races.
    pub fn now32(&self) -> u32 {
        loop {
            let h1 = self.high_count;
            let lo = self.hw.read() as u32;
            let h2 = self.high_count;
            if h1 == h2 {
                return h1 | lo;
            }
        }
    }

    /// 64-bit virtual clock: `(long_count << 32) | high_count | hw_counter`.
    pub fn now64(&self) -> u64 {
        ((self.long_count as u64) << 32) | self.now32() as u64
    }

    /// Arms (or synchronously fires) a timer for `pid` at absolute
    /// extended-32 target `target`.
    ///
    /// Classification into short/overflow/long is done by counting how
    /// many whole epochs separate `target` from the start of the current
    /// epoch (`self.high_count`), a direct way to express the three-bin
    /// rule once `target_low` no longer needs to double as a masked
    /// hardware register value.
    pub fn set_absolute(&mut self, pid: Pid, target: u32) {
        let now = self.now32();
        self.arm(pid, target, now)
    }

    /// As [`set_absolute`](Self::set_absolute), but rejects the request
    /// instead of evicting when `pid`'s slot is already armed: one slot per
    /// PID is the whole allotment, so a second request against a busy slot
    /// is a resource-exhaustion case, not a rearm.
    pub fn try_set_absolute(
        &mut self,
        pid: Pid,
        target: u32,
    ) -> Result<(), crate::error::SchedError> {
        if self.pool.get(pid).in_use {
            return Err(crate::error::SchedError::TimerBusy);
        }
        let now = self.now32();
        self.arm(pid, target, now);
        Ok(())
    }

    fn arm(&mut self, pid: Pid, target: u32, now: u32) {
        let offset = target.wrapping_sub(now);
        if offset <= C::BACKOFF {
            self.hw.spin_until((target & C::lo_mask()) as u16);
            self.fire_now(pid);
            return;
        }

        self.remove(pid);

        let epoch = self.epoch_size();
        let epochs_ahead = target.wrapping_sub(self.high_count) / epoch;
        let target_high = self.high_count.wrapping_add(epoch.wrapping_mul(epochs_ahead));
        let target_low = target.wrapping_sub(C::OVERHEAD);

        let kind = match epochs_ahead {
            0 => ListKind::Short,
            1 => ListKind::Overflow,
            _ => ListKind::Long,
        };

        {
            let slot = self.pool.get_mut(pid);
            slot.in_use = true;
            slot.target_low = target_low;
            slot.target_high = target_high;
            slot.list = kind;
        }

        match kind {
            ListKind::Short => {
                let was_head = self.short;
                let pool = &mut self.pool;
                list::linear_insert_sorted(pool, &mut self.short, pid, |pool, p| {
                    pool.get(p).target_low
                });
                if self.short != was_head {
                    self.reprogram_compare();
                }
            }
            ListKind::Overflow => {
                let pool = &mut self.pool;
                list::linear_insert_sorted(pool, &mut self.overflow, pid, |pool, p| {
                    pool.get(p).target_low
                });
            }
            ListKind::Long => {
                let pool = &mut self.pool;
                list::linear_insert_sorted(pool, &mut self.long, pid, |pool, p| {
                    let s = pool.get(p);
                    (s.target_high, s.target_low)
                });
            }
            ListKind::None => unreachable!(),
        }
    }

    fn reprogram_compare(&mut self) {
        match self.short {
            Some(pid) => {
                let target_low = self.pool.get(pid).target_low;
                self.hw.set_compare((target_low & C::lo_mask()) as u16);
            }
            None => self.hw.set_compare(C::lo_mask() as u16),
        }
    }

    /// `secure_mintimer_remove`: idempotent; zeroes the target fields.
    pub fn remove(&mut self, pid: Pid) {
        let kind = self.pool.get(pid).list;
        let head = match kind {
            ListKind::None => return,
            ListKind::Short => &mut self.short,
            ListKind::Overflow => &mut self.overflow,
            ListKind::Long => &mut self.long,
        };
        list::linear_remove(&mut self.pool, head, pid);
        let slot = self.pool.get_mut(pid);
        slot.in_use = false;
        slot.target_low = 0;
        slot.target_high = 0;
        slot.list = ListKind::None;
    }

    fn fire_now(&mut self, pid: Pid) {
        self.remove(pid);
        let _ = self.fired.push(pid);
    }

    /// `_timer_callback` / `secure_mintimer_timer_callback`: drains due
    /// timers on hardware compare-match or overflow, advancing the
    /// epoch counters as needed. Returns the PIDs that fired this call,
    /// in firing order; the caller (the scheduler handle) is responsible
    /// for transitioning each to `Pending` and requesting a reschedule.
    pub fn timer_callback(&mut self) -> Vec<Pid, MAX_THREADS> {
        self.fired.clear();
        self.in_isr = true;
        loop {
            if self.short.is_none() {
                self.advance_epoch();
            }
            loop {
                let due = match self.short {
                    Some(pid) => {
                        let target_low = self.pool.get(pid).target_low;
                        target_low.wrapping_sub(self.now32()) <= C::ISR_BACKOFF
                    }
                    None => false,
                };
                if !due {
                    break;
                }
                let pid = list::linear_pop_front(&mut self.pool, &mut self.short).unwrap();
                let target_low = self.pool.get(pid).target_low & C::lo_mask();
                self.hw.spin_until(target_low as u16);
                let slot = self.pool.get_mut(pid);
                slot.in_use = false;
                slot.target_low = 0;
                slot.target_high = 0;
                slot.list = ListKind::None;
                let _ = self.fired.push(pid);
            }
            if self.hw.overflow_pending() {
                self.hw.clear_overflow();
                continue;
            }
            break;
        }
        self.reprogram_compare();
        self.in_isr = false;
        self.fired.clone()
    }

    /// Moves `overflow` to `short` on an epoch boundary and migrates any
    /// now-current long-list timers into `short` (`_next_period` +
    /// `_select_long_timers`).
    fn advance_epoch(&mut self) {
        let epoch = self.epoch_size();
        self.high_count = self.high_count.wrapping_add(epoch);
        if self.high_count == 0 {
            self.long_count = self.long_count.wrapping_add(1);
        }
        self.short = self.overflow.take();
        if let Some(pid) = self.short {
            self.pool.get_mut(pid).list = ListKind::Short;
        }

        // migrate the prefix of `long` whose target_high now matches.
        while let Some(pid) = self.long {
            if self.pool.get(pid).target_high != self.high_count {
                break;
            }
            let pid = list::linear_pop_front(&mut self.pool, &mut self.long).unwrap();
            self.pool.get_mut(pid).list = ListKind::Short;
            let pool = &mut self.pool;
            list::linear_insert_sorted(pool, &mut self.short, pid, |pool, p| {
                pool.get(p).target_low
            });
        }
    }
}

/// Adapter letting [`SoftTimerEngine`] satisfy [`SchedTimerPort`] for a
/// particular PID's sleep/wake-up timer.
impl<H: HardwareTimer, C: Config> SchedTimerPort for SoftTimerEngine<H, C> {
    fn now(&self) -> u32 {
        self.now32()
    }
    fn arm_absolute(&mut self, pid: Pid, target_low: u32) {
        self.set_absolute(pid, target_low);
    }
    fn try_arm_absolute(
        &mut self,
        pid: Pid,
        target_low: u32,
    ) -> Result<(), crate::error::SchedError> {
        self.try_set_absolute(pid, target_low)
    }
    fn remove(&mut self, pid: Pid) {
        SoftTimerEngine::remove(self, pid);
    }
}
