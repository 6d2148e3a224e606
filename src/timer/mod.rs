//! The soft-timer subsystem: hardware driver boundary plus the
//! three-list multiplexing engine built on top of it.

pub mod hw;
pub mod soft;

pub use hw::HardwareTimer;
pub use soft::SoftTimerEngine;
