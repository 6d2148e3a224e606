//! Compile-time tunables and tick/microsecond conversion.
//!
//! A board crate implements [`Config`] to override the defaults; the
//! scheduler core is generic over it so the conversion math below is
//! monomorphized per-board rather than branching at runtime.

/// Scheduler-wide tunables, mirroring `secure_mintimer.h`'s `#ifndef`
/// guarded defaults.
pub trait Config {
    /// Hardware timer frequency in Hz. Only `1_000_000` and `32_768` have
    /// a dedicated fast conversion path; other frequencies that are a
    /// power-of-two multiple (or divisor) of 1 MHz use `SHIFT`.
    const HZ: u32 = 1_000_000;
    /// Width in bits of the underlying hardware counter.
    const WIDTH: u32 = 16;
    /// Offset below which `set_absolute` degrades to a synchronous spin-wait.
    const BACKOFF: u32 = 200;
    /// Same as `BACKOFF` but applied while draining the short list inside
    /// the timer callback.
    const ISR_BACKOFF: u32 = 200;
    /// Fixed cost subtracted from every armed target to compensate for the
    /// scheduler's own re-entry latency.
    const OVERHEAD: u32 = 300;
    /// log2 of `HZ / 1_000_000` when `HZ` is a power-of-two multiple of
    /// 1 MHz, or `-log2(1_000_000 / HZ)` encoded as a negative shift when
    /// `HZ` divides 1 MHz; `0` when neither applies (falls back to the
    /// exact 1 MHz or 32768 Hz special cases).
    const SHIFT: i32 = 0;

    /// Bitmask covering the low `WIDTH` bits of the hardware counter.
    fn lo_mask() -> u32 {
        if Self::WIDTH >= 32 {
            0xFFFF_FFFF
        } else {
            (1u32 << Self::WIDTH) - 1
        }
    }
}

/// The documented defaults: a 1 MHz hardware timer, 16-bit wide.
pub struct DefaultConfig;

impl Config for DefaultConfig {}

/// Converts a tick count of `C::HZ` to microseconds.
pub fn usec_from_ticks<C: Config>(ticks: u32) -> u32 {
    if C::HZ == 1_000_000 {
        ticks
    } else if C::HZ == 32_768 {
        (((ticks as u64) * 15625) >> 9) as u32
    } else if C::SHIFT > 0 {
        ticks >> C::SHIFT
    } else if C::SHIFT < 0 {
        ticks << (-C::SHIFT)
    } else {
        ((ticks as u64) * 1_000_000 / C::HZ as u64) as u32
    }
}

/// Converts microseconds to a tick count of `C::HZ`.
pub fn ticks_from_usec<C: Config>(usec: u32) -> u32 {
    if C::HZ == 1_000_000 {
        usec
    } else if C::HZ == 32_768 {
        (((usec as u64) * 512) / 15625) as u32
    } else if C::SHIFT > 0 {
        usec << C::SHIFT
    } else if C::SHIFT < 0 {
        usec >> (-C::SHIFT)
    } else {
        ((usec as u64) * C::HZ as u64 / 1_000_000) as u32
    }
}

/// Same conversions widened to 64 bits, used by `now64`/`tsleep64`.
pub fn usec_from_ticks64<C: Config>(ticks: u64) -> u64 {
    if C::HZ == 1_000_000 {
        ticks
    } else if C::HZ == 32_768 {
        (ticks * 15625) >> 9
    } else if C::SHIFT > 0 {
        ticks >> C::SHIFT
    } else if C::SHIFT < 0 {
        ticks << (-C::SHIFT)
    } else {
        ticks * 1_000_000 / C::HZ as u64
    }
}

pub fn ticks_from_usec64<C: Config>(usec: u64) -> u64 {
    if C::HZ == 1_000_000 {
        usec
    } else if C::HZ == 32_768 {
        (usec * 512) / 15625
    } else if C::SHIFT > 0 {
        usec << C::SHIFT
    } else if C::SHIFT < 0 {
        usec >> (-C::SHIFT)
    } else {
        usec * C::HZ as u64 / 1_000_000
    }
}
