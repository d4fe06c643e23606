//! Programmable Interval Timer (8254) on channel 0.
//!
//! The PIT runs as a rate generator at a caller-chosen frequency and drives
//! a free-running 64-bit tick counter plus a single registered callback (the
//! scheduler). The 64-bit counter will not wrap in practical kernel
//! lifetimes, so there is no overflow handling.

use core::sync::atomic::{AtomicU64, Ordering};

use conquer_once::spin::OnceCell;
use x86_64::instructions::port::Port;

use crate::{serial_println, KernelError, KernelResult};

/// Fixed base frequency of the PIT oscillator, in Hz.
pub const BASE_FREQUENCY: u32 = 1_193_182;

/// Lowest configurable tick rate; below this the 16-bit divisor saturates.
pub const MIN_FREQUENCY: u32 = 18;

/// Highest supported tick rate.
pub const MAX_FREQUENCY: u32 = 1000;

const CHANNEL_0: u16 = 0x40;
const COMMAND: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, mode 2 (rate generator), binary.
const COMMAND_BYTE: u8 = 0b0011_0100;

static TICKS: AtomicU64 = AtomicU64::new(0);
static FREQUENCY: AtomicU64 = AtomicU64::new(0);
static TICK_CALLBACK: OnceCell<fn()> = OnceCell::uninit();

/// Compute the channel-0 divisor for a requested frequency, rounded to the
/// nearest integer and clamped to the programmable range.
#[must_use]
pub const fn divisor_for(frequency: u32) -> u16 {
    let divisor = (BASE_FREQUENCY + frequency / 2) / frequency;
    if divisor == 0 {
        1
    } else if divisor > 65535 {
        65535
    } else {
        divisor as u16
    }
}

/// Program the timer to fire `frequency` times per second.
///
/// # Errors
/// [`KernelError::InvalidArgument`] when the frequency is outside
/// [`MIN_FREQUENCY`]..=[`MAX_FREQUENCY`].
pub fn init(frequency: u32) -> KernelResult<()> {
    if frequency < MIN_FREQUENCY || frequency > MAX_FREQUENCY {
        return Err(KernelError::InvalidArgument);
    }

    let divisor = divisor_for(frequency);
    FREQUENCY.store(u64::from(frequency), Ordering::Relaxed);
    TICKS.store(0, Ordering::Relaxed);

    let mut command: Port<u8> = Port::new(COMMAND);
    let mut channel0: Port<u8> = Port::new(CHANNEL_0);

    // SAFETY:
    // Well-known PIT registers; low byte then high byte per the command.
    unsafe {
        command.write(COMMAND_BYTE);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }

    serial_println!("[PIT] Timer initialized at {} Hz", frequency);
    Ok(())
}

/// Register the function invoked on every tick. Only the first registration
/// wins; the kernel wires the scheduler here once at boot.
pub fn set_tick_callback(callback: fn()) {
    let _ = TICK_CALLBACK.try_init_once(|| callback);
}

/// Current value of the monotonic tick counter.
#[must_use]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Seconds since the timer was programmed, derived from the tick counter.
#[must_use]
pub fn uptime_secs() -> u64 {
    let frequency = FREQUENCY.load(Ordering::Relaxed);
    if frequency == 0 {
        return 0;
    }
    ticks() / frequency
}

/// Busy-halt until at least `n` more ticks have elapsed.
///
/// Interrupts must be enabled, otherwise the counter never advances and
/// this never returns.
pub fn sleep(n: u64) {
    let target = ticks() + n;
    while ticks() < target {
        x86_64::instructions::hlt();
    }
}

/// Called by the timer interrupt handler: advance the counter.
pub(crate) fn record_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Called by the timer interrupt handler after the PIC acknowledgment: run
/// the registered callback. A context switch inside the callback suspends
/// the current task in this very call.
pub(crate) fn run_tick_callback() {
    if let Ok(callback) = TICK_CALLBACK.try_get() {
        callback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_divisor_rounds_to_nearest() {
        // 1_193_182 / 100 = 11_931.82 -> 11_932.
        assert_eq!(
            divisor_for(100),
            11_932,
            "The divisor must round to the nearest integer.",
        );
    }

    #[test_case]
    fn test_divisor_clamps_to_sixteen_bits() {
        assert_eq!(
            divisor_for(1),
            65_535,
            "A too-low frequency must clamp the divisor to 65535.",
        );
    }

    #[test_case]
    fn test_out_of_range_frequency_is_rejected() {
        assert_eq!(
            init(0).unwrap_err(),
            KernelError::InvalidArgument,
            "Zero frequency must be rejected.",
        );
        assert_eq!(
            init(200_000).unwrap_err(),
            KernelError::InvalidArgument,
            "A frequency above the supported range must be rejected.",
        );
    }
}
