// Millisecond timebase consumed by the dispatcher
//
// Time is a u32 millisecond counter that wraps at u32::MAX (~49.7
// days). All comparisons go through wrapping subtraction, which stays
// correct across one wrap as long as no period exceeds u32::MAX.

/// Source of the current time in milliseconds.
///
/// Any `Fn() -> u32` is a timebase, so a plain function such as
/// [`crate::kernel::clock::millis`] or a test closure can be handed to
/// the dispatcher directly.
pub trait Timebase {
    fn now(&self) -> u32;
}

impl<F> Timebase for F
where
    F: Fn() -> u32,
{
    #[inline]
    fn now(&self) -> u32 {
        self()
    }
}

/// Milliseconds between `since` and `now`, tolerating a counter wrap.
#[inline]
pub const fn elapsed(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

/// Whether `period` ms have passed since `last`.
#[inline]
pub const fn is_due(now: u32, last: u32, period: u32) -> bool {
    elapsed(now, last) >= period
}

/// Milliseconds left until `last + period`, 0 when already due.
#[inline]
pub const fn remaining(now: u32, last: u32, period: u32) -> u32 {
    period.saturating_sub(elapsed(now, last))
}

// embassy-time driver, truncated to 32 bits
#[cfg(feature = "embassy")]
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyMillis;

#[cfg(feature = "embassy")]
impl Timebase for EmbassyMillis {
    #[inline]
    fn now(&self) -> u32 {
        embassy_time::Instant::now().as_millis() as u32
    }
}
