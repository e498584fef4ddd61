// Global millisecond counter fed by the periodic timer interrupt
//
// The timer ISR calls on_timer_interrupt(); the main loop reads time
// through SystemMillis and consumes the pending flag. TICK_WEIGHT is
// the number of ms one interrupt stands for, so the host can slow the
// timer while idle and the counter still counts milliseconds.
// Counter wraps at u32::MAX; the dispatcher's arithmetic absorbs that.

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use critical_section::Mutex;

use super::timebase::Timebase;

static TIMER_PENDING: AtomicBool = AtomicBool::new(false);

// ms per timer interrupt (1 while active)
static TICK_WEIGHT: AtomicU32 = AtomicU32::new(1);

// cs: riscv32imc has no atomic add
static MILLIS: Mutex<Cell<u32>> = Mutex::new(Cell::new(0));

/// Call from the periodic timer ISR.
#[inline]
pub fn on_timer_interrupt() {
    TIMER_PENDING.store(true, Ordering::Release);
    advance(TICK_WEIGHT.load(Ordering::Relaxed));
}

pub fn set_tick_weight(ms: u32) {
    TICK_WEIGHT.store(ms.max(1), Ordering::Release);
}

pub fn tick_weight() -> u32 {
    TICK_WEIGHT.load(Ordering::Acquire)
}

pub fn advance(ms: u32) {
    critical_section::with(|cs| {
        let millis = MILLIS.borrow(cs);
        millis.set(millis.get().wrapping_add(ms));
    });
}

pub fn millis() -> u32 {
    critical_section::with(|cs| MILLIS.borrow(cs).get())
}

pub fn uptime_secs() -> u32 {
    millis() / 1000
}

#[cfg(test)]
fn reset() {
    critical_section::with(|cs| MILLIS.borrow(cs).set(0));
    TICK_WEIGHT.store(1, Ordering::Release);
    TIMER_PENDING.store(false, Ordering::Release);
}

/// True once per timer interrupt since the last call.
pub fn take_timer_pending() -> bool {
    TIMER_PENDING.swap(false, Ordering::AcqRel)
}

#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "riscv32")]
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack));
    }

    #[cfg(not(target_arch = "riscv32"))]
    {
        core::hint::spin_loop();
    }
}

/// [`Timebase`] over the global counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMillis;

impl Timebase for SystemMillis {
    #[inline]
    fn now(&self) -> u32 {
        millis()
    }
}
