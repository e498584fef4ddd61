// pulp-dispatch demo for the ESP32-C3
//
// Boot sequence: logger -> 1ms timer -> register tasks -> main loop
// Main loop: tick dispatcher -> WFI until the next timer interrupt
//
// The timer ISR only advances the global millisecond counter. When the
// next task is far away the timer drops to 10ms and the tick weight
// follows, so the counter stays in milliseconds; it snaps back to 1ms
// as soon as something is close to due.

#![no_std]
#![no_main]

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};

use critical_section::Mutex;
use esp_backtrace as _;
use esp_hal::clock::CpuClock;
use esp_hal::time::Duration;
use esp_hal::timer::PeriodicTimer;
use esp_hal::timer::timg::TimerGroup;
use log::{debug, info, warn};

use pulp_dispatch::kernel::clock::{self, SystemMillis};
use pulp_dispatch::kernel::{DispatchError, Dispatcher, Task};

esp_bootloader_esp_idf::esp_app_desc!();

const MAX_TASKS: usize = 8;

const ACTIVE_TIMER_MS: u64 = 1;
const IDLE_TIMER_MS: u64 = 10;
// slow the timer only when nothing is due for this long
const IDLE_THRESHOLD_MS: u32 = 50;

const HEARTBEAT_MS: u32 = 1000;
const FAST_HEARTBEAT_MS: u32 = 250;
const STATUS_MS: u32 = 5000;
const WARMUP_MS: u32 = 100;
const WARMUP_RUNS: u32 = 20;

static DISPATCH: Dispatcher<SystemMillis, MAX_TASKS> = Dispatcher::new(SystemMillis);

static TIMER0: Mutex<RefCell<Option<PeriodicTimer<'static, esp_hal::Blocking>>>> =
    Mutex::new(RefCell::new(None));

static HEARTBEAT: Task = Task::new(heartbeat);
static STATUS: Task = Task::new(status);
static WARMUP: Task = Task::new(warmup);

static HEARTBEATS: AtomicU32 = AtomicU32::new(0);
static WARMUPS: AtomicU32 = AtomicU32::new(0);

#[esp_hal::handler(priority = esp_hal::interrupt::Priority::Priority1)]
fn timer0_handler() {
    critical_section::with(|cs| {
        if let Some(timer) = TIMER0.borrow_ref_mut(cs).as_mut() {
            timer.clear_interrupt();
        }
    });
    clock::on_timer_interrupt();
}

fn set_timer_period(ms: u64) {
    clock::set_tick_weight(ms as u32);
    critical_section::with(|cs| {
        if let Some(timer) = TIMER0.borrow_ref_mut(cs).as_mut() {
            let _ = timer.start(Duration::from_millis(ms));
        }
    });
}

fn heartbeat() {
    let n = HEARTBEATS.fetch_add(1, Ordering::Relaxed) + 1;
    info!("heartbeat #{} at {}s", n, clock::uptime_secs());
}

fn status() {
    info!(
        "status: {}/{} tasks, up {}ms, {}ms/irq",
        DISPATCH.len(),
        DISPATCH.capacity(),
        clock::millis(),
        clock::tick_weight()
    );
}

// Runs WARMUP_RUNS times, then speeds up the heartbeat and removes itself.
fn warmup() {
    let n = WARMUPS.fetch_add(1, Ordering::Relaxed) + 1;
    if n < WARMUP_RUNS {
        return;
    }
    if let Err(e) = DISPATCH.reschedule(&HEARTBEAT, FAST_HEARTBEAT_MS) {
        warn!("warmup: reschedule heartbeat: {}", e);
    }
    if let Err(e) = DISPATCH.deregister(&WARMUP) {
        warn!("warmup: deregister: {}", e);
    }
    info!("warmup done after {} runs", n);
}

fn register_all() -> Result<(), DispatchError> {
    DISPATCH.register(Some(&HEARTBEAT), HEARTBEAT_MS)?;
    DISPATCH.register(Some(&STATUS), STATUS_MS)?;
    DISPATCH.register(Some(&WARMUP), WARMUP_MS)?;
    Ok(())
}

#[esp_hal::main]
fn main() -> ! {
    esp_println::logger::init_logger_from_env();
    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    info!("booting...");

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let mut timer0 = PeriodicTimer::new(timg0.timer0);
    critical_section::with(|cs| {
        timer0.set_interrupt_handler(timer0_handler);
        timer0.start(Duration::from_millis(ACTIVE_TIMER_MS)).unwrap();
        timer0.listen();
        TIMER0.borrow_ref_mut(cs).replace(timer0);
    });
    info!("timer initialized.");

    if let Err(e) = register_all() {
        warn!("dispatch: {}", e);
    }
    info!("dispatch ready: {} tasks.", DISPATCH.len());

    let mut timer_is_slow = false;

    loop {
        DISPATCH.tick();

        let idle = DISPATCH
            .time_until_next()
            .is_none_or(|ms| ms >= IDLE_THRESHOLD_MS);

        if idle && !timer_is_slow {
            set_timer_period(IDLE_TIMER_MS);
            timer_is_slow = true;
            debug!("timer: {}ms (idle)", IDLE_TIMER_MS);
        } else if !idle && timer_is_slow {
            set_timer_period(ACTIVE_TIMER_MS);
            timer_is_slow = false;
            debug!("timer: {}ms (active)", ACTIVE_TIMER_MS);
        }

        while !clock::take_timer_pending() {
            clock::wait_for_interrupt();
        }
    }
}
