// Fixed-capacity periodic task dispatcher
// NOTE: No dynamic allocation, N slots scanned linearly in index order
//
// Tasks are `static Task` items identified by the static's address,
// not by the fn() they wrap: fns with identical bodies may be merged,
// distinct non-zero-sized statics never are.
//
// Mutators may be called from an ISR that interrupts tick(): every slot
// read or write happens whole inside a critical section, so a
// half-written slot is never observed. Callbacks run outside the
// critical section and may register, deregister or reschedule
// (themselves included).

use core::cell::Cell;
use core::fmt;
use core::ptr;

use critical_section::Mutex;
use log::{debug, trace, warn};

use super::timebase::{Timebase, is_due, remaining};

/// A periodic task, declared as a `static`.
///
/// The address of the static is the task's identity, so two tasks
/// wrapping the same `fn()` are still distinct:
///
/// ```
/// use pulp_dispatch::kernel::Task;
///
/// fn blink() {}
/// static LED_A: Task = Task::new(blink);
/// static LED_B: Task = Task::new(blink);
/// assert!(!core::ptr::eq(&LED_A, &LED_B));
/// ```
#[derive(Debug)]
pub struct Task {
    run: fn(),
}

impl Task {
    pub const fn new(run: fn()) -> Self {
        Self { run }
    }

    #[inline]
    pub fn run(&self) {
        (self.run)()
    }
}

/// Handle the table stores and compares.
pub type TaskRef = &'static Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// Every slot is taken and the task is not already registered
    TableFull,
    /// No task given, or the task is not registered
    InvalidTask,
    /// The task already occupies a slot
    DuplicateTask,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::TableFull => write!(f, "task table full"),
            DispatchError::InvalidTask => write!(f, "invalid or unregistered task"),
            DispatchError::DuplicateTask => write!(f, "task already registered"),
        }
    }
}

impl core::error::Error for DispatchError {}

// One table entry; empty iff `task` is None, and then period and
// last_fire are both 0.
#[derive(Debug, Clone, Copy)]
struct Slot {
    task: Option<TaskRef>,
    last_fire: u32,
    period: u32,
}

impl Slot {
    const EMPTY: Self = Self {
        task: None,
        last_fire: 0,
        period: 0,
    };

    #[inline]
    fn holds(&self, task: TaskRef) -> bool {
        matches!(self.task, Some(t) if ptr::eq(t, task))
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.task.is_none()
    }
}

fn position<const N: usize>(slots: &[Cell<Slot>; N], task: TaskRef) -> Option<usize> {
    slots.iter().position(|slot| slot.get().holds(task))
}

/// Cooperative dispatcher for up to `N` periodic tasks.
///
/// `C` supplies the current time in milliseconds. All operations take
/// `&self`, so a dispatcher is normally a `static` shared between the
/// main loop (which calls [`tick`](Self::tick)) and interrupt handlers.
///
/// At most one of `register`/`deregister`/`reschedule` should be in
/// flight at a time; each one does its lookup and its write inside a
/// single critical section.
pub struct Dispatcher<C, const N: usize> {
    clock: C,
    slots: Mutex<[Cell<Slot>; N]>,
}

impl<C, const N: usize> Dispatcher<C, N> {
    /// Creates a dispatcher with every slot empty.
    pub const fn new(clock: C) -> Self {
        Self {
            clock,
            slots: Mutex::new([const { Cell::new(Slot::EMPTY) }; N]),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| {
            self.slots
                .borrow(cs)
                .iter()
                .filter(|slot| !slot.get().is_empty())
                .count()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    pub fn contains(&self, task: TaskRef) -> bool {
        critical_section::with(|cs| position(self.slots.borrow(cs), task).is_some())
    }

    /// Current period of `task`, if registered.
    pub fn period_of(&self, task: TaskRef) -> Option<u32> {
        critical_section::with(|cs| {
            let slots = self.slots.borrow(cs);
            position(slots, task).map(|i| slots[i].get().period)
        })
    }

    /// Removes every task.
    pub fn clear(&self) {
        for index in 0..N {
            critical_section::with(|cs| self.slots.borrow(cs)[index].set(Slot::EMPTY));
        }
        debug!("dispatch: table cleared");
    }
}

impl<C: Timebase, const N: usize> Dispatcher<C, N> {
    /// Adds `task` to the first free slot, due every `period` ms from now.
    ///
    /// `None` is rejected with [`DispatchError::InvalidTask`]. The whole
    /// table is checked for a duplicate before a free slot is used, so a
    /// re-registration is reported as a duplicate even when the table
    /// is full.
    pub fn register(&self, task: Option<TaskRef>, period: u32) -> Result<(), DispatchError> {
        let Some(task) = task else {
            return Err(DispatchError::InvalidTask);
        };

        let result = critical_section::with(|cs| {
            let slots = self.slots.borrow(cs);
            let mut free = None;
            for (index, slot) in slots.iter().enumerate() {
                let slot = slot.get();
                if slot.holds(task) {
                    return Err(DispatchError::DuplicateTask);
                }
                if free.is_none() && slot.is_empty() {
                    free = Some(index);
                }
            }

            let index = free.ok_or(DispatchError::TableFull)?;
            slots[index].set(Slot {
                task: Some(task),
                last_fire: self.clock.now(),
                period,
            });
            Ok(index)
        });

        match result {
            Ok(index) => {
                debug!("dispatch: slot {} registered, every {}ms", index, period);
                Ok(())
            }
            Err(DispatchError::TableFull) => {
                warn!("dispatch: table full ({} slots), task rejected", N);
                Err(DispatchError::TableFull)
            }
            Err(e) => {
                debug!("dispatch: register rejected: {}", e);
                Err(e)
            }
        }
    }

    /// Frees the slot holding `task`.
    pub fn deregister(&self, task: TaskRef) -> Result<(), DispatchError> {
        let index = critical_section::with(|cs| {
            let slots = self.slots.borrow(cs);
            let index = position(slots, task).ok_or(DispatchError::InvalidTask)?;
            slots[index].set(Slot::EMPTY);
            Ok(index)
        })?;

        debug!("dispatch: slot {} freed", index);
        Ok(())
    }

    /// Changes the period of `task` without touching its last fire time.
    ///
    /// Phase is preserved: if more than `period` ms have already passed
    /// since the last fire, the task runs on the next [`tick`](Self::tick).
    pub fn reschedule(&self, task: TaskRef, period: u32) -> Result<(), DispatchError> {
        let index = critical_section::with(|cs| {
            let slots = self.slots.borrow(cs);
            let index = position(slots, task).ok_or(DispatchError::InvalidTask)?;
            let mut slot = slots[index].get();
            slot.period = period;
            slots[index].set(slot);
            Ok(index)
        })?;

        debug!("dispatch: slot {} now every {}ms", index, period);
        Ok(())
    }

    /// One polling pass: fires every due task once, in slot order.
    ///
    /// The clock is read per slot, and `last_fire` is stamped before
    /// the callback runs. A long callback delays the rest of the pass.
    /// Returns how many tasks fired.
    pub fn tick(&self) -> usize {
        let mut fired = 0;

        for index in 0..N {
            let due = critical_section::with(|cs| {
                let cell = &self.slots.borrow(cs)[index];
                let mut slot = cell.get();
                let task = slot.task?;
                let now = self.clock.now();
                if !is_due(now, slot.last_fire, slot.period) {
                    return None;
                }
                slot.last_fire = now;
                cell.set(slot);
                Some((task, now))
            });

            if let Some((task, now)) = due {
                trace!("dispatch: slot {} fired at {}ms", index, now);
                task.run();
                fired += 1;
            }
        }

        fired
    }

    /// Milliseconds until the earliest task is due; `Some(0)` if one is
    /// already due, `None` with an empty table.
    pub fn time_until_next(&self) -> Option<u32> {
        critical_section::with(|cs| {
            let now = self.clock.now();
            self.slots
                .borrow(cs)
                .iter()
                .map(Cell::get)
                .filter(|slot| !slot.is_empty())
                .map(|slot| remaining(now, slot.last_fire, slot.period))
                .min()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::fmt::Write;
    use core::sync::atomic::{AtomicU32, Ordering};

    struct ManualClock(Cell<u32>);

    impl ManualClock {
        fn at(t: u32) -> Self {
            Self(Cell::new(t))
        }

        fn set(&self, t: u32) {
            self.0.set(t);
        }

        fn get(&self) -> u32 {
            self.0.get()
        }
    }

    // fixed buffer for Display checks without std
    struct LineBuf {
        buf: [u8; 64],
        len: usize,
    }

    impl LineBuf {
        fn new() -> Self {
            Self {
                buf: [0; 64],
                len: 0,
            }
        }

        fn as_str(&self) -> &str {
            core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
        }
    }

    impl Write for LineBuf {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            let bytes = s.as_bytes();
            let end = self.len + bytes.len();
            if end > self.buf.len() {
                return Err(fmt::Error);
            }
            self.buf[self.len..end].copy_from_slice(bytes);
            self.len = end;
            Ok(())
        }
    }

    fn noop() {}

    static A: Task = Task::new(noop);
    static B: Task = Task::new(noop);
    static C: Task = Task::new(noop);
    static D: Task = Task::new(noop);

    fn slot_at<T, const N: usize>(d: &Dispatcher<T, N>, index: usize) -> Slot {
        critical_section::with(|cs| d.slots.borrow(cs)[index].get())
    }

    #[test]
    fn new_table_is_empty() {
        let d: Dispatcher<_, 4> = Dispatcher::new(|| 0u32);
        assert_eq!(d.capacity(), 4);
        assert_eq!(d.len(), 0);
        assert!(d.is_empty());
        assert!(!d.is_full());
        assert_eq!(d.time_until_next(), None);
        for i in 0..4 {
            let slot = slot_at(&d, i);
            assert!(slot.is_empty());
            assert_eq!((slot.period, slot.last_fire), (0, 0));
        }
    }

    #[test]
    fn same_fn_different_tasks() {
        let d: Dispatcher<_, 4> = Dispatcher::new(|| 0u32);
        assert_eq!(d.register(Some(&A), 10), Ok(()));
        assert_eq!(d.register(Some(&B), 20), Ok(()));
        assert_eq!(d.len(), 2);
        assert_eq!(d.period_of(&A), Some(10));
        assert_eq!(d.period_of(&B), Some(20));

        assert_eq!(d.deregister(&A), Ok(()));
        assert!(!d.contains(&A));
        assert!(d.contains(&B));
    }

    #[test]
    fn register_fills_first_free_slot() {
        let clock = ManualClock::at(123);
        let d: Dispatcher<_, 3> = Dispatcher::new(|| clock.get());

        assert_eq!(d.register(Some(&A), 10), Ok(()));
        assert_eq!(d.register(Some(&B), 20), Ok(()));
        assert_eq!(d.deregister(&A), Ok(()));

        clock.set(200);
        assert_eq!(d.register(Some(&C), 30), Ok(()));

        let slot = slot_at(&d, 0);
        assert!(slot.holds(&C));
        assert_eq!(slot.period, 30);
        assert_eq!(slot.last_fire, 200);
        assert!(slot_at(&d, 1).holds(&B));
        assert!(slot_at(&d, 2).is_empty());
    }

    #[test]
    fn register_rejects_none() {
        let d: Dispatcher<_, 1> = Dispatcher::new(|| 0u32);
        assert_eq!(d.register(None, 10), Err(DispatchError::InvalidTask));
        d.register(Some(&A), 10).unwrap();
        assert_eq!(d.register(None, 0), Err(DispatchError::InvalidTask));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn duplicate_wins_over_free_slot() {
        let d: Dispatcher<_, 3> = Dispatcher::new(|| 0u32);
        d.register(Some(&A), 10).unwrap();
        d.register(Some(&B), 10).unwrap();
        d.deregister(&A).unwrap();

        // slot 0 is free, but B sits further along
        assert_eq!(d.register(Some(&B), 99), Err(DispatchError::DuplicateTask));
        assert_eq!(d.len(), 1);
        assert_eq!(d.period_of(&B), Some(10));
    }

    #[test]
    fn duplicate_reported_when_full() {
        let d: Dispatcher<_, 2> = Dispatcher::new(|| 0u32);
        d.register(Some(&A), 1).unwrap();
        d.register(Some(&B), 1).unwrap();
        assert!(d.is_full());
        assert_eq!(d.register(Some(&A), 1), Err(DispatchError::DuplicateTask));
        assert_eq!(d.register(Some(&C), 1), Err(DispatchError::TableFull));
    }

    #[test]
    fn deregister_clears_whole_slot() {
        let d: Dispatcher<_, 2> = Dispatcher::new(|| 77u32);
        d.register(Some(&A), 5).unwrap();
        assert_eq!(d.deregister(&A), Ok(()));
        let slot = slot_at(&d, 0);
        assert!(slot.is_empty());
        assert_eq!((slot.period, slot.last_fire), (0, 0));
        assert_eq!(d.deregister(&A), Err(DispatchError::InvalidTask));
        assert_eq!(d.deregister(&D), Err(DispatchError::InvalidTask));
    }

    #[test]
    fn reschedule_keeps_last_fire() {
        let clock = ManualClock::at(1_000);
        let d: Dispatcher<_, 2> = Dispatcher::new(|| clock.get());
        d.register(Some(&A), 100).unwrap();

        clock.set(1_050);
        assert_eq!(d.reschedule(&A, 500), Ok(()));
        let slot = slot_at(&d, 0);
        assert_eq!(slot.period, 500);
        assert_eq!(slot.last_fire, 1_000);
        assert_eq!(d.reschedule(&B, 1), Err(DispatchError::InvalidTask));
    }

    #[test]
    fn tick_stamps_last_fire() {
        static FIRED: AtomicU32 = AtomicU32::new(0);
        fn count() {
            FIRED.fetch_add(1, Ordering::Relaxed);
        }
        static COUNT: Task = Task::new(count);

        let clock = ManualClock::at(0);
        let d: Dispatcher<_, 2> = Dispatcher::new(|| clock.get());
        d.register(Some(&COUNT), 10).unwrap();

        clock.set(13);
        assert_eq!(d.tick(), 1);
        assert_eq!(slot_at(&d, 0).last_fire, 13);
        assert_eq!(FIRED.load(Ordering::Relaxed), 1);

        // next fire is measured from 13, not from 10
        clock.set(22);
        assert_eq!(d.tick(), 0);
        clock.set(23);
        assert_eq!(d.tick(), 1);
        assert_eq!(FIRED.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn zero_period_fires_every_tick() {
        static FIRED: AtomicU32 = AtomicU32::new(0);
        fn count() {
            FIRED.fetch_add(1, Ordering::Relaxed);
        }
        static COUNT: Task = Task::new(count);

        let d: Dispatcher<_, 1> = Dispatcher::new(|| 5u32);
        d.register(Some(&COUNT), 0).unwrap();
        for _ in 0..3 {
            d.tick();
        }
        assert_eq!(FIRED.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn time_until_next_picks_earliest() {
        let clock = ManualClock::at(0);
        let d: Dispatcher<_, 4> = Dispatcher::new(|| clock.get());
        d.register(Some(&A), 100).unwrap();
        d.register(Some(&B), 30).unwrap();

        clock.set(10);
        assert_eq!(d.time_until_next(), Some(20));
        clock.set(45);
        assert_eq!(d.time_until_next(), Some(0));

        d.clear();
        assert_eq!(d.time_until_next(), None);
        assert!(d.is_empty());
    }

    #[test]
    fn error_display() {
        let mut line = LineBuf::new();
        write!(line, "{}", DispatchError::TableFull).unwrap();
        assert_eq!(line.as_str(), "task table full");

        let mut line = LineBuf::new();
        write!(line, "{}", DispatchError::DuplicateTask).unwrap();
        assert_eq!(line.as_str(), "task already registered");
    }
}
