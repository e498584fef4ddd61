// Cooperative periodic dispatch and its millisecond timebase
// Single core, no preemption. The main loop calls Dispatcher::tick();
// interrupt handlers may add, drop or retime tasks in between.
//
// clock: ISR-fed global millisecond counter and WFI idle helper.

pub mod clock;
pub mod dispatch;
pub mod timebase;

pub use clock::SystemMillis;
pub use dispatch::{DispatchError, Dispatcher, Task, TaskRef};
pub use timebase::Timebase;
#[cfg(feature = "embassy")]
pub use timebase::EmbassyMillis;
