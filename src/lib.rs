//! A small real-time kernel that multiplexes guest bytecode VM tasks over a
//! single hardware thread.
//!
//! Scheduling is priority-preemptive with fixed time slices: the dispatcher
//! always runs the highest-priority READY task, the tick interrupt rotates
//! equal-priority tasks and wakes sleepers, and guest code blocks through
//! service requests surfaced by its VM. The VM, the allocator, the console
//! sink and the hardware layer are all collaborators behind seams; see
//! [`vm::Vm`] and [`hal::Hal`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate log;

pub mod error;
pub mod hal;
mod mutex;
mod queue;
mod scheduler;
mod task;
pub mod vm;

#[cfg(test)]
mod sim;

pub use error::{SysError, SysResult};
pub use hal::Hal;
pub use mutex::MutexId;
pub use scheduler::Scheduler;
pub use task::{TaskId, TaskState};
pub use vm::{PreemptFlag, SysCall, Vm, VmStep};

use static_assertions::const_assert;

/// Ticks a task may run before it is rotated behind its priority group.
pub const TIMESLICE_TICKS: u8 = 10;

/// Frequency of the tick interrupt.
pub const TICK_HZ: u32 = 1_000;

/// Priority given to tasks whose creator does not care. Smaller values are
/// more urgent.
pub const DEFAULT_PRIORITY: u8 = 128;

// Sleep durations are specified in milliseconds, so the tick rate must be a
// whole number of ticks per millisecond.
const_assert!(TICK_HZ % 1_000 == 0);
const_assert!(TIMESLICE_TICKS > 0);

/// Convert a millisecond duration to ticks, rounding to the nearest tick.
pub(crate) fn ms_to_ticks(ms: u32) -> u32 {
    ((u64::from(ms) * u64::from(TICK_HZ) + 500) / 1_000) as u32
}
