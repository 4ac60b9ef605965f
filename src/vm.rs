//! Interface to the guest bytecode VM.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::vec::Vec;

use crate::error::SysResult;
use crate::mutex::MutexId;
use crate::task::TaskId;

/// One-bit signal from the tick interrupt (or a blocking operation) to the
/// running VM.
///
/// The VM polls it at safe points and returns from [`Vm::run`] once it is
/// seen. Release on store, acquire on load, so the queue state published by
/// the raiser is visible to the task that observes the flag.
#[derive(Debug, Default)]
pub struct PreemptFlag(AtomicBool);

impl PreemptFlag {
    pub const fn new() -> PreemptFlag {
        PreemptFlag(AtomicBool::new(false))
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A kernel service requested by guest bytecode.
///
/// The binding layer inside the VM translates guest calls into these values
/// and the dispatcher applies them on behalf of the calling task. Calls that
/// produce a result have it written back through [`Vm::service_return`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysCall {
    /// Put the calling task to sleep for `ms` milliseconds.
    Sleep { ms: u32 },
    /// Give up the remainder of the current time slice.
    Relinquish,
    /// Change the calling task's base and effective priority.
    SetPriority { priority: u8 },
    /// Suspend `target`, or the calling task when `None`.
    Suspend { target: Option<TaskId> },
    /// Make a suspended task runnable again.
    Resume { target: TaskId },
    /// Create a new task from `bytecode`. The new task's slot index (or a
    /// negative error code) is the result.
    Spawn { bytecode: Vec<u8>, priority: u8 },
    /// Block until `mutex` is held by the calling task.
    MutexLock { mutex: MutexId },
    /// Acquire `mutex` only if it is free. The result is 0 on success.
    MutexTryLock { mutex: MutexId },
    /// Release `mutex`, handing it directly to the best waiter if any.
    MutexUnlock { mutex: MutexId },
}

/// Outcome of one bounded VM step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStep {
    /// A safe point was reached with the preemption flag raised, or the
    /// step's bounded burst of work was used up.
    Yielded,
    /// The guest invoked a kernel service.
    Call(SysCall),
    /// The program ran to completion; the task is done.
    Finished,
}

/// A guest VM instance, one per live task.
///
/// There is no separate close call: the scheduler calls [`Vm::end`] and
/// then drops the instance when its task terminates.
pub trait Vm: Sized {
    /// Obtain a fresh VM instance, or `None` when the VM pool or memory is
    /// exhausted.
    fn open() -> Option<Self>;

    /// Load a bytecode image into this instance.
    fn load(&mut self, bytecode: &[u8]) -> SysResult<()>;

    /// Switch the instance into execution state. Called once, before the
    /// first `run`.
    fn begin(&mut self);

    /// Execute guest code until the preemption flag is observed at a safe
    /// point, the guest requests a service, or the program ends. Runs with
    /// interrupts enabled.
    fn run(&mut self, preempt: &PreemptFlag) -> VmStep;

    /// Tear down execution state. Called once, when the task terminates.
    fn end(&mut self);

    /// Deliver the result of the service call this VM last surfaced.
    fn service_return(&mut self, value: i32);
}
