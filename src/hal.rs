//! Hardware abstraction consumed by the scheduler.
//!
//! The embedder supplies interrupt masking, the idle hook and a periodic
//! tick source: a timer interrupt firing at [`TICK_HZ`](crate::TICK_HZ)
//! that calls [`Scheduler::tick`](crate::Scheduler::tick).

/// Platform hooks the kernel relies on.
///
/// Implementations are zero-sized; every hook is an associated function so
/// the scheduler can wrap its own borrows in `critical` without aliasing a
/// HAL value.
pub trait Hal {
    /// One-time platform bring-up (timer, interrupt controller, heap).
    fn init();

    /// Run `f` with interrupts masked.
    ///
    /// Queue state is shared with the tick interrupt handler, so every
    /// mutation outside interrupt context happens inside this bracket. On
    /// hosts with a single execution context a pass-through implementation
    /// is sound.
    fn critical<R>(f: impl FnOnce() -> R) -> R;

    /// Park the CPU until the next interrupt. Called by the dispatcher
    /// whenever no task is runnable.
    fn idle_cpu();
}
