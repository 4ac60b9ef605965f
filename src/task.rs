use crate::mutex::MutexId;
use crate::vm::PreemptFlag;
use crate::TIMESLICE_TICKS;

/// Handle to a task's slot in the scheduler arena.
///
/// Slots are recycled once a task goes dormant, never freed, so a stale
/// handle is always safe to present to the scheduler (the operation becomes
/// a no-op or targets the slot's new occupant, as in any slot scheme).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    /// Raw slot index, for embedders that map handles into guest values.
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// No program bound.
    Dormant,
    /// Runnable, queued behind the running task.
    Ready,
    /// Currently executing. Always the head of the ready queue.
    Running,
    /// Blocked; `wait` says on what.
    Waiting,
    /// Out of scheduling until resumed.
    Suspended,
}

/// What a WAITING task is blocked on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WaitReason {
    /// Timed sleep, over when the global tick reaches `wakeup_tick`.
    Sleep,
    /// In line for a mutex.
    Mutex(MutexId),
}

/// Task control block.
pub(crate) struct Task<V> {
    pub state: TaskState,
    /// Meaningful only while `state` is `Waiting`.
    pub wait: Option<WaitReason>,
    /// Configured base priority. Smaller is more urgent.
    pub priority: u8,
    /// Priority the queues sort by. Mirrors `priority` today; kept separate
    /// so an inheritance scheme can diverge without reshaping the queues.
    pub effective_priority: u8,
    /// Ticks left in the current slice. 0 means the slice expired.
    pub timeslice: u8,
    /// Absolute tick at which a sleeping task becomes ready.
    pub wakeup_tick: u32,
    /// Ticks this task has been charged by the tick handler.
    pub run_ticks: u32,
    /// Bound VM instance. `None` iff the task is dormant.
    pub vm: Option<V>,
    pub preempt: PreemptFlag,
    /// Set when the task terminated, making its slot recyclable. A TCB
    /// created dormant on purpose keeps its slot until activated.
    pub retired: bool,
    /// Intrusive link for whichever queue currently holds the task.
    pub next: Option<TaskId>,
}

impl<V> Task<V> {
    pub fn dormant(priority: u8) -> Task<V> {
        Task {
            state: TaskState::Dormant,
            wait: None,
            priority,
            effective_priority: priority,
            timeslice: TIMESLICE_TICKS,
            wakeup_tick: 0,
            run_ticks: 0,
            vm: None,
            preempt: PreemptFlag::new(),
            retired: false,
            next: None,
        }
    }
}
