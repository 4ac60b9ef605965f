//! The four scheduling queues.
//!
//! Each queue is a singly-linked list threaded through [`Task::next`],
//! sorted ascending by effective priority and FIFO within a priority. The
//! target queue of an operation is selected purely from the task's state;
//! callers flip `state` between `remove` and `insert` when moving a task.
//!
//! The queue operations themselves never mask interrupts. Callers running
//! in task context hold the [`Hal::critical`](crate::hal::Hal::critical)
//! bracket around them because the tick handler walks the same lists.

use crate::task::{Task, TaskId, TaskState};

/// Heads of the state-keyed queues.
///
/// READY and RUNNING share one queue: the running task is its head.
pub(crate) struct QueueSet {
    dormant: Option<TaskId>,
    ready: Option<TaskId>,
    waiting: Option<TaskId>,
    suspended: Option<TaskId>,
}

impl QueueSet {
    pub const fn new() -> QueueSet {
        QueueSet {
            dormant: None,
            ready: None,
            waiting: None,
            suspended: None,
        }
    }

    pub fn dormant_head(&self) -> Option<TaskId> {
        self.dormant
    }

    pub fn ready_head(&self) -> Option<TaskId> {
        self.ready
    }

    pub fn waiting_head(&self) -> Option<TaskId> {
        self.waiting
    }

    pub fn suspended_head(&self) -> Option<TaskId> {
        self.suspended
    }

    fn head_mut(&mut self, state: TaskState) -> &mut Option<TaskId> {
        match state {
            TaskState::Dormant => &mut self.dormant,
            TaskState::Ready | TaskState::Running => &mut self.ready,
            TaskState::Waiting => &mut self.waiting,
            TaskState::Suspended => &mut self.suspended,
        }
    }

    /// Insert `id` into the queue selected by its state, before the first
    /// entry with a strictly larger effective priority. Equal-priority
    /// entries already queued stay in front, which keeps the order FIFO
    /// within a priority.
    pub fn insert<V>(&mut self, tasks: &mut [Task<V>], id: TaskId) {
        debug_assert!(tasks[id.0].next.is_none(), "task {} is already queued", id.0);

        let prio = tasks[id.0].effective_priority;
        let state = tasks[id.0].state;
        let head = self.head_mut(state);

        match *head {
            Some(h) if tasks[h.0].effective_priority <= prio => {
                // Walk to the last entry that does not sort after `id`.
                let mut at = h;
                while let Some(n) = tasks[at.0].next {
                    if tasks[n.0].effective_priority > prio {
                        break;
                    }
                    at = n;
                }
                tasks[id.0].next = tasks[at.0].next;
                tasks[at.0].next = Some(id);
            }
            other => {
                tasks[id.0].next = other;
                *head = Some(id);
            }
        }
    }

    /// Unlink `id` from the queue selected by its state. A task that is not
    /// on that queue is left untouched.
    pub fn remove<V>(&mut self, tasks: &mut [Task<V>], id: TaskId) {
        let state = tasks[id.0].state;
        let head = self.head_mut(state);

        let mut at = match *head {
            Some(h) if h == id => {
                *head = tasks[id.0].next.take();
                return;
            }
            Some(h) => h,
            None => return,
        };

        while let Some(n) = tasks[at.0].next {
            if n == id {
                tasks[at.0].next = tasks[id.0].next.take();
                return;
            }
            at = n;
        }
    }

    /// Queue contents front to back, for tests.
    #[cfg(test)]
    pub fn snapshot<V>(&self, tasks: &[Task<V>], state: TaskState) -> alloc::vec::Vec<TaskId> {
        let mut head = match state {
            TaskState::Dormant => self.dormant,
            TaskState::Ready | TaskState::Running => self.ready,
            TaskState::Waiting => self.waiting,
            TaskState::Suspended => self.suspended,
        };

        let mut out = alloc::vec::Vec::new();
        while let Some(id) = head {
            out.push(id);
            head = tasks[id.0].next;
        }
        out
    }
}

#[cfg(test)]
fn arena(prios: &[u8]) -> alloc::vec::Vec<Task<()>> {
    prios
        .iter()
        .map(|&p| {
            let mut t = Task::dormant(p);
            t.state = TaskState::Ready;
            t
        })
        .collect()
}

#[cfg(test)]
fn ids(v: &[usize]) -> alloc::vec::Vec<TaskId> {
    v.iter().map(|&i| TaskId(i)).collect()
}

#[test]
fn test_insert_sorted() {
    let mut tasks = arena(&[100, 50, 150, 100]);
    let mut q = QueueSet::new();

    for i in 0..4 {
        q.insert(&mut tasks, TaskId(i));
    }

    // Ascending priority, and task 0 (inserted first) ahead of its equal 3.
    assert_eq!(q.snapshot(&tasks, TaskState::Ready), ids(&[1, 0, 3, 2]));
}

#[test]
fn test_insert_fifo_within_priority() {
    let mut tasks = arena(&[7, 7, 7, 7]);
    let mut q = QueueSet::new();

    for i in [2, 0, 3, 1] {
        q.insert(&mut tasks, TaskId(i));
    }

    assert_eq!(q.snapshot(&tasks, TaskState::Ready), ids(&[2, 0, 3, 1]));
}

#[test]
fn test_remove_positions() {
    let t = &[
        // (remove, expected remainder)
        (0, [1usize, 2, 3]),
        (1, [0, 2, 3]),
        (2, [0, 1, 3]),
        (3, [0, 1, 2]),
    ];

    for &(victim, ref rest) in t {
        let mut tasks = arena(&[10, 20, 30, 40]);
        let mut q = QueueSet::new();
        for i in 0..4 {
            q.insert(&mut tasks, TaskId(i));
        }

        q.remove(&mut tasks, TaskId(victim));

        assert_eq!(q.snapshot(&tasks, TaskState::Ready), ids(rest));
        assert!(tasks[victim].next.is_none());
    }
}

#[test]
fn test_remove_absent_is_noop() {
    let mut tasks = arena(&[10, 20]);
    let mut q = QueueSet::new();
    q.insert(&mut tasks, TaskId(0));

    // Task 1 was never inserted; removing it twice changes nothing.
    q.remove(&mut tasks, TaskId(1));
    q.remove(&mut tasks, TaskId(1));

    assert_eq!(q.snapshot(&tasks, TaskState::Ready), ids(&[0]));
}

#[test]
fn test_state_selects_queue() {
    let mut tasks = arena(&[10, 10]);
    tasks[1].state = TaskState::Waiting;

    let mut q = QueueSet::new();
    q.insert(&mut tasks, TaskId(0));
    q.insert(&mut tasks, TaskId(1));

    assert_eq!(q.ready_head(), Some(TaskId(0)));
    assert_eq!(q.waiting_head(), Some(TaskId(1)));

    // Moving a task between queues: remove under the old state, insert
    // under the new one.
    q.remove(&mut tasks, TaskId(1));
    tasks[1].state = TaskState::Ready;
    q.insert(&mut tasks, TaskId(1));

    assert_eq!(q.snapshot(&tasks, TaskState::Ready), ids(&[0, 1]));
    assert_eq!(q.waiting_head(), None);
}

#[test]
fn test_running_shares_ready_queue() {
    let mut tasks = arena(&[10, 20]);
    tasks[0].state = TaskState::Running;

    let mut q = QueueSet::new();
    q.insert(&mut tasks, TaskId(0));
    q.insert(&mut tasks, TaskId(1));

    assert_eq!(q.ready_head(), Some(TaskId(0)));
    assert_eq!(q.snapshot(&tasks, TaskState::Ready), ids(&[0, 1]));
}
