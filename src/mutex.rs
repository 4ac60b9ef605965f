//! Mutexes with direct ownership handoff.
//!
//! A mutex stores only its owner. Blocked tasks live in the scheduler's
//! waiting queue, so the wakeup order falls out of the queue sort: best
//! priority first, FIFO among equals. On unlock, ownership moves to the
//! chosen waiter before anything else runs, which leaves no window for a
//! fresh lock to steal the mutex.

use crate::hal::Hal;
use crate::task::{TaskId, TaskState, WaitReason};
use crate::vm::Vm;
use crate::{Scheduler, TIMESLICE_TICKS};

/// Handle to a mutex slot in the scheduler's table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MutexId(pub(crate) usize);

impl MutexId {
    /// Raw slot index, for embedders that map handles into guest values.
    pub fn index(self) -> usize {
        self.0
    }
}

/// Mutex control block.
pub(crate) struct Mutex {
    pub locked: bool,
    /// Holder while locked. `locked == owner.is_some()` at rest.
    pub owner: Option<TaskId>,
}

impl<H: Hal, V: Vm> Scheduler<H, V> {
    /// Allocate a new, unlocked mutex.
    pub fn mutex_create(&mut self) -> MutexId {
        self.mutexes.push(Mutex {
            locked: false,
            owner: None,
        });
        MutexId(self.mutexes.len() - 1)
    }

    /// Acquire `mutex` for task `id`, parking the task when it is already
    /// held.
    ///
    /// The call always "succeeds": a contended caller moves to WAITING and
    /// acquisition is signalled by the task simply running again after the
    /// unlock handoff. Locking a mutex the task already holds is a
    /// programmer error and asserts.
    pub fn mutex_lock(&mut self, mutex: MutexId, id: TaskId) {
        if !self.is_live(id) {
            return;
        }

        H::critical(|| {
            let m = &mut self.mutexes[mutex.0];
            if !m.locked {
                m.locked = true;
                m.owner = Some(id);
                return;
            }

            assert!(
                m.owner != Some(id),
                "task {} re-locking mutex {} it already holds",
                id.0,
                mutex.0
            );

            self.queues.remove(&mut self.tasks, id);
            let t = &mut self.tasks[id.0];
            t.state = TaskState::Waiting;
            t.wait = Some(WaitReason::Mutex(mutex));
            self.queues.insert(&mut self.tasks, id);
            self.tasks[id.0].preempt.raise();
        });
    }

    /// Acquire `mutex` for task `id` only if it is free. Never blocks;
    /// returns whether the mutex was acquired.
    pub fn mutex_trylock(&mut self, mutex: MutexId, id: TaskId) -> bool {
        if !self.is_live(id) {
            return false;
        }

        H::critical(|| {
            let m = &mut self.mutexes[mutex.0];
            if m.locked {
                false
            } else {
                m.locked = true;
                m.owner = Some(id);
                true
            }
        })
    }

    /// Release `mutex`, which task `id` must hold.
    ///
    /// If anyone is waiting, the best waiter becomes the owner right here
    /// and turns READY; otherwise the mutex unlocks. Unlocking a mutex the
    /// task does not hold is a programmer error and asserts.
    pub fn mutex_unlock(&mut self, mutex: MutexId, id: TaskId) {
        let woke = H::critical(|| {
            let m = &self.mutexes[mutex.0];
            assert!(
                m.locked && m.owner == Some(id),
                "task {} unlocking mutex {} it does not hold",
                id.0,
                mutex.0
            );

            // First match in the waiting queue is the highest-priority
            // waiter, FIFO among equals.
            let mut waiter = None;
            let mut cur = self.queues.waiting_head();
            while let Some(w) = cur {
                let t = &self.tasks[w.0];
                if t.wait == Some(WaitReason::Mutex(mutex)) {
                    waiter = Some(w);
                    break;
                }
                cur = t.next;
            }

            match waiter {
                Some(w) => {
                    self.mutexes[mutex.0].owner = Some(w);
                    self.queues.remove(&mut self.tasks, w);
                    let t = &mut self.tasks[w.0];
                    t.state = TaskState::Ready;
                    t.wait = None;
                    t.timeslice = TIMESLICE_TICKS;
                    self.queues.insert(&mut self.tasks, w);
                    true
                }
                None => {
                    let m = &mut self.mutexes[mutex.0];
                    m.locked = false;
                    m.owner = None;
                    false
                }
            }
        });

        if woke {
            self.preempt_running();
        }
    }
}

#[cfg(test)]
use crate::sim::{NullHal, Script, ScriptVm};

#[cfg(test)]
type Sched = Scheduler<NullHal, ScriptVm>;

#[cfg(test)]
fn busy_task(s: &mut Sched, priority: u8) -> TaskId {
    s.create_task(Script::new().work(50).bytes(), priority).unwrap()
}

#[test]
fn test_lock_uncontended() {
    let mut s = Sched::new();
    let m = s.mutex_create();
    let o = busy_task(&mut s, 100);

    s.mutex_lock(m, o);

    assert!(s.mutexes[m.0].locked);
    assert_eq!(s.mutexes[m.0].owner, Some(o));
    // The owner did not block.
    assert_eq!(s.task_state(o), Some(TaskState::Ready));
    s.check_invariants();
}

#[test]
fn test_trylock_then_lock_blocks() {
    let mut s = Sched::new();
    let m = s.mutex_create();
    let o = busy_task(&mut s, 100);
    let w = busy_task(&mut s, 100);

    assert!(s.mutex_trylock(m, o));
    assert!(!s.mutex_trylock(m, w));

    s.mutex_lock(m, w);
    assert_eq!(s.task_state(w), Some(TaskState::Waiting));
    assert!(s.tasks[w.0].preempt.is_raised());
    s.check_invariants();
}

#[test]
fn test_unlock_without_waiters_frees() {
    let mut s = Sched::new();
    let m = s.mutex_create();
    let o = busy_task(&mut s, 100);

    s.mutex_lock(m, o);
    s.mutex_unlock(m, o);

    assert!(!s.mutexes[m.0].locked);
    assert_eq!(s.mutexes[m.0].owner, None);
    s.check_invariants();
}

#[test]
fn test_unlock_hands_off_to_highest_priority_waiter() {
    let mut s = Sched::new();
    let m = s.mutex_create();
    let o = busy_task(&mut s, 100);
    let w1 = busy_task(&mut s, 100);
    let w2 = busy_task(&mut s, 50);

    s.mutex_lock(m, o);
    s.mutex_lock(m, w1);
    s.mutex_lock(m, w2);
    s.check_invariants();

    s.mutex_unlock(m, o);

    // W2 outranks W1 even though it queued second.
    assert_eq!(s.mutexes[m.0].owner, Some(w2));
    assert!(s.mutexes[m.0].locked);
    assert_eq!(s.task_state(w2), Some(TaskState::Ready));
    assert_eq!(s.task_state(w1), Some(TaskState::Waiting));
    s.check_invariants();
}

#[test]
fn test_unlock_hands_off_fifo_among_equals() {
    let mut s = Sched::new();
    let m = s.mutex_create();
    let o = busy_task(&mut s, 100);
    let w1 = busy_task(&mut s, 100);
    let w2 = busy_task(&mut s, 100);

    s.mutex_lock(m, o);
    s.mutex_lock(m, w1);
    s.mutex_lock(m, w2);

    s.mutex_unlock(m, o);

    assert_eq!(s.mutexes[m.0].owner, Some(w1));
    assert_eq!(s.task_state(w1), Some(TaskState::Ready));
    assert_eq!(s.task_state(w2), Some(TaskState::Waiting));
    s.check_invariants();
}

#[test]
fn test_handoff_cannot_be_stolen() {
    let mut s = Sched::new();
    let m = s.mutex_create();
    let o = busy_task(&mut s, 100);
    let w = busy_task(&mut s, 100);
    let thief = busy_task(&mut s, 100);

    s.mutex_lock(m, o);
    s.mutex_lock(m, w);
    s.mutex_unlock(m, o);

    // Ownership went straight to the waiter; a new lock cannot slip in
    // between unlock and wakeup.
    assert_eq!(s.mutexes[m.0].owner, Some(w));
    assert!(!s.mutex_trylock(m, thief));

    s.mutex_lock(m, thief);
    assert_eq!(s.task_state(thief), Some(TaskState::Waiting));

    s.mutex_unlock(m, w);
    assert_eq!(s.mutexes[m.0].owner, Some(thief));
    s.check_invariants();
}

#[test]
#[should_panic(expected = "does not hold")]
fn test_unlock_by_non_owner_asserts() {
    let mut s = Sched::new();
    let m = s.mutex_create();
    let o = busy_task(&mut s, 100);
    let other = busy_task(&mut s, 100);

    s.mutex_lock(m, o);
    s.mutex_unlock(m, other);
}

#[test]
#[should_panic(expected = "already holds")]
fn test_relock_by_owner_asserts() {
    let mut s = Sched::new();
    let m = s.mutex_create();
    let o = busy_task(&mut s, 100);

    s.mutex_lock(m, o);
    s.mutex_lock(m, o);
}

#[test]
fn test_trylock_unknown_task_is_refused() {
    let mut s = Sched::new();
    let m = s.mutex_create();

    assert!(!s.mutex_trylock(m, TaskId(42)));
    assert!(!s.mutexes[m.0].locked);
}

#[test]
fn test_guest_mutex_contention_end_to_end() {
    // Whole scenario driven through the service layer: the first guest
    // grabs the mutex and yields, the second blocks on it, the first
    // finishes its work and unlocks, the second takes over.
    let mut s = Sched::new();
    let m = s.mutex_create();

    let owner = s
        .create_task(
            Script::new()
                .trylock(m)
                .relinquish()
                .work(2)
                .unlock(m)
                .halt()
                .bytes(),
            100,
        )
        .unwrap();
    let waiter = s
        .create_task(Script::new().lock(m).unlock(m).halt().bytes(), 100)
        .unwrap();

    s.run_tickless();

    // The waiter's own unlock only passes its owner assertion if the
    // handoff really made it the owner.
    assert!(!s.mutexes[m.0].locked);
    assert_eq!(s.mutexes[m.0].owner, None);
    assert_eq!(s.task_state(owner), Some(TaskState::Dormant));
    assert_eq!(s.task_state(waiter), Some(TaskState::Dormant));
    s.check_invariants();
}
