//! Task scheduling core: the TCB arena, the tick handler, the dispatcher
//! and the blocking operations.

use core::marker::PhantomData;

use alloc::vec::Vec;

use crate::error::{SysError, SysResult};
use crate::hal::Hal;
use crate::mutex::Mutex;
use crate::queue::QueueSet;
use crate::task::{Task, TaskId, TaskState, WaitReason};
use crate::vm::{SysCall, Vm, VmStep};
use crate::{ms_to_ticks, TIMESLICE_TICKS};

/// What a single dispatcher iteration did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Dispatch {
    /// A task's VM advanced by one step.
    Ran,
    /// Nothing is runnable, but blocked or suspended tasks remain.
    Idle,
    /// Every queue except the dormant one is empty.
    Drained,
}

pub struct Scheduler<H: Hal, V: Vm> {
    pub(crate) tasks: Vec<Task<V>>,
    pub(crate) queues: QueueSet,
    pub(crate) mutexes: Vec<Mutex>,
    /// Global tick counter. Wraps; all comparisons are signed differences.
    pub(crate) ticks: u32,
    _hal: PhantomData<H>,
}

impl<H: Hal, V: Vm> Scheduler<H, V> {
    /// Create a scheduler and bring the platform up through [`Hal::init`].
    pub fn new() -> Scheduler<H, V> {
        H::init();

        Scheduler {
            tasks: Vec::new(),
            queues: QueueSet::new(),
            mutexes: Vec::new(),
            ticks: 0,
            _hal: PhantomData,
        }
    }

    /// Current value of the global tick counter.
    pub fn tick_count(&self) -> u32 {
        self.ticks
    }

    /// State of `id`, if the slot exists.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.tasks.get(id.0).map(|t| t.state)
    }

    /// A task the blocking operations may act on: a known slot with a
    /// program bound. Everything else is silently ignored.
    pub(crate) fn is_live(&self, id: TaskId) -> bool {
        matches!(self.task_state(id), Some(s) if s != TaskState::Dormant)
    }

    // --- Task lifecycle

    /// Grab a free slot, recycling the first retired one. The returned slot
    /// is dormant and on no queue.
    fn alloc_slot(&mut self, priority: u8) -> TaskId {
        let retired = self
            .tasks
            .iter()
            .position(|t| t.state == TaskState::Dormant && t.retired);

        match retired {
            Some(i) => {
                let id = TaskId(i);
                H::critical(|| self.queues.remove(&mut self.tasks, id));
                self.tasks[i] = Task::dormant(priority);
                id
            }
            None => {
                self.tasks.push(Task::dormant(priority));
                TaskId(self.tasks.len() - 1)
            }
        }
    }

    fn open_vm(bytecode: &[u8]) -> SysResult<V> {
        let mut vm = V::open().ok_or(SysError::NoMem)?;

        if let Err(e) = vm.load(bytecode) {
            error!("bytecode rejected by the VM loader: {:?}", e);
            return Err(e);
        }

        vm.begin();
        Ok(vm)
    }

    /// Create a task from a bytecode image and make it READY.
    ///
    /// `NoMem` when no VM instance can be opened; load failures are logged
    /// and propagated. Nothing is queued on failure.
    pub fn create_task(&mut self, bytecode: &[u8], priority: u8) -> SysResult<TaskId> {
        let vm = Self::open_vm(bytecode)?;
        let id = self.alloc_slot(priority);

        let t = &mut self.tasks[id.0];
        t.state = TaskState::Ready;
        t.vm = Some(vm);
        H::critical(|| self.queues.insert(&mut self.tasks, id));

        info!("task {} spawned (priority {})", id.0, priority);
        Ok(id)
    }

    /// Create a TCB with no program bound. It sits in the dormant queue
    /// until [`Scheduler::activate_task`] gives it one.
    pub fn create_dormant_task(&mut self, priority: u8) -> TaskId {
        let id = self.alloc_slot(priority);
        H::critical(|| self.queues.insert(&mut self.tasks, id));
        id
    }

    /// Bind a program to a dormant TCB and make it READY.
    pub fn activate_task(&mut self, id: TaskId, bytecode: &[u8]) -> SysResult<()> {
        if self.task_state(id) != Some(TaskState::Dormant) {
            return Err(SysError::NoTask);
        }

        let vm = Self::open_vm(bytecode)?;
        H::critical(|| {
            self.queues.remove(&mut self.tasks, id);
            let t = &mut self.tasks[id.0];
            t.state = TaskState::Ready;
            t.timeslice = TIMESLICE_TICKS;
            t.vm = Some(vm);
            self.queues.insert(&mut self.tasks, id);
        });

        info!("task {} activated", id.0);
        Ok(())
    }

    /// Move a finished task to DORMANT and tear its VM down.
    fn retire(&mut self, id: TaskId) {
        H::critical(|| {
            self.queues.remove(&mut self.tasks, id);
            let t = &mut self.tasks[id.0];
            t.state = TaskState::Dormant;
            t.wait = None;
            t.retired = true;
            self.queues.insert(&mut self.tasks, id);
        });

        if let Some(mut vm) = self.tasks[id.0].vm.take() {
            vm.end();
        }

        info!("task {} finished", id.0);
    }

    // --- Tick handling

    /// The tick interrupt handler. Called from the HAL timer interrupt at
    /// [`TICK_HZ`](crate::TICK_HZ); the interrupt context itself is the
    /// critical section.
    pub fn tick(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);
        self.charge_running_slice();
        self.wake_sleepers();
    }

    /// Charge the running task one tick and flag it for preemption when its
    /// slice runs out.
    fn charge_running_slice(&mut self) {
        let h = match self.queues.ready_head() {
            Some(h) => h,
            None => return,
        };

        let t = &mut self.tasks[h.0];
        if t.state != TaskState::Running {
            return;
        }

        t.run_ticks = t.run_ticks.wrapping_add(1);
        if t.timeslice > 0 {
            t.timeslice -= 1;
            if t.timeslice == 0 {
                t.preempt.raise();
            }
        }
    }

    /// Wake every sleeper that is due. The signed-difference comparison
    /// wakes overdue tasks as well, so a late tick (or a wrapped counter)
    /// cannot strand a sleeper.
    fn wake_sleepers(&mut self) {
        let mut woke = false;

        let mut cur = self.queues.waiting_head();
        while let Some(id) = cur {
            // The link is rewritten on removal; read it first.
            cur = self.tasks[id.0].next;

            let t = &self.tasks[id.0];
            if t.wait != Some(WaitReason::Sleep) {
                continue;
            }
            if (self.ticks.wrapping_sub(t.wakeup_tick) as i32) < 0 {
                continue;
            }

            self.queues.remove(&mut self.tasks, id);
            let t = &mut self.tasks[id.0];
            t.state = TaskState::Ready;
            t.wait = None;
            t.timeslice = TIMESLICE_TICKS;
            self.queues.insert(&mut self.tasks, id);

            debug!("task {} woke at tick {}", id.0, self.ticks);
            woke = true;
        }

        // A wakeup may outrank the running task; bounce it back to the
        // dispatcher so it can re-select.
        if woke {
            self.preempt_running();
        }
    }

    /// Raise the preemption flag on the running task, if there is one.
    pub(crate) fn preempt_running(&self) {
        let mut cur = self.queues.ready_head();
        while let Some(id) = cur {
            let t = &self.tasks[id.0];
            if t.state == TaskState::Running {
                t.preempt.raise();
            }
            cur = t.next;
        }
    }

    // --- Dispatcher

    /// Dispatcher entry point for timer builds. Runs tasks until every
    /// queue apart from the dormant one is empty; ticks arrive from the HAL
    /// timer interrupt calling [`Scheduler::tick`].
    pub fn run(&mut self) {
        loop {
            match self.dispatch(false) {
                Dispatch::Ran => (),
                Dispatch::Idle => H::idle_cpu(),
                Dispatch::Drained => break,
            }
        }

        debug!("all task queues drained");
    }

    /// Dispatcher for builds without a hardware timer. Each dispatched VM
    /// step is accounted as one software tick, and time also advances while
    /// idling, so slice rotation and sleep wakeups behave as in the timer
    /// build.
    pub fn run_tickless(&mut self) {
        loop {
            match self.dispatch(true) {
                Dispatch::Ran => (),
                Dispatch::Idle => {
                    self.ticks = self.ticks.wrapping_add(1);
                    self.wake_sleepers();
                    H::idle_cpu();
                }
                Dispatch::Drained => break,
            }
        }
    }

    /// One dispatcher iteration: pick the ready-queue head, step its VM,
    /// react to the outcome. With `software_tick`, the iteration also plays
    /// the role of the tick interrupt for the duration of the step.
    fn dispatch(&mut self, software_tick: bool) -> Dispatch {
        let cur = match self.queues.ready_head() {
            Some(id) => id,
            None if self.has_live_tasks() => return Dispatch::Idle,
            None => return Dispatch::Drained,
        };

        H::critical(|| {
            let t = &mut self.tasks[cur.0];
            t.state = TaskState::Running;
            t.preempt.clear();
        });

        // The step itself runs with interrupts enabled; the tick handler
        // may poke the queues and this task's preemption flag meanwhile.
        let t = &mut self.tasks[cur.0];
        let step = match t.vm.as_mut() {
            Some(vm) => vm.run(&t.preempt),
            None => panic!("task {} is queued runnable without a VM", cur.0),
        };

        if software_tick && step != VmStep::Finished {
            // The software tick lands while the task counts as running.
            let t = &mut self.tasks[cur.0];
            t.run_ticks = t.run_ticks.wrapping_add(1);
            if t.timeslice > 0 {
                t.timeslice -= 1;
            }
        }

        match step {
            VmStep::Finished => {
                self.retire(cur);
                if !self.has_live_tasks() {
                    return Dispatch::Drained;
                }
            }
            VmStep::Call(call) => {
                self.service(cur, call);
                self.reschedule_current(cur);
            }
            VmStep::Yielded => {
                self.reschedule_current(cur);
            }
        }

        if software_tick {
            self.ticks = self.ticks.wrapping_add(1);
            self.wake_sleepers();
        }

        Dispatch::Ran
    }

    /// Runnable, blocked or suspended tasks still exist somewhere.
    fn has_live_tasks(&self) -> bool {
        self.queues.ready_head().is_some()
            || self.queues.waiting_head().is_some()
            || self.queues.suspended_head().is_some()
    }

    /// Post-step bookkeeping for a task that is still RUNNING: back to
    /// READY, rotating behind its priority group when the slice is spent.
    fn reschedule_current(&mut self, cur: TaskId) {
        if self.tasks[cur.0].state != TaskState::Running {
            // A blocking operation already moved the task; the queues are
            // current.
            return;
        }

        H::critical(|| {
            let t = &mut self.tasks[cur.0];
            t.state = TaskState::Ready;

            if t.timeslice == 0 {
                t.timeslice = TIMESLICE_TICKS;
                self.queues.remove(&mut self.tasks, cur);
                self.queues.insert(&mut self.tasks, cur);
            }
            // With slice left the task keeps the head position and is
            // re-picked next, unless a higher-priority task arrived.
        });
    }

    /// Apply a guest service request on behalf of the calling task.
    fn service(&mut self, cur: TaskId, call: SysCall) {
        match call {
            SysCall::Sleep { ms } => self.sleep_ms(cur, ms),
            SysCall::Relinquish => self.relinquish(cur),
            SysCall::SetPriority { priority } => self.change_priority(cur, priority),
            SysCall::Suspend { target } => self.suspend_task(target.unwrap_or(cur)),
            SysCall::Resume { target } => self.resume_task(target),
            SysCall::Spawn { bytecode, priority } => {
                let ret = match self.create_task(&bytecode, priority) {
                    Ok(id) => id.0 as i32,
                    Err(e) => -(e as i32),
                };
                self.service_reply(cur, ret);
            }
            SysCall::MutexLock { mutex } => self.mutex_lock(mutex, cur),
            SysCall::MutexTryLock { mutex } => {
                let ret = if self.mutex_trylock(mutex, cur) {
                    0
                } else {
                    SysError::Busy as i32
                };
                self.service_reply(cur, ret);
            }
            SysCall::MutexUnlock { mutex } => self.mutex_unlock(mutex, cur),
        }
    }

    fn service_reply(&mut self, id: TaskId, value: i32) {
        if let Some(vm) = self.tasks[id.0].vm.as_mut() {
            vm.service_return(value);
        }
    }

    // --- Blocking operations
    //
    // Callable by guest code through the service layer and directly by the
    // embedder. A handle that does not name a live task is ignored.

    /// Put `id` to sleep for `ms` milliseconds. It becomes READY again on
    /// the tick that reaches the deadline.
    pub fn sleep_ms(&mut self, id: TaskId, ms: u32) {
        if !self.is_live(id) {
            return;
        }

        let wakeup = self.ticks.wrapping_add(ms_to_ticks(ms));

        H::critical(|| {
            self.queues.remove(&mut self.tasks, id);
            let t = &mut self.tasks[id.0];
            t.state = TaskState::Waiting;
            t.wait = Some(WaitReason::Sleep);
            t.wakeup_tick = wakeup;
            self.queues.insert(&mut self.tasks, id);
            self.tasks[id.0].preempt.raise();
        });
    }

    /// Give up the rest of `id`'s time slice. The dispatcher rotates it
    /// behind its priority group on the next reschedule.
    pub fn relinquish(&mut self, id: TaskId) {
        if !self.is_live(id) {
            return;
        }

        let t = &mut self.tasks[id.0];
        t.timeslice = 0;
        t.preempt.raise();
    }

    /// Change `id`'s base and effective priority, re-sorting its queue at
    /// the moment of the change so the sort invariant never waits on the
    /// next reschedule.
    pub fn change_priority(&mut self, id: TaskId, priority: u8) {
        if !self.is_live(id) {
            return;
        }

        H::critical(|| {
            self.queues.remove(&mut self.tasks, id);
            let t = &mut self.tasks[id.0];
            if t.state == TaskState::Running {
                // Re-sorting can move the task off the ready-queue head, so
                // it stops being the running task right here.
                t.state = TaskState::Ready;
            }
            t.priority = priority;
            t.effective_priority = priority;
            t.timeslice = 0;
            self.queues.insert(&mut self.tasks, id);
            self.tasks[id.0].preempt.raise();
        });
    }

    /// Take `id` out of scheduling until [`Scheduler::resume_task`]. A
    /// waiting task abandons its sleep deadline or its place in a mutex
    /// line.
    pub fn suspend_task(&mut self, id: TaskId) {
        if !self.is_live(id) {
            return;
        }

        H::critical(|| {
            self.queues.remove(&mut self.tasks, id);
            let t = &mut self.tasks[id.0];
            t.state = TaskState::Suspended;
            t.wait = None;
            self.queues.insert(&mut self.tasks, id);
            self.tasks[id.0].preempt.raise();
        });
    }

    /// Put a suspended task back in the ready queue with a fresh slice. The
    /// running task is flagged so a higher-priority arrival preempts it.
    pub fn resume_task(&mut self, id: TaskId) {
        if self.task_state(id) != Some(TaskState::Suspended) {
            return;
        }

        H::critical(|| {
            self.queues.remove(&mut self.tasks, id);
            let t = &mut self.tasks[id.0];
            t.state = TaskState::Ready;
            t.timeslice = TIMESLICE_TICKS;
            self.queues.insert(&mut self.tasks, id);
        });

        self.preempt_running();
    }

    // --- Introspection

    /// Log the contents of all four queues. Debug aid only.
    pub fn dump_queues(&self) {
        self.dump_queue("ready", self.queues.ready_head());
        self.dump_queue("waiting", self.queues.waiting_head());
        self.dump_queue("suspended", self.queues.suspended_head());
        self.dump_queue("dormant", self.queues.dormant_head());
    }

    fn dump_queue(&self, name: &str, head: Option<TaskId>) {
        debug!("{} queue:", name);

        let mut cur = head;
        while let Some(id) = cur {
            let t = &self.tasks[id.0];
            debug!(
                "  task {}: {:?} prio {} slice {} cpu {} ticks",
                id.0, t.state, t.effective_priority, t.timeslice, t.run_ticks
            );
            cur = t.next;
        }
    }
}

#[cfg(test)]
impl<H: Hal, V: Vm> Scheduler<H, V> {
    /// Structural invariants that must hold between operations: queues
    /// sorted, every TCB on exactly one queue, at most one RUNNING task and
    /// only at the ready head, mutex owner bookkeeping consistent.
    pub(crate) fn check_invariants(&self) {
        let mut seen = alloc::vec![0u32; self.tasks.len()];

        let queues = [
            (self.queues.dormant_head(), &[TaskState::Dormant][..]),
            (
                self.queues.ready_head(),
                &[TaskState::Ready, TaskState::Running][..],
            ),
            (self.queues.waiting_head(), &[TaskState::Waiting][..]),
            (self.queues.suspended_head(), &[TaskState::Suspended][..]),
        ];

        for (head, states) in queues {
            let mut cur = head;
            let mut last_prio = 0;
            while let Some(id) = cur {
                let t = &self.tasks[id.0];
                seen[id.0] += 1;
                assert!(
                    states.contains(&t.state),
                    "task {} in the wrong queue for {:?}",
                    id.0,
                    t.state
                );
                assert!(
                    t.effective_priority >= last_prio,
                    "queue not sorted at task {}",
                    id.0
                );
                last_prio = t.effective_priority;
                cur = t.next;
            }
        }

        for (i, n) in seen.iter().enumerate() {
            assert_eq!(*n, 1, "task {} is on {} queues", i, n);
        }

        let running: Vec<TaskId> = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state == TaskState::Running)
            .map(|(i, _)| TaskId(i))
            .collect();
        assert!(running.len() <= 1, "more than one RUNNING task");
        if let Some(&r) = running.first() {
            assert_eq!(self.queues.ready_head(), Some(r));
        }

        for (i, t) in self.tasks.iter().enumerate() {
            assert_eq!(
                t.state == TaskState::Dormant,
                t.vm.is_none(),
                "task {} VM binding disagrees with its state",
                i
            );
            if let Some(WaitReason::Mutex(m)) = t.wait {
                assert_eq!(t.state, TaskState::Waiting);
                assert_ne!(
                    self.mutexes[m.0].owner,
                    Some(TaskId(i)),
                    "task {} waits on a mutex it owns",
                    i
                );
            }
        }

        for (i, m) in self.mutexes.iter().enumerate() {
            assert_eq!(
                m.locked,
                m.owner.is_some(),
                "mutex {} owner and locked flag disagree",
                i
            );
        }
    }
}

#[cfg(test)]
use crate::sim::{NullHal, Script, ScriptVm};

#[cfg(test)]
type Sched = Scheduler<NullHal, ScriptVm>;

#[cfg(test)]
fn ready_snapshot(s: &Sched) -> Vec<TaskId> {
    s.queues.snapshot(&s.tasks, TaskState::Ready)
}

#[test]
fn test_create_task_queues_by_priority() {
    let mut s = Sched::new();

    let lo = s.create_task(Script::new().work(5).bytes(), 200).unwrap();
    let hi = s.create_task(Script::new().work(5).bytes(), 50).unwrap();
    let mid = s.create_task(Script::new().work(5).bytes(), 100).unwrap();

    assert_eq!(ready_snapshot(&s), alloc::vec![hi, mid, lo]);
    assert_eq!(s.task_state(hi), Some(TaskState::Ready));
    s.check_invariants();
    s.dump_queues();
}

#[test]
fn test_create_task_rejects_bad_bytecode() {
    let mut s = Sched::new();

    assert_eq!(s.create_task(&[0xff], 100), Err(SysError::BadImage));
    assert!(ready_snapshot(&s).is_empty());
    assert!(s.tasks.is_empty());
}

#[test]
fn test_round_robin_within_priority() {
    let mut s = Sched::new();

    let a = s.create_task(Script::new().work(200).bytes(), 100).unwrap();
    let b = s.create_task(Script::new().work(200).bytes(), 100).unwrap();
    let c = s.create_task(Script::new().work(200).bytes(), 100).unwrap();

    let mut heads = Vec::new();
    for _ in 0..60 {
        heads.push(s.queues.ready_head().unwrap());
        assert_eq!(s.dispatch(true), Dispatch::Ran);
        s.check_invariants();
    }

    // One full slice each, then the head rotates: A B C A B C.
    let slice = usize::from(TIMESLICE_TICKS);
    for (i, &h) in heads.iter().enumerate() {
        let expect = [a, b, c][(i / slice) % 3];
        assert_eq!(h, expect, "dispatch {} ran the wrong task", i);
    }
}

#[test]
fn test_priority_preemption_on_resume() {
    let mut s = Sched::new();

    let hi = s
        .create_task(Script::new().suspend_self().work(5).bytes(), 50)
        .unwrap();
    let lo = s.create_task(Script::new().work(50).bytes(), 200).unwrap();

    // First dispatch runs the high-priority task, which suspends itself.
    assert_eq!(s.dispatch(true), Dispatch::Ran);
    assert_eq!(s.task_state(hi), Some(TaskState::Suspended));

    // The low-priority task now owns the CPU.
    assert_eq!(s.queues.ready_head(), Some(lo));
    assert_eq!(s.dispatch(true), Dispatch::Ran);

    // Resuming the high-priority task makes it the next pick.
    s.resume_task(hi);
    s.check_invariants();
    assert_eq!(s.queues.ready_head(), Some(hi));
    assert_eq!(s.task_state(lo), Some(TaskState::Ready));
}

#[test]
fn test_sleep_wakeup_at_deadline() {
    let mut s = Sched::new();

    let t = s
        .create_task(Script::new().sleep(5).work(1).bytes(), 100)
        .unwrap();

    // The task runs, asks to sleep and is parked.
    assert_eq!(s.dispatch(false), Dispatch::Ran);
    assert_eq!(s.task_state(t), Some(TaskState::Waiting));

    for tick in 1..5 {
        s.tick();
        assert_eq!(
            s.task_state(t),
            Some(TaskState::Waiting),
            "woke early at tick {}",
            tick
        );
    }

    s.tick();
    assert_eq!(s.task_state(t), Some(TaskState::Ready));
    assert_eq!(s.tasks[t.0].timeslice, TIMESLICE_TICKS);
    s.check_invariants();
}

#[test]
fn test_terminate_drains_run() {
    let mut s = Sched::new();

    let t = s.create_task(Script::new().halt().bytes(), 100).unwrap();

    // Returns once the only task finishes; its VM is torn down.
    s.run();

    assert_eq!(s.task_state(t), Some(TaskState::Dormant));
    assert!(s.tasks[t.0].vm.is_none());
    assert!(s.tasks[t.0].retired);
    s.check_invariants();
}

#[test]
fn test_sleep_duration_tickless() {
    let mut s = Sched::new();

    let t = s
        .create_task(Script::new().sleep(3).work(1).halt().bytes(), 100)
        .unwrap();

    s.run_tickless();

    // Not scheduled before the deadline: the whole program only completes
    // once at least 3 ticks have elapsed.
    assert!(s.tick_count() >= 3, "woke after {} ticks", s.tick_count());
    assert_eq!(s.task_state(t), Some(TaskState::Dormant));
}

#[test]
fn test_relinquish_rotates_within_priority() {
    let mut s = Sched::new();

    let a = s
        .create_task(Script::new().relinquish().work(5).bytes(), 100)
        .unwrap();
    let b = s.create_task(Script::new().work(5).bytes(), 100).unwrap();

    // A's first step gives up its slice, so B takes over immediately even
    // though A's slice was barely touched.
    assert_eq!(s.dispatch(true), Dispatch::Ran);
    assert_eq!(ready_snapshot(&s), alloc::vec![b, a]);
    assert_eq!(s.tasks[a.0].timeslice, TIMESLICE_TICKS);
    s.check_invariants();
}

#[test]
fn test_change_priority_resorts_immediately() {
    let mut s = Sched::new();

    let a = s.create_task(Script::new().work(5).bytes(), 100).unwrap();
    let b = s.create_task(Script::new().work(5).bytes(), 120).unwrap();

    s.change_priority(b, 50);

    // No dispatch needed: the queue is re-sorted at the change.
    assert_eq!(ready_snapshot(&s), alloc::vec![b, a]);
    assert_eq!(s.tasks[b.0].priority, 50);
    assert_eq!(s.tasks[b.0].effective_priority, 50);
    assert_eq!(s.tasks[b.0].timeslice, 0);
    assert!(s.tasks[b.0].preempt.is_raised());
    s.check_invariants();
}

#[test]
fn test_suspend_resume_round_trip() {
    let mut s = Sched::new();

    let t = s.create_task(Script::new().work(5).bytes(), 77).unwrap();

    s.suspend_task(t);
    assert_eq!(s.task_state(t), Some(TaskState::Suspended));
    s.check_invariants();

    s.resume_task(t);
    assert_eq!(s.task_state(t), Some(TaskState::Ready));
    assert_eq!(s.tasks[t.0].priority, 77);
    assert_eq!(s.tasks[t.0].effective_priority, 77);
    s.check_invariants();
}

#[test]
fn test_sleep_wakeup_across_tick_wraparound() {
    let mut s = Sched::new();

    let t = s
        .create_task(Script::new().sleep(5).work(1).bytes(), 100)
        .unwrap();

    s.ticks = u32::MAX - 2;
    assert_eq!(s.dispatch(false), Dispatch::Ran);
    assert_eq!(s.task_state(t), Some(TaskState::Waiting));

    // Wakeup tick is past the wrap; the signed comparison still fires.
    for _ in 0..4 {
        s.tick();
        assert_eq!(s.task_state(t), Some(TaskState::Waiting));
    }
    s.tick();
    assert_eq!(s.task_state(t), Some(TaskState::Ready));
}

#[test]
fn test_overdue_sleeper_wakes_on_late_tick() {
    let mut s = Sched::new();

    let t = s
        .create_task(Script::new().sleep(2).work(1).bytes(), 100)
        .unwrap();
    assert_eq!(s.dispatch(false), Dispatch::Ran);

    // Simulate a starved scheduler that missed the deadline tick.
    s.ticks = s.ticks.wrapping_add(10);
    s.tick();

    assert_eq!(s.task_state(t), Some(TaskState::Ready));
}

#[test]
fn test_slice_expiry_raises_preempt_flag() {
    let mut s = Sched::new();

    let t = s.create_task(Script::new().work(50).bytes(), 100).unwrap();

    // Pin the task as the running head, the way a real tick interrupt
    // would observe it mid-step.
    s.tasks[t.0].state = TaskState::Running;

    for _ in 0..u32::from(TIMESLICE_TICKS) - 1 {
        s.tick();
        assert!(!s.tasks[t.0].preempt.is_raised());
    }
    s.tick();

    assert!(s.tasks[t.0].preempt.is_raised());
    assert_eq!(s.tasks[t.0].timeslice, 0);
    assert_eq!(s.tasks[t.0].run_ticks, u32::from(TIMESLICE_TICKS));
}

#[test]
fn test_wakeup_preempts_running_task() {
    let mut s = Sched::new();

    let runner = s.create_task(Script::new().work(50).bytes(), 200).unwrap();
    let sleeper = s
        .create_task(Script::new().sleep(1).work(1).bytes(), 50)
        .unwrap();

    // Park the high-priority task, then pin the other as running.
    s.sleep_ms(sleeper, 1);
    s.tasks[runner.0].state = TaskState::Running;

    s.tick();

    assert_eq!(s.task_state(sleeper), Some(TaskState::Ready));
    assert!(s.tasks[runner.0].preempt.is_raised());
    // The woken task outranks the runner and sits in front of it.
    assert_eq!(s.queues.ready_head(), Some(sleeper));
}

#[test]
fn test_spawn_service_creates_task() {
    let mut s = Sched::new();

    let parent = s
        .create_task(
            Script::new()
                .spawn(50, &Script::new().halt())
                .work(2)
                .halt()
                .bytes(),
            100,
        )
        .unwrap();

    assert_eq!(s.dispatch(true), Dispatch::Ran);

    assert_eq!(s.tasks.len(), 2);
    let child = TaskId(1);
    assert_eq!(s.task_state(child), Some(TaskState::Ready));
    assert_eq!(s.tasks[child.0].priority, 50);
    // The child's handle was delivered to the parent.
    assert_eq!(s.tasks[parent.0].vm.as_ref().unwrap().replies, [1]);
    s.check_invariants();
}

#[test]
fn test_dormant_task_activation() {
    let mut s = Sched::new();

    let t = s.create_dormant_task(100);
    assert_eq!(s.task_state(t), Some(TaskState::Dormant));
    assert_eq!(s.queues.dormant_head(), Some(t));

    s.activate_task(t, Script::new().work(1).halt().bytes()).unwrap();
    assert_eq!(s.task_state(t), Some(TaskState::Ready));
    s.check_invariants();

    s.run_tickless();
    assert_eq!(s.task_state(t), Some(TaskState::Dormant));
}

#[test]
fn test_activate_rejects_non_dormant() {
    let mut s = Sched::new();

    let t = s.create_task(Script::new().work(1).bytes(), 100).unwrap();

    assert_eq!(
        s.activate_task(t, Script::new().halt().bytes()),
        Err(SysError::NoTask)
    );
}

#[test]
fn test_retired_slot_reuse() {
    let mut s = Sched::new();

    // A deliberately dormant TCB must keep its slot; only retired tasks
    // are recycled.
    let parked = s.create_dormant_task(100);
    let done = s.create_task(Script::new().halt().bytes(), 100).unwrap();
    s.run();
    assert!(s.tasks[done.0].retired);

    let fresh = s.create_task(Script::new().work(1).bytes(), 100).unwrap();
    assert_eq!(fresh, done);
    assert_ne!(fresh, parked);
    assert_eq!(s.task_state(parked), Some(TaskState::Dormant));
    s.check_invariants();
}

#[test]
fn test_ops_on_unknown_task_are_noops() {
    let mut s = Sched::new();

    let bogus = TaskId(42);
    s.sleep_ms(bogus, 5);
    s.relinquish(bogus);
    s.change_priority(bogus, 1);
    s.suspend_task(bogus);
    s.resume_task(bogus);

    // A dormant TCB is equally out of reach for blocking operations.
    let parked = s.create_dormant_task(100);
    s.sleep_ms(parked, 5);
    s.suspend_task(parked);
    assert_eq!(s.task_state(parked), Some(TaskState::Dormant));
    s.check_invariants();
}

#[test]
fn test_guest_resume_and_priority_change() {
    let mut s = Sched::new();

    let worker = s
        .create_task(Script::new().suspend_self().work(2).halt().bytes(), 100)
        .unwrap();
    let manager = s
        .create_task(
            Script::new()
                .resume(worker)
                .set_priority(150)
                .work(1)
                .halt()
                .bytes(),
            120,
        )
        .unwrap();

    // The worker parks itself; the manager revives it and then demotes
    // itself below the worker.
    assert_eq!(s.dispatch(true), Dispatch::Ran);
    assert_eq!(s.task_state(worker), Some(TaskState::Suspended));

    assert_eq!(s.dispatch(true), Dispatch::Ran);
    assert_eq!(s.task_state(worker), Some(TaskState::Ready));
    assert_eq!(s.queues.ready_head(), Some(worker));
    s.check_invariants();

    s.run_tickless();

    assert_eq!(s.tasks[manager.0].priority, 150);
    assert_eq!(s.task_state(worker), Some(TaskState::Dormant));
    assert_eq!(s.task_state(manager), Some(TaskState::Dormant));
}

#[test]
fn test_guest_driven_sleep_scenario() {
    // Two guests with different cadences; the whole run is driven through
    // the service layer, no direct kernel calls.
    let mut s = Sched::new();

    let fast = s
        .create_task(Script::new().sleep(1).work(1).sleep(1).halt().bytes(), 100)
        .unwrap();
    let slow = s
        .create_task(Script::new().sleep(4).work(1).halt().bytes(), 100)
        .unwrap();

    s.run_tickless();

    assert_eq!(s.task_state(fast), Some(TaskState::Dormant));
    assert_eq!(s.task_state(slow), Some(TaskState::Dormant));
    assert!(s.tick_count() >= 4);
    s.check_invariants();
}
