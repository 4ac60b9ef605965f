//! Hosted test doubles: a scripted guest VM and a pass-through HAL.
//!
//! The "bytecode" is a tiny op stream so every scheduler path is exercised
//! through the real [`Vm`] surface, loader included. One dispatched step
//! executes one bounded burst of work or surfaces one service call.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{SysError, SysResult};
use crate::hal::Hal;
use crate::mutex::MutexId;
use crate::task::TaskId;
use crate::vm::{PreemptFlag, SysCall, Vm, VmStep};

/// Pass-through HAL: a single-context host needs no interrupt masking.
pub struct NullHal;

static IDLE_SPINS: AtomicUsize = AtomicUsize::new(0);

impl Hal for NullHal {
    fn init() {}

    fn critical<R>(f: impl FnOnce() -> R) -> R {
        f()
    }

    fn idle_cpu() {
        // A run that idles this much is stuck.
        let spins = IDLE_SPINS.fetch_add(1, Ordering::Relaxed);
        assert!(spins < 1_000_000, "dispatcher idled forever");
    }
}

const OP_HALT: u8 = 0x00;
const OP_WORK: u8 = 0x01;
const OP_SLEEP: u8 = 0x02;
const OP_RELINQUISH: u8 = 0x03;
const OP_SET_PRIORITY: u8 = 0x04;
const OP_SUSPEND: u8 = 0x05;
const OP_RESUME: u8 = 0x06;
const OP_LOCK: u8 = 0x07;
const OP_TRYLOCK: u8 = 0x08;
const OP_UNLOCK: u8 = 0x09;
const OP_SPAWN: u8 = 0x0a;

/// Builder for test programs.
pub struct Script(Vec<u8>);

impl Script {
    pub fn new() -> Script {
        Script(Vec::new())
    }

    pub fn halt(mut self) -> Script {
        self.0.push(OP_HALT);
        self
    }

    /// `n` bounded bursts; each costs one dispatched step.
    pub fn work(mut self, n: u8) -> Script {
        self.0.extend([OP_WORK, n]);
        self
    }

    pub fn sleep(mut self, ms: u8) -> Script {
        self.0.extend([OP_SLEEP, ms]);
        self
    }

    pub fn relinquish(mut self) -> Script {
        self.0.push(OP_RELINQUISH);
        self
    }

    pub fn set_priority(mut self, priority: u8) -> Script {
        self.0.extend([OP_SET_PRIORITY, priority]);
        self
    }

    pub fn suspend_self(mut self) -> Script {
        self.0.push(OP_SUSPEND);
        self
    }

    pub fn resume(mut self, target: TaskId) -> Script {
        self.0.extend([OP_RESUME, target.0 as u8]);
        self
    }

    pub fn lock(mut self, mutex: MutexId) -> Script {
        self.0.extend([OP_LOCK, mutex.0 as u8]);
        self
    }

    pub fn trylock(mut self, mutex: MutexId) -> Script {
        self.0.extend([OP_TRYLOCK, mutex.0 as u8]);
        self
    }

    pub fn unlock(mut self, mutex: MutexId) -> Script {
        self.0.extend([OP_UNLOCK, mutex.0 as u8]);
        self
    }

    pub fn spawn(mut self, priority: u8, body: &Script) -> Script {
        self.0.extend([OP_SPAWN, priority, body.0.len() as u8]);
        self.0.extend(&body.0);
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Op {
    Halt,
    Work(u8),
    Sleep(u8),
    Relinquish,
    SetPriority(u8),
    SuspendSelf,
    Resume(u8),
    Lock(u8),
    TryLock(u8),
    Unlock(u8),
    Spawn(u8, Vec<u8>),
}

fn operand(bytecode: &[u8], i: &mut usize) -> SysResult<u8> {
    let b = *bytecode.get(*i).ok_or(SysError::BadImage)?;
    *i += 1;
    Ok(b)
}

fn decode(bytecode: &[u8]) -> SysResult<Vec<Op>> {
    let mut ops = Vec::new();
    let mut i = 0;

    while i < bytecode.len() {
        let op = bytecode[i];
        i += 1;

        ops.push(match op {
            OP_HALT => Op::Halt,
            OP_WORK => Op::Work(operand(bytecode, &mut i)?),
            OP_SLEEP => Op::Sleep(operand(bytecode, &mut i)?),
            OP_RELINQUISH => Op::Relinquish,
            OP_SET_PRIORITY => Op::SetPriority(operand(bytecode, &mut i)?),
            OP_SUSPEND => Op::SuspendSelf,
            OP_RESUME => Op::Resume(operand(bytecode, &mut i)?),
            OP_LOCK => Op::Lock(operand(bytecode, &mut i)?),
            OP_TRYLOCK => Op::TryLock(operand(bytecode, &mut i)?),
            OP_UNLOCK => Op::Unlock(operand(bytecode, &mut i)?),
            OP_SPAWN => {
                let priority = operand(bytecode, &mut i)?;
                let len = usize::from(operand(bytecode, &mut i)?);
                if i + len > bytecode.len() {
                    return Err(SysError::BadImage);
                }
                let body = bytecode[i..i + len].to_vec();
                i += len;
                Op::Spawn(priority, body)
            }
            _ => return Err(SysError::BadImage),
        });
    }

    Ok(ops)
}

/// Guest VM driven by a decoded script.
pub struct ScriptVm {
    ops: Vec<Op>,
    pc: usize,
    /// Remaining bursts of the current work op.
    burst: u8,
    running: bool,
    /// Service results delivered by the kernel, oldest first.
    pub replies: Vec<i32>,
}

impl Vm for ScriptVm {
    fn open() -> Option<ScriptVm> {
        Some(ScriptVm {
            ops: Vec::new(),
            pc: 0,
            burst: 0,
            running: false,
            replies: Vec::new(),
        })
    }

    fn load(&mut self, bytecode: &[u8]) -> SysResult<()> {
        self.ops = decode(bytecode)?;
        Ok(())
    }

    fn begin(&mut self) {
        self.running = true;
    }

    fn run(&mut self, preempt: &PreemptFlag) -> VmStep {
        assert!(self.running, "run outside begin/end");

        loop {
            if preempt.is_raised() {
                return VmStep::Yielded;
            }

            if self.burst > 0 {
                self.burst -= 1;
                return VmStep::Yielded;
            }

            let op = match self.ops.get(self.pc) {
                Some(op) => op.clone(),
                None => return VmStep::Finished,
            };
            self.pc += 1;

            return match op {
                Op::Halt => {
                    self.pc = self.ops.len();
                    VmStep::Finished
                }
                Op::Work(0) => continue,
                Op::Work(n) => {
                    self.burst = n - 1;
                    VmStep::Yielded
                }
                Op::Sleep(ms) => VmStep::Call(SysCall::Sleep { ms: u32::from(ms) }),
                Op::Relinquish => VmStep::Call(SysCall::Relinquish),
                Op::SetPriority(priority) => VmStep::Call(SysCall::SetPriority { priority }),
                Op::SuspendSelf => VmStep::Call(SysCall::Suspend { target: None }),
                Op::Resume(t) => VmStep::Call(SysCall::Resume {
                    target: TaskId(usize::from(t)),
                }),
                Op::Lock(m) => VmStep::Call(SysCall::MutexLock {
                    mutex: MutexId(usize::from(m)),
                }),
                Op::TryLock(m) => VmStep::Call(SysCall::MutexTryLock {
                    mutex: MutexId(usize::from(m)),
                }),
                Op::Unlock(m) => VmStep::Call(SysCall::MutexUnlock {
                    mutex: MutexId(usize::from(m)),
                }),
                Op::Spawn(priority, body) => VmStep::Call(SysCall::Spawn {
                    bytecode: body,
                    priority,
                }),
            };
        }
    }

    fn end(&mut self) {
        self.running = false;
    }

    fn service_return(&mut self, value: i32) {
        self.replies.push(value);
    }
}

#[test]
fn test_decode_rejects_unknown_opcode() {
    assert_eq!(decode(&[0xff]), Err(SysError::BadImage));
    assert_eq!(decode(&[OP_WORK]), Err(SysError::BadImage));
    assert_eq!(decode(&[OP_SPAWN, 100, 4, OP_HALT]), Err(SysError::BadImage));
}

#[test]
fn test_script_runs_bursts_then_finishes() {
    let script = Script::new().work(3).halt();

    let mut vm = ScriptVm::open().unwrap();
    vm.load(script.bytes()).unwrap();
    vm.begin();

    let flag = PreemptFlag::new();
    for _ in 0..3 {
        assert_eq!(vm.run(&flag), VmStep::Yielded);
    }
    assert_eq!(vm.run(&flag), VmStep::Finished);
}

#[test]
fn test_raised_flag_short_circuits_run() {
    let script = Script::new().work(3).halt();

    let mut vm = ScriptVm::open().unwrap();
    vm.load(script.bytes()).unwrap();
    vm.begin();

    let flag = PreemptFlag::new();
    flag.raise();
    assert_eq!(vm.run(&flag), VmStep::Yielded);

    // No progress was made while the flag was up.
    flag.clear();
    for _ in 0..3 {
        assert_eq!(vm.run(&flag), VmStep::Yielded);
    }
    assert_eq!(vm.run(&flag), VmStep::Finished);
}
