#![allow(dead_code)]

use mos_env::{memory::mmu::{Perm, VirtAddr, PAGE_SIZE, UTEXT}, Dispatch, EnvID, Error, Image, Kernel, KernelConfig, Segment, UserEnv};

/// writable data page of every demo program
pub const DATA: VirtAddr = VirtAddr::new(UTEXT.as_usize() + PAGE_SIZE);

pub enum Step<'k> {
    /// keep going whenever we are scheduled
    Continue,
    /// a forked child starts running this program
    Spawn(UserEnv<'k>, Box<dyn Program>),
    /// the env has destroyed itself
    Exit,
}

/// A user program as a state machine. `step` runs while its env owns the
/// cpu and stops at the next system call that may switch away.
pub trait Program {
    fn step<'k>(&mut self, env: &mut UserEnv<'k>) -> Result<Step<'k>, Error>;
}

pub fn kernel() -> Kernel {
    Kernel::new(KernelConfig::default().log2_nenv(5).npages(1024)).unwrap()
}

pub fn spawn(kernel: &Kernel) -> EnvID {
    let text = [0u8; 16];
    let segs = [
        Segment { va: UTEXT, data: &text, memsz: PAGE_SIZE, perm: Perm::V | Perm::USER },
        Segment { va: DATA, data: &[], memsz: PAGE_SIZE, perm: Perm::V | Perm::USER | Perm::D },
    ];
    kernel.env_create(&Image { entry: UTEXT, segments: &segs }).unwrap()
}

/// Cooperative driver for cpu 0: whichever env the scheduler picked runs
/// its program until it traps away again.
pub struct Driver<'k> {
    kernel: &'k Kernel,
    tasks: Vec<(UserEnv<'k>, Box<dyn Program>)>,
}

impl<'k> Driver<'k> {
    pub fn new(kernel: &'k Kernel) -> Self {
        Driver { kernel, tasks: Vec::new() }
    }

    pub fn add(&mut self, id: EnvID, program: Box<dyn Program>) {
        self.tasks.push((UserEnv::new(self.kernel, id), program));
    }

    /// Run until the cpu halts. Returns the number of steps taken.
    pub fn run(&mut self, budget: usize) -> usize {
        let mut dispatch = self.kernel.sched_yield(0);
        for steps in 0..budget {
            let id = match dispatch {
                Dispatch::Run(id) => id,
                Dispatch::Halt => match self.kernel.clock_interrupt(0) {
                    Dispatch::Halt => return steps,
                    next => {
                        dispatch = next;
                        continue;
                    }
                },
            };
            let slot = self.tasks.iter().position(|(env, _)| env.thisenv() == id)
                .unwrap_or_else(|| panic!("no program for {:?}", id));
            let (env, program) = &mut self.tasks[slot];
            match program.step(env).unwrap_or_else(|err| panic!("{:?} failed: {}", id, err)) {
                Step::Continue => {}
                Step::Spawn(child, program) => self.tasks.push((child, program)),
                Step::Exit => {
                    self.tasks.swap_remove(slot);
                }
            }
            dispatch = match self.kernel.cpu_env(0) {
                Some(cur) => Dispatch::Run(cur),
                None => self.kernel.sched_yield(0),
            };
        }
        panic!("demo did not finish within {} steps", budget);
    }
}
