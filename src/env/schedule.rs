use log::{trace, warn};

use crate::exception::traps::Trapframe;

use super::{CpuStatus, EnvID, EnvManager, EnvStatus, Kernel};

/// Outcome of a scheduling decision for one cpu.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// resume this env from its saved trap frame
    Run(EnvID),
    /// nothing to run, wait for the next timer interrupt
    Halt,
}

/// The hardware side of a context switch. Neither operation returns.
pub trait Machine {
    /// restore `tf` and drop to user mode.
    fn env_pop_tf(&self, tf: &Trapframe) -> !;
    /// idle `cpu` until an interrupt arrives.
    fn wait_for_interrupt(&self, cpu: usize) -> !;
}

impl EnvManager {
    /// Pick the next env for `cpu`: the first runnable slot after the one it
    /// last ran, wrapping around. Falls back to the current env while it is
    /// still running, and halts the cpu otherwise.
    pub fn sched_yield(&mut self, cpu: usize) -> Dispatch {
        let nenv = self.nenv();
        let cur = self.cpus[cpu].cpu_env;
        let start = cur.map_or(0, |ind| ind + 1);
        for k in 0..nenv {
            let ind = (start + k) % nenv;
            if self.envs[ind].env_status == EnvStatus::Runnable {
                return self.env_run(cpu, ind);
            }
        }
        if let Some(ind) = cur {
            if self.envs[ind].env_status == EnvStatus::Running {
                return self.env_run(cpu, ind);
            }
        }
        self.sched_halt(cpu)
    }

    /// Make `ind` the env of `cpu`.
    fn env_run(&mut self, cpu: usize, ind: usize) -> Dispatch {
        if let Some(prev) = self.cpus[cpu].cpu_env {
            if prev != ind && self.envs[prev].env_status == EnvStatus::Running {
                self.envs[prev].env_status = EnvStatus::Runnable;
            }
        }
        let e = &mut self.envs[ind];
        e.env_status = EnvStatus::Running;
        e.env_cpunum = Some(cpu);
        e.env_runs += 1;
        self.cpus[cpu].cpu_env = Some(ind);
        self.cpus[cpu].cpu_status = CpuStatus::Started;
        trace!("cpu {} runs {:08x}", cpu, e.env_id.as_usize());
        Dispatch::Run(e.env_id)
    }

    /// Idle `cpu`. It gives up its env and waits for the timer.
    fn sched_halt(&mut self, cpu: usize) -> Dispatch {
        let alive = self.envs.iter().any(|e| {
            matches!(e.env_status, EnvStatus::Runnable | EnvStatus::Running | EnvStatus::Dying)
        });
        if !alive {
            warn!("no runnable environments in the system!");
        }
        self.cpus[cpu].cpu_env = None;
        self.cpus[cpu].cpu_status = CpuStatus::Halted;
        Dispatch::Halt
    }
}

impl Kernel {
    /// One scheduling decision for `cpu`.
    pub fn sched_yield(&self, cpu: usize) -> Dispatch {
        self.lock().sched_yield(cpu)
    }

    /// Timer tick on `cpu`: preempt whatever runs there and pick again.
    pub fn clock_interrupt(&self, cpu: usize) -> Dispatch {
        let mut em = self.lock();
        if em.cpus[cpu].cpu_status == CpuStatus::Halted {
            em.cpus[cpu].cpu_status = CpuStatus::Started;
        }
        if let Some(ind) = em.cpus[cpu].cpu_env {
            if em.envs[ind].env_status == EnvStatus::Dying {
                return em.kill(cpu, ind);
            }
        }
        em.sched_yield(cpu)
    }

    /// Carry out `dispatch` on `cpu`. The dispatch lock is released before
    /// the machine takes over.
    pub fn run<M: Machine>(&self, cpu: usize, dispatch: Dispatch, machine: &M) -> ! {
        let tf = match dispatch {
            Dispatch::Run(id) => self.env_trapframe(id).ok(),
            Dispatch::Halt => None,
        };
        match tf {
            Some(tf) => machine.env_pop_tf(&tf),
            None => machine.wait_for_interrupt(cpu),
        }
    }

    /// Schedule `cpu` and hand it over. Never returns.
    pub fn schedule<M: Machine>(&self, cpu: usize, machine: &M) -> ! {
        let dispatch = self.sched_yield(cpu);
        self.run(cpu, dispatch, machine)
    }
}
