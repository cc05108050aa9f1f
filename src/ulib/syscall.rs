use crate::{env::{schedule::Dispatch, syscall::{Completion, Syscall}, EnvID, EnvStatus}, err::Error, exception::traps::Trapframe, memory::mmu::{Perm, VirtAddr}};

use super::UserEnv;

impl<'k> UserEnv<'k> {
    /// Trap into the kernel for a call that returns to us.
    fn msyscall(&self, call: Syscall) -> Result<usize, Error> {
        match self.kernel.syscall(self.thisenv, call)? {
            Completion::Return(ret) => Ok(ret),
            // we were reaped on the way in
            Completion::Switch(_) => Err(Error::Fault),
        }
    }

    /// Trap for a call that gives the cpu away.
    fn msyscall_switch(&self, call: Syscall) -> Result<Dispatch, Error> {
        match self.kernel.syscall(self.thisenv, call)? {
            Completion::Switch(dispatch) => Ok(dispatch),
            Completion::Return(_) => Err(Error::Unspecified),
        }
    }

    pub fn syscall_getenvid(&self) -> Result<EnvID, Error> {
        self.msyscall(Syscall::GetEnvID).map(EnvID::new)
    }

    pub fn syscall_yield(&self) -> Result<Dispatch, Error> {
        self.msyscall_switch(Syscall::Yield)
    }

    /// `Some` when we destroyed ourselves and the cpu moved on.
    pub fn syscall_env_destroy(&self, envid: EnvID) -> Result<Option<Dispatch>, Error> {
        match self.kernel.syscall(self.thisenv, Syscall::EnvDestroy(envid))? {
            Completion::Return(_) => Ok(None),
            Completion::Switch(dispatch) => Ok(Some(dispatch)),
        }
    }

    pub fn syscall_set_pgfault_upcall(&self, envid: EnvID, func: VirtAddr) -> Result<(), Error> {
        self.msyscall(Syscall::SetPgfaultUpcall(envid, func)).map(|_| ())
    }

    pub fn syscall_mem_alloc(&self, envid: EnvID, va: VirtAddr, perm: Perm) -> Result<(), Error> {
        self.msyscall(Syscall::MemAlloc(envid, va, perm)).map(|_| ())
    }

    pub fn syscall_mem_map(&self, srcid: EnvID, srcva: VirtAddr, dstid: EnvID, dstva: VirtAddr, perm: Perm) -> Result<(), Error> {
        self.msyscall(Syscall::MemMap(srcid, srcva, dstid, dstva, perm)).map(|_| ())
    }

    pub fn syscall_mem_unmap(&self, envid: EnvID, va: VirtAddr) -> Result<(), Error> {
        self.msyscall(Syscall::MemUnmap(envid, va)).map(|_| ())
    }

    pub fn syscall_exofork(&self) -> Result<EnvID, Error> {
        self.msyscall(Syscall::Exofork).map(EnvID::new)
    }

    pub fn syscall_set_env_status(&self, envid: EnvID, status: EnvStatus) -> Result<(), Error> {
        self.msyscall(Syscall::SetEnvStatus(envid, status)).map(|_| ())
    }

    pub fn syscall_set_trapframe(&self, envid: EnvID, tf: &Trapframe) -> Result<(), Error> {
        self.msyscall(Syscall::SetTrapframe(envid, *tf)).map(|_| ())
    }

    pub fn syscall_ipc_try_send(&self, envid: EnvID, value: usize, srcva: Option<VirtAddr>, perm: Perm) -> Result<(), Error> {
        self.msyscall(Syscall::IpcTrySend(envid, value, srcva, perm)).map(|_| ())
    }

    pub fn syscall_ipc_recv(&self, dstva: Option<VirtAddr>) -> Result<Dispatch, Error> {
        self.msyscall_switch(Syscall::IpcRecv(dstva))
    }
}
