use core::mem::size_of;

use log::{info, trace};

use crate::{err::Error, exception::traps::{Trapframe, REG_A0, REG_V0, STATUS_USER}, memory::mmu::{Perm, VirtAddr, UTOP}};

use super::{schedule::Dispatch, EnvID, EnvManager, EnvStatus, Entry, Kernel};

/// syscall id enum
#[repr(usize)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallID {
    GetEnvID,
    Yield,
    EnvDestroy,
    SetPgfaultUpcall,
    MemAlloc,
    MemMap,
    MemUnmap,
    Exofork,
    SetEnvStatus,
    SetTrapframe,
    IpcTrySend,
    IpcRecv,
    SysNo,
}

/// convert int to syscall id
impl From<usize> for SyscallID {
    fn from(value: usize) -> Self {
        match value {
            x if x == SyscallID::GetEnvID as usize => SyscallID::GetEnvID,
            x if x == SyscallID::Yield as usize => SyscallID::Yield,
            x if x == SyscallID::EnvDestroy as usize => SyscallID::EnvDestroy,
            x if x == SyscallID::SetPgfaultUpcall as usize => SyscallID::SetPgfaultUpcall,
            x if x == SyscallID::MemAlloc as usize => SyscallID::MemAlloc,
            x if x == SyscallID::MemMap as usize => SyscallID::MemMap,
            x if x == SyscallID::MemUnmap as usize => SyscallID::MemUnmap,
            x if x == SyscallID::Exofork as usize => SyscallID::Exofork,
            x if x == SyscallID::SetEnvStatus as usize => SyscallID::SetEnvStatus,
            x if x == SyscallID::SetTrapframe as usize => SyscallID::SetTrapframe,
            x if x == SyscallID::IpcTrySend as usize => SyscallID::IpcTrySend,
            x if x == SyscallID::IpcRecv as usize => SyscallID::IpcRecv,
            _ => SyscallID::SysNo,
        }
    }
}

/// A decoded system call with typed arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Syscall {
    GetEnvID,
    Yield,
    EnvDestroy(EnvID),
    SetPgfaultUpcall(EnvID, VirtAddr),
    MemAlloc(EnvID, VirtAddr, Perm),
    /// `(srcid, srcva, dstid, dstva, perm)`
    MemMap(EnvID, VirtAddr, EnvID, VirtAddr, Perm),
    MemUnmap(EnvID, VirtAddr),
    Exofork,
    SetEnvStatus(EnvID, EnvStatus),
    SetTrapframe(EnvID, Trapframe),
    /// `(dstid, value, srcva, perm)`
    IpcTrySend(EnvID, usize, Option<VirtAddr>, Perm),
    IpcRecv(Option<VirtAddr>),
}

/// How a system call finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// the caller continues with this return value
    Return(usize),
    /// the caller gave up the cpu
    Switch(Dispatch),
}

impl Syscall {
    pub fn id(&self) -> SyscallID {
        match self {
            Syscall::GetEnvID => SyscallID::GetEnvID,
            Syscall::Yield => SyscallID::Yield,
            Syscall::EnvDestroy(..) => SyscallID::EnvDestroy,
            Syscall::SetPgfaultUpcall(..) => SyscallID::SetPgfaultUpcall,
            Syscall::MemAlloc(..) => SyscallID::MemAlloc,
            Syscall::MemMap(..) => SyscallID::MemMap,
            Syscall::MemUnmap(..) => SyscallID::MemUnmap,
            Syscall::Exofork => SyscallID::Exofork,
            Syscall::SetEnvStatus(..) => SyscallID::SetEnvStatus,
            Syscall::SetTrapframe(..) => SyscallID::SetTrapframe,
            Syscall::IpcTrySend(..) => SyscallID::IpcTrySend,
            Syscall::IpcRecv(..) => SyscallID::IpcRecv,
        }
    }
}

/// check if virtual address is a user page
#[inline]
fn check_va(va: VirtAddr) -> Result<(), Error> {
    if va.is_user_page() {
        Ok(())
    } else {
        Err(Error::Inval)
    }
}

#[inline]
fn check_perm(perm: Perm) -> Result<(), Error> {
    if perm.is_valid_user() {
        Ok(())
    } else {
        Err(Error::Inval)
    }
}

#[inline]
fn raw_perm(bits: usize) -> Result<Perm, Error> {
    Perm::from_bits(bits).ok_or(Error::Inval)
}

/// raw address argument, anything at or above `UTOP` meaning "none".
#[inline]
fn raw_page(va: usize) -> Option<VirtAddr> {
    if va < UTOP.as_usize() {
        Some(VirtAddr::new(va))
    } else {
        None
    }
}

impl EnvManager {
    /// get current env id
    fn sys_get_envid(&self, caller: usize) -> EnvID {
        self.envs[caller].env_id
    }

    /// give up the cpu; the caller reads 0 once resumed
    fn sys_yield(&mut self, cpu: usize, caller: usize) -> Dispatch {
        self.envs[caller].env_tf.regs[REG_V0] = 0;
        self.sched_yield(cpu)
    }

    /// destroy env
    fn sys_env_destroy(&mut self, cpu: usize, caller: usize, envid: EnvID) -> Result<Option<Dispatch>, Error> {
        let ind = self.envid2ind(Some(caller), envid, true)?;
        let cur = self.envs[caller].env_id.as_usize();
        if ind == caller {
            info!("[{:08x}] exiting gracefully", cur);
        } else {
            info!("[{:08x}] destroying {:08x}", cur, self.envs[ind].env_id.as_usize());
        }
        Ok(self.destroy(cpu, ind))
    }

    /// set page fault upcall entry of env
    fn sys_set_pgfault_upcall(&mut self, caller: usize, envid: EnvID, func: VirtAddr) -> Result<(), Error> {
        let ind = self.envid2ind(Some(caller), envid, true)?;
        self.envs[ind].env_pgfault_upcall = if func.is_null() { None } else { Some(func) };
        Ok(())
    }

    /// alloc a zeroed page and map it at `va`
    fn sys_mem_alloc(&mut self, caller: usize, envid: EnvID, va: VirtAddr, perm: Perm) -> Result<(), Error> {
        let ind = self.envid2ind(Some(caller), envid, true)?;
        check_va(va)?;
        check_perm(perm)?;
        let (pgdir, frames) = self.space(ind)?;
        let ppn = frames.alloc()?;
        if let Err(err) = pgdir.insert(frames, ppn, va, perm) {
            frames.dealloc(ppn);
            return Err(err);
        }
        Ok(())
    }

    /// share the page at `srcva` of `srcid` into `dstid` at `dstva`
    fn sys_mem_map(&mut self, caller: usize, srcid: EnvID, srcva: VirtAddr, dstid: EnvID, dstva: VirtAddr, perm: Perm) -> Result<(), Error> {
        let src = self.envid2ind(Some(caller), srcid, true)?;
        let dst = self.envid2ind(Some(caller), dstid, true)?;
        check_va(srcva)?;
        check_va(dstva)?;
        check_perm(perm)?;
        let (ppn, pte) = self.lookup(src, srcva).ok_or(Error::Inval)?;
        if perm.writable() && !pte.perm().writable() {
            return Err(Error::Inval);
        }
        let (pgdir, frames) = self.space(dst)?;
        pgdir.insert(frames, ppn, dstva, perm)
    }

    /// unmap `va`, absent mappings included
    fn sys_mem_unmap(&mut self, caller: usize, envid: EnvID, va: VirtAddr) -> Result<(), Error> {
        let ind = self.envid2ind(Some(caller), envid, true)?;
        check_va(va)?;
        let (pgdir, frames) = self.space(ind)?;
        pgdir.remove(frames, va);
        Ok(())
    }

    /// Blank child of the caller. It carries the caller's registers, reads 0
    /// as its return value, and stays `NotRunnable`.
    fn sys_exofork(&mut self, caller: usize) -> Result<EnvID, Error> {
        let parent = self.envs[caller].env_id;
        let ind = self.alloc(parent)?;
        let mut tf = self.envs[caller].env_tf;
        tf.regs[REG_V0] = 0;
        let child = &mut self.envs[ind];
        child.env_tf = tf;
        child.env_status = EnvStatus::NotRunnable;
        Ok(child.env_id)
    }

    /// set env status
    fn sys_set_env_status(&mut self, caller: usize, envid: EnvID, status: EnvStatus) -> Result<(), Error> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(Error::Inval);
        }
        let ind = self.envid2ind(Some(caller), envid, true)?;
        let e = &mut self.envs[ind];
        match (e.env_status, status) {
            (EnvStatus::Dying, _) | (EnvStatus::Running, EnvStatus::Runnable) => {},
            _ => e.env_status = status,
        }
        Ok(())
    }

    /// replace the trap frame of env; returns what the target reads in `v0`
    fn sys_set_trapframe(&mut self, caller: usize, envid: EnvID, mut tf: Trapframe) -> Result<usize, Error> {
        let ind = self.envid2ind(Some(caller), envid, true)?;
        tf.cp0_status |= STATUS_USER;
        self.envs[ind].env_tf = tf;
        if ind == caller {
            Ok(tf.regs[REG_V0])
        } else {
            Ok(0)
        }
    }

    /// Deliver `value`, and the page at `srcva` if the receiver asked for
    /// one, to an env blocked in `ipc_recv`.
    fn sys_ipc_try_send(&mut self, caller: usize, envid: EnvID, value: usize, srcva: Option<VirtAddr>, perm: Perm) -> Result<(), Error> {
        let ind = self.envid2ind(Some(caller), envid, false)?;
        if !self.envs[ind].env_ipc_recving {
            return Err(Error::IpcNotRecv);
        }
        let page = match srcva {
            Some(srcva) => {
                check_va(srcva)?;
                check_perm(perm)?;
                let (ppn, pte) = self.lookup(caller, srcva).ok_or(Error::Inval)?;
                if perm.writable() && !pte.perm().writable() {
                    return Err(Error::Inval);
                }
                Some(ppn)
            }
            None => None,
        };
        let mut sent = Perm::empty();
        if let (Some(ppn), Some(dstva)) = (page, self.envs[ind].env_ipc_dstva) {
            let (pgdir, frames) = self.space(ind)?;
            pgdir.insert(frames, ppn, dstva, perm)?;
            sent = perm;
        }
        let from = self.envs[caller].env_id;
        let e = &mut self.envs[ind];
        e.env_ipc_recving = false;
        e.env_ipc_from = from;
        e.env_ipc_value = value;
        e.env_ipc_perm = sent;
        e.env_tf.regs[REG_V0] = 0;
        e.env_status = EnvStatus::Runnable;
        Ok(())
    }

    /// Block the caller until a matching send. Only a bad `dstva` returns.
    fn sys_ipc_recv(&mut self, cpu: usize, caller: usize, dstva: Option<VirtAddr>) -> Result<Dispatch, Error> {
        if let Some(dstva) = dstva {
            check_va(dstva)?;
        }
        let e = &mut self.envs[caller];
        e.env_ipc_recving = true;
        e.env_ipc_dstva = dstva;
        e.env_status = EnvStatus::NotRunnable;
        Ok(self.sched_yield(cpu))
    }

    /// Execute `call` for env `caller`, running on `cpu`.
    pub(crate) fn dispatch(&mut self, cpu: usize, caller: usize, call: Syscall) -> Result<Completion, Error> {
        trace!("[{:08x}] syscall {:?}", self.envs[caller].env_id.as_usize(), call.id());
        match call {
            Syscall::GetEnvID => Ok(Completion::Return(self.sys_get_envid(caller).as_usize())),
            Syscall::Yield => Ok(Completion::Switch(self.sys_yield(cpu, caller))),
            Syscall::EnvDestroy(envid) => Ok(match self.sys_env_destroy(cpu, caller, envid)? {
                Some(dispatch) => Completion::Switch(dispatch),
                None => Completion::Return(0),
            }),
            Syscall::SetPgfaultUpcall(envid, func) => self.sys_set_pgfault_upcall(caller, envid, func).map(|_| Completion::Return(0)),
            Syscall::MemAlloc(envid, va, perm) => self.sys_mem_alloc(caller, envid, va, perm).map(|_| Completion::Return(0)),
            Syscall::MemMap(srcid, srcva, dstid, dstva, perm) => self.sys_mem_map(caller, srcid, srcva, dstid, dstva, perm).map(|_| Completion::Return(0)),
            Syscall::MemUnmap(envid, va) => self.sys_mem_unmap(caller, envid, va).map(|_| Completion::Return(0)),
            Syscall::Exofork => self.sys_exofork(caller).map(|id| Completion::Return(id.as_usize())),
            Syscall::SetEnvStatus(envid, status) => self.sys_set_env_status(caller, envid, status).map(|_| Completion::Return(0)),
            Syscall::SetTrapframe(envid, tf) => self.sys_set_trapframe(caller, envid, tf).map(Completion::Return),
            Syscall::IpcTrySend(envid, value, srcva, perm) => self.sys_ipc_try_send(caller, envid, value, srcva, perm).map(|_| Completion::Return(0)),
            Syscall::IpcRecv(dstva) => self.sys_ipc_recv(cpu, caller, dstva).map(Completion::Switch),
        }
    }

    /// Decode the registers of a raw system call made by `caller`.
    fn decode(&self, caller: usize, regs: &[usize; 32]) -> Result<Syscall, Error> {
        let [a1, a2, a3, a4, a5] = [regs[REG_A0 + 1], regs[REG_A0 + 2], regs[REG_A0 + 3], regs[REG_A0 + 4], regs[REG_A0 + 5]];
        Ok(match SyscallID::from(regs[REG_A0]) {
            SyscallID::GetEnvID => Syscall::GetEnvID,
            SyscallID::Yield => Syscall::Yield,
            SyscallID::EnvDestroy => Syscall::EnvDestroy(EnvID::new(a1)),
            SyscallID::SetPgfaultUpcall => Syscall::SetPgfaultUpcall(EnvID::new(a1), VirtAddr::new(a2)),
            SyscallID::MemAlloc => Syscall::MemAlloc(EnvID::new(a1), VirtAddr::new(a2), raw_perm(a3)?),
            SyscallID::MemMap => Syscall::MemMap(EnvID::new(a1), VirtAddr::new(a2), EnvID::new(a3), VirtAddr::new(a4), raw_perm(a5)?),
            SyscallID::MemUnmap => Syscall::MemUnmap(EnvID::new(a1), VirtAddr::new(a2)),
            SyscallID::Exofork => Syscall::Exofork,
            SyscallID::SetEnvStatus => Syscall::SetEnvStatus(EnvID::new(a1), EnvStatus::try_from(a2)?),
            SyscallID::SetTrapframe => {
                let mut buf = [0u8; Trapframe::WORDS * size_of::<usize>()];
                self.copy_from_user(caller, VirtAddr::new(a2), &mut buf)?;
                let tf = Trapframe::from_bytes(&buf).ok_or(Error::Inval)?;
                Syscall::SetTrapframe(EnvID::new(a1), tf)
            }
            SyscallID::IpcTrySend => {
                let srcva = raw_page(a3);
                let perm = match srcva {
                    Some(_) => raw_perm(a4)?,
                    None => Perm::empty(),
                };
                Syscall::IpcTrySend(EnvID::new(a1), a2, srcva, perm)
            }
            SyscallID::IpcRecv => Syscall::IpcRecv(raw_page(a1)),
            SyscallID::SysNo => return Err(Error::NoSys),
        })
    }
}

impl Kernel {
    /// Typed system call made by the running env `id`.
    pub fn syscall(&self, id: EnvID, call: Syscall) -> Result<Completion, Error> {
        let mut em = self.lock();
        match em.enter(id) {
            Entry::Caller { ind, cpu } => em.dispatch(cpu, ind, call),
            Entry::Reaped(dispatch) => Ok(Completion::Switch(dispatch)),
            Entry::NotRunning => Err(Error::BadEnv),
        }
    }

    /// Raw system call trap on `cpu`: number in `a0`, arguments in `a1..a5`,
    /// result in `v0`. Returns what the cpu does next.
    pub fn do_syscall(&self, cpu: usize) -> Dispatch {
        let mut em = self.lock();
        let ind = match em.cpus[cpu].cpu_env {
            Some(ind) => ind,
            None => return em.sched_yield(cpu),
        };
        if em.envs[ind].env_status == EnvStatus::Dying {
            return em.kill(cpu, ind);
        }
        let epc = &mut em.envs[ind].env_tf.cp0_epc;
        *epc = epc.wrapping_add(4);
        let regs = em.envs[ind].env_tf.regs;
        let ret = em.decode(ind, &regs).and_then(|call| em.dispatch(cpu, ind, call));
        let v0 = match ret {
            Ok(Completion::Switch(dispatch)) => return dispatch,
            Ok(Completion::Return(v)) => v,
            Err(err) => isize::from(err) as usize,
        };
        let e = &mut em.envs[ind];
        e.env_tf.regs[REG_V0] = v0;
        Dispatch::Run(e.env_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::{Image, Segment}, init::KernelConfig, memory::mmu::{PAGE_SIZE, UTEXT}};

    fn boot() -> (Kernel, EnvID) {
        let kernel = Kernel::new(KernelConfig::default().log2_nenv(4).npages(128)).unwrap();
        let segs = [Segment { va: UTEXT, data: &[0; 16], memsz: PAGE_SIZE, perm: Perm::V | Perm::USER | Perm::D }];
        let id = kernel.env_create(&Image { entry: UTEXT, segments: &segs }).unwrap();
        assert_eq!(kernel.sched_yield(0), Dispatch::Run(id));
        (kernel, id)
    }

    fn trap(kernel: &Kernel, no: SyscallID, args: &[usize]) -> Dispatch {
        {
            let mut em = kernel.lock();
            let ind = em.cpus[0].cpu_env.unwrap();
            let tf = &mut em.envs[ind].env_tf;
            tf.regs[REG_A0] = no as usize;
            for (i, a) in args.iter().enumerate() {
                tf.regs[REG_A0 + 1 + i] = *a;
            }
        }
        kernel.do_syscall(0)
    }

    fn v0(kernel: &Kernel, id: EnvID) -> isize {
        kernel.env_trapframe(id).unwrap().regs[REG_V0] as isize
    }

    #[test]
    fn syscall_numbers_follow_the_enum() {
        assert_eq!(SyscallID::from(0), SyscallID::GetEnvID);
        assert_eq!(SyscallID::from(11), SyscallID::IpcRecv);
        assert_eq!(SyscallID::from(12), SyscallID::SysNo);
        assert_eq!(SyscallID::from(usize::MAX), SyscallID::SysNo);
        assert_eq!(Syscall::IpcRecv(None).id(), SyscallID::IpcRecv);
    }

    #[test]
    fn trap_at_top_of_address_space_wraps_epc() {
        let (kernel, id) = boot();
        let mut tf = kernel.env_trapframe(id).unwrap();
        tf.cp0_epc = usize::MAX;
        kernel.syscall(id, Syscall::SetTrapframe(EnvID::zero(), tf)).unwrap();
        assert_eq!(trap(&kernel, SyscallID::GetEnvID, &[]), Dispatch::Run(id));
        assert_eq!(kernel.env_trapframe(id).unwrap().cp0_epc, 3);
        assert_eq!(v0(&kernel, id), id.as_usize() as isize);
    }

    #[test]
    fn raw_abi_returns_in_v0_and_advances_epc() {
        let (kernel, id) = boot();
        assert_eq!(trap(&kernel, SyscallID::GetEnvID, &[]), Dispatch::Run(id));
        assert_eq!(v0(&kernel, id), id.as_usize() as isize);
        assert_eq!(kernel.env_trapframe(id).unwrap().cp0_epc, UTEXT.as_usize() + 4);

        assert_eq!(trap(&kernel, SyscallID::SysNo, &[]), Dispatch::Run(id));
        assert_eq!(v0(&kernel, id), Error::NoSys.code() as isize);
        trap(&kernel, SyscallID::MemAlloc, &[0, UTEXT.as_usize() + 1, (Perm::V | Perm::USER).bits()]);
        assert_eq!(v0(&kernel, id), Error::Inval.code() as isize);
        // unknown permission bits
        trap(&kernel, SyscallID::MemAlloc, &[0, UTEXT.as_usize(), 0x8000_0000]);
        assert_eq!(v0(&kernel, id), Error::Inval.code() as isize);
        assert_eq!(kernel.env_trapframe(id).unwrap().cp0_epc, UTEXT.as_usize() + 16);
    }

    #[test]
    fn raw_exofork_child_resumes_after_the_call() {
        let (kernel, id) = boot();
        trap(&kernel, SyscallID::Exofork, &[]);
        let child = EnvID::new(v0(&kernel, id) as usize);
        let tf = kernel.env_trapframe(child).unwrap();
        assert_eq!(tf.regs[REG_V0], 0);
        assert_eq!(tf.cp0_epc, UTEXT.as_usize() + 4);
        assert_eq!(kernel.env_info(child).unwrap().env_status, EnvStatus::NotRunnable);
        assert_eq!(kernel.env_info(child).unwrap().env_parent_id, id);

        trap(&kernel, SyscallID::SetEnvStatus, &[child.as_usize(), 7]);
        assert_eq!(v0(&kernel, id), Error::Inval.code() as isize);
        trap(&kernel, SyscallID::SetEnvStatus, &[child.as_usize(), EnvStatus::Runnable as usize]);
        assert_eq!(v0(&kernel, id), 0);
        assert_eq!(trap(&kernel, SyscallID::Yield, &[]), Dispatch::Run(child));
        assert_eq!(v0(&kernel, id), 0);
    }

    #[test]
    fn raw_set_trapframe_reads_user_memory() {
        let (kernel, id) = boot();
        let mut tf = Trapframe::new();
        tf.cp0_epc = 0x400100;
        tf.regs[REG_V0] = 77;
        kernel.user_store(id, UTEXT, &tf.to_bytes()).unwrap();
        trap(&kernel, SyscallID::SetTrapframe, &[0, UTEXT.as_usize()]);
        let now = kernel.env_trapframe(id).unwrap();
        assert_eq!(now.cp0_epc, 0x400100);
        assert_eq!(now.regs[REG_V0], 77);
        assert_eq!(now.cp0_status & STATUS_USER, STATUS_USER);

        // frame straddling an unmapped page
        trap(&kernel, SyscallID::SetTrapframe, &[0, UTEXT.as_usize() + PAGE_SIZE - 8]);
        assert_eq!(v0(&kernel, id), Error::Inval.code() as isize);
    }

    #[test]
    fn raw_recv_blocks_and_send_wakes() {
        let (kernel, a) = boot();
        trap(&kernel, SyscallID::Exofork, &[]);
        let b = EnvID::new(v0(&kernel, a) as usize);
        trap(&kernel, SyscallID::SetEnvStatus, &[b.as_usize(), EnvStatus::Runnable as usize]);

        // a blocks without a page, b runs
        assert_eq!(trap(&kernel, SyscallID::IpcRecv, &[UTOP.as_usize()]), Dispatch::Run(b));
        let info = kernel.env_info(a).unwrap();
        assert!(info.env_ipc_recving);
        assert_eq!(info.env_ipc_dstva, None);

        // srcva at UTOP means no page, perm is ignored
        assert_eq!(trap(&kernel, SyscallID::IpcTrySend, &[a.as_usize(), 42, UTOP.as_usize(), usize::MAX]), Dispatch::Run(b));
        assert_eq!(v0(&kernel, b), 0);
        let info = kernel.env_info(a).unwrap();
        assert_eq!(info.env_status, EnvStatus::Runnable);
        assert_eq!((info.env_ipc_value, info.env_ipc_from), (42, b));
        assert_eq!(info.env_ipc_perm, Perm::empty());
        assert_eq!(v0(&kernel, a), 0);
    }

    #[test]
    fn raw_destroy_self_switches_away() {
        let (kernel, id) = boot();
        assert_eq!(trap(&kernel, SyscallID::EnvDestroy, &[0]), Dispatch::Halt);
        assert_eq!(kernel.env_info(id), Err(Error::BadEnv));
        assert_eq!(kernel.num_free_frames(), 128);
    }
}
