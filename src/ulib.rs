//! User-space runtime linked into every program: system call stubs, the
//! page-fault upcall, fork and IPC.

/// system call stubs
pub mod syscall;
/// page fault upcall
pub mod pgfault;
/// copy-on-write fork
pub mod fork;
/// ipc wrappers
pub mod ipc;

use core::mem::size_of;

use crate::{env::{EnvID, EnvInfo, Kernel}, err::Error, exception::traps::{MemFault, UTrapframe}, memory::{mmu::VirtAddr, page_table::Pte}};

/// Page fault handler run by the upcall stub.
pub type PgfaultHandler = fn(&mut UserEnv<'_>, &UTrapframe) -> Result<(), Error>;

/// One user program's view of the machine: its own env and the library state
/// that lives in its address space.
pub struct UserEnv<'k> {
    kernel: &'k Kernel,
    thisenv: EnvID,
    pgfault_handler: Option<PgfaultHandler>,
}

impl<'k> UserEnv<'k> {
    pub fn new(kernel: &'k Kernel, thisenv: EnvID) -> Self {
        UserEnv {
            kernel,
            thisenv,
            pgfault_handler: None,
        }
    }

    #[inline]
    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    #[inline]
    pub fn thisenv(&self) -> EnvID {
        self.thisenv
    }

    /// our own entry in `envs`.
    pub fn info(&self) -> Result<EnvInfo, Error> {
        self.kernel.env_info(self.thisenv)
    }

    /// `uvpd[pdx(va)]`
    #[inline]
    pub fn vpd(&self, va: VirtAddr) -> Pte {
        self.kernel.vpd(self.thisenv, va).unwrap_or_default()
    }

    /// `uvpt[vpn(va)]`
    #[inline]
    pub fn vpt(&self, va: VirtAddr) -> Pte {
        self.kernel.vpt(self.thisenv, va).unwrap_or_default()
    }

    /// Load `buf.len()` bytes from `va`. Page faults go through the upcall
    /// and the access is retried once it returns.
    pub fn read(&mut self, va: VirtAddr, buf: &mut [u8]) -> Result<(), Error> {
        loop {
            match self.kernel.user_load(self.thisenv, va, buf) {
                Ok(()) => return Ok(()),
                Err(fault) => self.take_fault(fault)?,
            }
        }
    }

    /// Store `data` at `va`, with the same fault handling as [`read`](Self::read).
    pub fn write(&mut self, va: VirtAddr, data: &[u8]) -> Result<(), Error> {
        loop {
            match self.kernel.user_store(self.thisenv, va, data) {
                Ok(()) => return Ok(()),
                Err(fault) => self.take_fault(fault)?,
            }
        }
    }

    pub fn read_word(&mut self, va: VirtAddr) -> Result<usize, Error> {
        let mut word = [0u8; size_of::<usize>()];
        self.read(va, &mut word)?;
        Ok(usize::from_le_bytes(word))
    }

    pub fn write_word(&mut self, va: VirtAddr, value: usize) -> Result<(), Error> {
        self.write(va, &value.to_le_bytes())
    }

    fn take_fault(&mut self, fault: MemFault) -> Result<(), Error> {
        match fault {
            MemFault::Upcall { entry, utf } => self.upcall(entry, utf),
            MemFault::Killed(_) => Err(Error::Fault),
            MemFault::NotRunning => Err(Error::BadEnv),
        }
    }

    /// Leave for good. Returns only if the kernel refused.
    pub fn exit(&mut self) -> Result<(), Error> {
        self.syscall_env_destroy(EnvID::zero()).map(|_| ())
    }
}
