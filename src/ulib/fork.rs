use log::{debug, warn};

use crate::{env::{EnvID, EnvStatus}, err::Error, exception::traps::{ExcCode, UTrapframe, REG_V0}, memory::mmu::{Perm, VirtAddr, PAGE_SIZE, UCOW, UTOP, UXSTACKTOP}};

use super::{pgfault::PGFAULT_UPCALL, UserEnv};

/// Resolve a write to a copy-on-write page: copy it to a private frame
/// through `UCOW` and map that frame writable in its place.
fn cow_handler(env: &mut UserEnv<'_>, utf: &UTrapframe) -> Result<(), Error> {
    let va = utf.utf_fault_va.page_align_down();
    let perm = env.vpt(va).perm();
    let write = utf.exc_code().map_or(false, ExcCode::is_write);
    if !write || !perm.contains(Perm::COW) {
        warn!("[{:08x}] not a copy-on-write fault at va {:08x}", env.thisenv().as_usize(), utf.utf_fault_va.as_usize());
        return Err(Error::Fault);
    }

    let rw = Perm::V | Perm::USER | Perm::D;
    env.syscall_mem_alloc(EnvID::zero(), UCOW, rw)?;
    let mut page = [0u8; PAGE_SIZE];
    env.read(va, &mut page)?;
    env.write(UCOW, &page)?;
    env.syscall_mem_map(EnvID::zero(), UCOW, EnvID::zero(), va, rw)?;
    env.syscall_mem_unmap(EnvID::zero(), UCOW)
}

impl<'k> UserEnv<'k> {
    /// Map our page at `va` into `child`. Shared pages keep their permission;
    /// writable and copy-on-write pages become copy-on-write on both sides,
    /// the child first.
    fn duppage(&self, child: EnvID, va: VirtAddr, perm: Perm) -> Result<(), Error> {
        let perm = (perm & Perm::SYSCALL) | Perm::REQUIRED;
        if perm.contains(Perm::LIBRARY) {
            self.syscall_mem_map(EnvID::zero(), va, child, va, perm)
        } else if perm.writable() || perm.contains(Perm::COW) {
            let cow = perm.difference(Perm::D).union(Perm::COW);
            self.syscall_mem_map(EnvID::zero(), va, child, va, cow)?;
            self.syscall_mem_map(EnvID::zero(), va, EnvID::zero(), va, cow)
        } else {
            self.syscall_mem_map(EnvID::zero(), va, child, va, perm)
        }
    }

    fn fork_setup(&self, child: EnvID) -> Result<(), Error> {
        let exstack = UXSTACKTOP - PAGE_SIZE;
        self.syscall_mem_alloc(child, exstack, Perm::V | Perm::USER | Perm::D)?;
        self.syscall_set_pgfault_upcall(child, PGFAULT_UPCALL)?;

        let mut va = VirtAddr::zero();
        while va < UTOP {
            if !self.vpd(va).valid() {
                va = VirtAddr::from_indices(va.pdx() + 1, 0);
                continue;
            }
            let pte = self.vpt(va);
            if va != exstack && pte.valid() && pte.perm().contains(Perm::USER) {
                self.duppage(child, va, pte.perm())?;
            }
            va += PAGE_SIZE;
        }
        self.syscall_set_env_status(child, EnvStatus::Runnable)
    }

    /// Copy-on-write fork. Returns the child's id; the child itself is
    /// reached through [`fork_child`](Self::fork_child). A child whose setup
    /// fails is destroyed before the error is returned.
    pub fn fork(&mut self) -> Result<EnvID, Error> {
        self.set_pgfault_handler(cow_handler)?;
        let child = self.syscall_exofork()?;
        if let Err(err) = self.fork_setup(child) {
            return Err(self.abandon(child, err));
        }
        debug!("[{:08x}] forked {:08x}", self.thisenv.as_usize(), child.as_usize());
        Ok(child)
    }

    /// Tear down a child whose setup failed with `err`. `err` is what the
    /// caller gets back even when the teardown fails as well.
    pub(crate) fn abandon(&self, child: EnvID, err: Error) -> Error {
        warn!("[{:08x}] fork of {:08x} failed: {}", self.thisenv.as_usize(), child.as_usize(), err);
        if let Err(cleanup) = self.syscall_env_destroy(child) {
            warn!("[{:08x}] cannot destroy half-built {:08x}: {}", self.thisenv.as_usize(), child.as_usize(), cleanup);
        }
        err
    }

    /// The child's side of `fork`: it wakes up with 0 from `exofork` and
    /// carries our library state along with the copied address space.
    pub fn fork_child(&self, child: EnvID) -> Result<UserEnv<'k>, Error> {
        let info = self.kernel.env_info(child)?;
        if info.env_parent_id != self.thisenv {
            return Err(Error::BadEnv);
        }
        let tf = self.kernel.env_trapframe(child)?;
        if tf.regs[REG_V0] != 0 {
            return Err(Error::Inval);
        }
        Ok(UserEnv {
            kernel: self.kernel,
            thisenv: child,
            pgfault_handler: self.pgfault_handler,
        })
    }
}
