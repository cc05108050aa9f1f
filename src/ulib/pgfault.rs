use log::warn;

use crate::{env::EnvID, err::Error, exception::traps::UTrapframe, memory::mmu::{Perm, VirtAddr, PAGE_SIZE, UXSTACKTOP}};

use super::{PgfaultHandler, UserEnv};

/// address of the upcall entry stub in the library text
pub const PGFAULT_UPCALL: VirtAddr = VirtAddr::new(0x0040_0040);

impl<'k> UserEnv<'k> {
    /// Install `handler` for our page faults. The first call allocates the
    /// exception stack and registers the upcall with the kernel.
    pub fn set_pgfault_handler(&mut self, handler: PgfaultHandler) -> Result<(), Error> {
        if self.pgfault_handler.is_none() {
            self.syscall_mem_alloc(EnvID::zero(), UXSTACKTOP - PAGE_SIZE, Perm::V | Perm::USER | Perm::D)?;
            self.syscall_set_pgfault_upcall(EnvID::zero(), PGFAULT_UPCALL)?;
        }
        self.pgfault_handler = Some(handler);
        Ok(())
    }

    #[inline]
    pub fn pgfault_handler(&self) -> Option<PgfaultHandler> {
        self.pgfault_handler
    }

    /// The upcall stub. The kernel left the fault record at `utf` on the
    /// exception stack; run the handler, then resume the saved context.
    pub(super) fn upcall(&mut self, entry: VirtAddr, utf: VirtAddr) -> Result<(), Error> {
        let handler = match self.pgfault_handler {
            Some(handler) if entry == PGFAULT_UPCALL => handler,
            _ => {
                warn!("[{:08x}] no page fault handler at {:08x}", self.thisenv.as_usize(), entry.as_usize());
                return self.die();
            }
        };
        let mut buf = [0u8; UTrapframe::SIZE];
        self.read(utf, &mut buf)?;
        let utf = match UTrapframe::from_bytes(&buf) {
            Some(utf) => utf,
            None => return self.die(),
        };
        if let Err(err) = handler(self, &utf) {
            warn!("[{:08x}] page fault at va {:08x}: {}", self.thisenv.as_usize(), utf.utf_fault_va.as_usize(), err);
            return self.die();
        }
        self.syscall_set_trapframe(EnvID::zero(), &utf.utf_tf)
    }

    fn die(&mut self) -> Result<(), Error> {
        self.syscall_env_destroy(EnvID::zero())?;
        Err(Error::Fault)
    }
}
