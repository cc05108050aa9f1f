use crate::{env::{schedule::Dispatch, EnvID}, err::Error, memory::mmu::{Perm, VirtAddr}};

use super::UserEnv;

/// What a completed receive delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpcMessage {
    pub from: EnvID,
    pub value: usize,
    /// permission of the transferred page, empty if none was
    pub perm: Perm,
}

impl<'k> UserEnv<'k> {
    /// Send `value`, and the page at `srcva` if given, to `to`.
    ///
    /// `Ok(None)` once delivered. While `to` is not receiving we yield and
    /// return the switch; call again once rescheduled.
    pub fn ipc_send(&mut self, to: EnvID, value: usize, srcva: Option<VirtAddr>, perm: Perm) -> Result<Option<Dispatch>, Error> {
        match self.syscall_ipc_try_send(to, value, srcva, perm) {
            Ok(()) => Ok(None),
            Err(Error::IpcNotRecv) => self.syscall_yield().map(Some),
            Err(err) => Err(err),
        }
    }

    /// Block for a message, with an incoming page mapped at `dstva` if given.
    /// Once we run again the message is read with [`ipc_take`](Self::ipc_take).
    pub fn ipc_recv(&mut self, dstva: Option<VirtAddr>) -> Result<Dispatch, Error> {
        self.syscall_ipc_recv(dstva)
    }

    /// The message left by the send that woke us.
    pub fn ipc_take(&self) -> Result<IpcMessage, Error> {
        let info = self.info()?;
        Ok(IpcMessage {
            from: info.env_ipc_from,
            value: info.env_ipc_value,
            perm: info.env_ipc_perm,
        })
    }
}
