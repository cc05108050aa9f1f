use core::mem::size_of;

use alloc::vec::Vec;
use log::warn;

use crate::{env::{schedule::Dispatch, EnvManager}, memory::mmu::{Perm, VirtAddr, PAGE_SIZE, UXSTACKTOP}};

pub const STATUS_CU0: usize = 0x10000000;
pub const STATUS_IM7: usize = 0x8000;
pub const STATUS_UM: usize = 0x0010;
pub const STATUS_EXL: usize = 0x0002;
pub const STATUS_IE: usize = 0x0001;
/// status bits every user context runs with.
pub const STATUS_USER: usize = STATUS_IM7 | STATUS_IE | STATUS_EXL | STATUS_UM;

/// return value register
pub const REG_V0: usize = 2;
/// first argument register
pub const REG_A0: usize = 4;
/// stack pointer
pub const REG_SP: usize = 29;

/// Exception codes, as found in `cp0_cause[6:2]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ExcCode {
    Int = 0,
    /// store to a valid page without the dirty bit
    Mod = 1,
    /// load from an invalid page
    TlbL = 2,
    /// store to an invalid page
    TlbS = 3,
    Sys = 8,
}

impl ExcCode {
    #[inline]
    pub fn is_write(self) -> bool {
        matches!(self, ExcCode::Mod | ExcCode::TlbS)
    }

    pub fn from_cause(cause: usize) -> Option<Self> {
        match (cause >> 2) & 0x1f {
            0 => Some(ExcCode::Int),
            1 => Some(ExcCode::Mod),
            2 => Some(ExcCode::TlbL),
            3 => Some(ExcCode::TlbS),
            8 => Some(ExcCode::Sys),
            _ => None,
        }
    }

    #[inline]
    pub const fn into_cause(self) -> usize {
        (self as usize) << 2
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Trapframe {
    pub regs: [usize; 32],
    pub cp0_status: usize,
    pub hi: usize,
    pub lo: usize,
    pub cp0_badvaddr: usize,
    pub cp0_cause: usize,
    pub cp0_epc: usize,
}

/// Fault record pushed onto the user exception stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct UTrapframe {
    pub utf_fault_va: VirtAddr,
    pub utf_err: usize,
    pub utf_tf: Trapframe,
}

/// What a user memory access that trapped turned into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemFault {
    /// the env continues at `entry` with the fault record at `utf`.
    Upcall { entry: VirtAddr, utf: VirtAddr },
    /// the env was destroyed; the cpu moves on.
    Killed(Dispatch),
    /// the accessing env is not running.
    NotRunning,
}

impl Trapframe {
    pub const WORDS: usize = 32 + 6;

    pub fn new() -> Self {
        Self::default()
    }

    fn write_words(&self, out: &mut Vec<usize>) {
        out.extend_from_slice(&self.regs);
        out.extend_from_slice(&[self.cp0_status, self.hi, self.lo, self.cp0_badvaddr, self.cp0_cause, self.cp0_epc]);
    }

    fn read_words(words: &[usize]) -> Self {
        let mut tf = Trapframe::new();
        tf.regs.copy_from_slice(&words[..32]);
        tf.cp0_status = words[32];
        tf.hi = words[33];
        tf.lo = words[34];
        tf.cp0_badvaddr = words[35];
        tf.cp0_cause = words[36];
        tf.cp0_epc = words[37];
        tf
    }

    /// in-memory image, native word size, little endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut words = Vec::with_capacity(Self::WORDS);
        self.write_words(&mut words);
        words_to_bytes(&words)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let words = bytes_to_words(bytes, Self::WORDS)?;
        Some(Self::read_words(&words))
    }
}

impl UTrapframe {
    pub const WORDS: usize = 2 + Trapframe::WORDS;
    pub const SIZE: usize = Self::WORDS * size_of::<usize>();

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut words = Vec::with_capacity(Self::WORDS);
        words.push(self.utf_fault_va.as_usize());
        words.push(self.utf_err);
        self.utf_tf.write_words(&mut words);
        words_to_bytes(&words)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let words = bytes_to_words(bytes, Self::WORDS)?;
        Some(UTrapframe {
            utf_fault_va: VirtAddr::new(words[0]),
            utf_err: words[1],
            utf_tf: Trapframe::read_words(&words[2..]),
        })
    }

    /// exception code of the fault.
    #[inline]
    pub fn exc_code(&self) -> Option<ExcCode> {
        ExcCode::from_cause(self.utf_err)
    }
}

fn words_to_bytes(words: &[usize]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn bytes_to_words(bytes: &[u8], n: usize) -> Option<Vec<usize>> {
    const W: usize = size_of::<usize>();
    if bytes.len() < n * W {
        return None;
    }
    Some(bytes.chunks_exact(W).take(n).map(|c| {
        let mut word = [0u8; W];
        word.copy_from_slice(c);
        usize::from_le_bytes(word)
    }).collect())
}

impl EnvManager {
    /// Deliver a user page fault of env `ind`, running on `cpu`.
    ///
    /// The fault record goes to the top of the exception stack, or below the
    /// current frame (leaving one scratch word) when the env is already
    /// handling a fault. Without an upcall, or without room on a writable
    /// exception stack, the env is destroyed.
    pub(crate) fn page_fault(&mut self, cpu: usize, ind: usize, fault_va: VirtAddr, code: ExcCode) -> MemFault {
        let env = self.env_mut(ind);
        env.env_tf.cp0_badvaddr = fault_va.as_usize();
        env.env_tf.cp0_cause = code.into_cause();
        let tf = env.env_tf;
        let envid = env.env_id;

        let entry = match env.env_pgfault_upcall {
            Some(entry) => entry,
            None => {
                warn!("[{:08x}] user fault va {:08x} ip {:08x}", envid.as_usize(), fault_va.as_usize(), tf.cp0_epc);
                return MemFault::Killed(self.kill(cpu, ind));
            }
        };

        let exstack = UXSTACKTOP - PAGE_SIZE;
        let sp = VirtAddr::new(tf.regs[REG_SP]);
        let top = if sp >= exstack && sp < UXSTACKTOP {
            sp - size_of::<usize>()
        } else {
            UXSTACKTOP
        };
        let frame = match top.as_usize().checked_sub(UTrapframe::SIZE) {
            Some(frame) if frame >= exstack.as_usize() => VirtAddr::new(frame),
            _ => {
                warn!("[{:08x}] exception stack overflow at va {:08x}", envid.as_usize(), fault_va.as_usize());
                return MemFault::Killed(self.kill(cpu, ind));
            }
        };

        let utf = UTrapframe {
            utf_fault_va: fault_va,
            utf_err: code.into_cause(),
            utf_tf: tf,
        };
        if self.copy_to_user(ind, frame, &utf.to_bytes(), Perm::V | Perm::USER | Perm::D).is_err() {
            warn!("[{:08x}] no writable exception stack, va {:08x}", envid.as_usize(), fault_va.as_usize());
            return MemFault::Killed(self.kill(cpu, ind));
        }

        let env = self.env_mut(ind);
        env.env_tf.regs[REG_SP] = frame.as_usize();
        env.env_tf.regs[REG_A0] = frame.as_usize();
        env.env_tf.cp0_epc = entry.as_usize();
        MemFault::Upcall { entry, utf: frame }
    }
}
