pub mod schedule;
pub mod syscall;

use core::{cmp::{max, min}, fmt};

use alloc::vec::Vec;
use log::{debug, info};
use spin::{Mutex, MutexGuard};

use crate::{err::Error, exception::traps::{ExcCode, MemFault, Trapframe, REG_SP, STATUS_USER}, init::KernelConfig, memory::{frame::FrameAllocator, mmu::{Perm, PhysPageNum, VirtAddr, PAGE_SIZE, USTACKTOP, UTOP}, page_table::{PageTable, Pte}}, util::queue::IndexLink};

use self::schedule::Dispatch;

pub const LOG2NENV: usize = 10;
pub const NENV: usize = 1 << LOG2NENV;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(C)]
pub struct EnvID(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvStatus {
    Free = 0,
    Runnable = 1,
    NotRunnable = 2,
    Running = 3,
    Dying = 4,
}

pub struct Env {
    pub(crate) env_tf: Trapframe,
    pub(crate) env_id: EnvID,
    pub(crate) env_parent_id: EnvID,
    pub(crate) env_status: EnvStatus,
    pub(crate) env_pgdir: Option<PageTable>,
    pub(crate) env_cpunum: Option<usize>,
    pub(crate) env_runs: usize,
    pub(crate) env_pgfault_upcall: Option<VirtAddr>,
    pub(crate) env_ipc_recving: bool,
    pub(crate) env_ipc_dstva: Option<VirtAddr>,
    pub(crate) env_ipc_value: usize,
    pub(crate) env_ipc_from: EnvID,
    pub(crate) env_ipc_perm: Perm,
}

/// Read-only view of an environment, what user space sees through `envs`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvInfo {
    pub env_id: EnvID,
    pub env_parent_id: EnvID,
    pub env_status: EnvStatus,
    pub env_cpunum: Option<usize>,
    pub env_runs: usize,
    pub env_pgfault_upcall: Option<VirtAddr>,
    pub env_ipc_recving: bool,
    pub env_ipc_dstva: Option<VirtAddr>,
    pub env_ipc_value: usize,
    pub env_ipc_from: EnvID,
    pub env_ipc_perm: Perm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuStatus {
    Unused,
    Started,
    Halted,
}

pub struct CpuInfo {
    cpu_env: Option<usize>,
    cpu_status: CpuStatus,
}

/// A loadable piece of a user program. Bytes past `data` up to `memsz` are
/// zero.
#[derive(Clone, Copy, Debug)]
pub struct Segment<'a> {
    pub va: VirtAddr,
    pub data: &'a [u8],
    pub memsz: usize,
    pub perm: Perm,
}

/// A user program ready to be loaded.
#[derive(Clone, Copy, Debug)]
pub struct Image<'a> {
    pub entry: VirtAddr,
    pub segments: &'a [Segment<'a>],
}

/// Who a kernel entry is running for.
pub(crate) enum Entry {
    Caller { ind: usize, cpu: usize },
    /// the env was marked dying and has now been freed
    Reaped(Dispatch),
    NotRunning,
}

pub struct EnvManager {
    envs: Vec<Env>,
    env_free_list: IndexLink,
    cpus: Vec<CpuInfo>,
    frames: FrameAllocator,
    log2nenv: usize,
    alloced_env: usize,
}

/// The kernel: every piece of shared state behind the dispatch lock.
pub struct Kernel {
    envs: Mutex<EnvManager>,
}

impl EnvID {
    #[inline]
    pub const fn new(v: usize) -> Self {
        Self(v)
    }
    /// the id meaning "the calling environment".
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for EnvID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvID({:08x})", self.0)
    }
}

impl fmt::LowerHex for EnvID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl TryFrom<usize> for EnvStatus {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EnvStatus::Free),
            1 => Ok(EnvStatus::Runnable),
            2 => Ok(EnvStatus::NotRunnable),
            3 => Ok(EnvStatus::Running),
            4 => Ok(EnvStatus::Dying),
            _ => Err(Error::Inval),
        }
    }
}

impl Env {
    pub fn new() -> Self {
        Env {
            env_tf: Trapframe::new(),
            env_id: EnvID::zero(),
            env_parent_id: EnvID::zero(),
            env_status: EnvStatus::Free,
            env_pgdir: None,
            env_cpunum: None,
            env_runs: 0,
            env_pgfault_upcall: None,
            env_ipc_recving: false,
            env_ipc_dstva: None,
            env_ipc_value: 0,
            env_ipc_from: EnvID::zero(),
            env_ipc_perm: Perm::empty(),
        }
    }

    fn info(&self) -> EnvInfo {
        EnvInfo {
            env_id: self.env_id,
            env_parent_id: self.env_parent_id,
            env_status: self.env_status,
            env_cpunum: self.env_cpunum,
            env_runs: self.env_runs,
            env_pgfault_upcall: self.env_pgfault_upcall,
            env_ipc_recving: self.env_ipc_recving,
            env_ipc_dstva: self.env_ipc_dstva,
            env_ipc_value: self.env_ipc_value,
            env_ipc_from: self.env_ipc_from,
            env_ipc_perm: self.env_ipc_perm,
        }
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvManager {
    pub fn new(config: &KernelConfig) -> Self {
        let nenv = 1 << config.log2_nenv;
        let mut envs = Vec::with_capacity(nenv);
        envs.resize_with(nenv, Env::new);
        let mut env_free_list = IndexLink::new(nenv);
        for i in (0..nenv).rev() {
            env_free_list.insert_head(i);
        }
        let mut cpus = Vec::with_capacity(config.ncpu);
        cpus.resize_with(config.ncpu, || CpuInfo { cpu_env: None, cpu_status: CpuStatus::Unused });
        EnvManager {
            envs,
            env_free_list,
            cpus,
            frames: FrameAllocator::new(config.npages),
            log2nenv: config.log2_nenv,
            alloced_env: 0,
        }
    }

    #[inline]
    pub fn nenv(&self) -> usize {
        self.envs.len()
    }

    #[inline]
    pub fn ncpu(&self) -> usize {
        self.cpus.len()
    }

    #[inline]
    pub fn envx(&self, id: EnvID) -> usize {
        id.as_usize() & (self.nenv() - 1)
    }

    #[inline]
    pub(crate) fn env(&self, ind: usize) -> &Env {
        &self.envs[ind]
    }

    #[inline]
    pub(crate) fn env_mut(&mut self, ind: usize) -> &mut Env {
        &mut self.envs[ind]
    }

    #[inline]
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    #[inline]
    pub fn cpu_status(&self, cpu: usize) -> CpuStatus {
        self.cpus[cpu].cpu_status
    }

    /// the env currently owning `cpu`.
    #[inline]
    pub fn cpu_env(&self, cpu: usize) -> Option<EnvID> {
        self.cpus[cpu].cpu_env.map(|ind| self.envs[ind].env_id)
    }

    #[inline]
    fn mkenvid(&mut self, ind: usize) -> EnvID {
        self.alloced_env += 1;
        EnvID::new((self.alloced_env << (1 + self.log2nenv)) | ind)
    }

    /// Take a free slot and give it a fresh address space. The new env is
    /// `NotRunnable`; the caller decides when it may run.
    pub fn alloc(&mut self, parent_id: EnvID) -> Result<usize, Error> {
        let ind = self.env_free_list.first().ok_or(Error::NoFreeEnv)?;
        let pgdir = PageTable::new(&mut self.frames)?;
        let envid = self.mkenvid(ind);
        let e = &mut self.envs[ind];
        e.env_tf = Trapframe::new();
        e.env_tf.cp0_status = STATUS_USER;
        e.env_tf.regs[REG_SP] = USTACKTOP.as_usize();
        e.env_id = envid;
        e.env_parent_id = parent_id;
        e.env_status = EnvStatus::NotRunnable;
        e.env_pgdir = Some(pgdir);
        e.env_cpunum = None;
        e.env_runs = 0;
        e.env_pgfault_upcall = None;
        e.env_ipc_recving = false;
        e.env_ipc_dstva = None;
        e.env_ipc_value = 0;
        e.env_ipc_from = EnvID::zero();
        e.env_ipc_perm = Perm::empty();
        self.env_free_list.remove(ind);
        debug!("[{:08x}] new env {:08x}", parent_id.as_usize(), envid.as_usize());
        Ok(ind)
    }

    /// Resolve `id` to a slot. Id 0 names `caller`. With `checkperm`, the
    /// target must be the caller itself or one of its live descendants.
    pub fn envid2ind(&self, caller: Option<usize>, id: EnvID, checkperm: bool) -> Result<usize, Error> {
        if id.is_zero() {
            return caller.ok_or(Error::BadEnv);
        }
        let ind = self.envx(id);
        let e = &self.envs[ind];
        if e.env_status == EnvStatus::Free || e.env_id != id {
            return Err(Error::BadEnv);
        }
        if checkperm {
            let caller = caller.ok_or(Error::BadEnv)?;
            if !self.is_ancestor(self.envs[caller].env_id, ind) {
                return Err(Error::BadEnv);
            }
        }
        Ok(ind)
    }

    /// whether `ancestor` is `ind` itself or sits on its live parent chain.
    fn is_ancestor(&self, ancestor: EnvID, ind: usize) -> bool {
        let mut cur = ind;
        for _ in 0..self.nenv() {
            let e = &self.envs[cur];
            if e.env_id == ancestor {
                return true;
            }
            let parent = e.env_parent_id;
            if parent.is_zero() {
                return false;
            }
            let next = self.envx(parent);
            let p = &self.envs[next];
            if p.env_status == EnvStatus::Free || p.env_id != parent {
                return false;
            }
            cur = next;
        }
        false
    }

    /// Release everything the env owns and return its slot.
    pub fn free(&mut self, ind: usize) {
        let e = &mut self.envs[ind];
        debug!("[{:08x}] free env {:08x}", e.env_parent_id.as_usize(), e.env_id.as_usize());
        if let Some(pgdir) = e.env_pgdir.take() {
            pgdir.destroy(&mut self.frames);
        }
        e.env_status = EnvStatus::Free;
        e.env_cpunum = None;
        e.env_pgfault_upcall = None;
        e.env_ipc_recving = false;
        for cpu in self.cpus.iter_mut() {
            if cpu.cpu_env == Some(ind) {
                cpu.cpu_env = None;
            }
        }
        self.env_free_list.insert_head(ind);
    }

    /// Destroy env `ind` on behalf of `cpu`.
    ///
    /// An env running on another cpu only becomes `Dying`; it is freed at its
    /// next kernel entry. When `cpu` loses its own env, the scheduling
    /// decision that follows is returned.
    pub fn destroy(&mut self, cpu: usize, ind: usize) -> Option<Dispatch> {
        match self.owner(ind) {
            Some(owner) if owner != cpu => {
                self.envs[ind].env_status = EnvStatus::Dying;
                None
            }
            Some(_) => {
                self.free(ind);
                Some(self.sched_yield(cpu))
            }
            None => {
                self.free(ind);
                None
            }
        }
    }

    /// the cpu `ind` is the current env of, whatever its status.
    #[inline]
    fn owner(&self, ind: usize) -> Option<usize> {
        self.cpus.iter().position(|c| c.cpu_env == Some(ind))
    }

    /// destroy an env that is running on `cpu`.
    pub(crate) fn kill(&mut self, cpu: usize, ind: usize) -> Dispatch {
        match self.destroy(cpu, ind) {
            Some(dispatch) => dispatch,
            None => self.sched_yield(cpu),
        }
    }

    /// Account a kernel entry made by `id`. Only the current env of a cpu
    /// can trap; it may already have marked itself `NotRunnable`.
    pub(crate) fn enter(&mut self, id: EnvID) -> Entry {
        let ind = match self.envid2ind(None, id, false) {
            Ok(ind) => ind,
            Err(_) => return Entry::NotRunning,
        };
        let cpu = match self.owner(ind) {
            Some(cpu) => cpu,
            None => return Entry::NotRunning,
        };
        if self.envs[ind].env_status == EnvStatus::Dying {
            return match self.destroy(cpu, ind) {
                Some(dispatch) => Entry::Reaped(dispatch),
                None => Entry::NotRunning,
            };
        }
        Entry::Caller { ind, cpu }
    }

    /// Create a runnable env with no parent from `image`.
    pub fn create(&mut self, image: &Image) -> Result<EnvID, Error> {
        let ind = self.alloc(EnvID::zero())?;
        if let Err(err) = self.load_icode(ind, image) {
            self.free(ind);
            return Err(err);
        }
        let e = &mut self.envs[ind];
        e.env_status = EnvStatus::Runnable;
        info!("[00000000] new env {:08x}", e.env_id.as_usize());
        Ok(e.env_id)
    }

    fn load_icode_mapper(&mut self, ind: usize, va: VirtAddr, perm: Perm) -> Result<PhysPageNum, Error> {
        let (pgdir, frames) = self.space(ind)?;
        if let Some((ppn, _)) = pgdir.lookup(va) {
            return Ok(ppn);
        }
        let ppn = frames.alloc()?;
        if let Err(err) = pgdir.insert(frames, ppn, va, perm) {
            frames.dealloc(ppn);
            return Err(err);
        }
        Ok(ppn)
    }

    fn load_icode(&mut self, ind: usize, image: &Image) -> Result<(), Error> {
        for seg in image.segments {
            if !seg.perm.is_valid_user() || seg.data.len() > seg.memsz {
                return Err(Error::Inval);
            }
            let start = seg.va.as_usize();
            let end = start.checked_add(seg.memsz).filter(|&end| end <= UTOP.as_usize()).ok_or(Error::Inval)?;
            let data_end = start + seg.data.len();
            let mut va = seg.va.page_align_down();
            while va.as_usize() < end {
                let ppn = self.load_icode_mapper(ind, va, seg.perm)?;
                let page_lo = va.as_usize();
                let lo = max(page_lo, start);
                let hi = min(page_lo + PAGE_SIZE, data_end);
                if lo < hi {
                    self.frames.page_mut(ppn)[lo - page_lo..hi - page_lo].copy_from_slice(&seg.data[lo - start..hi - start]);
                }
                va += PAGE_SIZE;
            }
        }
        self.load_icode_mapper(ind, USTACKTOP - PAGE_SIZE, Perm::V | Perm::USER | Perm::D)?;
        self.envs[ind].env_tf.cp0_epc = image.entry.as_usize();
        Ok(())
    }

    /// page table and frame allocator of env `ind`, borrowed together.
    #[inline]
    pub(crate) fn space(&mut self, ind: usize) -> Result<(&mut PageTable, &mut FrameAllocator), Error> {
        match self.envs[ind].env_pgdir.as_mut() {
            Some(pgdir) => Ok((pgdir, &mut self.frames)),
            None => Err(Error::BadEnv),
        }
    }

    /// the mapping of `va` in env `ind`.
    #[inline]
    pub fn lookup(&self, ind: usize, va: VirtAddr) -> Option<(PhysPageNum, Pte)> {
        self.envs[ind].env_pgdir.as_ref().and_then(|pgdir| pgdir.lookup(va))
    }

    /// Split `[va, va+len)` into per-page pieces mapped with at least `need`.
    /// On failure, the first address that is not accessible.
    fn user_chunks(&self, ind: usize, va: VirtAddr, len: usize, need: Perm) -> Result<Vec<(PhysPageNum, usize, usize)>, VirtAddr> {
        let mut chunks = Vec::new();
        let mut cur = va.as_usize();
        let end = cur.checked_add(len).ok_or(va)?;
        while cur < end {
            let page = VirtAddr::new(cur).page_align_down();
            let off = cur - page.as_usize();
            let n = min(PAGE_SIZE - off, end - cur);
            match self.lookup(ind, page) {
                Some((ppn, pte)) if page < UTOP && pte.perm().contains(need) => chunks.push((ppn, off, n)),
                _ => return Err(VirtAddr::new(cur)),
            }
            cur += n;
        }
        Ok(chunks)
    }

    fn read_chunks(&self, chunks: &[(PhysPageNum, usize, usize)], buf: &mut [u8]) {
        let mut done = 0;
        for &(ppn, off, n) in chunks {
            buf[done..done + n].copy_from_slice(&self.frames.page(ppn)[off..off + n]);
            done += n;
        }
    }

    fn write_chunks(&mut self, chunks: &[(PhysPageNum, usize, usize)], data: &[u8]) {
        let mut done = 0;
        for &(ppn, off, n) in chunks {
            self.frames.page_mut(ppn)[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
    }

    /// kernel write into user memory; every page must carry `need`.
    pub(crate) fn copy_to_user(&mut self, ind: usize, va: VirtAddr, data: &[u8], need: Perm) -> Result<(), Error> {
        let chunks = self.user_chunks(ind, va, data.len(), need).map_err(|_| Error::Inval)?;
        self.write_chunks(&chunks, data);
        Ok(())
    }

    /// kernel read from user memory.
    pub(crate) fn copy_from_user(&self, ind: usize, va: VirtAddr, buf: &mut [u8]) -> Result<(), Error> {
        let chunks = self.user_chunks(ind, va, buf.len(), Perm::V | Perm::USER).map_err(|_| Error::Inval)?;
        self.read_chunks(&chunks, buf);
        Ok(())
    }

    /// exception raised by a user access at `va`.
    fn fault_code(&self, ind: usize, va: VirtAddr, write: bool) -> ExcCode {
        let present = self.lookup(ind, va.page_align_down())
            .map_or(false, |(_, pte)| pte.perm().contains(Perm::V | Perm::USER));
        match (write, present) {
            (true, true) => ExcCode::Mod,
            (true, false) => ExcCode::TlbS,
            (false, _) => ExcCode::TlbL,
        }
    }
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Result<Self, Error> {
        config.validate()?;
        info!("mos init: {} envs, {} pages, {} cpus", 1usize << config.log2_nenv, config.npages, config.ncpu);
        Ok(Kernel {
            envs: Mutex::new(EnvManager::new(&config)),
        })
    }

    /// take the dispatch lock.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, EnvManager> {
        self.envs.lock()
    }

    pub fn env_create(&self, image: &Image) -> Result<EnvID, Error> {
        self.lock().create(image)
    }

    pub fn env_info(&self, id: EnvID) -> Result<EnvInfo, Error> {
        let em = self.lock();
        let ind = em.envid2ind(None, id, false)?;
        Ok(em.env(ind).info())
    }

    pub fn env_trapframe(&self, id: EnvID) -> Result<Trapframe, Error> {
        let em = self.lock();
        let ind = em.envid2ind(None, id, false)?;
        Ok(em.env(ind).env_tf)
    }

    /// page directory entry covering `va`, as seen through `uvpd`.
    pub fn vpd(&self, id: EnvID, va: VirtAddr) -> Result<Pte, Error> {
        let em = self.lock();
        let ind = em.envid2ind(None, id, false)?;
        Ok(em.env(ind).env_pgdir.as_ref().map_or(Pte::default(), |pgdir| pgdir.get_entry(va.pdx())))
    }

    /// page table entry of `va`, as seen through `uvpt`.
    pub fn vpt(&self, id: EnvID, va: VirtAddr) -> Result<Pte, Error> {
        let em = self.lock();
        let ind = em.envid2ind(None, id, false)?;
        Ok(em.env(ind).env_pgdir.as_ref().map_or(Pte::default(), |pgdir| pgdir.entry(va)))
    }

    /// the physical page behind `va` in `id`, with its permission.
    pub fn lookup(&self, id: EnvID, va: VirtAddr) -> Option<(PhysPageNum, Perm)> {
        let em = self.lock();
        let ind = em.envid2ind(None, id, false).ok()?;
        em.lookup(ind, va).map(|(ppn, pte)| (ppn, pte.perm()))
    }

    pub fn page_ref(&self, ppn: PhysPageNum) -> u16 {
        self.lock().frames().refcount(ppn)
    }

    pub fn num_free_frames(&self) -> usize {
        self.lock().frames().num_free_frames()
    }

    pub fn cpu_env(&self, cpu: usize) -> Option<EnvID> {
        self.lock().cpu_env(cpu)
    }

    pub fn cpu_status(&self, cpu: usize) -> CpuStatus {
        self.lock().cpu_status(cpu)
    }

    /// User load of `buf.len()` bytes at `va` by the running env `id`.
    /// A missing page raises a fault that is delivered before returning.
    pub fn user_load(&self, id: EnvID, va: VirtAddr, buf: &mut [u8]) -> Result<(), MemFault> {
        let mut em = self.lock();
        let (ind, cpu) = match em.enter(id) {
            Entry::Caller { ind, cpu } => (ind, cpu),
            Entry::Reaped(dispatch) => return Err(MemFault::Killed(dispatch)),
            Entry::NotRunning => return Err(MemFault::NotRunning),
        };
        match em.user_chunks(ind, va, buf.len(), Perm::V | Perm::USER) {
            Ok(chunks) => {
                em.read_chunks(&chunks, buf);
                Ok(())
            }
            Err(fault_va) => {
                let code = em.fault_code(ind, fault_va, false);
                Err(em.page_fault(cpu, ind, fault_va, code))
            }
        }
    }

    /// User store of `data` at `va` by the running env `id`. Nothing is
    /// written unless every page is present and writable.
    pub fn user_store(&self, id: EnvID, va: VirtAddr, data: &[u8]) -> Result<(), MemFault> {
        let mut em = self.lock();
        let (ind, cpu) = match em.enter(id) {
            Entry::Caller { ind, cpu } => (ind, cpu),
            Entry::Reaped(dispatch) => return Err(MemFault::Killed(dispatch)),
            Entry::NotRunning => return Err(MemFault::NotRunning),
        };
        match em.user_chunks(ind, va, data.len(), Perm::V | Perm::USER | Perm::D) {
            Ok(chunks) => {
                em.write_chunks(&chunks, data);
                Ok(())
            }
            Err(fault_va) => {
                let code = em.fault_code(ind, fault_va, true);
                Err(em.page_fault(cpu, ind, fault_va, code))
            }
        }
    }
}
