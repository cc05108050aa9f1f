use alloc::{boxed::Box, vec::Vec};

use super::{frame::FrameAllocator, mmu::*, Error};

pub const PAGE_TABLE_ENTRIES: usize = PAGE_SIZE / 4;

/// Page table entry, wrapped type.
/// Refers to both directory and table entries.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(C)]
pub struct Pte(usize);

type Leaf = Box<[Pte; PAGE_TABLE_ENTRIES]>;

/// Two-level page table. Every second-level table occupies one physical
/// frame, as does the directory itself.
pub struct PageTable {
    root: PhysPageNum,
    entries: Vec<Pte>,
    leaves: Vec<Option<Leaf>>,
}

impl Pte {
    #[inline]
    pub const fn new(pte: usize) -> Self {
        Self(pte)
    }
    #[inline]
    pub const fn new_from_ppn(ppn: PhysPageNum, perm: Perm) -> Self {
        Self((ppn.as_usize() << PGSHIFT) | perm.bits())
    }
    /// get pte as raw value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
    /// ppn of this entry.
    #[inline]
    pub const fn ppn(self) -> PhysPageNum {
        PhysPageNum::new(self.0 >> PGSHIFT)
    }
    /// flags of this entry.
    #[inline]
    pub const fn perm(self) -> Perm {
        Perm::from_bits_truncate(self.0 & (PAGE_SIZE - 1))
    }
    #[inline]
    pub const fn valid(self) -> bool {
        self.0 & Perm::V.bits() != 0
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pte").field("ppn", &self.ppn()).field("perm", &self.perm()).finish()
    }
}

impl PageTable {
    /// allocate the directory frame.
    pub fn new(frames: &mut FrameAllocator) -> Result<Self, Error> {
        let root = frames.alloc()?;
        frames.incref(root);
        let mut leaves = Vec::with_capacity(PAGE_TABLE_ENTRIES);
        leaves.resize_with(PAGE_TABLE_ENTRIES, || None);
        Ok(Self {
            root,
            entries: alloc::vec![Pte::new(0); PAGE_TABLE_ENTRIES],
            leaves,
        })
    }

    #[inline]
    pub fn root(&self) -> PhysPageNum {
        self.root
    }

    /// directory entry, as seen through the read-only `uvpd` window.
    #[inline]
    pub fn get_entry(&self, pdx: usize) -> Pte {
        self.entries[pdx]
    }

    #[inline]
    fn walk_or_create(&mut self, frames: &mut FrameAllocator, va: VirtAddr) -> Result<&mut Pte, Error> {
        let pdx = va.pdx();
        if !self.entries[pdx].valid() {
            let ppn = frames.alloc()?;
            frames.incref(ppn);
            self.entries[pdx] = Pte::new_from_ppn(ppn, Perm::V);
            self.leaves[pdx] = Some(Box::new([Pte::new(0); PAGE_TABLE_ENTRIES]));
        }
        match self.leaves[pdx].as_mut() {
            Some(leaf) => Ok(&mut leaf[va.ptx()]),
            None => Err(Error::Unspecified),
        }
    }

    #[inline]
    fn walk(&self, va: VirtAddr) -> Option<&Pte> {
        self.leaves[va.pdx()].as_ref().map(|leaf| &leaf[va.ptx()])
    }

    #[inline]
    fn walk_mut(&mut self, va: VirtAddr) -> Option<&mut Pte> {
        self.leaves[va.pdx()].as_mut().map(|leaf| &mut leaf[va.ptx()])
    }

    /// table entry for `va`, zero when no second-level table exists.
    #[inline]
    pub fn entry(&self, va: VirtAddr) -> Pte {
        self.walk(va).copied().unwrap_or_default()
    }

    /// the page mapped at `va` together with its entry.
    #[inline]
    pub fn lookup(&self, va: VirtAddr) -> Option<(PhysPageNum, Pte)> {
        self.walk(va).filter(|pte| pte.valid()).map(|pte| (pte.ppn(), *pte))
    }

    #[inline]
    pub fn remove(&mut self, frames: &mut FrameAllocator, va: VirtAddr) {
        if let Some(pte) = self.walk_mut(va) {
            if pte.valid() {
                let ppn = pte.ppn();
                *pte = Pte::new(0);
                frames.decref(ppn);
            }
        }
    }

    /// map `ppn` at `va`. A different page already mapped there is removed
    /// first; the same page only gets its permission replaced. A page whose
    /// reference count is saturated cannot be mapped again.
    #[inline]
    pub fn insert(&mut self, frames: &mut FrameAllocator, ppn: PhysPageNum, va: VirtAddr, perm: Perm) -> Result<(), Error> {
        if let Some(pte) = self.walk_mut(va) {
            if pte.valid() && pte.ppn() == ppn {
                *pte = Pte::new_from_ppn(ppn, perm | Perm::V);
                return Ok(());
            }
        }
        if frames.refcount(ppn) == u16::MAX {
            return Err(Error::NoMem);
        }
        self.remove(frames, va);
        let pte = self.walk_or_create(frames, va)?;
        *pte = Pte::new_from_ppn(ppn, perm | Perm::V);
        frames.incref(ppn);
        Ok(())
    }

    /// drop every mapping and every table frame, directory included.
    pub fn destroy(mut self, frames: &mut FrameAllocator) {
        for pdx in 0..PAGE_TABLE_ENTRIES {
            let pde = self.entries[pdx];
            if !pde.valid() {
                continue;
            }
            if let Some(leaf) = self.leaves[pdx].take() {
                for pte in leaf.iter().filter(|pte| pte.valid()) {
                    frames.decref(pte.ppn());
                }
            }
            self.entries[pdx] = Pte::new(0);
            frames.decref(pde.ppn());
        }
        frames.decref(self.root);
    }
}
